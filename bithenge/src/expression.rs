//! Expressions: pure value producers evaluated against a scope.

use std::cell::RefCell;
use std::rc::Rc;

use bithenge_tree::{new_offset_blob, new_subblob, Blob, Error, Int, Node, Result};

use crate::print::{self, PrintFormat};
use crate::scope::Scope;
use crate::transform::Transform;

/// Shared handle to an expression.
pub type ExprRef = Rc<dyn Expression>;

/// A pure function from a scope to a node. Evaluation never mutates the
/// scope.
pub trait Expression {
    /// Produce the expression's value in `scope`.
    fn evaluate(&self, scope: &Rc<Scope>) -> Result<Node>;
}

/// Binary operators of the script expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Integer addition.
    Add,
    /// Integer subtraction.
    Subtract,
    /// Integer multiplication.
    Multiply,
    /// Floored integer division; the divisor must be positive.
    IntegerDivide,
    /// Euclidean remainder; the divisor must be positive.
    Modulo,
    /// Integer comparison.
    LessThan,
    /// Integer comparison.
    LessThanOrEqual,
    /// Integer comparison.
    GreaterThan,
    /// Integer comparison.
    GreaterThanOrEqual,
    /// Node equality on any operand types.
    Equals,
    /// Node inequality on any operand types.
    NotEquals,
    /// Strict boolean conjunction; both operands are evaluated.
    And,
    /// Strict boolean disjunction; both operands are evaluated.
    Or,
    /// Child lookup: internal member or blob byte.
    Member,
    /// Blob concatenation; the right operand is evaluated lazily.
    Concat,
}

/// Applies a [`BinaryOp`] to two subexpressions.
pub struct BinaryExpression {
    op: BinaryOp,
    lhs: ExprRef,
    rhs: ExprRef,
}

impl BinaryExpression {
    /// Combine two expressions with `op`.
    pub fn new(op: BinaryOp, lhs: ExprRef, rhs: ExprRef) -> Self {
        BinaryExpression { op, lhs, rhs }
    }

    fn integers(lhs: &Node, rhs: &Node) -> Result<(Int, Int)> {
        Ok((lhs.as_integer()?, rhs.as_integer()?))
    }
}

impl Expression for BinaryExpression {
    fn evaluate(&self, scope: &Rc<Scope>) -> Result<Node> {
        let lhs = self.lhs.evaluate(scope)?;
        if self.op == BinaryOp::Concat {
            // The right operand materializes only when a read first
            // crosses into it, in the scope captured here.
            let blob = lhs.as_blob()?;
            return concat_blob_lazy(Rc::clone(blob), Rc::clone(&self.rhs), Rc::clone(scope));
        }
        let rhs = self.rhs.evaluate(scope)?;
        match self.op {
            BinaryOp::Add => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                Ok(Node::Integer(a.checked_add(b).ok_or(Error::Invalid)?))
            }
            BinaryOp::Subtract => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                Ok(Node::Integer(a.checked_sub(b).ok_or(Error::Invalid)?))
            }
            BinaryOp::Multiply => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                Ok(Node::Integer(a.checked_mul(b).ok_or(Error::Invalid)?))
            }
            BinaryOp::IntegerDivide => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                if b <= 0 {
                    return Err(Error::Invalid);
                }
                Ok(Node::Integer(a.div_euclid(b)))
            }
            BinaryOp::Modulo => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                if b <= 0 {
                    return Err(Error::Invalid);
                }
                Ok(Node::Integer(a.rem_euclid(b)))
            }
            BinaryOp::LessThan => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                Ok(Node::Boolean(a < b))
            }
            BinaryOp::LessThanOrEqual => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                Ok(Node::Boolean(a <= b))
            }
            BinaryOp::GreaterThan => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                Ok(Node::Boolean(a > b))
            }
            BinaryOp::GreaterThanOrEqual => {
                let (a, b) = Self::integers(&lhs, &rhs)?;
                Ok(Node::Boolean(a >= b))
            }
            BinaryOp::Equals => Ok(Node::Boolean(Node::equal(&lhs, &rhs)?)),
            BinaryOp::NotEquals => Ok(Node::Boolean(!Node::equal(&lhs, &rhs)?)),
            BinaryOp::And => Ok(Node::Boolean(lhs.as_boolean()? && rhs.as_boolean()?)),
            BinaryOp::Or => Ok(Node::Boolean(lhs.as_boolean()? || rhs.as_boolean()?)),
            BinaryOp::Member => lhs.get(&rhs),
            BinaryOp::Concat => unreachable!("handled before evaluating the right operand"),
        }
    }
}

/// The innermost input node, walking outward until one is found.
pub struct InNodeExpression;

impl Expression for InNodeExpression {
    fn evaluate(&self, scope: &Rc<Scope>) -> Result<Node> {
        let mut frame: Option<&Rc<Scope>> = Some(scope);
        while let Some(current) = frame {
            if let Some(node) = current.in_node() {
                return Ok(node);
            }
            frame = current.outer();
        }
        Err(Error::Invalid)
    }
}

/// The node being built in the innermost frame only.
pub struct CurrentNodeExpression;

impl Expression for CurrentNodeExpression {
    fn evaluate(&self, scope: &Rc<Scope>) -> Result<Node> {
        scope.current_node().ok_or(Error::Invalid)
    }
}

/// Parameter `index` of the nearest parameterized frame.
pub struct ParamExpression {
    index: usize,
}

impl ParamExpression {
    /// Reference parameter `index`.
    pub fn new(index: usize) -> Self {
        ParamExpression { index }
    }
}

impl Expression for ParamExpression {
    fn evaluate(&self, scope: &Rc<Scope>) -> Result<Node> {
        scope.get_param(self.index)
    }
}

/// A captured constant.
pub struct ConstExpression {
    node: Node,
}

impl ConstExpression {
    /// Capture `node`.
    pub fn new(node: Node) -> Self {
        ConstExpression { node }
    }
}

impl Expression for ConstExpression {
    fn evaluate(&self, _scope: &Rc<Scope>) -> Result<Node> {
        Ok(self.node.clone())
    }
}

/// `.key`: searches the nodes being built, innermost first, without
/// crossing a barrier.
pub struct ScopeMemberExpression {
    key: Node,
}

impl ScopeMemberExpression {
    /// Search for `key`.
    pub fn new(key: Node) -> Self {
        ScopeMemberExpression { key }
    }
}

impl Expression for ScopeMemberExpression {
    fn evaluate(&self, scope: &Rc<Scope>) -> Result<Node> {
        let mut frame: Option<&Rc<Scope>> = Some(scope);
        while let Some(current) = frame {
            if current.is_barrier() {
                break;
            }
            if let Some(node) = current.current_node() {
                if matches!(node, Node::Internal(_) | Node::Blob(_)) {
                    match node.get(&self.key) {
                        Err(Error::NotFound) => {}
                        result => return result,
                    }
                }
            }
            frame = current.outer();
        }
        let rendered = print::node_to_string(PrintFormat::Python, &self.key)?;
        Err(scope.report(format!("no scope member {rendered}")))
    }
}

/// Projects a sub-view out of a blob-valued expression.
pub struct SubblobExpression {
    blob: ExprRef,
    start: ExprRef,
    limit: Option<ExprRef>,
    absolute_limit: bool,
}

impl SubblobExpression {
    /// With `limit` absent the view runs to the end of the blob. With
    /// `absolute_limit` the limit is an end offset rather than a length.
    pub fn new(
        blob: ExprRef,
        start: ExprRef,
        limit: Option<ExprRef>,
        absolute_limit: bool,
    ) -> Self {
        SubblobExpression {
            blob,
            start,
            limit,
            absolute_limit,
        }
    }
}

impl Expression for SubblobExpression {
    fn evaluate(&self, scope: &Rc<Scope>) -> Result<Node> {
        let start = self.start.evaluate(scope)?.as_integer()?;
        let mut limit = None;
        if let Some(expr) = &self.limit {
            let mut value = expr.evaluate(scope)?.as_integer()?;
            if self.absolute_limit {
                value = value.wrapping_sub(start);
            }
            limit = Some(value);
        }
        if start < 0 || limit.is_some_and(|value| value < 0) {
            return Err(Error::Invalid);
        }

        let blob_node = self.blob.evaluate(scope)?;
        let blob = blob_node.as_blob()?;
        match limit {
            Some(limit) => new_subblob(Rc::clone(blob), start as u64, limit as u64),
            None => new_offset_blob(Rc::clone(blob), start as u64),
        }
    }
}

/// Evaluates parameter expressions in the caller's scope and installs
/// the results before invoking the wrapped transform.
pub struct ParamWrapper {
    inner: crate::transform::XformRef,
    params: Vec<ExprRef>,
}

impl ParamWrapper {
    /// Wrap `inner`; `params` must match its declared arity.
    pub fn new(inner: crate::transform::XformRef, params: Vec<ExprRef>) -> Self {
        debug_assert_eq!(inner.num_params(), params.len());
        ParamWrapper { inner, params }
    }

    fn fill_scope(&self, outer: &Rc<Scope>) -> Result<Rc<Scope>> {
        let inner = Scope::new(Some(outer));
        inner.alloc_params(self.params.len());
        for (index, expr) in self.params.iter().enumerate() {
            inner.set_param(index, expr.evaluate(outer)?);
        }
        Ok(inner)
    }
}

impl Transform for ParamWrapper {
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let inner_scope = self.fill_scope(scope)?;
        self.inner.apply(&inner_scope, input)
    }

    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        let inner_scope = self.fill_scope(scope)?;
        self.inner.prefix_length(&inner_scope, blob)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let inner_scope = self.fill_scope(scope)?;
        self.inner.prefix_apply(&inner_scope, blob)
    }
}

/// A transform that evaluates an expression with the input installed as
/// the `in` node.
pub struct ExpressionTransform {
    expr: ExprRef,
}

impl ExpressionTransform {
    /// Wrap `expr`.
    pub fn new(expr: ExprRef) -> Self {
        ExpressionTransform { expr }
    }
}

impl Transform for ExpressionTransform {
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let inner = Scope::new(Some(scope));
        inner.set_in_node(Some(input.clone()));
        self.expr.evaluate(&inner)
    }
}

/// A transform for expressions that never mention `in`: it consumes no
/// input at all.
pub struct InputlessTransform {
    expr: ExprRef,
}

impl InputlessTransform {
    /// Wrap `expr`; the parser guarantees it does not reference `in`.
    pub fn new(expr: ExprRef) -> Self {
        InputlessTransform { expr }
    }
}

impl Transform for InputlessTransform {
    fn prefix_length(&self, _scope: &Rc<Scope>, _blob: &Rc<dyn Blob>) -> Result<u64> {
        Ok(0)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, _blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        Ok((self.expr.evaluate(scope)?, 0))
    }
}

/// Concatenation of two blobs; the second may be deferred behind an
/// expression until a read first needs it.
struct ConcatBlob {
    first: Rc<dyn Blob>,
    first_size: u64,
    second: RefCell<Option<Rc<dyn Blob>>>,
    pending: RefCell<Option<(ExprRef, Rc<Scope>)>>,
}

impl ConcatBlob {
    fn second(&self) -> Result<Rc<dyn Blob>> {
        if let Some(blob) = self.second.borrow().as_ref() {
            return Ok(Rc::clone(blob));
        }
        let blob = {
            let pending = self.pending.borrow();
            let (expr, scope) = pending.as_ref().ok_or(Error::Invalid)?;
            let node = expr.evaluate(scope)?;
            match &node {
                Node::Blob(blob) => Rc::clone(blob),
                _ => return Err(scope.report("concatenation arguments must be blobs")),
            }
        };
        *self.second.borrow_mut() = Some(Rc::clone(&blob));
        *self.pending.borrow_mut() = None;
        Ok(blob)
    }
}

impl Blob for ConcatBlob {
    fn size(&self) -> Result<u64> {
        Ok(self.first_size + self.second()?.size()?)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut count = 0;
        if offset < self.first_size {
            count = self.first.read(offset, buf)?;
            if offset + count as u64 != self.first_size || count == buf.len() {
                return Ok(count);
            }
        }
        let second = self.second()?;
        let n = second.read(offset + count as u64 - self.first_size, &mut buf[count..])?;
        Ok(count + n)
    }

    fn read_bits(
        &self,
        offset: u64,
        buf: &mut [u8],
        count: u64,
        little_endian: bool,
    ) -> Result<u64> {
        let mut produced = 0;
        if offset < self.first_size {
            produced = self.first.read_bits(offset, buf, count, little_endian)?;
            if offset + produced != self.first_size || produced == count {
                return Ok(produced);
            }
        }
        // A read may only cross into the second blob at a byte boundary.
        if produced % 8 != 0 {
            return Err(Error::Invalid);
        }
        let second = self.second()?;
        let n = second.read_bits(
            offset + produced - self.first_size,
            &mut buf[(produced / 8) as usize..],
            count - produced,
            little_endian,
        )?;
        Ok(produced + n)
    }
}

/// Concatenate two blobs.
pub fn concat_blob(first: Rc<dyn Blob>, second: Rc<dyn Blob>) -> Result<Node> {
    let first_size = first.size()?;
    Ok(Node::Blob(Rc::new(ConcatBlob {
        first,
        first_size,
        second: RefCell::new(Some(second)),
        pending: RefCell::new(None),
    })))
}

/// Concatenate a blob with one computed later by `expr` in `scope`.
pub fn concat_blob_lazy(first: Rc<dyn Blob>, expr: ExprRef, scope: Rc<Scope>) -> Result<Node> {
    let first_size = first.size()?;
    Ok(Node::Blob(Rc::new(ConcatBlob {
        first,
        first_size,
        second: RefCell::new(None),
        pending: RefCell::new(Some((expr, scope))),
    })))
}
