//! Sequence transforms: `struct`, `repeat`, and `do … while`.
//!
//! All three decode an ordered run of children from a blob and present
//! the result as an internal node whose children are computed on
//! demand. The shared machinery memoizes where each child ends, so that
//! looking up one field decodes only the lengths of the fields before
//! it, not their values.

use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::rc::{Rc, Weak};

use bithenge_tree::{
    new_offset_blob, new_subblob, Blob, Error, ForEach, Int, Internal, Node, Result,
};

use crate::expression::ExprRef;
use crate::scope::Scope;
use crate::transform::{prefix_length_via_apply, Transform, XformRef};

/// Selects the subtransform used for a given child index.
type TransformAt<'a> = dyn Fn(usize) -> Result<XformRef> + 'a;

/// State shared by all sequence nodes: the backing blob, the scope the
/// children are decoded in, and the memoized end offset of each child.
struct SeqCore {
    blob: Rc<dyn Blob>,
    scope: Rc<Scope>,
    /// End offset of each child whose extent is known, in input units.
    ends: RefCell<Vec<u64>>,
    /// Total number of children, once known.
    known_count: Cell<Option<usize>>,
    /// Whether running out of input ends the sequence rather than
    /// failing it.
    end_on_empty: bool,
}

impl SeqCore {
    fn new(
        blob: Rc<dyn Blob>,
        scope: Rc<Scope>,
        known_count: Option<usize>,
        end_on_empty: bool,
    ) -> SeqCore {
        SeqCore {
            blob,
            scope,
            ends: RefCell::new(Vec::new()),
            known_count: Cell::new(known_count),
            end_on_empty,
        }
    }

    fn cached_ends(&self) -> usize {
        self.ends.borrow().len()
    }

    /// The tail of the backing blob starting at `offset`, with the
    /// end-of-input check applied when the sequence ends on empty.
    fn tail(&self, offset: u64) -> Result<Node> {
        let tail = new_offset_blob(Rc::clone(&self.blob), offset)?;
        if self.end_on_empty && tail.as_blob()?.is_empty()? {
            self.known_count.set(Some(self.cached_ends()));
            return Err(Error::NotFound);
        }
        Ok(tail)
    }

    /// The input offset where child `index` starts, measuring the
    /// children before it with `prefix_length` as needed.
    ///
    /// No `ends` borrow is held across subtransform calls: measuring a
    /// child may re-enter this node through a member expression.
    fn field_offset(&self, transform_at: &TransformAt<'_>, index: usize) -> Result<u64> {
        if index == 0 {
            return Ok(0);
        }
        let target = index - 1;
        loop {
            let (cached, prev) = {
                let ends = self.ends.borrow();
                (ends.len(), ends.last().copied().unwrap_or(0))
            };
            if cached > target {
                return Ok(self.ends.borrow()[target]);
            }
            let xform = transform_at(cached)?;
            let tail = self.tail(prev)?;
            let length = xform.prefix_length(&self.scope, tail.as_blob()?)?;
            let mut ends = self.ends.borrow_mut();
            if ends.len() == cached {
                ends.push(prev + length);
            }
        }
    }

    /// Decode child `index`. The trailing, not yet measured child is
    /// decoded with `prefix_apply` so its extent is cached in the same
    /// pass; earlier children get an exactly bounded sub-view.
    fn subtransform(&self, transform_at: &TransformAt<'_>, index: usize) -> Result<Node> {
        let start = self.field_offset(transform_at, index)?;
        let xform = transform_at(index)?;
        if index == self.cached_ends() {
            let tail = self.tail(start)?;
            let (node, size) = xform.prefix_apply(&self.scope, tail.as_blob()?)?;
            let mut ends = self.ends.borrow_mut();
            if ends.len() == index {
                ends.push(start + size);
            }
            Ok(node)
        } else {
            let end = self.field_offset(transform_at, index + 1)?;
            let sub = new_subblob(Rc::clone(&self.blob), start, end - start)?;
            xform.apply(&self.scope, &sub)
        }
    }

    /// Whether `count` children exactly cover the blob.
    fn complete(&self, transform_at: &TransformAt<'_>, count: usize) -> Result<bool> {
        let size = self.blob.size()?;
        let end = self.field_offset(transform_at, count)?;
        Ok(size == end)
    }
}

/// Non-owning stand-in installed as a scope's current node.
///
/// The sequence node owns its scope; the scope's back-reference to the
/// node must not own it, or the pair would keep itself alive. Lookups
/// upgrade the handle; once the node is gone (reachable only through a
/// scope captured past its lifetime), members simply resolve as absent.
struct WeakInternal<T: Internal> {
    target: Weak<T>,
}

impl<T: Internal> Internal for WeakInternal<T> {
    fn for_each(&self, f: &mut ForEach<'_>) -> Result<ControlFlow<()>> {
        match self.target.upgrade() {
            Some(node) => node.for_each(f),
            None => Err(Error::NotFound),
        }
    }

    fn get(&self, key: &Node) -> Result<Node> {
        match self.target.upgrade() {
            Some(node) => node.get(key),
            None => Err(Error::NotFound),
        }
    }
}

fn weak_handle<T>(node: &Rc<T>) -> Node
where
    T: Internal + 'static,
{
    Node::Internal(Rc::new(WeakInternal {
        target: Rc::downgrade(node),
    }))
}

/// A struct field: the key it decodes into, or `None` for a child whose
/// entries are merged into the parent.
pub type NamedField = (Option<Rc<str>>, XformRef);

/// Decodes a fixed run of named fields out of a blob.
pub struct StructTransform {
    fields: Rc<Vec<NamedField>>,
}

impl StructTransform {
    /// Create a struct transform over `fields`, applied in order.
    pub fn new(fields: Vec<NamedField>) -> Self {
        StructTransform {
            fields: Rc::new(fields),
        }
    }

    fn make_node(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>, prefix: bool) -> Rc<StructNode> {
        let inner = Scope::new(Some(scope));
        let node = Rc::new(StructNode {
            fields: Rc::clone(&self.fields),
            core: SeqCore::new(
                Rc::clone(blob),
                Rc::clone(&inner),
                Some(self.fields.len()),
                false,
            ),
            prefix,
        });
        // Later fields resolve `.name` against this node through the
        // scope; the handle is weak so the node/scope pair cannot keep
        // itself alive.
        inner.set_current_node(Some(weak_handle(&node)));
        node
    }
}

impl Transform for StructTransform {
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let blob = input.as_blob()?;
        Ok(Node::Internal(self.make_node(scope, blob, false)))
    }

    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        let node = self.make_node(scope, blob, true);
        let at = |index: usize| node.transform_at(index);
        node.core.field_offset(&at, self.fields.len())
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let node = self.make_node(scope, blob, true);
        let size = {
            let at = |index: usize| node.transform_at(index);
            node.core.field_offset(&at, self.fields.len())?
        };
        Ok((Node::Internal(node), size))
    }
}

struct StructNode {
    fields: Rc<Vec<NamedField>>,
    core: SeqCore,
    prefix: bool,
}

impl StructNode {
    fn transform_at(&self, index: usize) -> Result<XformRef> {
        Ok(Rc::clone(&self.fields[index].1))
    }
}

impl Internal for StructNode {
    fn for_each(&self, f: &mut ForEach<'_>) -> Result<ControlFlow<()>> {
        let at = |index: usize| self.transform_at(index);
        for (index, (name, _)) in self.fields.iter().enumerate() {
            let child = self.core.subtransform(&at, index)?;
            match name {
                Some(name) => {
                    if f(Node::String(Rc::clone(name)), child)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
                None => {
                    // A nameless child contributes its own entries.
                    let merged = child.as_internal()?;
                    if merged.for_each(f)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
        }
        if !self.prefix && !self.core.complete(&at, self.fields.len())? {
            return Err(Error::Invalid);
        }
        Ok(ControlFlow::Continue(()))
    }

    fn get(&self, key: &Node) -> Result<Node> {
        let Node::String(wanted) = key else {
            return Err(Error::NotFound);
        };
        let at = |index: usize| self.transform_at(index);

        // A named match decodes that child alone; earlier siblings are
        // only measured, later ones not touched at all.
        for (index, (name, _)) in self.fields.iter().enumerate() {
            if name.as_deref() == Some(wanted.as_ref()) {
                return self.core.subtransform(&at, index);
            }
        }

        for (index, (name, _)) in self.fields.iter().enumerate() {
            if name.is_some() {
                continue;
            }
            let child = self.core.subtransform(&at, index)?;
            let merged = child.as_internal()?;
            match merged.get(key) {
                Err(Error::NotFound) => continue,
                result => return result,
            }
        }
        Err(Error::NotFound)
    }
}

/// Decodes a run of identical elements, either exactly `count` of them
/// or as many as fit.
pub struct RepeatTransform {
    xform: XformRef,
    count: Option<ExprRef>,
}

impl RepeatTransform {
    /// With `count` absent, elements are decoded until one no longer
    /// fits.
    pub fn new(xform: XformRef, count: Option<ExprRef>) -> Self {
        RepeatTransform { xform, count }
    }

    fn make_node(
        &self,
        scope: &Rc<Scope>,
        blob: &Rc<dyn Blob>,
        prefix: bool,
    ) -> Result<Rc<RepeatNode>> {
        let mut count = None;
        if let Some(expr) = &self.count {
            let value = expr.evaluate(scope)?.as_integer()?;
            if value < 0 {
                return Err(Error::Invalid);
            }
            count = Some(value as usize);
        }
        Ok(Rc::new(RepeatNode {
            xform: Rc::clone(&self.xform),
            core: SeqCore::new(Rc::clone(blob), Rc::clone(scope), count, count.is_none()),
            bounded: count.is_some(),
            prefix,
        }))
    }
}

impl Transform for RepeatTransform {
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let blob = input.as_blob()?;
        Ok(Node::Internal(self.make_node(scope, blob, false)?))
    }

    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        prefix_length_via_apply(self, scope, blob)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let node = self.make_node(scope, blob, true)?;
        let at = |_: usize| Ok(Rc::clone(&node.xform));
        let size = match node.core.known_count.get() {
            Some(count) => node.core.field_offset(&at, count)?,
            None => {
                let mut size = 0;
                let mut count = 1;
                loop {
                    match node.core.field_offset(&at, count) {
                        Ok(end) => {
                            size = end;
                            count += 1;
                        }
                        Err(Error::Invalid) | Err(Error::NotFound) => break,
                        Err(err) => return Err(err),
                    }
                }
                size
            }
        };
        Ok((Node::Internal(node), size))
    }
}

struct RepeatNode {
    xform: XformRef,
    core: SeqCore,
    /// Whether the element count came from an expression; only an
    /// open-ended repeat stops gracefully on a child that does not fit.
    bounded: bool,
    prefix: bool,
}

impl Internal for RepeatNode {
    fn for_each(&self, f: &mut ForEach<'_>) -> Result<ControlFlow<()>> {
        let at = |_: usize| Ok(Rc::clone(&self.xform));
        let mut index = 0;
        loop {
            if let Some(count) = self.core.known_count.get() {
                if index >= count {
                    break;
                }
            }
            match self.core.subtransform(&at, index) {
                Ok(child) => {
                    if f(Node::Integer(index as Int), child)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
                Err(Error::Invalid) | Err(Error::NotFound) if !self.bounded => {
                    self.core.known_count.set(Some(index));
                    break;
                }
                Err(err) => return Err(err),
            }
            index += 1;
        }
        if !self.prefix {
            let count = self.core.known_count.get().ok_or(Error::Invalid)?;
            if !self.core.complete(&at, count)? {
                return Err(Error::Invalid);
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn get(&self, key: &Node) -> Result<Node> {
        let Node::Integer(index) = key else {
            return Err(Error::NotFound);
        };
        if *index < 0 {
            return Err(Error::NotFound);
        }
        let index = *index as usize;
        if let Some(count) = self.core.known_count.get() {
            if index >= count {
                return Err(Error::NotFound);
            }
        }
        self.core
            .subtransform(&|_| Ok(Rc::clone(&self.xform)), index)
    }
}

/// Decodes elements until a condition on the just-decoded element turns
/// false; the final element is included.
pub struct DoWhileTransform {
    xform: XformRef,
    condition: ExprRef,
}

impl DoWhileTransform {
    /// `condition` is evaluated after each element, in a scope whose
    /// current node is that element; it must produce a boolean.
    pub fn new(xform: XformRef, condition: ExprRef) -> Self {
        DoWhileTransform { xform, condition }
    }
}

impl Transform for DoWhileTransform {
    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        prefix_length_via_apply(self, scope, blob)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let node = Rc::new(DoWhileNode {
            xform: Rc::clone(&self.xform),
            condition: Rc::clone(&self.condition),
            core: SeqCore::new(Rc::clone(blob), Rc::clone(scope), None, false),
        });
        // The extent is only known once every element has been decoded
        // and the condition has turned false.
        let _ = node.for_each(&mut |_, _| Ok(ControlFlow::Continue(())))?;
        let count = node.core.known_count.get().ok_or(Error::Invalid)?;
        let size = {
            let at = |_: usize| Ok(Rc::clone(&node.xform));
            node.core.field_offset(&at, count)?
        };
        Ok((Node::Internal(node), size))
    }
}

struct DoWhileNode {
    xform: XformRef,
    condition: ExprRef,
    core: SeqCore,
}

impl Internal for DoWhileNode {
    fn for_each(&self, f: &mut ForEach<'_>) -> Result<ControlFlow<()>> {
        let at = |_: usize| Ok(Rc::clone(&self.xform));
        let mut index = 0;
        loop {
            if let Some(count) = self.core.known_count.get() {
                if index >= count {
                    break;
                }
            }
            let child = self.core.subtransform(&at, index)?;
            if f(Node::Integer(index as Int), child.clone())?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            let cond_scope = Scope::new(Some(&self.core.scope));
            cond_scope.set_current_node(Some(child));
            let proceed = self.condition.evaluate(&cond_scope)?.as_boolean()?;
            if !proceed {
                self.core.known_count.set(Some(index + 1));
                break;
            }
            index += 1;
        }
        Ok(ControlFlow::Continue(()))
    }
}
