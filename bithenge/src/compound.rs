//! Combinators over whole transforms: composition, conditionals, and
//! partial application.

use std::rc::Rc;

use bithenge_tree::{Blob, Error, Node, Result};

use crate::expression::ExprRef;
use crate::scope::Scope;
use crate::transform::{prefix_apply_via_length, Transform, XformRef};

/// `x1 <- x2 <- … <- xn`: the rightmost transform consumes the raw
/// input, each result feeds the transform to its left.
pub struct ComposeTransform {
    xforms: Vec<XformRef>,
}

/// Compose `xforms`, leftmost outermost. A single transform is returned
/// unchanged.
pub fn new_composed_transform(mut xforms: Vec<XformRef>) -> XformRef {
    if xforms.len() == 1 {
        return xforms.remove(0);
    }
    Rc::new(ComposeTransform { xforms })
}

impl Transform for ComposeTransform {
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let mut node = input.clone();
        for xform in self.xforms.iter().rev() {
            node = xform.apply(scope, &node)?;
        }
        Ok(node)
    }

    /// Only the rightmost transform touches the byte stream; the others
    /// rework a node, so the composition's prefix is its prefix.
    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        let last = self.xforms.last().ok_or(Error::NotSupported)?;
        last.prefix_length(scope, blob)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        prefix_apply_via_length(self, scope, blob)
    }
}

/// Dispatches to one of two transforms on a boolean expression.
pub struct IfTransform {
    condition: ExprRef,
    on_true: XformRef,
    on_false: XformRef,
}

impl IfTransform {
    /// Evaluate `condition` in the caller's scope; it must produce a
    /// boolean.
    pub fn new(condition: ExprRef, on_true: XformRef, on_false: XformRef) -> Self {
        IfTransform {
            condition,
            on_true,
            on_false,
        }
    }

    fn choose(&self, scope: &Rc<Scope>) -> Result<&XformRef> {
        if self.condition.evaluate(scope)?.as_boolean()? {
            Ok(&self.on_true)
        } else {
            Ok(&self.on_false)
        }
    }
}

impl Transform for IfTransform {
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        self.choose(scope)?.apply(scope, input)
    }

    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        self.choose(scope)?.prefix_length(scope, blob)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        prefix_apply_via_length(self, scope, blob)
    }
}

/// Applies the wrapped transform to a prefix of the input without
/// requiring it to consume the whole blob.
pub struct PartialTransform {
    inner: XformRef,
}

impl PartialTransform {
    /// Wrap `inner`.
    pub fn new(inner: XformRef) -> Self {
        PartialTransform { inner }
    }
}

impl Transform for PartialTransform {
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let blob = input.as_blob()?;
        let (node, _) = self.inner.prefix_apply(scope, blob)?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ConstExpression;
    use crate::transform::primitive_transform;
    use bithenge_tree::blob_from_data;

    fn scope() -> Rc<Scope> {
        Scope::new(None)
    }

    fn const_expr(node: Node) -> ExprRef {
        Rc::new(ConstExpression::new(node))
    }

    #[test]
    fn compose_applies_rightmost_first() {
        // ascii <- zero_terminated: strip the NUL, then decode text.
        let composed = new_composed_transform(vec![
            primitive_transform("ascii").unwrap(),
            primitive_transform("zero_terminated").unwrap(),
        ]);
        let out = composed.apply(&scope(), &blob_from_data(b"hi\0")).unwrap();
        assert_eq!(out.as_str().unwrap(), "hi");
    }

    #[test]
    fn compose_prefix_length_delegates_to_the_rightmost() {
        let composed = new_composed_transform(vec![
            primitive_transform("ascii").unwrap(),
            primitive_transform("zero_terminated").unwrap(),
        ]);
        let blob = blob_from_data(b"hi\0xx");
        let length = composed
            .prefix_length(&scope(), blob.as_blob().unwrap())
            .unwrap();
        assert_eq!(length, 3);
        let (node, size) = composed
            .prefix_apply(&scope(), blob.as_blob().unwrap())
            .unwrap();
        assert_eq!(node.as_str().unwrap(), "hi");
        assert_eq!(size, 3);
    }

    #[test]
    fn compose_of_non_consumer_has_no_prefix_length() {
        let composed = new_composed_transform(vec![
            primitive_transform("ascii").unwrap(),
            primitive_transform("nonzero_boolean").unwrap(),
        ]);
        let blob = blob_from_data(&[1]);
        let result = composed.prefix_length(&scope(), blob.as_blob().unwrap());
        assert_eq!(result.unwrap_err(), Error::NotSupported);
    }

    #[test]
    fn if_dispatches_on_the_condition() {
        let xform = IfTransform::new(
            const_expr(Node::Boolean(false)),
            primitive_transform("uint16be").unwrap(),
            primitive_transform("uint16le").unwrap(),
        );
        let out = xform.apply(&scope(), &blob_from_data(&[0x34, 0x12])).unwrap();
        assert_eq!(out.as_integer().unwrap(), 0x1234);
    }

    #[test]
    fn if_requires_a_boolean_condition() {
        let xform = IfTransform::new(
            const_expr(Node::Integer(1)),
            primitive_transform("uint8").unwrap(),
            primitive_transform("uint8").unwrap(),
        );
        let result = xform.apply(&scope(), &blob_from_data(&[1]));
        assert_eq!(result.unwrap_err(), Error::Invalid);
    }

    #[test]
    fn partial_allows_leftover_input() {
        let xform = PartialTransform::new(primitive_transform("uint8").unwrap());
        let out = xform
            .apply(&scope(), &blob_from_data(&[9, 99, 255]))
            .unwrap();
        assert_eq!(out.as_integer().unwrap(), 9);
    }
}
