//! Dynamic environment chain threaded through transform application.

use std::cell::RefCell;
use std::rc::Rc;

use bithenge_tree::{Error, Node, Result};

/// One frame of the dynamic environment.
///
/// A transform pushes a frame before calling into subtransforms and
/// drops it afterwards. A frame carries the parameters of the innermost
/// parameterized transform, the node currently being built (so that
/// later fields can refer back to earlier siblings), the input node, and
/// a barrier flag that stops outward member lookup at the boundary of a
/// named transform.
pub struct Scope {
    outer: Option<Rc<Scope>>,
    barrier: bool,
    params: RefCell<Vec<Option<Node>>>,
    current_node: RefCell<Option<Node>>,
    in_node: RefCell<Option<Node>>,
    error: RefCell<Option<String>>,
}

impl Scope {
    /// Push a fresh frame inside `outer`.
    pub fn new(outer: Option<&Rc<Scope>>) -> Rc<Scope> {
        Scope::build(outer, false)
    }

    /// Push a fresh frame that blocks outward member lookup.
    pub fn new_barrier(outer: Option<&Rc<Scope>>) -> Rc<Scope> {
        Scope::build(outer, true)
    }

    fn build(outer: Option<&Rc<Scope>>, barrier: bool) -> Rc<Scope> {
        Rc::new(Scope {
            outer: outer.cloned(),
            barrier,
            params: RefCell::new(Vec::new()),
            current_node: RefCell::new(None),
            in_node: RefCell::new(None),
            error: RefCell::new(None),
        })
    }

    /// The enclosing frame, if any.
    pub fn outer(&self) -> Option<&Rc<Scope>> {
        self.outer.as_ref()
    }

    /// Whether member lookup stops at this frame.
    pub fn is_barrier(&self) -> bool {
        self.barrier
    }

    /// The node currently being built in this frame.
    pub fn current_node(&self) -> Option<Node> {
        self.current_node.borrow().clone()
    }

    /// Install the node currently being built.
    pub fn set_current_node(&self, node: Option<Node>) {
        *self.current_node.borrow_mut() = node;
    }

    /// The input node of this frame.
    pub fn in_node(&self) -> Option<Node> {
        self.in_node.borrow().clone()
    }

    /// Install the input node.
    pub fn set_in_node(&self, node: Option<Node>) {
        *self.in_node.borrow_mut() = node;
    }

    /// Allocate `count` empty parameter slots. Must be called at most
    /// once per frame, before any slot is set.
    pub fn alloc_params(&self, count: usize) {
        let mut params = self.params.borrow_mut();
        debug_assert!(params.is_empty());
        *params = vec![None; count];
    }

    /// Fill parameter slot `index`. Each slot is assigned exactly once.
    pub fn set_param(&self, index: usize, node: Node) {
        let mut params = self.params.borrow_mut();
        debug_assert!(params[index].is_none());
        params[index] = Some(node);
    }

    /// Fetch parameter `index`, walking outward to the nearest frame
    /// that has parameters. Frames without parameters are transparent,
    /// so a wrapper pushed for bookkeeping does not hide the enclosing
    /// transform's parameters.
    pub fn get_param(&self, index: usize) -> Result<Node> {
        let params = self.params.borrow();
        if params.is_empty() {
            drop(params);
            match self.outer() {
                Some(outer) => outer.get_param(index),
                None => Err(Error::Invalid),
            }
        } else {
            params.get(index).cloned().flatten().ok_or(Error::Invalid)
        }
    }

    /// Record a diagnostic at the outermost frame. If any frame already
    /// carries one, the new message is dropped: the first error wins.
    ///
    /// Returns the error value the caller should propagate.
    pub fn report(&self, message: impl Into<String>) -> Error {
        let mut frame = self;
        loop {
            if frame.error.borrow().is_some() {
                return Error::Invalid;
            }
            match frame.outer() {
                Some(outer) => frame = outer.as_ref(),
                None => break,
            }
        }
        let message = message.into();
        tracing::debug!(message = %message, "scope diagnostic");
        *frame.error.borrow_mut() = Some(message);
        Error::Invalid
    }

    /// The diagnostic recorded at the outermost frame, if any.
    pub fn error_message(&self) -> Option<String> {
        let mut frame = self;
        while let Some(outer) = frame.outer() {
            frame = outer.as_ref();
        }
        frame.error.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_found_through_paramless_frames() {
        let root = Scope::new(None);
        root.alloc_params(2);
        root.set_param(0, Node::Integer(10));
        root.set_param(1, Node::Integer(20));
        let inner = Scope::new(Some(&root));
        let innermost = Scope::new(Some(&inner));
        assert_eq!(innermost.get_param(1).unwrap().as_integer().unwrap(), 20);
    }

    #[test]
    fn frames_with_params_shadow_outer_ones() {
        let root = Scope::new(None);
        root.alloc_params(1);
        root.set_param(0, Node::Integer(1));
        let inner = Scope::new(Some(&root));
        inner.alloc_params(1);
        inner.set_param(0, Node::Integer(2));
        assert_eq!(inner.get_param(0).unwrap().as_integer().unwrap(), 2);
    }

    #[test]
    fn missing_params_are_an_error() {
        let scope = Scope::new(None);
        assert_eq!(scope.get_param(0).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn first_error_wins() {
        let root = Scope::new(None);
        let inner = Scope::new(Some(&root));
        assert_eq!(inner.report("first"), Error::Invalid);
        assert_eq!(inner.report("second"), Error::Invalid);
        assert_eq!(root.error_message().as_deref(), Some("first"));
        assert_eq!(inner.error_message().as_deref(), Some("first"));
    }

    #[test]
    fn barrier_flag_is_set_at_construction() {
        let root = Scope::new(None);
        let barrier = Scope::new_barrier(Some(&root));
        assert!(barrier.is_barrier());
        assert!(!root.is_barrier());
    }
}
