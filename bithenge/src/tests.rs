//! Property suites for the engine.

use std::rc::Rc;

use proptest::prelude::*;

use bithenge_tree::{blob_from_buffer, new_subblob, Node};

use crate::scope::Scope;
use crate::transform::primitive_transform;

/// Prefix consistency: when a transform reports a prefix length `n`,
/// decoding the bounded sub-view with `apply` must agree with
/// `prefix_apply`, both in the produced node and in `n` itself.
fn check_prefix_consistency(name: &str, data: Vec<u8>) -> std::result::Result<(), TestCaseError> {
    let xform = primitive_transform(name).unwrap();
    let scope = Scope::new(None);
    let input = blob_from_buffer(data);
    let blob = input.as_blob().unwrap();

    let Ok(length) = xform.prefix_length(&scope, blob) else {
        return Ok(());
    };
    let via_prefix = xform.prefix_apply(&scope, blob);
    let prefix = new_subblob(Rc::clone(blob), 0, length).unwrap();
    let via_apply = xform.apply(&scope, &prefix);
    match (via_prefix, via_apply) {
        (Ok((node, size)), Ok(expected)) => {
            prop_assert_eq!(size, length);
            prop_assert!(Node::equal(&node, &expected).unwrap());
        }
        (Err(a), Err(b)) => prop_assert_eq!(a, b),
        (a, b) => prop_assert!(false, "prefix_apply {a:?} disagrees with apply {b:?}"),
    }
    Ok(())
}

proptest! {
    #[test]
    fn fixed_uint_prefix_consistency(
        data in proptest::collection::vec(any::<u8>(), 0..12),
        name in prop::sample::select(vec!["uint8", "uint16le", "uint16be", "uint32le", "uint32be", "uint64le", "uint64be"]),
    ) {
        check_prefix_consistency(name, data)?;
    }

    #[test]
    fn zero_terminated_prefix_consistency(
        data in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        check_prefix_consistency("zero_terminated", data)?;
    }

    /// Decoding an n-bit big-endian field and the remaining bits of a
    /// byte always reassembles the byte.
    #[test]
    fn bitfield_split_reassembles(byte in any::<u8>(), split in 0i64..=8) {
        let scope = Scope::new(None);
        let bits = primitive_transform("bits_be")
            .unwrap()
            .apply(&scope, &blob_from_buffer(vec![byte]))
            .unwrap();
        let bits_blob = bits.as_blob().unwrap();
        let uint_be = primitive_transform("uint_be").unwrap();

        let head_scope = Scope::new(None);
        head_scope.alloc_params(1);
        head_scope.set_param(0, Node::Integer(split));
        let (head, consumed) = uint_be.prefix_apply(&head_scope, bits_blob).unwrap();
        prop_assert_eq!(consumed, split as u64);

        let tail = bithenge_tree::new_offset_blob(Rc::clone(bits_blob), split as u64).unwrap();
        let tail_scope = Scope::new(None);
        tail_scope.alloc_params(1);
        tail_scope.set_param(0, Node::Integer(8 - split));
        let (tail_value, _) = uint_be
            .prefix_apply(&tail_scope, tail.as_blob().unwrap())
            .unwrap();

        let head = head.as_integer().unwrap();
        let tail_value = tail_value.as_integer().unwrap();
        prop_assert_eq!((head << (8 - split)) | tail_value, byte as i64);
    }
}
