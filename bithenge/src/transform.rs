//! The transform framework and the built-in primitive transforms.

use std::cell::RefCell;
use std::rc::Rc;

use bithenge_tree::{new_subblob, Blob, Error, Int, Node, Result};

use crate::scope::Scope;

/// Shared handle to a transform.
pub type XformRef = Rc<dyn Transform>;

/// A decoder from an input node to an output node.
///
/// A realization provides `apply`, or `prefix_apply`, or both; the
/// missing operations are wired from the present ones with
/// `prefix_apply_via_length` and `prefix_length_via_apply`, exactly
/// where the transform has a corresponding natural definition. An
/// operation with no sensible definition keeps the unsupported default.
pub trait Transform {
    /// The number of parameters a caller must install before applying
    /// this transform.
    fn num_params(&self) -> usize {
        0
    }

    /// Decode the whole input node.
    ///
    /// The default runs [`Transform::prefix_apply`] and requires it to
    /// consume the entire blob.
    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let blob = input.as_blob()?;
        let (node, size) = self.prefix_apply(scope, blob)?;
        if blob.size()? != size {
            return Err(Error::Invalid);
        }
        Ok(node)
    }

    /// How many input units this transform would consume from the front
    /// of `blob`.
    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        let _ = (scope, blob);
        Err(Error::NotSupported)
    }

    /// Decode a prefix of `blob`, reporting the decoded node and how
    /// many input units it covered.
    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let _ = (scope, blob);
        Err(Error::NotSupported)
    }
}

/// Synthesize `prefix_apply` for a transform that knows its prefix
/// length: take that many units, then apply to the bounded sub-view.
pub(crate) fn prefix_apply_via_length<T>(
    xform: &T,
    scope: &Rc<Scope>,
    blob: &Rc<dyn Blob>,
) -> Result<(Node, u64)>
where
    T: Transform + ?Sized,
{
    let size = xform.prefix_length(scope, blob)?;
    let prefix = new_subblob(Rc::clone(blob), 0, size)?;
    let node = xform.apply(scope, &prefix)?;
    Ok((node, size))
}

/// Synthesize `prefix_length` for a transform that can only decode: run
/// it and discard the node.
pub(crate) fn prefix_length_via_apply<T>(
    xform: &T,
    scope: &Rc<Scope>,
    blob: &Rc<dyn Blob>,
) -> Result<u64>
where
    T: Transform + ?Sized,
{
    xform.prefix_apply(scope, blob).map(|(_, size)| size)
}

/// Wrapper around the body of a named transform.
///
/// Pushes a barrier frame carrying only the input node and the declared
/// parameters, so the body cannot see members of the caller's partially
/// built nodes.
pub struct BarrierTransform {
    num_params: usize,
    inner: RefCell<Option<XformRef>>,
}

impl BarrierTransform {
    /// Create a barrier expecting `num_params` parameters. The body must
    /// be installed with [`BarrierTransform::set_subtransform`] before
    /// use, which makes self-recursive definitions possible.
    pub fn new(num_params: usize) -> Self {
        BarrierTransform {
            num_params,
            inner: RefCell::new(None),
        }
    }

    /// Install the body. The body itself must not expect parameters; it
    /// reads this barrier's parameters through the scope chain.
    pub fn set_subtransform(&self, xform: XformRef) {
        debug_assert_eq!(xform.num_params(), 0);
        let mut slot = self.inner.borrow_mut();
        debug_assert!(slot.is_none());
        *slot = Some(xform);
    }

    fn inner(&self) -> Result<XformRef> {
        self.inner.borrow().clone().ok_or(Error::Invalid)
    }

    fn enter(&self, scope: &Rc<Scope>, in_node: Node) -> Rc<Scope> {
        let inner = Scope::new_barrier(Some(scope));
        inner.set_in_node(Some(in_node));
        inner
    }
}

impl Transform for BarrierTransform {
    fn num_params(&self) -> usize {
        self.num_params
    }

    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let inner_scope = self.enter(scope, input.clone());
        self.inner()?.apply(&inner_scope, input)
    }

    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        let inner_scope = self.enter(scope, Node::Blob(Rc::clone(blob)));
        self.inner()?.prefix_length(&inner_scope, blob)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let inner_scope = self.enter(scope, Node::Blob(Rc::clone(blob)));
        self.inner()?.prefix_apply(&inner_scope, blob)
    }
}

/// Decode the whole blob as UTF-8 text.
pub struct AsciiTransform;

impl Transform for AsciiTransform {
    fn apply(&self, _scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let blob = input.as_blob()?;
        let size = blob.size()?;
        let mut buf = vec![0u8; size as usize];
        let n = blob.read(0, &mut buf)?;
        if n as u64 != size {
            return Err(Error::Invalid);
        }
        let text = String::from_utf8(buf).map_err(|_| Error::Invalid)?;
        Ok(Node::string(text))
    }
}

/// Decode a single bit as a boolean.
pub struct BitTransform;

impl Transform for BitTransform {
    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        prefix_length_via_apply(self, scope, blob)
    }

    fn prefix_apply(&self, _scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let mut buf = [0u8; 1];
        let n = blob.read_bits(0, &mut buf, 1, true)?;
        if n != 1 {
            return Err(Error::Invalid);
        }
        Ok((Node::Boolean(buf[0] & 1 != 0), 1))
    }
}

/// Bit-addressable view over a byte blob, 8x its size.
struct BitsBlob {
    bytes: Rc<dyn Blob>,
    little_endian: bool,
}

impl Blob for BitsBlob {
    fn size(&self) -> Result<u64> {
        Ok(self.bytes.size()? * 8)
    }

    fn read_bits(
        &self,
        offset: u64,
        buf: &mut [u8],
        count: u64,
        little_endian: bool,
    ) -> Result<u64> {
        let byte_offset = offset / 8;
        let bit_offset = (offset % 8) as u32;
        let out_bytes = count.div_ceil(8) as usize;
        let span = (count + bit_offset as u64).div_ceil(8) as usize;
        // One extra zeroed byte so the shift below can read past the
        // last byte that actually holds data.
        let mut scratch = vec![0u8; span + 1];
        let n = self.bytes.read(byte_offset, &mut scratch[..span])?;
        let produced = count.min((n as u64 * 8).saturating_sub(bit_offset as u64));
        if little_endian != self.little_endian {
            for byte in scratch[..n].iter_mut() {
                *byte = byte.reverse_bits();
            }
        }
        for i in 0..out_bytes {
            let b0 = scratch[i];
            let b1 = scratch[i + 1];
            buf[i] = if bit_offset == 0 {
                b0
            } else if little_endian {
                (b0 >> bit_offset) | (b1 << (8 - bit_offset))
            } else {
                (b0 << bit_offset) | (b1 >> (8 - bit_offset))
            };
        }
        Ok(produced)
    }
}

/// Reinterpret a byte blob as a bit blob.
pub struct BitsTransform {
    little_endian: bool,
}

impl BitsTransform {
    /// `little_endian` selects whether bit 0 of each byte is the least
    /// or the most significant bit.
    pub fn new(little_endian: bool) -> Self {
        BitsTransform { little_endian }
    }
}

impl Transform for BitsTransform {
    fn apply(&self, _scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let bytes = input.as_blob()?;
        Ok(Node::Blob(Rc::new(BitsBlob {
            bytes: Rc::clone(bytes),
            little_endian: self.little_endian,
        })))
    }
}

/// Always fails; the fallback arm of a desugared `switch`.
pub struct InvalidTransform;

impl Transform for InvalidTransform {
    fn apply(&self, _scope: &Rc<Scope>, _input: &Node) -> Result<Node> {
        Err(Error::Invalid)
    }
}

/// Pass the blob through, requiring its size to equal the first
/// parameter.
pub struct KnownLengthTransform;

impl KnownLengthTransform {
    fn length(scope: &Rc<Scope>) -> Result<u64> {
        let length = scope.get_param(0)?.as_integer()?;
        if length < 0 {
            return Err(Error::Invalid);
        }
        Ok(length as u64)
    }
}

impl Transform for KnownLengthTransform {
    fn num_params(&self) -> usize {
        1
    }

    fn apply(&self, scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let length = Self::length(scope)?;
        let blob = input.as_blob()?;
        if blob.size()? != length {
            return Err(Error::Invalid);
        }
        Ok(input.clone())
    }

    fn prefix_length(&self, scope: &Rc<Scope>, _blob: &Rc<dyn Blob>) -> Result<u64> {
        Self::length(scope)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        prefix_apply_via_length(self, scope, blob)
    }
}

/// Integer to boolean, true iff nonzero.
pub struct NonzeroBooleanTransform;

impl Transform for NonzeroBooleanTransform {
    fn apply(&self, _scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        Ok(Node::Boolean(input.as_integer()? != 0))
    }
}

/// Fixed-width unsigned integer decoder.
pub struct FixedUintTransform {
    width: usize,
    little_endian: bool,
}

impl FixedUintTransform {
    /// `width` is the number of bytes, 1 to 8.
    pub fn new(width: usize, little_endian: bool) -> Self {
        debug_assert!((1..=8).contains(&width));
        FixedUintTransform {
            width,
            little_endian,
        }
    }
}

impl Transform for FixedUintTransform {
    fn apply(&self, _scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let blob = input.as_blob()?;
        // Request one extra byte; receiving it means the blob is longer
        // than the field.
        let mut buf = [0u8; 9];
        let n = blob.read(0, &mut buf[..self.width + 1])?;
        if n != self.width {
            return Err(Error::Invalid);
        }
        let mut word = [0u8; 8];
        let value = if self.little_endian {
            word[..self.width].copy_from_slice(&buf[..self.width]);
            u64::from_le_bytes(word)
        } else {
            word[8 - self.width..].copy_from_slice(&buf[..self.width]);
            u64::from_be_bytes(word)
        };
        // The full 64-bit range wraps into the signed node domain.
        Ok(Node::Integer(value as Int))
    }

    fn prefix_length(&self, _scope: &Rc<Scope>, _blob: &Rc<dyn Blob>) -> Result<u64> {
        Ok(self.width as u64)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        prefix_apply_via_length(self, scope, blob)
    }
}

/// Unsigned integer of an arbitrary bit width given by the first
/// parameter; at most 63 bits so the result stays nonnegative.
pub struct UintBitsTransform {
    little_endian: bool,
}

impl UintBitsTransform {
    /// `little_endian` controls both the bit order within bytes and the
    /// byte significance order.
    pub fn new(little_endian: bool) -> Self {
        UintBitsTransform { little_endian }
    }
}

impl Transform for UintBitsTransform {
    fn num_params(&self) -> usize {
        1
    }

    fn prefix_length(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        prefix_length_via_apply(self, scope, blob)
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        let num_bits = scope.get_param(0)?.as_integer()?;
        if !(0..=63).contains(&num_bits) {
            return Err(Error::Invalid);
        }
        let num_bits = num_bits as u64;
        let mut buf = [0u8; 8];
        let n = blob.read_bits(0, &mut buf, num_bits, self.little_endian)?;
        if n != num_bits {
            return Err(Error::Invalid);
        }

        let full_bytes = (num_bits / 8) as usize;
        let tail_bits = (num_bits % 8) as u32;
        let mut value: Int = 0;
        if self.little_endian {
            for (i, byte) in buf[..full_bytes].iter().enumerate() {
                value += (*byte as Int) << (8 * i);
            }
            if tail_bits != 0 {
                let tail = buf[full_bytes] & ((1u8 << tail_bits) - 1);
                value += (tail as Int) << (8 * full_bytes);
            }
        } else {
            for (i, byte) in buf[..full_bytes].iter().enumerate() {
                value += (*byte as Int) << (num_bits - 8 * (i as u64 + 1));
            }
            if tail_bits != 0 {
                value += (buf[full_bytes] >> (8 - tail_bits)) as Int;
            }
        }
        Ok((Node::Integer(value), num_bits))
    }
}

/// Strip the trailing NUL from a blob.
pub struct ZeroTerminatedTransform;

impl Transform for ZeroTerminatedTransform {
    fn apply(&self, _scope: &Rc<Scope>, input: &Node) -> Result<Node> {
        let blob = input.as_blob()?;
        let size = blob.size()?;
        if size < 1 {
            return Err(Error::Invalid);
        }
        let mut last = [0u8; 1];
        let n = blob.read(size - 1, &mut last)?;
        if n != 1 || last[0] != 0 {
            return Err(Error::Invalid);
        }
        new_subblob(Rc::clone(blob), 0, size - 1)
    }

    fn prefix_length(&self, _scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<u64> {
        let mut buf = [0u8; 4096];
        let mut offset = 0u64;
        loop {
            let n = blob.read(offset, &mut buf)?;
            if let Some(pos) = buf[..n].iter().position(|&byte| byte == 0) {
                return Ok(offset + pos as u64 + 1);
            }
            if n < buf.len() {
                return Err(Error::Invalid);
            }
            offset += n as u64;
        }
    }

    fn prefix_apply(&self, scope: &Rc<Scope>, blob: &Rc<dyn Blob>) -> Result<(Node, u64)> {
        prefix_apply_via_length(self, scope, blob)
    }
}

/// Look up a built-in transform by its script name.
pub fn primitive_transform(name: &str) -> Option<XformRef> {
    let xform: XformRef = match name {
        "ascii" => Rc::new(AsciiTransform),
        "bit" => Rc::new(BitTransform),
        "bits_be" => Rc::new(BitsTransform::new(false)),
        "bits_le" => Rc::new(BitsTransform::new(true)),
        "known_length" => Rc::new(KnownLengthTransform),
        "nonzero_boolean" => Rc::new(NonzeroBooleanTransform),
        "uint8" => Rc::new(FixedUintTransform::new(1, false)),
        "uint16be" => Rc::new(FixedUintTransform::new(2, false)),
        "uint16le" => Rc::new(FixedUintTransform::new(2, true)),
        "uint32be" => Rc::new(FixedUintTransform::new(4, false)),
        "uint32le" => Rc::new(FixedUintTransform::new(4, true)),
        "uint64be" => Rc::new(FixedUintTransform::new(8, false)),
        "uint64le" => Rc::new(FixedUintTransform::new(8, true)),
        "uint_be" => Rc::new(UintBitsTransform::new(false)),
        "uint_le" => Rc::new(UintBitsTransform::new(true)),
        "zero_terminated" => Rc::new(ZeroTerminatedTransform),
        _ => return None,
    };
    Some(xform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bithenge_tree::blob_from_data;

    fn scope() -> Rc<Scope> {
        Scope::new(None)
    }

    fn scope_with_int_param(value: Int) -> Rc<Scope> {
        let scope = Scope::new(None);
        scope.alloc_params(1);
        scope.set_param(0, Node::Integer(value));
        scope
    }

    #[test]
    fn fixed_uints_decode_both_endiannesses() {
        let cases: [(&str, &[u8], Int); 6] = [
            ("uint8", &[0x42], 0x42),
            ("uint16le", &[0x34, 0x12], 0x1234),
            ("uint16be", &[0x12, 0x34], 0x1234),
            ("uint32le", &[0x78, 0x56, 0x34, 0x12], 0x1234_5678),
            ("uint32be", &[0x12, 0x34, 0x56, 0x78], 0x1234_5678),
            ("uint64be", &[0, 0, 0, 0, 0, 0, 0x02, 0x01], 0x0201),
        ];
        for (name, bytes, expected) in cases {
            let xform = primitive_transform(name).unwrap();
            let out = xform.apply(&scope(), &blob_from_data(bytes)).unwrap();
            assert_eq!(out.as_integer().unwrap(), expected, "{name}");
        }
    }

    #[test]
    fn fixed_uint_rejects_wrong_sizes() {
        let xform = primitive_transform("uint16be").unwrap();
        let too_short = xform.apply(&scope(), &blob_from_data(&[1]));
        assert_eq!(too_short.unwrap_err(), Error::Invalid);
        let too_long = xform.apply(&scope(), &blob_from_data(&[1, 2, 3]));
        assert_eq!(too_long.unwrap_err(), Error::Invalid);
    }

    #[test]
    fn fixed_uint_prefix_apply_takes_exactly_width() {
        let xform = primitive_transform("uint16le").unwrap();
        let input = blob_from_data(&[0x34, 0x12, 0xff]);
        let (node, size) = xform
            .prefix_apply(&scope(), input.as_blob().unwrap())
            .unwrap();
        assert_eq!(node.as_integer().unwrap(), 0x1234);
        assert_eq!(size, 2);
    }

    #[test]
    fn ascii_decodes_whole_blob() {
        let xform = primitive_transform("ascii").unwrap();
        let out = xform.apply(&scope(), &blob_from_data(b"Hello")).unwrap();
        assert_eq!(out.as_str().unwrap(), "Hello");
    }

    #[test]
    fn zero_terminated_strips_terminator() {
        let xform = primitive_transform("zero_terminated").unwrap();
        let input = blob_from_data(b"hi\0");
        let out = xform.apply(&scope(), &input).unwrap();
        let blob = out.as_blob().unwrap();
        assert_eq!(blob.size().unwrap(), 2);

        let length = xform
            .prefix_length(&scope(), input.as_blob().unwrap())
            .unwrap();
        assert_eq!(length, 3);

        let no_nul = xform.prefix_length(&scope(), blob_from_data(b"hi").as_blob().unwrap());
        assert_eq!(no_nul.unwrap_err(), Error::Invalid);
    }

    #[test]
    fn known_length_passes_or_rejects() {
        let xform = primitive_transform("known_length").unwrap();
        let scope = scope_with_int_param(3);
        let ok = xform.apply(&scope, &blob_from_data(&[1, 2, 3])).unwrap();
        assert_eq!(ok.as_blob().unwrap().size().unwrap(), 3);
        let bad = xform.apply(&scope, &blob_from_data(&[1, 2]));
        assert_eq!(bad.unwrap_err(), Error::Invalid);
        assert_eq!(
            xform
                .prefix_length(&scope, blob_from_data(&[]).as_blob().unwrap())
                .unwrap(),
            3
        );
    }

    #[test]
    fn bit_reads_the_low_bit_first() {
        let xform = primitive_transform("bit").unwrap();
        let (node, size) = xform
            .prefix_apply(&scope(), blob_from_data(&[0b0000_0010]).as_blob().unwrap())
            .unwrap();
        assert!(!node.as_boolean().unwrap());
        assert_eq!(size, 1);
    }

    #[test]
    fn bits_be_view_is_eight_times_larger() {
        let xform = primitive_transform("bits_be").unwrap();
        let out = xform.apply(&scope(), &blob_from_data(&[0xa5])).unwrap();
        let bits = out.as_blob().unwrap();
        assert_eq!(bits.size().unwrap(), 8);
        let mut buf = [0u8; 1];
        assert_eq!(bits.read_bits(0, &mut buf, 3, false).unwrap(), 3);
        // 0xa5 = 10100101, so the first three bits MSB-first are 101.
        assert_eq!(buf[0] >> 5, 0b101);
    }

    #[test]
    fn bits_views_reverse_per_byte_between_endiannesses() {
        let blob = BitsBlob {
            bytes: Rc::clone(blob_from_data(&[0b1000_0000]).as_blob().unwrap()),
            little_endian: false,
        };
        let mut buf = [0u8; 1];
        // In the producer's big-endian view the first bit is 1; reading
        // the same stream little-endian reverses each byte.
        blob.read_bits(0, &mut buf, 8, true).unwrap();
        assert_eq!(buf[0], 0b0000_0001);
    }

    #[test]
    fn uint_bits_decodes_bitfields() {
        let bits = primitive_transform("bits_be")
            .unwrap()
            .apply(&scope(), &blob_from_data(&[0xa5]))
            .unwrap();
        let bits_blob = bits.as_blob().unwrap();
        let xform = primitive_transform("uint_be").unwrap();

        let scope3 = scope_with_int_param(3);
        let (x, size) = xform.prefix_apply(&scope3, bits_blob).unwrap();
        assert_eq!(x.as_integer().unwrap(), 5);
        assert_eq!(size, 3);

        let tail = bithenge_tree::new_offset_blob(Rc::clone(bits_blob), 3).unwrap();
        let scope5 = scope_with_int_param(5);
        let (y, size) = xform.prefix_apply(&scope5, tail.as_blob().unwrap()).unwrap();
        assert_eq!(y.as_integer().unwrap(), 5);
        assert_eq!(size, 5);
    }

    #[test]
    fn uint_bits_rejects_out_of_range_widths() {
        let xform = primitive_transform("uint_be").unwrap();
        for width in [-1, 64] {
            let scope = scope_with_int_param(width);
            let result = xform.prefix_apply(&scope, blob_from_data(&[0; 9]).as_blob().unwrap());
            assert_eq!(result.unwrap_err(), Error::Invalid);
        }
    }

    #[test]
    fn nonzero_boolean_converts_integers() {
        let xform = primitive_transform("nonzero_boolean").unwrap();
        assert!(xform
            .apply(&scope(), &Node::Integer(-3))
            .unwrap()
            .as_boolean()
            .unwrap());
        assert!(!xform
            .apply(&scope(), &Node::Integer(0))
            .unwrap()
            .as_boolean()
            .unwrap());
        assert_eq!(
            xform.apply(&scope(), &Node::Boolean(true)).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn invalid_always_fails() {
        let xform = primitive_transform("invalid");
        assert!(xform.is_none(), "invalid is not script-visible");
        let direct = InvalidTransform;
        assert_eq!(
            direct.apply(&scope(), &Node::Integer(0)).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn apply_synthesized_from_prefix_apply_requires_full_consumption() {
        let xform = primitive_transform("bit").unwrap();
        let result = xform.apply(&scope(), &blob_from_data(&[1, 2]));
        assert_eq!(result.unwrap_err(), Error::Invalid);
    }

    #[test]
    fn barrier_hides_outer_members_but_passes_params() {
        let barrier = BarrierTransform::new(0);
        barrier.set_subtransform(primitive_transform("uint8").unwrap());
        let scope = Scope::new(None);
        let out = barrier.apply(&scope, &blob_from_data(&[9])).unwrap();
        assert_eq!(out.as_integer().unwrap(), 9);
    }
}
