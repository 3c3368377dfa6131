//! Raw binary blobs.

use std::rc::Rc;

use crate::{Error, Node, Result};

/// Window size used when streaming blob contents.
const COMPARE_CHUNK: usize = 4096;

/// Constituent parts of a sub-view blob, used to flatten nested views.
pub struct SubParts {
    /// The blob the view reads from.
    pub source: Rc<dyn Blob>,
    /// Start of the view within `source`.
    pub offset: u64,
    /// Bound of the view, or `None` when it extends to the end.
    pub size: Option<u64>,
}

/// A byte- or bit-addressable immutable sequence.
///
/// A realization is either byte-addressable (it overrides [`Blob::read`])
/// or bit-addressable (it overrides [`Blob::read_bits`]); the other
/// operation is synthesized where possible. [`Blob::size`] reports bytes
/// for byte blobs and bits for bit blobs.
pub trait Blob {
    /// Total size, in the blob's native unit.
    fn size(&self) -> Result<u64>;

    /// Read bytes starting at `offset`, returning how many were
    /// produced. Short reads happen at the end of the blob; an offset
    /// past the end is an error.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _ = (offset, buf);
        Err(Error::NotSupported)
    }

    /// Read `count` bits starting at bit `offset` into `buf`, returning
    /// how many bits were produced.
    ///
    /// `buf` must hold at least `count` bits. In the little-endian view
    /// bit 0 of the stream is the least significant bit of the first
    /// byte; in the big-endian view it is the most significant. Partial
    /// tail bits fill the last written byte from that same end.
    ///
    /// Byte blobs synthesize this from [`Blob::read`], which requires a
    /// byte-aligned `offset`.
    fn read_bits(
        &self,
        offset: u64,
        buf: &mut [u8],
        count: u64,
        little_endian: bool,
    ) -> Result<u64> {
        let _ = little_endian;
        if offset % 8 != 0 {
            return Err(Error::Invalid);
        }
        let byte_count = count.div_ceil(8) as usize;
        let n = self.read(offset / 8, &mut buf[..byte_count])?;
        Ok(count.min(n as u64 * 8))
    }

    /// The parts of a sub-view, if this blob is one. Lets view
    /// constructors collapse a view-of-a-view into a single view.
    fn sub_parts(&self) -> Option<SubParts> {
        None
    }

    /// Whether the blob holds no data at all.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }
}

/// A blob backed by an owned byte buffer.
pub struct MemoryBlob {
    data: Vec<u8>,
}

impl MemoryBlob {
    /// Wrap an owned buffer.
    pub fn new(data: Vec<u8>) -> Self {
        MemoryBlob { data }
    }
}

impl Blob for MemoryBlob {
    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset > self.data.len() as u64 {
            return Err(Error::OutOfRange);
        }
        let offset = offset as usize;
        let count = buf.len().min(self.data.len() - offset);
        buf[..count].copy_from_slice(&self.data[offset..offset + count]);
        Ok(count)
    }
}

/// Create a blob node that owns `data`.
pub fn blob_from_buffer(data: Vec<u8>) -> Node {
    Node::Blob(Rc::new(MemoryBlob::new(data)))
}

/// Create a blob node holding a copy of `data`.
pub fn blob_from_data(data: &[u8]) -> Node {
    blob_from_buffer(data.to_vec())
}

/// A shifted and optionally bounded view over another blob.
struct SubBlob {
    source: Rc<dyn Blob>,
    offset: u64,
    size: Option<u64>,
}

impl SubBlob {
    /// Clamp a request against the bound, if any. An offset past the
    /// bound is a structural error rather than a plain overrun.
    fn clamp(&self, offset: u64, wanted: u64) -> Result<u64> {
        match self.size {
            Some(size) => {
                if offset > size {
                    return Err(Error::Invalid);
                }
                Ok(wanted.min(size - offset))
            }
            None => Ok(wanted),
        }
    }
}

impl Blob for SubBlob {
    fn size(&self) -> Result<u64> {
        match self.size {
            Some(size) => Ok(size),
            None => Ok(self.source.size()?.saturating_sub(self.offset)),
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let count = self.clamp(offset, buf.len() as u64)? as usize;
        self.source.read(self.offset + offset, &mut buf[..count])
    }

    fn read_bits(
        &self,
        offset: u64,
        buf: &mut [u8],
        count: u64,
        little_endian: bool,
    ) -> Result<u64> {
        let count = self.clamp(offset, count)?;
        self.source
            .read_bits(self.offset + offset, buf, count, little_endian)
    }

    fn sub_parts(&self) -> Option<SubParts> {
        Some(SubParts {
            source: Rc::clone(&self.source),
            offset: self.offset,
            size: self.size,
        })
    }
}

fn new_sub(source: Rc<dyn Blob>, offset: u64, size: Option<u64>) -> Result<Node> {
    let mut source = source;
    let mut offset = offset;
    let mut size = size;
    // A view of a view collapses into a single view over the original
    // source, so deep nesting cannot build up. The inner bound clamps
    // the requested one.
    if let Some(parts) = source.sub_parts() {
        if let Some(limit) = parts.size {
            if offset > limit {
                return Err(Error::Invalid);
            }
            let available = limit - offset;
            size = Some(match size {
                Some(requested) => requested.min(available),
                None => available,
            });
        }
        offset += parts.offset;
        source = parts.source;
    }
    Ok(Node::Blob(Rc::new(SubBlob {
        source,
        offset,
        size,
    })))
}

/// Create a view of `source` shifted by `offset` and extending to its
/// end.
pub fn new_offset_blob(source: Rc<dyn Blob>, offset: u64) -> Result<Node> {
    new_sub(source, offset, None)
}

/// Create a bounded view of `source` covering `size` units starting at
/// `offset`.
pub fn new_subblob(source: Rc<dyn Blob>, offset: u64, size: u64) -> Result<Node> {
    new_sub(source, offset, Some(size))
}

/// Compare two blobs by content, streaming over fixed-size windows.
pub fn blob_equal(a: &dyn Blob, b: &dyn Blob) -> Result<bool> {
    let mut buf_a = [0u8; COMPARE_CHUNK];
    let mut buf_b = [0u8; COMPARE_CHUNK];
    let mut offset = 0u64;
    loop {
        let na = a.read(offset, &mut buf_a)?;
        let nb = b.read(offset, &mut buf_b)?;
        if na != nb || buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
        if na < COMPARE_CHUNK {
            return Ok(true);
        }
        offset += na as u64;
    }
}
