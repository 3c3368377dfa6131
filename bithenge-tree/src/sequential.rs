//! Blob adapter over an incremental reader.

use std::cell::RefCell;
use std::io::Read;

use crate::{Blob, Error, Result};

/// Bytes pulled from the reader per request.
const READ_CHUNK: usize = 4096;

/// A blob that buffers bytes from an [`std::io::Read`] source on demand.
///
/// Random-access reads force the buffer to grow just far enough to
/// satisfy them; [`Blob::size`] forces the remainder. The source must
/// therefore be finite, but its length need not be known up front.
pub struct SequentialBlob<R: Read> {
    state: RefCell<State<R>>,
}

struct State<R> {
    reader: R,
    buffer: Vec<u8>,
    finished: bool,
}

impl<R: Read> SequentialBlob<R> {
    /// Wrap a reader.
    pub fn new(reader: R) -> Self {
        SequentialBlob {
            state: RefCell::new(State {
                reader,
                buffer: Vec::new(),
                finished: false,
            }),
        }
    }
}

impl<R> State<R>
where
    R: Read,
{
    /// Buffer at least `end` bytes, or everything if the source is
    /// shorter.
    fn fill_to(&mut self, end: u64) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.finished && (self.buffer.len() as u64) < end {
            let n = self.reader.read(&mut chunk)?;
            if n == 0 {
                self.finished = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(())
    }
}

impl<R> Blob for SequentialBlob<R>
where
    R: Read + 'static,
{
    fn size(&self) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        state.fill_to(u64::MAX)?;
        Ok(state.buffer.len() as u64)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        state.fill_to(offset + buf.len() as u64)?;
        if offset > state.buffer.len() as u64 {
            return Err(Error::Invalid);
        }
        let offset = offset as usize;
        let count = buf.len().min(state.buffer.len() - offset);
        buf[..count].copy_from_slice(&state.buffer[offset..offset + count]);
        Ok(count)
    }
}
