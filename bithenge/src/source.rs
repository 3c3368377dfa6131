//! Root blob construction from `scheme:payload` source descriptions.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::rc::Rc;

use bithenge_tree::{blob_from_buffer, Blob, Error, Node, Result};

/// A blob reading lazily from an open file.
pub struct FileBlob {
    file: RefCell<File>,
    size: u64,
}

impl FileBlob {
    /// Open `path` and wrap it as a blob node. The size is fixed at
    /// open time.
    pub fn open(path: impl AsRef<Path>) -> Result<Node> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Node::Blob(Rc::new(FileBlob {
            file: RefCell::new(file),
            size,
        })))
    }
}

impl Blob for FileBlob {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset > self.size {
            return Err(Error::OutOfRange);
        }
        let count = buf.len().min((self.size - offset) as usize);
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..count])?;
        Ok(count)
    }
}

/// Create a root node from a source description.
///
/// Recognized forms: `hex:HEX` (an even-length hex string decoded to a
/// memory blob), `file:PATH`, and a bare path treated as a file name.
/// `block:` device sources exist only on platforms with a local block
/// device registry and are unsupported here.
pub fn node_from_source(source: &str) -> Result<Node> {
    match source.split_once(':') {
        Some(("file", path)) => FileBlob::open(path),
        Some(("hex", payload)) => {
            let data = hex::decode(payload).map_err(|_| Error::Invalid)?;
            Ok(blob_from_buffer(data))
        }
        Some(("block", _)) => Err(Error::NotSupported),
        Some(_) => Err(Error::Invalid),
        None => FileBlob::open(source),
    }
}
