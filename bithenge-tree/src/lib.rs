//! Node and blob data model of the Bithenge binary-structure decoder.
//!
//! A decoded tree is made of [`Node`]s: booleans, integers, strings,
//! raw [`Blob`]s, and [`Internal`] nodes (associative maps whose children
//! may be computed on demand). Blobs are byte- or bit-addressable views
//! over some backing store; sub-views, concatenations, and lazily
//! buffered sources all implement the same trait.
//!
//! This crate holds only the data model; transforms, expressions, and
//! the script language live in the `bithenge` crate.

mod blob;
mod error;
mod node;
mod sequential;


pub use blob::{
    blob_equal, blob_from_buffer, blob_from_data, new_offset_blob, new_subblob, Blob,
    MemoryBlob, SubParts,
};
pub use error::{Error, Result};
pub use node::{simple_internal, ForEach, Internal, Node, NodeType};
pub use sequential::SequentialBlob;

/// Integer payload of an integer node: signed, at least 64 bits wide.
pub type Int = i64;
