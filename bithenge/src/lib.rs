//! Bithenge: a scriptable binary-structure decoder.
//!
//! Raw bytes go in as a [`Node`] wrapping a blob; a [`Transform`],
//! usually the `main` transform of a parsed script, turns them into a
//! typed tree of booleans, integers, strings, blobs, and lazily decoded
//! internal nodes. Scripts compose transforms out of primitives such as
//! `uint16le` and `zero_terminated`, sequence constructs (`struct`,
//! `repeat`, `do { } while`), and expressions over the partially built
//! tree.
//!
//! ```
//! use bithenge::{node_from_source, node_to_string, parse_script, PrintFormat, Scope};
//!
//! let main = parse_script(
//!     "demo.bh",
//!     "transform main = struct { .a <- uint8; .b <- uint16le; };",
//! )?;
//! let input = node_from_source("hex:423412")?;
//! let scope = Scope::new(None);
//! let tree = main.apply(&scope, &input)?;
//! let text = node_to_string(PrintFormat::Json, &tree)?;
//! assert!(text.contains("\"b\": 4660"));
//! # Ok::<(), bithenge::Error>(())
//! ```
//!
//! The data model lives in the [`bithenge-tree`](bithenge_tree) crate,
//! re-exported here as [`tree`].

pub mod compound;
pub mod expression;
pub mod print;
pub mod scope;
pub mod script;
pub mod sequence;
pub mod source;
pub mod transform;

#[cfg(test)]
mod tests;

pub use bithenge_tree as tree;
pub use bithenge_tree::{Blob, Error, Int, Internal, Node, NodeType, Result};
pub use print::{node_to_string, print_node, write_node, PrintFormat};
pub use scope::Scope;
pub use script::{parse_script, parse_script_file};
pub use source::node_from_source;
pub use transform::{primitive_transform, Transform, XformRef};
