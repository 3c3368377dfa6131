//! Error taxonomy shared by the whole decoder.

/// Errors reported by the data model and the decoding engine.
///
/// Every fallible operation in the crate family reports one of these
/// variants; success is `Ok`. The variants are deliberately coarse so
/// that callers can probe (a missing child is distinct from a malformed
/// one) without having to match on message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Wrong node variant, arithmetic on the wrong type, a bit/byte
    /// boundary violation, or a format mismatch in the input data.
    #[error("invalid type, structure, or format")]
    Invalid,
    /// The operation is not provided by this variant.
    #[error("operation not supported")]
    NotSupported,
    /// An internal node has no child under the requested key, or a
    /// sequence index is out of range.
    #[error("no such child")]
    NotFound,
    /// A read started past the end of a blob.
    #[error("offset beyond the end of the blob")]
    OutOfRange,
    /// A source adapter failed to produce bytes.
    #[error("i/o error: {0}")]
    Io(String),
    /// A script failed to parse; the message carries the
    /// `file:line:column` diagnostic.
    #[error("{0}")]
    Syntax(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Error::Io("formatter error".into())
    }
}

/// Convenience alias used across the crate family.
pub type Result<T> = core::result::Result<T, Error>;
