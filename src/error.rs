//! Error taxonomy for the AFF4 library.
//!
//! Every fallible operation in this crate returns `Aff4Result<T>`. The
//! variants mirror the in-band status codes of the reference
//! implementation (`NOT_FOUND`, `INCOMPATIBLE_TYPES`, `INVALID_INPUT`,
//! `IO_ERROR`, `NOT_IMPLEMENTED`, `GENERIC_ERROR`); `STATUS_OK` and
//! `CONTINUE` are simply `Ok(..)`.

use std::fmt;
use std::io;

/// In-band error reported by an AFF4 operation.
#[derive(Debug)]
pub enum Aff4Status {
    /// A URN, predicate or byte range was absent.
    NotFound(String),
    /// An `RDFValue::Get` or factory-open type mismatch.
    IncompatibleTypes(String),
    /// Malformed argument or container structure.
    InvalidInput(String),
    /// Backing-file or codec failure.
    IoError(String),
    /// Reached a deliberately unimplemented path (e.g. YAML load).
    NotImplemented(String),
    /// An internal invariant was violated (e.g. double checkout).
    GenericError(String),
}

pub type Aff4Result<T> = Result<T, Aff4Status>;

impl fmt::Display for Aff4Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aff4Status::NotFound(m) => write!(f, "NOT_FOUND: {}", m),
            Aff4Status::IncompatibleTypes(m) => write!(f, "INCOMPATIBLE_TYPES: {}", m),
            Aff4Status::InvalidInput(m) => write!(f, "INVALID_INPUT: {}", m),
            Aff4Status::IoError(m) => write!(f, "IO_ERROR: {}", m),
            Aff4Status::NotImplemented(m) => write!(f, "NOT_IMPLEMENTED: {}", m),
            Aff4Status::GenericError(m) => write!(f, "GENERIC_ERROR: {}", m),
        }
    }
}

impl std::error::Error for Aff4Status {}

impl From<io::Error> for Aff4Status {
    fn from(e: io::Error) -> Self {
        Aff4Status::IoError(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Aff4Status {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Aff4Status::InvalidInput(e.to_string())
    }
}

impl From<Aff4Status> for io::Error {
    fn from(e: Aff4Status) -> Self {
        match e {
            Aff4Status::NotFound(m) => io::Error::new(io::ErrorKind::NotFound, m),
            Aff4Status::InvalidInput(m) => io::Error::new(io::ErrorKind::InvalidInput, m),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
