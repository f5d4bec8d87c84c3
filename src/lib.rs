//! Read and write AFF4 forensic evidence containers.
//!
//! `exhume_aff4` provides the resolver / metadata graph, the object
//! cache, the ZIP64 volume reader/writer, and the two stream types
//! ([`image::AFF4Image`], [`map::AFF4Map`]) that make up the format,
//! plus a C ABI ([`capi`]) for embedding in non-Rust tooling.

pub mod cache;
pub mod capi;
pub mod error;
pub mod factory;
pub mod image;
pub mod map;
pub mod object;
pub mod rdf;
pub mod store;
pub mod stream;
pub mod urn;
pub mod zip;

pub use error::{Aff4Result, Aff4Status};
pub use image::AFF4Image;
pub use map::{AFF4Map, Range};
pub use object::AFF4Object;
pub use rdf::{Category, Compression, RdfValue, WriteMode};
pub use store::{CheckedOut, DataStore};
pub use stream::{Aff4Stream, Aff4StreamExt, FileBackedObject, StringIo};
pub use urn::Urn;
pub use zip::{ZipFile, ZipFileSegment};
