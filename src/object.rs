//! The AFF4 object lifecycle (spec §3 "AFF4 object", §9 design notes).
//!
//! Concrete streams/volumes (`ZipFile`, `AFF4Image`, `AFF4Map`,
//! `FileBackedObject`, `StringIo`) implement [`AFF4Object`] so the
//! resolver's cache (`src/cache.rs`) can hold them as trait objects and
//! the factory registry (`src/factory.rs`) can construct them by type
//! URN. Downcasting back to a concrete type happens through
//! [`AFF4Object::as_any`] / [`AFF4Object::into_any`], the way a registry
//! of heterogeneous constructors is usually done in Rust without a
//! class hierarchy.

use std::any::Any;

use crate::error::Aff4Result;
use crate::store::DataStore;
use crate::urn::Urn;

/// Lifecycle states an AFF4 object moves through: constructed → loaded
/// (attributes populated from the graph) → dirty (mutated since last
/// flush) → flushed (writes committed, triples emitted).
pub trait AFF4Object: Any {
    /// This object's identifying URN.
    fn urn(&self) -> &Urn;

    /// `true` if this object has been mutated since its last flush.
    fn is_dirty(&self) -> bool;

    /// Populates this object's attributes from the resolver's graph.
    /// Called once, right after construction, by `AFF4FactoryOpen`.
    fn load_from_urn(&mut self, store: &DataStore) -> Aff4Result<()>;

    /// Commits pending writes and emits this object's RDF triples into
    /// the resolver. Idempotent when not dirty.
    fn flush(&mut self, store: &DataStore) -> Aff4Result<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}
