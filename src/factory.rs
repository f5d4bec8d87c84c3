//! Process-wide factory registry (spec §4.H): type-URN → constructor.
//!
//! Registration is append-only; re-registering a type URN is rejected.
//! The registry is process-wide (a `static`), matching the reference
//! implementation's `ClassFactory<T>` and the C ABI's single shared
//! resolver — not per-`DataStore`, since a concrete type (say
//! `aff4:image_type`) always constructs the same Rust type regardless
//! of which resolver asked for it.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{Aff4Result, Aff4Status};
use crate::object::AFF4Object;
use crate::rdf;
use crate::store::DataStore;
use crate::urn::Urn;

pub type Ctor = fn(&DataStore, &Urn) -> Aff4Result<Box<dyn AFF4Object>>;

static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Ctor>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<&'static str, Ctor>> {
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<&'static str, Ctor> = HashMap::new();
        m.insert(rdf::AFF4_ZIP_TYPE, crate::zip::construct as Ctor);
        m.insert(rdf::AFF4_IMAGE_TYPE, crate::image::construct as Ctor);
        m.insert(rdf::AFF4_LEGACY_IMAGE_TYPE, crate::image::construct as Ctor);
        m.insert(rdf::AFF4_MAP_TYPE, crate::map::construct as Ctor);
        m.insert(rdf::AFF4_FILE_TYPE, crate::stream::construct_file as Ctor);
        Mutex::new(m)
    })
}

/// Registers a constructor for `type_urn`. Rejects re-registration of
/// an already-known type, per spec §4.H.
pub fn register(type_urn: &'static str, ctor: Ctor) -> Aff4Result<()> {
    let mut reg = registry().lock().expect("factory registry poisoned");
    if reg.contains_key(type_urn) {
        return Err(Aff4Status::GenericError(format!(
            "type {} is already registered",
            type_urn
        )));
    }
    reg.insert(type_urn, ctor);
    Ok(())
}

pub fn lookup(type_urn: &str) -> Option<Ctor> {
    registry()
        .lock()
        .expect("factory registry poisoned")
        .get(type_urn)
        .copied()
}
