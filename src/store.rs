//! The resolver / data store (spec §3 "Data store", §4.B).
//!
//! `DataStore` is a cheap-to-clone handle (an `Rc` around the actual
//! graph + object cache), matching design note §9: objects hold a
//! non-owning handle back to the resolver rather than the resolver
//! owning raw back-pointers into its objects. [`CheckedOut<T>`] is the
//! scoped single-checkout guard of §9: construction moves the object
//! out of the cache's LRU into the caller's hands, `Drop` moves it back.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use log::warn;

use crate::cache::ObjectCache;
use crate::error::{Aff4Result, Aff4Status};
use crate::factory;
use crate::object::AFF4Object;
use crate::rdf::{self, RdfValue};
use crate::urn::Urn;

const DEFAULT_CACHE_LIMIT: usize = 10;

struct Inner {
    graph: RefCell<HashMap<Urn, HashMap<Urn, RdfValue>>>,
    namespaces: RefCell<Vec<(String, String)>>,
    cache: RefCell<ObjectCache>,
}

/// A handle to the resolver's metadata graph and object cache. Cloning
/// is cheap (an `Rc` bump) and all clones observe the same state.
#[derive(Clone)]
pub struct DataStore(Rc<Inner>);

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    pub fn new() -> Self {
        DataStore(Rc::new(Inner {
            graph: RefCell::new(HashMap::new()),
            namespaces: RefCell::new(vec![
                ("aff4".to_string(), "http://aff4.org/Schema#".to_string()),
                (
                    "xsd".to_string(),
                    "http://www.w3.org/2001/XMLSchema#".to_string(),
                ),
            ]),
            cache: RefCell::new(ObjectCache::new(DEFAULT_CACHE_LIMIT)),
        }))
    }

    pub fn with_cache_limit(limit: usize) -> Self {
        let store = Self::new();
        *store.0.cache.borrow_mut() = ObjectCache::new(limit);
        store
    }

    pub fn add_namespace(&self, prefix: &str, uri: &str) {
        self.0
            .namespaces
            .borrow_mut()
            .push((prefix.to_string(), uri.to_string()));
    }

    /// `Set(s,p,v,replace=true)`. A second `Set` on the same pair
    /// overwrites unless `replace` is `false`, in which case an
    /// existing value is left untouched.
    pub fn set(&self, subject: &Urn, predicate: &Urn, value: RdfValue, replace: bool) {
        let mut graph = self.0.graph.borrow_mut();
        let preds = graph.entry(subject.clone()).or_default();
        if !replace && preds.contains_key(predicate) {
            return;
        }
        preds.insert(predicate.clone(), value);
    }

    pub fn get(&self, subject: &Urn, predicate: &Urn) -> Aff4Result<RdfValue> {
        self.0
            .graph
            .borrow()
            .get(subject)
            .and_then(|preds| preds.get(predicate))
            .cloned()
            .ok_or_else(|| {
                Aff4Status::NotFound(format!("no ({}, {}) triple", subject, predicate))
            })
    }

    pub fn get_string(&self, subject: &Urn, predicate: &Urn) -> Aff4Result<String> {
        self.get(subject, predicate)?.as_string().map(str::to_string)
    }

    pub fn get_integer(&self, subject: &Urn, predicate: &Urn) -> Aff4Result<i64> {
        self.get(subject, predicate)?.as_integer()
    }

    pub fn get_urn(&self, subject: &Urn, predicate: &Urn) -> Aff4Result<Urn> {
        self.get(subject, predicate)?.as_urn().cloned()
    }

    /// `Query(predicate, value) -> set<URN>`: every subject with that
    /// exact (predicate, value) pair.
    pub fn query(&self, predicate: &Urn, value: &RdfValue) -> HashSet<Urn> {
        self.0
            .graph
            .borrow()
            .iter()
            .filter_map(|(subject, preds)| {
                (preds.get(predicate) == Some(value)).then(|| subject.clone())
            })
            .collect()
    }

    pub fn close_subject(&self, _subject: &Urn) {
        // Metadata is resolver-owned, not per-object; nothing to release
        // beyond what `CheckedOut::close` already does for live objects.
    }

    // --- Object cache / factory -------------------------------------------------

    fn flush_evicted(&self, evicted: Vec<Box<dyn AFF4Object>>) {
        for mut obj in evicted {
            let urn = obj.urn().clone();
            if let Err(e) = obj.flush(self) {
                warn!("error flushing evicted object {}: {}", urn, e);
            }
        }
    }

    pub(crate) fn cache_put(&self, obj: Box<dyn AFF4Object>) {
        let evicted = self.0.cache.borrow_mut().put(obj);
        self.flush_evicted(evicted);
    }

    pub(crate) fn return_object(&self, obj: Box<dyn AFF4Object>) {
        let evicted = self.0.cache.borrow_mut().return_object(obj);
        self.flush_evicted(evicted);
    }

    pub fn cache_keys(&self) -> Vec<Urn> {
        self.0.cache.borrow().keys()
    }

    pub fn cache_in_use_keys(&self) -> Vec<Urn> {
        self.0.cache.borrow().in_use_keys()
    }

    /// The canonical entry point for obtaining a live object (spec
    /// §4.B). Fails with `GenericError` on double checkout; constructs
    /// via the factory registry (using `aff4:type`, or
    /// `aff4:stream_write_mode` for raw backing files not yet typed) on
    /// cache miss.
    pub fn aff4_factory_open<T: AFF4Object + 'static>(
        &self,
        urn: &Urn,
    ) -> Aff4Result<CheckedOut<T>> {
        if self.0.cache.borrow().contains_in_use(urn) {
            return Err(Aff4Status::GenericError(format!(
                "{} is already checked out",
                urn
            )));
        }

        if let Some(boxed) = self.0.cache.borrow_mut().get(urn) {
            return Self::downcast_checked_out(self.clone(), boxed);
        }

        let boxed = self.construct(urn)?;
        self.0.cache.borrow_mut().mark_in_use(urn);
        Self::downcast_checked_out(self.clone(), boxed)
    }

    fn construct(&self, urn: &Urn) -> Aff4Result<Box<dyn AFF4Object>> {
        let type_urn = Urn::new(rdf::AFF4_TYPE);
        let mut boxed = if let Ok(type_value) = self.get_string(urn, &type_urn) {
            let ctor = factory::lookup(&type_value).ok_or_else(|| {
                Aff4Status::NotFound(format!("no factory registered for type {}", type_value))
            })?;
            ctor(self, urn)?
        } else if self
            .get_string(urn, &Urn::new(rdf::AFF4_STREAM_WRITE_MODE))
            .is_ok()
        {
            let ctor = factory::lookup(rdf::AFF4_FILE_TYPE).expect("file type always registered");
            ctor(self, urn)?
        } else {
            return Err(Aff4Status::NotFound(format!(
                "{} has no aff4:type and no stream write mode",
                urn
            )));
        };
        boxed.load_from_urn(self)?;
        Ok(boxed)
    }

    fn downcast_checked_out<T: AFF4Object + 'static>(
        store: DataStore,
        boxed: Box<dyn AFF4Object>,
    ) -> Aff4Result<CheckedOut<T>> {
        let any: Box<dyn Any> = boxed.into_any();
        match any.downcast::<T>() {
            Ok(obj) => Ok(CheckedOut {
                store,
                object: Some(*obj),
            }),
            Err(_) => Err(Aff4Status::IncompatibleTypes(
                "factory-constructed object does not satisfy the requested capability".into(),
            )),
        }
    }

    /// `Close(object)`: flush and return a checked-out object to the
    /// cache explicitly, rather than waiting on `Drop`.
    pub fn close<T: AFF4Object + 'static>(&self, obj: CheckedOut<T>) -> Aff4Result<()> {
        obj.close()
    }

    // --- Turtle / YAML persistence ----------------------------------------------

    /// `DumpToTurtle(stream, base)`: one triple per (s, p, v), using
    /// `rio_turtle`'s formatter with this store's namespace prefixes.
    pub fn dump_to_turtle(&self, out: &mut dyn Write, _base: &str) -> Aff4Result<()> {
        use rio_api::formatter::TriplesFormatter;
        use rio_api::model::{Literal, NamedNode, Subject, Term, Triple};
        use rio_turtle::TurtleFormatter;

        for (prefix, uri) in self.0.namespaces.borrow().iter() {
            writeln!(out, "@prefix {}: <{}> .", prefix, uri)
                .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        }
        writeln!(out).map_err(|e| Aff4Status::IoError(e.to_string()))?;

        let mut formatter = TurtleFormatter::new(out);
        for (subject, preds) in self.0.graph.borrow().iter() {
            for (predicate, value) in preds.iter() {
                let subject_node = NamedNode {
                    iri: &subject.serialize(),
                };
                let predicate_node = NamedNode {
                    iri: &predicate.serialize(),
                };
                let object_urn_serialized;
                let object_int_str;
                let object_bytes_str;
                let object = match value {
                    RdfValue::Urn(u) => {
                        object_urn_serialized = u.serialize();
                        Term::NamedNode(NamedNode {
                            iri: &object_urn_serialized,
                        })
                    }
                    RdfValue::XsdString(s) => Term::Literal(Literal::Simple { value: s }),
                    RdfValue::XsdInteger(i) => {
                        object_int_str = i.to_string();
                        Term::Literal(Literal::Typed {
                            value: &object_int_str,
                            datatype: NamedNode {
                                iri: rdf::XSD_INTEGER,
                            },
                        })
                    }
                    RdfValue::RdfBytes(b) => {
                        object_bytes_str = String::from_utf8_lossy(b).into_owned();
                        Term::Literal(Literal::Typed {
                            value: &object_bytes_str,
                            datatype: NamedNode { iri: rdf::AFF4_BYTES },
                        })
                    }
                };
                formatter
                    .format(&Triple {
                        subject: Subject::NamedNode(subject_node),
                        predicate: predicate_node,
                        object,
                    })
                    .map_err(|e| Aff4Status::IoError(e.to_string()))?;
            }
        }
        formatter
            .finish()
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;
        Ok(())
    }

    /// `LoadFromTurtle(stream)`. Unknown predicates are kept as-is.
    pub fn load_from_turtle(&self, input: &mut dyn Read) -> Aff4Result<()> {
        use rio_api::model::{Subject, Term};
        use rio_api::parser::TriplesParser;
        use rio_turtle::{TurtleError, TurtleParser};
        use std::io::BufReader;

        let mut text = String::new();
        input
            .read_to_string(&mut text)
            .map_err(|e| Aff4Status::IoError(e.to_string()))?;

        // Namespace prefixes were written as plain `@prefix` lines ahead
        // of the triples; rio's Turtle parser handles those natively.
        let mut parser = TurtleParser::new(BufReader::new(text.as_bytes()), None);
        let result: Result<(), TurtleError> = parser.parse_all(&mut |t| {
            let subject = match t.subject {
                Subject::NamedNode(n) => Urn::new(n.iri),
                _ => return Ok(()),
            };
            let predicate = Urn::new(t.predicate.iri);
            let value = match t.object {
                Term::NamedNode(n) => RdfValue::Urn(Urn::new(n.iri)),
                Term::Literal(rio_api::model::Literal::Simple { value }) => {
                    RdfValue::XsdString(value.to_string())
                }
                Term::Literal(rio_api::model::Literal::Typed { value, datatype }) => {
                    if datatype.iri == rdf::XSD_INTEGER {
                        RdfValue::XsdInteger(value.parse().unwrap_or_default())
                    } else if datatype.iri == rdf::AFF4_BYTES {
                        RdfValue::RdfBytes(value.as_bytes().to_vec())
                    } else {
                        RdfValue::XsdString(value.to_string())
                    }
                }
                _ => return Ok(()),
            };
            self.set(&subject, &predicate, value, true);
            Ok(())
        });
        result.map_err(|e| Aff4Status::InvalidInput(e.to_string()))
    }

    /// YAML dump is supported for diagnostics; loading is not (spec
    /// §3/§7: `NOT_IMPLEMENTED`).
    pub fn dump_to_yaml(&self, out: &mut dyn Write) -> Aff4Result<()> {
        for (subject, preds) in self.0.graph.borrow().iter() {
            writeln!(out, "{}:", subject).map_err(|e| Aff4Status::IoError(e.to_string()))?;
            for (predicate, value) in preds.iter() {
                writeln!(out, "  {}: {:?}", predicate, value)
                    .map_err(|e| Aff4Status::IoError(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn load_from_yaml(&self, _input: &mut dyn Read) -> Aff4Result<()> {
        Err(Aff4Status::NotImplemented(
            "YAML loading is not supported".into(),
        ))
    }
}

/// A scoped single-checkout guard (spec §9 "Scoped single-checkout").
/// Holds the object directly; `Drop` hands it back to the resolver's
/// cache, logging a warning first if it is still dirty (spec §3:
/// "destruction without flush of a dirty object is a defect").
pub struct CheckedOut<T: AFF4Object> {
    store: DataStore,
    object: Option<T>,
}

impl<T: AFF4Object> Deref for CheckedOut<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.object.as_ref().expect("object taken before drop")
    }
}

impl<T: AFF4Object> DerefMut for CheckedOut<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("object taken before drop")
    }
}

impl<T: AFF4Object> CheckedOut<T> {
    /// Explicitly flushes and returns the object to the cache,
    /// consuming the guard (spec §4.B `Close`).
    pub fn close(mut self) -> Aff4Result<()> {
        if let Some(mut obj) = self.object.take() {
            let result = obj.flush(&self.store);
            self.store.return_object(Box::new(obj));
            result
        } else {
            Ok(())
        }
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }
}

impl<T: AFF4Object> Drop for CheckedOut<T> {
    fn drop(&mut self) {
        if let Some(obj) = self.object.take() {
            if obj.is_dirty() {
                warn!(
                    "{} dropped without explicit flush while still dirty",
                    obj.urn()
                );
            }
            self.store.return_object(Box::new(obj));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors `data_store_test.cc`'s `MemoryDataStoreTest`.
    #[test]
    fn set_get_overwrites() {
        let store = DataStore::new();
        let s = Urn::new("hello");
        let p = Urn::new("World");
        store.set(&s, &p, RdfValue::XsdString("foo".into()), true);
        assert_eq!(store.get_string(&s, &p).unwrap(), "foo");

        store.set(&s, &p, RdfValue::XsdString("bar".into()), true);
        assert_eq!(store.get_string(&s, &p).unwrap(), "bar");
    }

    #[test]
    fn set_no_replace_keeps_first_value() {
        let store = DataStore::new();
        let s = Urn::new("hello");
        let p = Urn::new("World");
        store.set(&s, &p, RdfValue::XsdString("foo".into()), true);
        store.set(&s, &p, RdfValue::XsdString("bar".into()), false);
        assert_eq!(store.get_string(&s, &p).unwrap(), "foo");
    }

    #[test]
    fn incompatible_get_fails() {
        let store = DataStore::new();
        let s = Urn::new("hello");
        let p = Urn::new("World");
        store.set(&s, &p, RdfValue::XsdString("foo".into()), true);
        assert!(matches!(
            store.get(&s, &p).unwrap().as_bytes(),
            Err(Aff4Status::IncompatibleTypes(_))
        ));
    }

    #[test]
    fn query_returns_matching_subjects() {
        let store = DataStore::new();
        let p = Urn::new("aff4:type");
        let v = RdfValue::Urn(Urn::new("aff4:image_type"));
        store.set(&Urn::new("a"), &p, v.clone(), true);
        store.set(&Urn::new("b"), &p, v.clone(), true);
        store.set(
            &Urn::new("c"),
            &p,
            RdfValue::Urn(Urn::new("aff4:map_type")),
            true,
        );
        let matches = store.query(&p, &v);
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(&Urn::new("a")));
        assert!(matches.contains(&Urn::new("b")));
    }

    #[test]
    fn turtle_round_trip() {
        let store = DataStore::new();
        let s = Urn::new("hello");
        let p = Urn::new("World");
        store.set(&s, &p, RdfValue::XsdString("foo".into()), true);

        let mut buf: Vec<u8> = Vec::new();
        store.dump_to_turtle(&mut buf, "").unwrap();

        let new_store = DataStore::new();
        new_store.load_from_turtle(&mut &buf[..]).unwrap();
        assert_eq!(new_store.get_string(&s, &p).unwrap(), "foo");
    }

    #[test]
    fn yaml_load_is_not_implemented() {
        let store = DataStore::new();
        let mut buf: Vec<u8> = Vec::new();
        store.dump_to_yaml(&mut buf).unwrap();
        let new_store = DataStore::new();
        assert!(matches!(
            new_store.load_from_yaml(&mut &buf[..]),
            Err(Aff4Status::NotImplemented(_))
        ));
    }
}
