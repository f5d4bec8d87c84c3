//! The object cache: an LRU of live objects plus an in-use set (spec
//! §4.C, §8 invariant 7, scenario S6).
//!
//! An object checked out via `AFF4FactoryOpen` physically lives inside
//! the [`crate::store::CheckedOut`] guard that the caller holds, not in
//! the cache's own storage — so `in_use` here is a presence set, not a
//! second object table. That is how this crate keeps §9's "non-owning
//! handle, scoped borrow" design note safe without `unsafe`: the guard
//! owns the object outright and hands it back to the cache on `Drop`.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::object::AFF4Object;
use crate::urn::Urn;

pub struct ObjectCache {
    limit: usize,
    /// Front = most recently used.
    order: VecDeque<Urn>,
    store: HashMap<Urn, Box<dyn AFF4Object>>,
    in_use: HashSet<Urn>,
}

impl ObjectCache {
    pub fn new(limit: usize) -> Self {
        ObjectCache {
            limit,
            order: VecDeque::new(),
            store: HashMap::new(),
            in_use: HashSet::new(),
        }
    }

    /// Inserts `obj` at the LRU head. If this pushes the cache over its
    /// limit, evicts tail entries and returns them (still resident, not
    /// flushed) for the caller to flush with its own resolver handle —
    /// the cache has no back-reference to the [`crate::store::DataStore`]
    /// that owns it. An object already in `in_use` is never evicted
    /// regardless of cache size.
    #[must_use]
    pub fn put(&mut self, obj: Box<dyn AFF4Object>) -> Vec<Box<dyn AFF4Object>> {
        let urn = obj.urn().clone();
        self.order.retain(|u| u != &urn);
        self.order.push_front(urn.clone());
        self.store.insert(urn, obj);
        self.evict_over_limit()
    }

    fn evict_over_limit(&mut self) -> Vec<Box<dyn AFF4Object>> {
        let mut evicted = Vec::new();
        while self.order.len() > self.limit {
            let Some(urn) = self.order.back().cloned() else {
                break;
            };
            if self.in_use.contains(&urn) {
                // Never evict a checked-out object; it isn't stored
                // here anyway, but guard against future refactors.
                break;
            }
            self.order.pop_back();
            if let Some(obj) = self.store.remove(&urn) {
                evicted.push(obj);
            }
        }
        evicted
    }

    /// Moves `urn` from the LRU into `in_use` and returns it, or `None`
    /// if it is not resident. Does not check whether it is already
    /// checked out — callers (the resolver) enforce single checkout.
    pub fn get(&mut self, urn: &Urn) -> Option<Box<dyn AFF4Object>> {
        let obj = self.store.remove(urn)?;
        self.order.retain(|u| u != urn);
        self.in_use.insert(urn.clone());
        Some(obj)
    }

    /// Returns a checked-out object to the LRU head.
    #[must_use]
    pub fn return_object(&mut self, obj: Box<dyn AFF4Object>) -> Vec<Box<dyn AFF4Object>> {
        let urn = obj.urn().clone();
        self.in_use.remove(&urn);
        self.order.push_front(urn.clone());
        self.store.insert(urn, obj);
        self.evict_over_limit()
    }

    /// Removes `urn` from whichever structure holds it. Ignores an
    /// absent URN.
    pub fn remove(&mut self, urn: &Urn) {
        self.in_use.remove(urn);
        self.order.retain(|u| u != urn);
        self.store.remove(urn);
    }

    pub fn contains_in_use(&self, urn: &Urn) -> bool {
        self.in_use.contains(urn)
    }

    /// Records `urn` as checked out without it ever having been
    /// resident in the LRU store. Used right after a fresh
    /// `AFF4FactoryOpen` construction, where the object goes straight
    /// into the caller's `CheckedOut` guard instead of through `get`.
    pub fn mark_in_use(&mut self, urn: &Urn) {
        self.order.retain(|u| u != urn);
        self.store.remove(urn);
        self.in_use.insert(urn.clone());
    }

    pub fn contains_resident(&self, urn: &Urn) -> bool {
        self.store.contains_key(urn)
    }

    /// LRU order, head first. Test/introspection helper mirroring the
    /// reference implementation's `AFF4ObjectCacheMock::GetKeys`.
    pub fn keys(&self) -> Vec<Urn> {
        self.order.iter().cloned().collect()
    }

    /// In-use set, mirroring `AFF4ObjectCacheMock::GetInUse`.
    pub fn in_use_keys(&self) -> Vec<Urn> {
        self.in_use.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DataStore;

    struct Dummy {
        urn: Urn,
    }

    impl AFF4Object for Dummy {
        fn urn(&self) -> &Urn {
            &self.urn
        }
        fn is_dirty(&self) -> bool {
            false
        }
        fn load_from_urn(&mut self, _store: &DataStore) -> crate::error::Aff4Result<()> {
            Ok(())
        }
        fn flush(&mut self, _store: &DataStore) -> crate::error::Aff4Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
        fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
            self
        }
    }

    fn dummy(name: &str) -> Box<dyn AFF4Object> {
        Box::new(Dummy {
            urn: Urn::new(name),
        })
    }

    /// Mirrors `data_store_test.cc`'s `AFF4ObjectCacheTest.TestLRU` (spec S6).
    #[test]
    fn lru_put_get_return_evict() {
        let mut cache = ObjectCache::new(3);
        assert!(cache.put(dummy("a")).is_empty());
        assert!(cache.put(dummy("b")).is_empty());
        assert!(cache.put(dummy("c")).is_empty());

        assert_eq!(
            cache.keys(),
            vec![Urn::new("c"), Urn::new("b"), Urn::new("a")]
        );

        let a = cache.get(&Urn::new("a")).expect("a resident");
        assert_eq!(cache.keys(), vec![Urn::new("c"), Urn::new("b")]);
        assert_eq!(cache.in_use_keys(), vec![Urn::new("a")]);

        assert!(cache.return_object(a).is_empty());
        assert_eq!(
            cache.keys(),
            vec![Urn::new("a"), Urn::new("c"), Urn::new("b")]
        );
        assert!(cache.in_use_keys().is_empty());

        let evicted = cache.put(dummy("d"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].urn(), &Urn::new("b"));
        assert_eq!(
            cache.keys(),
            vec![Urn::new("d"), Urn::new("a"), Urn::new("c")]
        );
        assert!(cache.get(&Urn::new("b")).is_none());

        cache.remove(&Urn::new("d"));
        assert!(cache.get(&Urn::new("d")).is_none());
        assert_eq!(cache.keys().len(), 2);
    }
}
