// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-node object store.
//!
//! Objects are immutable once stored. Pinned objects are never evicted, and
//! unpinned ones are evicted in LRU order only when the [`EvictionGuard`]
//! agrees. All state sits behind a single mutex; callbacks run after the
//! lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use raylite_common::id::{NodeID, ObjectID};
use raylite_common::{RayError, RayResult};
use raylite_observability::{domain_events, EventSink};

use crate::common::{
    AddObjectCallback, AllowAllEvictions, EvictionGuard, ObjectInfo, RayObject, RemovalReason,
    RemoveObjectCallback,
};
use crate::eviction::EvictionPolicy;

/// Result of a successful [`ObjectStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    /// The same bytes were already stored under this ID.
    AlreadyPresent,
}

struct LocalObject {
    object: RayObject,
    info: ObjectInfo,
    pin_count: u32,
}

struct StoreInner {
    objects: HashMap<ObjectID, LocalObject>,
    eviction: EvictionPolicy,
    used_bytes: u64,
    vetoed_evictions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub num_objects: usize,
    pub num_pinned: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub num_evictions: u64,
    pub vetoed_evictions: u64,
}

pub struct ObjectStore {
    node_id: NodeID,
    capacity_bytes: u64,
    inner: Mutex<StoreInner>,
    guard: RwLock<Arc<dyn EvictionGuard>>,
    add_callbacks: RwLock<Vec<AddObjectCallback>>,
    remove_callbacks: RwLock<Vec<RemoveObjectCallback>>,
    events: Arc<dyn EventSink>,
}

impl ObjectStore {
    pub fn new(node_id: NodeID, capacity_bytes: u64, events: Arc<dyn EventSink>) -> Self {
        Self {
            node_id,
            capacity_bytes,
            inner: Mutex::new(StoreInner {
                objects: HashMap::new(),
                eviction: EvictionPolicy::new(),
                used_bytes: 0,
                vetoed_evictions: 0,
            }),
            guard: RwLock::new(Arc::new(AllowAllEvictions)),
            add_callbacks: RwLock::new(Vec::new()),
            remove_callbacks: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn node_id(&self) -> &NodeID {
        &self.node_id
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn set_eviction_guard(&self, guard: Arc<dyn EvictionGuard>) {
        *self.guard.write() = guard;
    }

    pub fn add_object_callback(&self, callback: AddObjectCallback) {
        self.add_callbacks.write().push(callback);
    }

    pub fn add_remove_callback(&self, callback: RemoveObjectCallback) {
        self.remove_callbacks.write().push(callback);
    }

    /// Store `object` under `object_id`, evicting unreferenced objects if
    /// needed.
    ///
    /// Re-putting identical content is a no-op; different content under an
    /// existing ID is rejected. Fails with `ObjectStoreFull` when eviction
    /// cannot make room.
    pub fn put(&self, object_id: ObjectID, object: RayObject, pin: bool) -> RayResult<PutOutcome> {
        let guard = self.guard.read().clone();
        let size = object.size();
        let (result, evicted, vetoed) = {
            let mut state = self.inner.lock();
            let inner = &mut *state;

            if let Some(existing) = inner.objects.get_mut(&object_id) {
                if existing.object != object {
                    return Err(RayError::object_exists(format!(
                        "object {object_id} is already bound to different content"
                    )));
                }
                if pin {
                    existing.pin_count += 1;
                    if existing.pin_count == 1 {
                        inner.eviction.remove(&object_id);
                    }
                }
                return Ok(PutOutcome::AlreadyPresent);
            }

            if size > self.capacity_bytes {
                return Err(RayError::object_store_full(format!(
                    "object {object_id} of {size} bytes exceeds store capacity {}",
                    self.capacity_bytes
                )));
            }

            let free = self.capacity_bytes - inner.used_bytes;
            let mut evicted = Vec::new();
            let mut vetoed = Vec::new();
            let mut result = Ok(());
            if size > free {
                let needed = size - free;
                let victims = inner
                    .eviction
                    .choose_victims(needed, |id| guard.is_evictable(id))
                    .ok_or_else(|| {
                        RayError::object_store_full(format!(
                            "need {needed} more bytes for {object_id} on node {}; \
                             {} bytes in use of {}",
                            self.node_id.short_hex(),
                            inner.used_bytes,
                            self.capacity_bytes
                        ))
                    })?;
                // The guard may have changed its mind since the scan; every
                // victim is re-checked before any of them is dropped.
                let (allowed, refused): (Vec<_>, Vec<_>) = victims
                    .into_iter()
                    .partition(|(victim, _)| guard.is_evictable(victim));
                inner.vetoed_evictions += refused.len() as u64;
                vetoed.extend(refused.into_iter().map(|(victim, _)| victim));
                let reclaimable: u64 = allowed.iter().map(|(_, victim_size)| victim_size).sum();
                if reclaimable < needed {
                    result = Err(RayError::object_store_full(format!(
                        "eviction for {object_id} was refused; {} bytes in use of {}",
                        inner.used_bytes, self.capacity_bytes
                    )));
                } else {
                    for (victim, victim_size) in allowed {
                        inner.eviction.evict(&victim);
                        inner.objects.remove(&victim);
                        inner.used_bytes -= victim_size;
                        evicted.push((victim, victim_size));
                    }
                }
            }

            let result = result.map(|()| {
                let info = ObjectInfo::new(object_id, &object);
                inner.used_bytes += size;
                if !pin {
                    inner.eviction.add(object_id, size);
                }
                inner.objects.insert(
                    object_id,
                    LocalObject {
                        object,
                        info: info.clone(),
                        pin_count: u32::from(pin),
                    },
                );
                info
            });
            (result, evicted, vetoed)
        };

        for victim in &vetoed {
            tracing::error!(node_id = %self.node_id, object_id = %victim, "eviction picked a referenced object");
            self.events.emit(domain_events::eviction_vetoed(&self.node_id, victim));
        }
        for (victim, victim_size) in &evicted {
            tracing::debug!(node_id = %self.node_id, object_id = %victim, size = victim_size, "evicted object");
            self.events
                .emit(domain_events::object_evicted(&self.node_id, victim, *victim_size));
            self.notify_removed(victim, RemovalReason::Evicted);
        }
        let info = result?;

        tracing::debug!(node_id = %self.node_id, object_id = %object_id, size, pin, "stored object");
        let callbacks = self.add_callbacks.read().clone();
        for callback in callbacks {
            callback(&self.node_id, &info);
        }
        self.emit_occupancy();
        Ok(PutOutcome::Created)
    }

    /// Local lookup only; see `ObjectManager::get` for the cluster-wide get.
    pub fn get(&self, object_id: &ObjectID) -> Option<RayObject> {
        let mut inner = self.inner.lock();
        let object = inner.objects.get(object_id).map(|o| o.object.clone())?;
        inner.eviction.touch(object_id);
        Some(object)
    }

    pub fn get_info(&self, object_id: &ObjectID) -> Option<ObjectInfo> {
        self.inner.lock().objects.get(object_id).map(|o| o.info.clone())
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.inner.lock().objects.contains_key(object_id)
    }

    /// Protect an object from eviction. Pins nest.
    pub fn pin(&self, object_id: &ObjectID) -> RayResult<()> {
        let mut state = self.inner.lock();
        let inner = &mut *state;
        let entry = inner
            .objects
            .get_mut(object_id)
            .ok_or_else(|| RayError::object_not_found(format!("cannot pin missing object {object_id}")))?;
        entry.pin_count += 1;
        if entry.pin_count == 1 {
            inner.eviction.remove(object_id);
        }
        Ok(())
    }

    /// Release one pin; the object becomes evictable when the last pin goes.
    pub fn unpin(&self, object_id: &ObjectID) -> RayResult<()> {
        let mut state = self.inner.lock();
        let inner = &mut *state;
        let entry = inner
            .objects
            .get_mut(object_id)
            .ok_or_else(|| RayError::object_not_found(format!("cannot unpin missing object {object_id}")))?;
        if entry.pin_count == 0 {
            return Err(RayError::invalid_argument(format!("object {object_id} is not pinned")));
        }
        entry.pin_count -= 1;
        if entry.pin_count == 0 {
            let size = entry.info.size;
            inner.eviction.add(*object_id, size);
        }
        Ok(())
    }

    pub fn is_pinned(&self, object_id: &ObjectID) -> bool {
        self.inner
            .lock()
            .objects
            .get(object_id)
            .is_some_and(|o| o.pin_count > 0)
    }

    /// Remove an object regardless of pins. Returns whether it was present.
    pub fn delete(&self, object_id: &ObjectID) -> bool {
        self.remove_with_reason(object_id, RemovalReason::Freed)
    }

    pub(crate) fn remove_with_reason(&self, object_id: &ObjectID, reason: RemovalReason) -> bool {
        let removed = {
            let mut state = self.inner.lock();
            let inner = &mut *state;
            match inner.objects.remove(object_id) {
                Some(entry) => {
                    inner.used_bytes -= entry.info.size;
                    inner.eviction.remove(object_id);
                    true
                }
                None => false,
            }
        };
        if removed {
            tracing::debug!(node_id = %self.node_id, object_id = %object_id, ?reason, "removed object");
            self.notify_removed(object_id, reason);
            self.emit_occupancy();
        }
        removed
    }

    pub fn object_ids(&self) -> Vec<ObjectID> {
        self.inner.lock().objects.keys().copied().collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            num_objects: inner.objects.len(),
            num_pinned: inner.objects.values().filter(|o| o.pin_count > 0).count(),
            used_bytes: inner.used_bytes,
            capacity_bytes: self.capacity_bytes,
            num_evictions: inner.eviction.num_evictions_total(),
            vetoed_evictions: inner.vetoed_evictions,
        }
    }

    fn notify_removed(&self, object_id: &ObjectID, reason: RemovalReason) {
        let callbacks = self.remove_callbacks.read().clone();
        for callback in callbacks {
            callback(&self.node_id, object_id, reason);
        }
    }

    fn emit_occupancy(&self) {
        let stats = self.stats();
        self.events.emit(domain_events::object_store_occupancy(
            &self.node_id,
            stats.used_bytes,
            stats.capacity_bytes,
            stats.num_objects,
        ));
    }
}

/// Every node's store, keyed by node.
#[derive(Default)]
pub struct StoreRegistry {
    stores: RwLock<HashMap<NodeID, Arc<ObjectStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, store: Arc<ObjectStore>) {
        self.stores.write().insert(*store.node_id(), store);
    }

    pub fn remove(&self, node_id: &NodeID) -> Option<Arc<ObjectStore>> {
        self.stores.write().remove(node_id)
    }

    pub fn get(&self, node_id: &NodeID) -> Option<Arc<ObjectStore>> {
        self.stores.read().get(node_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ObjectStore>> {
        self.stores.read().values().cloned().collect()
    }

    pub fn node_ids(&self) -> Vec<NodeID> {
        self.stores.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use raylite_common::id::{JobID, TaskID};
    use raylite_common::StatusCode;
    use raylite_observability::MemoryEventSink;
    use std::collections::HashSet;

    fn oid(i: u32) -> ObjectID {
        ObjectID::for_put(&TaskID::for_driver_task(&JobID::from_int(3)), i).unwrap()
    }

    fn blob(len: usize) -> RayObject {
        RayObject::new(Bytes::from(vec![7u8; len]))
    }

    fn store(capacity: u64) -> (ObjectStore, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        (ObjectStore::new(NodeID::from_random(), capacity, sink.clone()), sink)
    }

    struct Referenced(Mutex<HashSet<ObjectID>>);

    impl EvictionGuard for Referenced {
        fn is_evictable(&self, object_id: &ObjectID) -> bool {
            !self.0.lock().contains(object_id)
        }
    }

    #[test]
    fn test_put_get_and_immutability() {
        let (store, _) = store(100);
        assert_eq!(store.put(oid(1), blob(10), false).unwrap(), PutOutcome::Created);
        assert_eq!(store.put(oid(1), blob(10), false).unwrap(), PutOutcome::AlreadyPresent);
        let err = store.put(oid(1), blob(11), false).unwrap_err();
        assert_eq!(err.code, StatusCode::ObjectExists);
        assert_eq!(store.get(&oid(1)).unwrap(), blob(10));
        assert!(store.contains(&oid(1)));
        assert!(store.get(&oid(2)).is_none());
    }

    #[test]
    fn test_eviction_is_lru_over_unpinned() {
        let (store, sink) = store(30);
        store.put(oid(1), blob(10), false).unwrap();
        store.put(oid(2), blob(10), true).unwrap();
        store.put(oid(3), blob(10), false).unwrap();
        store.get(&oid(1));

        store.put(oid(4), blob(10), false).unwrap();
        assert!(store.contains(&oid(1)));
        assert!(store.contains(&oid(2)));
        assert!(!store.contains(&oid(3)));
        assert_eq!(sink.with_label(domain_events::OBJECT_EVICTED).len(), 1);
        assert_eq!(store.stats().used_bytes, 30);
    }

    #[test]
    fn test_full_when_everything_is_pinned_or_referenced() {
        let (store, _) = store(20);
        let referenced = Arc::new(Referenced(Mutex::new(HashSet::new())));
        store.set_eviction_guard(referenced.clone());
        store.put(oid(1), blob(10), true).unwrap();
        store.put(oid(2), blob(10), false).unwrap();
        referenced.0.lock().insert(oid(2));

        let err = store.put(oid(3), blob(5), false).unwrap_err();
        assert!(err.is_object_store_full());
        assert!(store.contains(&oid(1)) && store.contains(&oid(2)));

        referenced.0.lock().clear();
        store.put(oid(3), blob(5), false).unwrap();
        assert!(!store.contains(&oid(2)));
        assert!(store.put(oid(9), blob(21), false).unwrap_err().is_object_store_full());
    }

    /// Allows the first check of `flaky` and refuses every later one.
    struct ChangesItsMind {
        flaky: ObjectID,
        checks: Mutex<u32>,
    }

    impl EvictionGuard for ChangesItsMind {
        fn is_evictable(&self, object_id: &ObjectID) -> bool {
            if *object_id != self.flaky {
                return true;
            }
            let mut checks = self.checks.lock();
            *checks += 1;
            *checks == 1
        }
    }

    #[test]
    fn test_refused_recheck_keeps_every_victim_resident() {
        let (store, sink) = store(20);
        store.set_eviction_guard(Arc::new(ChangesItsMind { flaky: oid(2), checks: Mutex::new(0) }));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let removed_clone = removed.clone();
        store.add_remove_callback(Arc::new(move |_node, id, _reason| {
            removed_clone.lock().push(*id);
        }));
        store.put(oid(1), blob(10), false).unwrap();
        store.put(oid(2), blob(10), false).unwrap();

        let err = store.put(oid(3), blob(15), false).unwrap_err();
        assert!(err.is_object_store_full());
        assert!(store.contains(&oid(1)) && store.contains(&oid(2)));
        assert!(!store.contains(&oid(3)));
        assert!(removed.lock().is_empty());
        assert!(sink.with_label(domain_events::OBJECT_EVICTED).is_empty());
        assert_eq!(sink.with_label(domain_events::EVICTION_VETOED).len(), 1);
        let stats = store.stats();
        assert_eq!(stats.used_bytes, 20);
        assert_eq!(stats.num_objects, 2);
        assert_eq!(stats.num_evictions, 0);
        assert_eq!(stats.vetoed_evictions, 1);

        // The first victim is still evictable once the space suffices.
        store.put(oid(4), blob(10), false).unwrap();
        assert!(!store.contains(&oid(1)));
        assert_eq!(*removed.lock(), vec![oid(1)]);
        assert_eq!(store.stats().num_evictions, 1);
    }

    #[test]
    fn test_pin_unpin_nesting() {
        let (store, _) = store(10);
        store.put(oid(1), blob(10), false).unwrap();
        store.pin(&oid(1)).unwrap();
        store.pin(&oid(1)).unwrap();
        store.unpin(&oid(1)).unwrap();
        assert!(store.is_pinned(&oid(1)));
        assert!(store.put(oid(2), blob(1), false).is_err());
        store.unpin(&oid(1)).unwrap();
        assert!(store.unpin(&oid(1)).is_err());
        store.put(oid(2), blob(1), false).unwrap();
        assert!(!store.contains(&oid(1)));
        assert!(store.pin(&oid(7)).is_err());
    }

    #[test]
    fn test_callbacks_fire_outside_lock() {
        let (store, _) = store(100);
        let store = Arc::new(store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&store);
        let seen_add = seen.clone();
        store.add_object_callback(Arc::new(move |_node, info| {
            // Re-entering the store from a callback must not deadlock.
            let store = weak.upgrade().unwrap();
            assert!(store.contains(&info.object_id));
            seen_add.lock().push(("add", info.object_id));
        }));
        let seen_remove = seen.clone();
        store.add_remove_callback(Arc::new(move |_node, id, reason| {
            assert_eq!(reason, RemovalReason::Freed);
            seen_remove.lock().push(("remove", *id));
        }));
        store.put(oid(1), blob(1), true).unwrap();
        assert!(store.delete(&oid(1)));
        assert!(!store.delete(&oid(1)));
        assert_eq!(*seen.lock(), vec![("add", oid(1)), ("remove", oid(1))]);
        assert_eq!(store.stats().used_bytes, 0);
    }

    #[test]
    fn test_registry() {
        let registry = StoreRegistry::new();
        let (store, _) = store(1);
        let node = *store.node_id();
        registry.insert(Arc::new(store));
        assert!(registry.get(&node).is_some());
        assert_eq!(registry.node_ids(), vec![node]);
        assert!(registry.remove(&node).is_some());
        assert!(registry.all().is_empty());
    }
}
