// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! LRU eviction order for unpinned objects.
//!
//! Only unpinned objects live in the LRU. A victim additionally has to pass
//! the caller's veto check, which is how the ownership layer keeps
//! referenced objects resident.

use lru::LruCache;
use raylite_common::id::ObjectID;

pub struct EvictionPolicy {
    /// Unpinned objects, most recently used first.
    lru: LruCache<ObjectID, u64>,
    evictable_bytes: u64,
    num_evictions_total: u64,
    bytes_evicted_total: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy {
    pub fn new() -> Self {
        Self {
            lru: LruCache::unbounded(),
            evictable_bytes: 0,
            num_evictions_total: 0,
            bytes_evicted_total: 0,
        }
    }

    /// Track a newly unpinned object as most recently used.
    pub fn add(&mut self, object_id: ObjectID, size: u64) {
        if let Some(old) = self.lru.put(object_id, size) {
            self.evictable_bytes -= old;
        }
        self.evictable_bytes += size;
    }

    /// Stop tracking an object (pinned or deleted). Returns its size.
    pub fn remove(&mut self, object_id: &ObjectID) -> Option<u64> {
        let size = self.lru.pop(object_id)?;
        self.evictable_bytes -= size;
        Some(size)
    }

    /// Mark an object as just accessed.
    pub fn touch(&mut self, object_id: &ObjectID) {
        self.lru.promote(object_id);
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.lru.contains(object_id)
    }

    /// Pick least-recently-used victims worth at least `bytes_required`.
    ///
    /// Objects rejected by `may_evict` are skipped. Returns `None` when the
    /// allowed victims cannot free enough. Selection never removes anything;
    /// call `evict` for each victim actually dropped.
    pub fn choose_victims(
        &self,
        bytes_required: u64,
        mut may_evict: impl FnMut(&ObjectID) -> bool,
    ) -> Option<Vec<(ObjectID, u64)>> {
        if bytes_required == 0 {
            return Some(Vec::new());
        }
        let mut victims = Vec::new();
        let mut freed = 0u64;
        for (object_id, size) in self.lru.iter().rev() {
            if freed >= bytes_required {
                break;
            }
            if may_evict(object_id) {
                victims.push((*object_id, *size));
                freed += *size;
            }
        }
        (freed >= bytes_required).then_some(victims)
    }

    /// Drop a victim from the LRU and count it as evicted.
    pub fn evict(&mut self, object_id: &ObjectID) -> Option<u64> {
        let size = self.remove(object_id)?;
        self.num_evictions_total += 1;
        self.bytes_evicted_total += size;
        Some(size)
    }

    pub fn evictable_bytes(&self) -> u64 {
        self.evictable_bytes
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn num_evictions_total(&self) -> u64 {
        self.num_evictions_total
    }

    pub fn bytes_evicted_total(&self) -> u64 {
        self.bytes_evicted_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raylite_common::id::{JobID, TaskID};

    fn oid(i: u32) -> ObjectID {
        ObjectID::for_put(&TaskID::for_driver_task(&JobID::from_int(1)), i).unwrap()
    }

    #[test]
    fn test_lru_order() {
        let mut policy = EvictionPolicy::new();
        policy.add(oid(1), 10);
        policy.add(oid(2), 10);
        policy.add(oid(3), 10);
        policy.touch(&oid(1));

        let victims = policy.choose_victims(15, |_| true).unwrap();
        let ids: Vec<_> = victims.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![oid(2), oid(3)]);
        assert_eq!(policy.evictable_bytes(), 30);
        assert_eq!(policy.num_evictions_total(), 0);

        for id in &ids {
            assert_eq!(policy.evict(id), Some(10));
        }
        assert_eq!(policy.evict(&oid(2)), None);
        assert_eq!(policy.evictable_bytes(), 10);
        assert_eq!(policy.num_evictions_total(), 2);
        assert_eq!(policy.bytes_evicted_total(), 20);
    }

    #[test]
    fn test_vetoed_objects_are_skipped() {
        let mut policy = EvictionPolicy::new();
        policy.add(oid(1), 10);
        policy.add(oid(2), 10);
        let victims = policy.choose_victims(10, |id| *id != oid(1)).unwrap();
        assert_eq!(victims, vec![(oid(2), 10)]);
        assert!(policy.contains(&oid(1)));
    }

    #[test]
    fn test_insufficient_space_removes_nothing() {
        let mut policy = EvictionPolicy::new();
        policy.add(oid(1), 10);
        assert!(policy.choose_victims(11, |_| true).is_none());
        assert_eq!(policy.len(), 1);
        assert_eq!(policy.remove(&oid(1)), Some(10));
        assert!(policy.is_empty());
        assert_eq!(policy.evictable_bytes(), 0);
    }
}
