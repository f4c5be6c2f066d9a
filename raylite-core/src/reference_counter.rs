// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Ownership-based reference counting.
//!
//! Each submitting context owns the objects it puts and the returns of the
//! tasks it submits, and is the only writer of their reference records.
//! Other contexts borrow; they register with the owner and release when
//! their handle goes away.
//!
//! Nested references form a graph kept as an arena: every record lists the
//! live objects containing it and the objects it contains. Freeing an object
//! walks that graph, so a chain of nested objects is released in one pass
//! without relying on a tracing collector.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use raylite_common::id::{ObjectID, WorkerID};
use raylite_common::{RayError, RayResult};
use raylite_object_store::EvictionGuard;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefCounts {
    pub local: u64,
    pub submitted: u64,
    pub contained_in: u64,
    pub borrowers: u64,
}

#[derive(Debug, Default)]
struct Reference {
    local: u64,
    submitted: u64,
    contained_in: HashSet<ObjectID>,
    contains: HashSet<ObjectID>,
    borrowers: HashMap<WorkerID, u64>,
}

impl Reference {
    fn is_deletable(&self) -> bool {
        self.local == 0 && self.submitted == 0 && self.contained_in.is_empty() && self.borrowers.is_empty()
    }

    fn counts(&self) -> RefCounts {
        RefCounts {
            local: self.local,
            submitted: self.submitted,
            contained_in: self.contained_in.len() as u64,
            borrowers: self.borrowers.values().sum(),
        }
    }
}

pub struct OwnershipTable {
    owner_id: WorkerID,
    refs: Mutex<HashMap<ObjectID, Reference>>,
}

impl OwnershipTable {
    pub fn new(owner_id: WorkerID) -> Self {
        Self {
            owner_id,
            refs: Mutex::new(HashMap::new()),
        }
    }

    pub fn owner_id(&self) -> WorkerID {
        self.owner_id
    }

    /// Start tracking a new object, optionally containing `inner` objects.
    pub fn add_owned_object(&self, object_id: ObjectID, inner: &[ObjectID]) {
        let mut refs = self.refs.lock();
        refs.entry(object_id).or_default();
        for inner_id in inner {
            Self::link(&mut refs, object_id, *inner_id);
        }
    }

    /// Record that `outer` holds a reference to `inner` after both exist.
    /// `inner` stays alive at least as long as `outer` does.
    pub fn add_contained_ref(&self, outer: ObjectID, inner: ObjectID) {
        Self::link(&mut self.refs.lock(), outer, inner);
    }

    pub fn add_local_ref(&self, object_id: ObjectID) {
        self.refs.lock().entry(object_id).or_default().local += 1;
    }

    /// Drop one local handle. Returns every object this frees.
    pub fn remove_local_ref(&self, object_id: &ObjectID) -> Vec<ObjectID> {
        let mut refs = self.refs.lock();
        match refs.get_mut(object_id) {
            Some(reference) if reference.local > 0 => reference.local -= 1,
            _ => {
                tracing::warn!(object_id = %object_id, "local ref released more often than taken");
                return Vec::new();
            }
        }
        Self::collect_freed(&mut refs, vec![*object_id])
    }

    pub fn add_submitted_task_refs(&self, object_ids: &[ObjectID]) {
        let mut refs = self.refs.lock();
        for object_id in object_ids {
            refs.entry(*object_id).or_default().submitted += 1;
        }
    }

    pub fn remove_submitted_task_refs(&self, object_ids: &[ObjectID]) -> Vec<ObjectID> {
        let mut refs = self.refs.lock();
        let mut candidates = Vec::new();
        for object_id in object_ids {
            if let Some(reference) = refs.get_mut(object_id) {
                reference.submitted = reference.submitted.saturating_sub(1);
                candidates.push(*object_id);
            }
        }
        Self::collect_freed(&mut refs, candidates)
    }

    fn link(refs: &mut HashMap<ObjectID, Reference>, outer: ObjectID, inner: ObjectID) {
        if outer == inner {
            return;
        }
        refs.entry(outer).or_default().contains.insert(inner);
        refs.entry(inner).or_default().contained_in.insert(outer);
    }

    pub fn add_borrower(&self, object_id: &ObjectID, borrower: WorkerID) -> RayResult<()> {
        let mut refs = self.refs.lock();
        let reference = refs
            .get_mut(object_id)
            .ok_or_else(|| RayError::object_not_found(format!("{object_id} is not owned by {}", self.owner_id)))?;
        *reference.borrowers.entry(borrower).or_insert(0) += 1;
        Ok(())
    }

    /// A borrower dropped one handle.
    pub fn release(&self, object_id: &ObjectID, borrower: &WorkerID) -> Vec<ObjectID> {
        let mut refs = self.refs.lock();
        let Some(reference) = refs.get_mut(object_id) else {
            return Vec::new();
        };
        if let Some(count) = reference.borrowers.get_mut(borrower) {
            *count -= 1;
            if *count == 0 {
                reference.borrowers.remove(borrower);
            }
        }
        Self::collect_freed(&mut refs, vec![*object_id])
    }

    /// Drop every borrow held by `borrower`, e.g. when it disconnects.
    pub fn remove_borrower(&self, borrower: &WorkerID) -> Vec<ObjectID> {
        let mut refs = self.refs.lock();
        let candidates: Vec<ObjectID> = refs
            .iter_mut()
            .filter_map(|(object_id, reference)| reference.borrowers.remove(borrower).map(|_| *object_id))
            .collect();
        Self::collect_freed(&mut refs, candidates)
    }

    /// Remove every deletable object reachable from `candidates` through the
    /// containment graph.
    fn collect_freed(refs: &mut HashMap<ObjectID, Reference>, mut candidates: Vec<ObjectID>) -> Vec<ObjectID> {
        let mut freed = Vec::new();
        while let Some(object_id) = candidates.pop() {
            if !refs.get(&object_id).is_some_and(Reference::is_deletable) {
                continue;
            }
            let Some(reference) = refs.remove(&object_id) else {
                continue;
            };
            for inner in reference.contains {
                if let Some(child) = refs.get_mut(&inner) {
                    child.contained_in.remove(&object_id);
                    candidates.push(inner);
                }
            }
            freed.push(object_id);
        }
        freed
    }

    /// True when no handle, pending task, containing object or borrower
    /// references the object. Untracked objects are deletable.
    pub fn is_deletable(&self, object_id: &ObjectID) -> bool {
        self.refs.lock().get(object_id).map_or(true, Reference::is_deletable)
    }

    pub fn tracks(&self, object_id: &ObjectID) -> bool {
        self.refs.lock().contains_key(object_id)
    }

    pub fn counts(&self, object_id: &ObjectID) -> Option<RefCounts> {
        self.refs.lock().get(object_id).map(Reference::counts)
    }

    pub fn object_ids(&self) -> Vec<ObjectID> {
        self.refs.lock().keys().copied().collect()
    }

    /// Forget everything; used when the owner goes away.
    pub fn drain(&self) -> Vec<ObjectID> {
        self.refs.lock().drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }
}

/// All live owners of the cluster.
#[derive(Default)]
pub struct OwnerRegistry {
    owners: RwLock<HashMap<WorkerID, Arc<OwnershipTable>>>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: Arc<OwnershipTable>) {
        self.owners.write().insert(table.owner_id(), table);
    }

    pub fn unregister(&self, owner_id: &WorkerID) -> Option<Arc<OwnershipTable>> {
        self.owners.write().remove(owner_id)
    }

    pub fn get(&self, owner_id: &WorkerID) -> Option<Arc<OwnershipTable>> {
        self.owners.read().get(owner_id).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<OwnershipTable>> {
        self.owners.read().values().cloned().collect()
    }

    pub fn owner_of(&self, object_id: &ObjectID) -> Option<WorkerID> {
        self.owners
            .read()
            .values()
            .find(|table| table.tracks(object_id))
            .map(|table| table.owner_id())
    }

    pub fn counts(&self, object_id: &ObjectID) -> Option<RefCounts> {
        self.owners.read().values().find_map(|table| table.counts(object_id))
    }

    /// Release everything `borrower` borrowed from any owner.
    pub fn remove_borrower(&self, borrower: &WorkerID) -> Vec<ObjectID> {
        let tables: Vec<_> = self.owners.read().values().cloned().collect();
        tables.iter().flat_map(|table| table.remove_borrower(borrower)).collect()
    }

    pub fn is_deletable(&self, object_id: &ObjectID) -> bool {
        self.owners.read().values().all(|table| table.is_deletable(object_id))
    }
}

/// Lets the object store evict only objects no owner still references.
pub struct OwnershipGuard(pub Arc<OwnerRegistry>);

impl EvictionGuard for OwnershipGuard {
    fn is_evictable(&self, object_id: &ObjectID) -> bool {
        self.0.is_deletable(object_id)
    }
}
