// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Location directory: ObjectID -> nodes holding a copy.
//!
//! Entries are advisory. A stale entry costs one failed pull, after which
//! the puller invalidates it. The directory can be marked unavailable to
//! model a partitioned directory service; publishers then queue and retry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use raylite_common::id::{NodeID, ObjectID};
use raylite_common::{RayError, RayResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationEntry {
    pub locations: BTreeSet<NodeID>,
    /// Node of the owning worker, the authority on the object's lifetime.
    pub owner_node: Option<NodeID>,
    pub size: u64,
}

#[derive(Default)]
struct DirectoryState {
    entries: HashMap<ObjectID, LocationEntry>,
    node_objects: HashMap<NodeID, HashSet<ObjectID>>,
}

pub struct LocationDirectory {
    state: RwLock<DirectoryState>,
    available: AtomicBool,
}

impl Default for LocationDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationDirectory {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::info!(available, "location directory availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> RayResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RayError::unavailable("location directory is unreachable"))
        }
    }

    /// Record that `node_id` holds a copy of `object_id`.
    pub fn publish(&self, object_id: ObjectID, node_id: NodeID, size: u64) -> RayResult<()> {
        self.check_available()?;
        let mut state = self.state.write();
        let entry = state.entries.entry(object_id).or_default();
        entry.locations.insert(node_id);
        entry.size = size;
        state.node_objects.entry(node_id).or_default().insert(object_id);
        tracing::trace!(object_id = %object_id, node_id = %node_id, "published location");
        Ok(())
    }

    /// Nodes currently believed to hold `object_id`, in a stable order.
    /// An unreachable directory reports no locations.
    pub fn lookup(&self, object_id: &ObjectID) -> Vec<NodeID> {
        if !self.is_available() {
            return Vec::new();
        }
        self.state
            .read()
            .entries
            .get(object_id)
            .map(|e| e.locations.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, object_id: &ObjectID) -> Option<LocationEntry> {
        self.state.read().entries.get(object_id).cloned()
    }

    /// Drop `node_id` from the entry of `object_id`.
    pub fn invalidate(&self, object_id: &ObjectID, node_id: &NodeID) {
        let mut state = self.state.write();
        let now_empty = match state.entries.get_mut(object_id) {
            Some(entry) => {
                entry.locations.remove(node_id);
                entry.locations.is_empty() && entry.owner_node.is_none()
            }
            None => false,
        };
        if now_empty {
            state.entries.remove(object_id);
        }
        if let Some(objects) = state.node_objects.get_mut(node_id) {
            objects.remove(object_id);
        }
    }

    pub fn set_owner(&self, object_id: ObjectID, owner_node: NodeID) {
        self.state.write().entries.entry(object_id).or_default().owner_node = Some(owner_node);
    }

    pub fn owner_node(&self, object_id: &ObjectID) -> Option<NodeID> {
        self.state.read().entries.get(object_id).and_then(|e| e.owner_node)
    }

    /// Forget the object entirely. Returns the nodes that held a copy.
    pub fn remove_object(&self, object_id: &ObjectID) -> Vec<NodeID> {
        let mut state = self.state.write();
        let Some(entry) = state.entries.remove(object_id) else {
            return Vec::new();
        };
        for node_id in &entry.locations {
            if let Some(objects) = state.node_objects.get_mut(node_id) {
                objects.remove(object_id);
            }
        }
        entry.locations.into_iter().collect()
    }

    /// Remove a dead node from every entry.
    ///
    /// Returns the objects whose last known copy was on that node.
    pub fn handle_node_removed(&self, node_id: &NodeID) -> Vec<ObjectID> {
        let mut state = self.state.write();
        let objects = state.node_objects.remove(node_id).unwrap_or_default();
        let mut orphaned = Vec::new();
        for object_id in objects {
            if let Some(entry) = state.entries.get_mut(&object_id) {
                entry.locations.remove(node_id);
                if entry.locations.is_empty() {
                    orphaned.push(object_id);
                }
            }
        }
        for entry in state.entries.values_mut() {
            if entry.owner_node == Some(*node_id) {
                entry.owner_node = None;
            }
        }
        orphaned.sort();
        tracing::info!(node_id = %node_id, orphaned = orphaned.len(), "removed node from location directory");
        orphaned
    }

    pub fn objects_on_node(&self, node_id: &NodeID) -> Vec<ObjectID> {
        self.state
            .read()
            .node_objects
            .get(node_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn num_objects_tracked(&self) -> usize {
        self.state.read().entries.len()
    }
}
