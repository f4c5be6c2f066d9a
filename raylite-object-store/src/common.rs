// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Types shared by the object store modules.

use std::sync::Arc;

use bytes::Bytes;
use raylite_common::id::{NodeID, ObjectID, TaskID};
use raylite_common::ObjectError;

/// An immutable value as held by a node's store.
///
/// A task that failed stores its error here instead of data; such objects
/// have no payload and therefore never need store capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct RayObject {
    pub data: Bytes,
    /// Object IDs serialized inside `data`.
    pub nested_refs: Vec<ObjectID>,
    pub error: Option<ObjectError>,
}

impl RayObject {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            nested_refs: Vec::new(),
            error: None,
        }
    }

    pub fn with_nested_refs(mut self, nested_refs: Vec<ObjectID>) -> Self {
        self.nested_refs = nested_refs;
        self
    }

    pub fn from_error(error: ObjectError) -> Self {
        Self {
            data: Bytes::new(),
            nested_refs: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn into_result(self) -> Result<Bytes, ObjectError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

/// Metadata kept alongside every stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub object_id: ObjectID,
    pub owner_task_id: TaskID,
    pub size: u64,
    pub created_at_ms: u64,
    pub is_error: bool,
}

impl ObjectInfo {
    pub fn new(object_id: ObjectID, object: &RayObject) -> Self {
        Self {
            object_id,
            owner_task_id: object_id.task_id(),
            size: object.size(),
            created_at_ms: raylite_util::time::current_time_ms(),
            is_error: object.is_error(),
        }
    }
}

/// Why an object left a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Its owner released the last reference.
    Freed,
    /// Memory pressure.
    Evicted,
    /// The node holding it went away.
    NodeRemoved,
}

pub type AddObjectCallback = Arc<dyn Fn(&NodeID, &ObjectInfo) + Send + Sync>;
pub type RemoveObjectCallback = Arc<dyn Fn(&NodeID, &ObjectID, RemovalReason) + Send + Sync>;

/// Ownership view consulted before an object is evicted.
pub trait EvictionGuard: Send + Sync {
    /// False while anything still references `object_id`.
    fn is_evictable(&self, object_id: &ObjectID) -> bool;
}

/// Permits every eviction. Only suitable for stores without owners.
pub struct AllowAllEvictions;

impl EvictionGuard for AllowAllEvictions {
    fn is_evictable(&self, _object_id: &ObjectID) -> bool {
        true
    }
}

/// Hooks into the ownership layer used by `ObjectManager::get`.
pub trait ObjectResolver: Send + Sync {
    /// A permanent failure recorded for the object, if any.
    fn failure(&self, object_id: &ObjectID) -> Option<ObjectError>;

    /// No live copy of `object_id` is known anywhere. Implementations start
    /// recovery or record a permanent failure; either way the waiters on the
    /// object must eventually be resolved.
    fn on_object_missing(&self, object_id: &ObjectID);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_objects_have_no_size() {
        let err = ObjectError::Cancelled {
            task_id: TaskID::from_random(),
        };
        let object = RayObject::from_error(err.clone());
        assert!(object.is_error());
        assert_eq!(object.size(), 0);
        assert_eq!(object.into_result(), Err(err));
    }

    #[test]
    fn test_info_tracks_owner_task() {
        let task = TaskID::for_driver_task(&raylite_common::id::JobID::from_int(1));
        let id = ObjectID::for_put(&task, 1).unwrap();
        let info = ObjectInfo::new(id, &RayObject::new(Bytes::from_static(b"abc")));
        assert_eq!(info.owner_task_id, task);
        assert_eq!(info.size, 3);
        assert!(!info.is_error);
    }
}
