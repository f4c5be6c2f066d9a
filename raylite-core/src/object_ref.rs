// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Reference-counted handles to objects.
//!
//! An [`ObjectRef`] is one local reference held by its owner, or one
//! borrow held by another context. Cloning takes another reference and
//! dropping releases it; when the last reference anywhere goes away the
//! object is freed from every store.

use std::fmt;
use std::sync::Weak;

use bytes::Bytes;
use raylite_common::id::{ActorID, NodeID, ObjectID, TaskID, WorkerID};
use raylite_common::ObjectError;
use raylite_scheduler::TaskArg;
use raylite_util::time::Deadline;

use crate::cluster::Cluster;

pub struct ObjectRef {
    object_id: ObjectID,
    owner_id: WorkerID,
    /// Set when this reference is a borrow rather than an owner reference.
    borrower_id: Option<WorkerID>,
    /// Node the holder reads from.
    node_id: NodeID,
    cluster: Weak<Cluster>,
}

impl ObjectRef {
    /// Wrap a local reference the owner has already counted.
    pub(crate) fn owned(cluster: Weak<Cluster>, object_id: ObjectID, owner_id: WorkerID, node_id: NodeID) -> Self {
        Self {
            object_id,
            owner_id,
            borrower_id: None,
            node_id,
            cluster,
        }
    }

    /// Wrap a borrow already registered with the owner.
    pub(crate) fn borrowed(
        cluster: Weak<Cluster>,
        object_id: ObjectID,
        owner_id: WorkerID,
        borrower_id: WorkerID,
        node_id: NodeID,
    ) -> Self {
        Self {
            object_id,
            owner_id,
            borrower_id: Some(borrower_id),
            node_id,
            cluster,
        }
    }

    pub fn object_id(&self) -> ObjectID {
        self.object_id
    }

    pub fn owner_id(&self) -> WorkerID {
        self.owner_id
    }

    pub fn is_borrowed(&self) -> bool {
        self.borrower_id.is_some()
    }

    /// The task that created the object.
    pub fn task_id(&self) -> TaskID {
        self.object_id.task_id()
    }

    /// Block until the value is available and return it, or the error the
    /// object resolved to.
    pub async fn resolve(&self) -> Result<Bytes, ObjectError> {
        let cluster = self.cluster.upgrade().ok_or(ObjectError::OwnerDied {
            object_id: self.object_id,
        })?;
        cluster
            .objects()
            .get(&self.node_id, &self.object_id, Deadline::never())
            .await?
            .into_result()
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        if let Some(table) = self.cluster.upgrade().and_then(|c| c.owners().get(&self.owner_id)) {
            match self.borrower_id {
                None => table.add_local_ref(self.object_id),
                Some(borrower) => {
                    if let Err(e) = table.add_borrower(&self.object_id, borrower) {
                        tracing::warn!(object_id = %self.object_id, error = %e, "borrow of a freed object");
                    }
                }
            }
        }
        Self {
            object_id: self.object_id,
            owner_id: self.owner_id,
            borrower_id: self.borrower_id,
            node_id: self.node_id,
            cluster: self.cluster.clone(),
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        let Some(cluster) = self.cluster.upgrade() else {
            return;
        };
        let Some(table) = cluster.owners().get(&self.owner_id) else {
            return;
        };
        let freed = match self.borrower_id {
            None => table.remove_local_ref(&self.object_id),
            Some(borrower) => table.release(&self.object_id, &borrower),
        };
        if !freed.is_empty() {
            cluster.task_manager().free_objects(&freed);
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("object_id", &self.object_id)
            .field("owner_id", &self.owner_id)
            .field("borrowed", &self.borrower_id.is_some())
            .finish()
    }
}

impl From<&ObjectRef> for TaskArg {
    fn from(object_ref: &ObjectRef) -> Self {
        TaskArg::ObjectRef(object_ref.object_id)
    }
}

/// A created actor. Holds a reference to the actor's handle object, which
/// keeps the actor's creation lineage around while the handle lives.
#[derive(Debug, Clone)]
pub struct ActorHandle {
    actor_id: ActorID,
    class_name: String,
    handle_ref: ObjectRef,
}

impl ActorHandle {
    pub(crate) fn new(actor_id: ActorID, class_name: String, handle_ref: ObjectRef) -> Self {
        Self {
            actor_id,
            class_name,
            handle_ref,
        }
    }

    pub fn actor_id(&self) -> ActorID {
        self.actor_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn creation_task_id(&self) -> TaskID {
        TaskID::for_actor_creation_task(&self.actor_id)
    }

    /// Signals sent by any of this actor's methods come from this source.
    pub fn signal_source(&self) -> TaskID {
        self.creation_task_id()
    }

    /// Wait for the constructor to finish. Fails with the constructor's
    /// error if it raised.
    pub async fn ready(&self) -> Result<(), ObjectError> {
        self.handle_ref.resolve().await.map(|_| ())
    }
}
