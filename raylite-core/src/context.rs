// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Identity and ID counters of a submitting context.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use raylite_common::id::{ActorID, JobID, NodeID, ObjectID, TaskID, WorkerID};
use raylite_common::RayResult;

/// Derives the IDs of everything a driver creates. Children of the
/// driver task are numbered by one counter shared by tasks and actors,
/// puts by another.
pub struct WorkerContext {
    worker_id: WorkerID,
    node_id: NodeID,
    job_id: JobID,
    current_task_id: TaskID,
    task_index: AtomicU64,
    put_index: AtomicU32,
}

impl WorkerContext {
    pub fn new(worker_id: WorkerID, node_id: NodeID, job_id: JobID) -> Self {
        Self {
            worker_id,
            node_id,
            job_id,
            current_task_id: TaskID::for_driver_task(&job_id),
            task_index: AtomicU64::new(0),
            put_index: AtomicU32::new(0),
        }
    }

    pub fn worker_id(&self) -> WorkerID {
        self.worker_id
    }

    pub fn node_id(&self) -> NodeID {
        self.node_id
    }

    pub fn job_id(&self) -> JobID {
        self.job_id
    }

    pub fn current_task_id(&self) -> TaskID {
        self.current_task_id
    }

    pub fn next_task_id(&self, actor_id: Option<&ActorID>) -> RayResult<TaskID> {
        let counter = self.task_index.fetch_add(1, Ordering::Relaxed) + 1;
        TaskID::derive(&self.current_task_id, counter, actor_id)
    }

    pub fn next_actor_id(&self) -> ActorID {
        let counter = self.task_index.fetch_add(1, Ordering::Relaxed) + 1;
        ActorID::of(&self.job_id, &self.current_task_id, counter)
    }

    pub fn next_put_id(&self) -> RayResult<ObjectID> {
        let index = self.put_index.fetch_add(1, Ordering::Relaxed) + 1;
        ObjectID::for_put(&self.current_task_id, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_deterministic() {
        let job = JobID::from_int(2);
        let a = WorkerContext::new(WorkerID::from_random(), NodeID::from_random(), job);
        let b = WorkerContext::new(WorkerID::from_random(), NodeID::from_random(), job);
        let first = a.next_task_id(None).unwrap();
        assert_ne!(first, a.next_task_id(None).unwrap());
        // Same job, same sequence.
        assert_eq!(first, b.next_task_id(None).unwrap());

        let put = a.next_put_id().unwrap();
        assert!(put.is_put());
        assert_eq!(put.object_index(), 1);
        assert_eq!(put.task_id(), a.current_task_id());
    }
}
