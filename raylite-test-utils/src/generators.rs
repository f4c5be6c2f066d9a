// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Random IDs for tests.

use raylite_common::id::{JobID, NodeID, ObjectID, TaskID, WorkerID};

pub fn random_job_id() -> JobID {
    JobID::from_int(rand::random::<u16>() as u32 + 1)
}

/// A driver task of a random job.
pub fn random_task_id() -> TaskID {
    TaskID::for_driver_task(&random_job_id())
}

pub fn random_node_id() -> NodeID {
    NodeID::from_random()
}

pub fn random_worker_id() -> WorkerID {
    WorkerID::from_random()
}

/// A put object of a random driver.
pub fn random_object_id() -> ObjectID {
    ObjectID::for_put(&random_task_id(), rand::random::<u16>() as u32 + 1).expect("valid put id")
}
