// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Ownership, lineage reconstruction and the driver API of raylite.
//!
//! A [`cluster::Cluster`] simulates a multi-node deployment inside one
//! process. Drivers attach with [`cluster_context::ClusterContext`] to put
//! objects, submit tasks and create actors; [`state::GlobalState`] reads
//! back what the cluster is doing.

pub mod cluster;
pub mod cluster_context;
pub mod context;
pub mod error;
pub mod function_manager;
pub mod health_check;
pub mod object_ref;
pub mod reference_counter;
pub mod signal;
pub mod state;
pub mod task_manager;
pub mod worker;

pub use cluster::{Cluster, NodeInfo, NodeSpec};
pub use cluster_context::{ActorOptions, ClusterContext, TaskOptions};
pub use error::{CoreError, CoreResult};
pub use function_manager::{ActorInstance, FunctionRegistry};
pub use object_ref::{ActorHandle, ObjectRef};
pub use signal::Signal;
pub use state::GlobalState;
pub use worker::TaskContext;
