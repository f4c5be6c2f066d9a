// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task scheduling for the raylite core.
//!
//! - [`task_spec`]: task variants, arguments and the task state machine.
//! - [`scheduling_resources`] / [`cluster_resource_manager`]: per-node and
//!   cluster-wide resource accounting.
//! - [`scheduling_policy`]: best-fit node selection.
//! - [`worker_pool`]: per-node worker leasing.
//! - [`task_scheduler`]: dependency tracking, matching and dispatch.
//! - [`resource_demand`]: scale-up planning for infeasible demand.

pub mod cluster_resource_manager;
pub mod resource_demand;
pub mod scheduling_policy;
pub mod scheduling_resources;
pub mod task_scheduler;
pub mod task_spec;
pub mod worker_pool;

pub use cluster_resource_manager::ClusterResourceManager;
pub use resource_demand::{ClusterLifecycleManager, NodeProvider, ResourceDemandScheduler};
pub use scheduling_policy::{BestFitPolicy, SchedulingPolicy};
pub use task_scheduler::{TaskAssignment, TaskDispatcher, TaskRecord, TaskScheduler};
pub use task_spec::{TaskArg, TaskKind, TaskSpec, TaskState};
pub use worker_pool::{WorkerInfo, WorkerPool, WorkerState};
