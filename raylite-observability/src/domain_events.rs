// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Typed constructors for the events the core emits.
//!
//! Labels are stable strings so external consumers can filter on them.

use raylite_common::id::{NodeID, ObjectID, TaskID, WorkerID};

use crate::events::{CoreEvent, EventSeverity, EventSourceType};

pub const TASK_STATE_CHANGED: &str = "TASK_STATE_CHANGED";
pub const TASK_RESUBMITTED: &str = "TASK_RESUBMITTED";
pub const OBJECT_STORE_OCCUPANCY: &str = "OBJECT_STORE_OCCUPANCY";
pub const OBJECT_EVICTED: &str = "OBJECT_EVICTED";
pub const EVICTION_VETOED: &str = "EVICTION_VETOED";
pub const OBJECT_UNRECONSTRUCTABLE: &str = "OBJECT_UNRECONSTRUCTABLE";
pub const NODE_ADDED: &str = "NODE_ADDED";
pub const NODE_REMOVED: &str = "NODE_REMOVED";
pub const WORKER_DIED: &str = "WORKER_DIED";
pub const RESOURCE_DEMAND: &str = "RESOURCE_DEMAND";

// ─── Task Events ────────────────────────────────────────────────────────

pub fn task_state_changed(task_id: &TaskID, function: &str, from: &str, to: &str, attempt: u32) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::Scheduler,
        EventSeverity::Info,
        TASK_STATE_CHANGED,
        format!("{function} {from} -> {to}"),
    )
    .with_field("task_id", task_id)
    .with_field("function", function)
    .with_field("from", from)
    .with_field("to", to)
    .with_field("attempt", attempt)
}

pub fn task_resubmitted(task_id: &TaskID, attempt: u32, retries_left: u32) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::Ownership,
        EventSeverity::Warning,
        TASK_RESUBMITTED,
        format!("re-executing lost task (attempt {attempt})"),
    )
    .with_field("task_id", task_id)
    .with_field("attempt", attempt)
    .with_field("retries_left", retries_left)
}

// ─── Object Events ──────────────────────────────────────────────────────

pub fn object_store_occupancy(node_id: &NodeID, used_bytes: u64, capacity_bytes: u64, num_objects: usize) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::ObjectStore,
        EventSeverity::Info,
        OBJECT_STORE_OCCUPANCY,
        format!("{used_bytes}/{capacity_bytes} bytes in use"),
    )
    .with_field("node_id", node_id)
    .with_field("used_bytes", used_bytes)
    .with_field("capacity_bytes", capacity_bytes)
    .with_field("num_objects", num_objects)
}

pub fn object_evicted(node_id: &NodeID, object_id: &ObjectID, size: u64) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::ObjectStore,
        EventSeverity::Info,
        OBJECT_EVICTED,
        format!("evicted {size} bytes"),
    )
    .with_field("node_id", node_id)
    .with_field("object_id", object_id)
    .with_field("size", size)
}

/// The store picked a referenced object as an eviction victim. This is a
/// bug in the caller; the eviction is refused.
pub fn eviction_vetoed(node_id: &NodeID, object_id: &ObjectID) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::ObjectStore,
        EventSeverity::Fatal,
        EVICTION_VETOED,
        "refused to evict a referenced object",
    )
    .with_field("node_id", node_id)
    .with_field("object_id", object_id)
}

pub fn object_unreconstructable(object_id: &ObjectID, reason: &str) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::Ownership,
        EventSeverity::Error,
        OBJECT_UNRECONSTRUCTABLE,
        format!("object lost for good: {reason}"),
    )
    .with_field("object_id", object_id)
    .with_field("reason", reason)
}

// ─── Cluster Events ─────────────────────────────────────────────────────

pub fn node_added(node_id: &NodeID, resources: &str) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::Cluster,
        EventSeverity::Info,
        NODE_ADDED,
        format!("node joined with {resources}"),
    )
    .with_field("node_id", node_id)
    .with_field("resources", resources)
}

pub fn node_removed(node_id: &NodeID, reason: &str) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::Cluster,
        EventSeverity::Warning,
        NODE_REMOVED,
        format!("node left: {reason}"),
    )
    .with_field("node_id", node_id)
    .with_field("reason", reason)
}

pub fn worker_died(worker_id: &WorkerID, node_id: &NodeID, running_task: Option<&TaskID>) -> CoreEvent {
    let event = CoreEvent::new(
        EventSourceType::Worker,
        EventSeverity::Warning,
        WORKER_DIED,
        "worker exited unexpectedly",
    )
    .with_field("worker_id", worker_id)
    .with_field("node_id", node_id);
    match running_task {
        Some(task_id) => event.with_field("task_id", task_id),
        None => event,
    }
}

pub fn resource_demand(demand: &str, launch_requests: usize) -> CoreEvent {
    CoreEvent::new(
        EventSourceType::Scheduler,
        EventSeverity::Info,
        RESOURCE_DEMAND,
        format!("infeasible demand {demand} forwarded for scale-up"),
    )
    .with_field("demand", demand)
    .with_field("launch_requests", launch_requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_event() {
        let task_id = TaskID::from_random();
        let event = task_state_changed(&task_id, "square", "QUEUED", "RUNNING", 1);
        assert_eq!(event.label, TASK_STATE_CHANGED);
        assert_eq!(event.field("task_id"), Some(task_id.hex().as_str()));
        assert_eq!(event.field("to"), Some("RUNNING"));
        assert_eq!(event.message, "square QUEUED -> RUNNING");
    }

    #[test]
    fn test_occupancy_event() {
        let event = object_store_occupancy(&NodeID::from_random(), 10, 100, 2);
        assert_eq!(event.field("used_bytes"), Some("10"));
        assert_eq!(event.field("num_objects"), Some("2"));
    }

    #[test]
    fn test_worker_died_with_and_without_task() {
        let node = NodeID::from_random();
        let worker = WorkerID::from_random();
        assert!(worker_died(&worker, &node, None).field("task_id").is_none());
        let task = TaskID::from_random();
        assert!(worker_died(&worker, &node, Some(&task)).field("task_id").is_some());
        assert_eq!(eviction_vetoed(&node, &ObjectID::nil()).severity, EventSeverity::Fatal);
    }
}
