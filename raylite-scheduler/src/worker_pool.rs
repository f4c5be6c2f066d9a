// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-node worker pools.
//!
//! Workers are leased one task at a time and returned idle for reuse. An
//! actor's worker is dedicated to that actor for the actor's lifetime.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use raylite_common::id::{ActorID, NodeID, WorkerID};
use raylite_util::time::current_time_ms;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Leased,
    Actor(ActorID),
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerID,
    pub node_id: NodeID,
    pub state: WorkerState,
    pub started_at_ms: u64,
    pub tasks_executed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopWorkerResult {
    /// An idle worker was leased.
    Reused(WorkerID),
    /// A new worker was registered and leased; the caller must start it.
    Started(WorkerID),
    /// The node is at its worker cap.
    Exhausted,
}

impl PopWorkerResult {
    pub fn worker_id(&self) -> Option<WorkerID> {
        match self {
            PopWorkerResult::Reused(id) | PopWorkerResult::Started(id) => Some(*id),
            PopWorkerResult::Exhausted => None,
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerID, WorkerInfo>,
    idle: HashMap<NodeID, VecDeque<WorkerID>>,
    dead: HashMap<WorkerID, WorkerInfo>,
}

impl PoolState {
    fn num_alive_on(&self, node_id: &NodeID) -> usize {
        self.workers.values().filter(|w| w.node_id == *node_id).count()
    }
}

pub struct WorkerPool {
    state: RwLock<PoolState>,
    max_workers_per_node: usize,
}

impl WorkerPool {
    pub fn new(max_workers_per_node: usize) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            max_workers_per_node: max_workers_per_node.max(1),
        }
    }

    /// Lease a worker on `node_id`, reusing an idle one when possible.
    pub fn pop_worker(&self, node_id: &NodeID) -> PopWorkerResult {
        let mut state = self.state.write();
        if let Some(worker_id) = state.idle.get_mut(node_id).and_then(VecDeque::pop_front) {
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.state = WorkerState::Leased;
            }
            return PopWorkerResult::Reused(worker_id);
        }
        if state.num_alive_on(node_id) >= self.max_workers_per_node {
            return PopWorkerResult::Exhausted;
        }
        let worker_id = WorkerID::from_random();
        state.workers.insert(
            worker_id,
            WorkerInfo {
                worker_id,
                node_id: *node_id,
                state: WorkerState::Leased,
                started_at_ms: current_time_ms(),
                tasks_executed: 0,
            },
        );
        tracing::debug!(worker_id = %worker_id, node_id = %node_id, "registered new worker");
        PopWorkerResult::Started(worker_id)
    }

    /// Return a leased worker to its node's idle list.
    pub fn push_worker(&self, worker_id: &WorkerID) -> bool {
        let mut state = self.state.write();
        let Some(worker) = state.workers.get_mut(worker_id) else {
            return false;
        };
        if worker.state != WorkerState::Leased {
            return false;
        }
        worker.state = WorkerState::Idle;
        let node_id = worker.node_id;
        state.idle.entry(node_id).or_default().push_back(*worker_id);
        true
    }

    /// Dedicate a leased worker to an actor.
    pub fn assign_actor(&self, worker_id: &WorkerID, actor_id: ActorID) -> bool {
        match self.state.write().workers.get_mut(worker_id) {
            Some(worker) if worker.state == WorkerState::Leased => {
                worker.state = WorkerState::Actor(actor_id);
                true
            }
            _ => false,
        }
    }

    pub fn record_task(&self, worker_id: &WorkerID) {
        if let Some(worker) = self.state.write().workers.get_mut(worker_id) {
            worker.tasks_executed += 1;
        }
    }

    /// Mark a worker dead. Returns its last known info.
    pub fn disconnect_worker(&self, worker_id: &WorkerID) -> Option<WorkerInfo> {
        let mut state = self.state.write();
        let mut worker = state.workers.remove(worker_id)?;
        if let Some(idle) = state.idle.get_mut(&worker.node_id) {
            idle.retain(|id| id != worker_id);
        }
        let last = worker.clone();
        worker.state = WorkerState::Dead;
        state.dead.insert(*worker_id, worker);
        Some(last)
    }

    /// Kill every worker of a removed node.
    pub fn remove_node(&self, node_id: &NodeID) -> Vec<WorkerInfo> {
        let worker_ids: Vec<WorkerID> = self
            .state
            .read()
            .workers
            .values()
            .filter(|w| w.node_id == *node_id)
            .map(|w| w.worker_id)
            .collect();
        let removed = worker_ids.iter().filter_map(|id| self.disconnect_worker(id)).collect();
        self.state.write().idle.remove(node_id);
        removed
    }

    pub fn get_worker(&self, worker_id: &WorkerID) -> Option<WorkerInfo> {
        let state = self.state.read();
        state.workers.get(worker_id).or_else(|| state.dead.get(worker_id)).cloned()
    }

    pub fn is_worker_dead(&self, worker_id: &WorkerID) -> bool {
        self.state.read().dead.contains_key(worker_id)
    }

    pub fn num_idle_workers(&self, node_id: &NodeID) -> usize {
        self.state.read().idle.get(node_id).map_or(0, VecDeque::len)
    }

    pub fn num_workers(&self, node_id: &NodeID) -> usize {
        self.state.read().num_alive_on(node_id)
    }

    /// Live workers followed by dead ones.
    pub fn all_workers(&self) -> Vec<WorkerInfo> {
        let state = self.state.read();
        let mut workers: Vec<WorkerInfo> = state.workers.values().cloned().collect();
        workers.sort_by_key(|w| (w.node_id, w.started_at_ms, w.worker_id));
        workers.extend(state.dead.values().cloned());
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raylite_common::id::{JobID, TaskID};

    #[test]
    fn test_idle_worker_is_reused() {
        let pool = WorkerPool::new(2);
        let node = NodeID::from_random();
        let first = pool.pop_worker(&node);
        assert!(matches!(first, PopWorkerResult::Started(_)));
        let worker_id = first.worker_id().unwrap();
        assert!(pool.push_worker(&worker_id));
        assert_eq!(pool.num_idle_workers(&node), 1);
        assert_eq!(pool.pop_worker(&node), PopWorkerResult::Reused(worker_id));
    }

    #[test]
    fn test_cap_per_node() {
        let pool = WorkerPool::new(1);
        let (a, b) = (NodeID::from_random(), NodeID::from_random());
        assert!(matches!(pool.pop_worker(&a), PopWorkerResult::Started(_)));
        assert_eq!(pool.pop_worker(&a), PopWorkerResult::Exhausted);
        assert!(matches!(pool.pop_worker(&b), PopWorkerResult::Started(_)));
    }

    #[test]
    fn test_actor_worker_is_never_idle() {
        let pool = WorkerPool::new(4);
        let node = NodeID::from_random();
        let worker_id = pool.pop_worker(&node).worker_id().unwrap();
        let driver = TaskID::for_driver_task(&JobID::from_int(1));
        let actor_id = ActorID::of(&JobID::from_int(1), &driver, 1);
        assert!(pool.assign_actor(&worker_id, actor_id));
        assert!(!pool.push_worker(&worker_id));
        assert_eq!(pool.get_worker(&worker_id).unwrap().state, WorkerState::Actor(actor_id));
    }

    #[test]
    fn test_remove_node_kills_workers() {
        let pool = WorkerPool::new(4);
        let node = NodeID::from_random();
        let w1 = pool.pop_worker(&node).worker_id().unwrap();
        let w2 = pool.pop_worker(&node).worker_id().unwrap();
        pool.push_worker(&w2);
        let removed = pool.remove_node(&node);
        assert_eq!(removed.len(), 2);
        assert!(pool.is_worker_dead(&w1) && pool.is_worker_dead(&w2));
        assert_eq!(pool.num_workers(&node), 0);
        assert_eq!(pool.num_idle_workers(&node), 0);
    }
}
