// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task scheduler: dependency tracking, resource matching and dispatch.
//!
//! Every task moves through [`TaskState`]. A task waits in `WAITING` until
//! all its argument objects exist, sits in `SCHEDULED` until the policy
//! finds a node with free resources and the node's pool yields a worker,
//! and is `QUEUED` once handed to that worker. The worker reports
//! `RUNNING` and completion back through [`TaskScheduler::task_started`] and
//! [`TaskScheduler::task_finished`].
//!
//! Actor methods bypass resource matching. They queue on their actor and run
//! on its dedicated worker, at most `max_concurrency` at a time.
//!
//! Dispatch, failure reports and scale-up requests are made after the
//! scheduler lock is released, so collaborators may call back in.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use raylite_common::id::{ActorID, NodeID, ObjectID, TaskID, WorkerID};
use raylite_common::scheduling::ResourceSet;
use raylite_common::{ObjectError, RayError, RayResult, UnreconstructableReason};
use raylite_observability::{domain_events, CoreEvent, EventSink};
use serde::Serialize;

use crate::cluster_resource_manager::ClusterResourceManager;
use crate::resource_demand::ClusterLifecycleManager;
use crate::scheduling_policy::{SchedulingDecision, SchedulingPolicy};
use crate::task_spec::{TaskKind, TaskSpec, TaskState};
use crate::worker_pool::{PopWorkerResult, WorkerPool};

/// A task matched to a node and worker.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub spec: TaskSpec,
    pub node_id: NodeID,
    pub worker_id: WorkerID,
    /// The worker was registered for this task and is not running yet.
    pub new_worker: bool,
    pub attempt: u32,
}

/// Executes scheduling decisions.
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, assignment: TaskAssignment);
    /// The task can never run; its returns must resolve to `error`.
    fn fail(&self, spec: &TaskSpec, error: ObjectError);
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskID,
    pub function: String,
    pub state: TaskState,
    pub attempt: u32,
    pub node_id: Option<NodeID>,
    pub worker_id: Option<WorkerID>,
    pub resources: ResourceSet,
}

struct TaskEntry {
    spec: TaskSpec,
    state: TaskState,
    attempt: u32,
    missing: HashSet<ObjectID>,
    node_id: Option<NodeID>,
    worker_id: Option<WorkerID>,
    /// Resources held on `node_id`.
    allocated: Option<ResourceSet>,
}

impl TaskEntry {
    fn record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.spec.task_id,
            function: self.spec.function_name(),
            state: self.state,
            attempt: self.attempt,
            node_id: self.node_id,
            worker_id: self.worker_id,
            resources: self.spec.resources.clone(),
        }
    }

    /// Apply a validated transition, recording the event.
    fn transition(&mut self, next: TaskState, events: &mut Vec<CoreEvent>) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                task_id = %self.spec.task_id,
                from = %self.state,
                to = %next,
                "ignoring illegal task state transition"
            );
            return false;
        }
        tracing::debug!(task_id = %self.spec.task_id, from = %self.state, to = %next, "task state changed");
        events.push(domain_events::task_state_changed(
            &self.spec.task_id,
            &self.spec.function_name(),
            self.state.as_str(),
            next.as_str(),
            self.attempt,
        ));
        self.state = next;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActorStatus {
    /// Creation task dispatched, constructor not finished.
    Pending,
    Alive,
    Dead,
}

struct ActorEntry {
    status: ActorStatus,
    node_id: NodeID,
    worker_id: WorkerID,
    max_concurrency: u32,
    running: u32,
    /// Method calls with resolved arguments waiting for a slot.
    queue: VecDeque<TaskID>,
    /// Held for the actor's lifetime.
    resources: ResourceSet,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskID, TaskEntry>,
    waiting_on: HashMap<ObjectID, Vec<TaskID>>,
    /// `SCHEDULED` tasks in submission order.
    ready: VecDeque<TaskID>,
    actors: HashMap<ActorID, ActorEntry>,
    infeasible_reported: HashSet<TaskID>,
}

/// Side effects collected under the lock and performed after it.
#[derive(Default)]
struct Effects {
    events: Vec<CoreEvent>,
    assignments: Vec<TaskAssignment>,
    failures: Vec<(TaskSpec, ObjectError)>,
    infeasible: Vec<ResourceSet>,
}

pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
    resources: Arc<ClusterResourceManager>,
    workers: Arc<WorkerPool>,
    policy: Box<dyn SchedulingPolicy>,
    dispatcher: RwLock<Option<Arc<dyn TaskDispatcher>>>,
    lifecycle: RwLock<Option<Arc<dyn ClusterLifecycleManager>>>,
    enable_autoscaling: bool,
    events: Arc<dyn EventSink>,
}

impl TaskScheduler {
    pub fn new(
        resources: Arc<ClusterResourceManager>,
        workers: Arc<WorkerPool>,
        policy: Box<dyn SchedulingPolicy>,
        enable_autoscaling: bool,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            resources,
            workers,
            policy,
            dispatcher: RwLock::new(None),
            lifecycle: RwLock::new(None),
            enable_autoscaling,
            events,
        }
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn TaskDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    pub fn set_lifecycle_manager(&self, lifecycle: Arc<dyn ClusterLifecycleManager>) {
        *self.lifecycle.write() = Some(lifecycle);
    }

    pub fn resources(&self) -> &ClusterResourceManager {
        &self.resources
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Accept a new task. `is_resolved` is evaluated under the scheduler
    /// lock; an object that resolves later must be reported through
    /// [`TaskScheduler::handle_object_available`].
    pub fn submit(&self, spec: TaskSpec, is_resolved: impl Fn(&ObjectID) -> bool) -> RayResult<()> {
        let mut effects = Effects::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.tasks.contains_key(&spec.task_id) {
                return Err(RayError::invalid_argument(format!("task {} was already submitted", spec.task_id)));
            }
            let task_id = spec.task_id;
            tracing::debug!(task_id = %task_id, function = %spec.function_name(), "task submitted");
            state.tasks.insert(
                task_id,
                TaskEntry {
                    spec,
                    state: TaskState::Waiting,
                    attempt: 0,
                    missing: HashSet::new(),
                    node_id: None,
                    worker_id: None,
                    allocated: None,
                },
            );
            Self::track_dependencies(state, task_id, &is_resolved, &mut effects);
            self.schedule_locked(state, &mut effects);
        }
        self.apply(effects);
        Ok(())
    }

    /// Re-run a `LOST` or `DONE` task from its lineage. Returns the new
    /// attempt number.
    pub fn resubmit(&self, task_id: &TaskID, is_resolved: impl Fn(&ObjectID) -> bool) -> RayResult<u32> {
        let mut effects = Effects::default();
        let attempt = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let entry = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| RayError::not_found(format!("no lineage for task {task_id}")))?;
            if !entry.transition(TaskState::Reconstructing, &mut effects.events) {
                return Err(RayError::invalid(format!("task {task_id} is {} and cannot be re-executed", entry.state)));
            }
            entry.attempt += 1;
            entry.node_id = None;
            entry.worker_id = None;
            let attempt = entry.attempt;
            Self::track_dependencies(state, *task_id, &is_resolved, &mut effects);
            self.schedule_locked(state, &mut effects);
            attempt
        };
        self.apply(effects);
        Ok(attempt)
    }

    fn track_dependencies(
        state: &mut SchedulerState,
        task_id: TaskID,
        is_resolved: &dyn Fn(&ObjectID) -> bool,
        effects: &mut Effects,
    ) {
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        let missing: HashSet<ObjectID> = entry.spec.dependencies().into_iter().filter(|id| !is_resolved(id)).collect();
        if missing.is_empty() {
            if entry.transition(TaskState::Scheduled, &mut effects.events) {
                state.ready.push_back(task_id);
            }
            return;
        }
        if entry.state != TaskState::Waiting {
            entry.transition(TaskState::Waiting, &mut effects.events);
        }
        for object_id in &missing {
            state.waiting_on.entry(*object_id).or_default().push(task_id);
        }
        entry.missing = missing;
    }

    /// An object became visible (or failed for good). Tasks waiting on it
    /// may proceed.
    pub fn handle_object_available(&self, object_id: &ObjectID) {
        let mut effects = Effects::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(task_ids) = state.waiting_on.remove(object_id) else {
                return;
            };
            for task_id in task_ids {
                let Some(entry) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if entry.state != TaskState::Waiting || !entry.missing.remove(object_id) {
                    continue;
                }
                if entry.missing.is_empty() && entry.transition(TaskState::Scheduled, &mut effects.events) {
                    state.ready.push_back(task_id);
                }
            }
            self.schedule_locked(state, &mut effects);
        }
        self.apply(effects);
    }

    /// Re-evaluate every awaited object, for when notifications may have
    /// been missed (the directory was unreachable).
    pub fn recheck_dependencies(&self, is_resolved: impl Fn(&ObjectID) -> bool) {
        let awaited: Vec<ObjectID> = self.state.lock().waiting_on.keys().copied().collect();
        for object_id in awaited.iter().filter(|id| is_resolved(id)) {
            self.handle_object_available(object_id);
        }
    }

    /// Register a node's resources and retry pending work.
    pub fn node_added(&self, node_id: NodeID, total: ResourceSet) {
        self.resources.add_node(node_id, total);
        self.schedule_pending();
    }

    pub fn schedule_pending(&self) {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            state.infeasible_reported.clear();
            self.schedule_locked(&mut state, &mut effects);
        }
        self.apply(effects);
    }

    fn schedule_locked(&self, state: &mut SchedulerState, effects: &mut Effects) {
        let mut deferred = VecDeque::new();
        while let Some(task_id) = state.ready.pop_front() {
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            if entry.state != TaskState::Scheduled {
                continue;
            }

            if let TaskKind::ActorMethodCall { actor_id, .. } = &entry.spec.kind {
                let actor_id = *actor_id;
                match state.actors.get_mut(&actor_id) {
                    Some(actor) if actor.status != ActorStatus::Dead => actor.queue.push_back(task_id),
                    _ => {
                        entry.transition(TaskState::Done, &mut effects.events);
                        effects.failures.push((
                            entry.spec.clone(),
                            ObjectError::Unreconstructable {
                                object_id: ObjectID::for_actor_handle(&actor_id),
                                reason: UnreconstructableReason::ActorTask,
                            },
                        ));
                    }
                }
                continue;
            }

            let request = entry.spec.resources.clone();
            match self.resources.select_and_allocate(self.policy.as_ref(), &request) {
                SchedulingDecision::Node(node_id) => {
                    let pop = self.workers.pop_worker(&node_id);
                    let Some(worker_id) = pop.worker_id() else {
                        self.resources.release(&node_id, &request);
                        deferred.push_back(task_id);
                        continue;
                    };
                    entry.transition(TaskState::Queued, &mut effects.events);
                    entry.node_id = Some(node_id);
                    entry.worker_id = Some(worker_id);
                    entry.allocated = Some(request);
                    if let TaskKind::ActorCreation {
                        actor_id,
                        max_concurrency,
                        ..
                    } = &entry.spec.kind
                    {
                        let pending_calls = state
                            .actors
                            .remove(actor_id)
                            .map(|previous| previous.queue)
                            .unwrap_or_default();
                        state.actors.insert(
                            *actor_id,
                            ActorEntry {
                                status: ActorStatus::Pending,
                                node_id,
                                worker_id,
                                max_concurrency: *max_concurrency,
                                running: 0,
                                queue: pending_calls,
                                resources: ResourceSet::new(),
                            },
                        );
                    }
                    tracing::debug!(task_id = %task_id, node_id = %node_id, worker_id = %worker_id, "task placed");
                    effects.assignments.push(TaskAssignment {
                        spec: entry.spec.clone(),
                        node_id,
                        worker_id,
                        new_worker: matches!(pop, PopWorkerResult::Started(_)),
                        attempt: entry.attempt,
                    });
                }
                SchedulingDecision::Unavailable => deferred.push_back(task_id),
                SchedulingDecision::Infeasible => {
                    if state.infeasible_reported.insert(task_id) {
                        tracing::warn!(
                            task_id = %task_id,
                            request = %request,
                            "no node can ever satisfy the request"
                        );
                        effects.infeasible.push(request);
                    }
                    deferred.push_back(task_id);
                }
            }
        }
        state.ready = deferred;

        for actor in state.actors.values_mut() {
            if actor.status != ActorStatus::Alive {
                continue;
            }
            while actor.running < actor.max_concurrency {
                let Some(task_id) = actor.queue.pop_front() else {
                    break;
                };
                let Some(entry) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if !entry.transition(TaskState::Queued, &mut effects.events) {
                    continue;
                }
                actor.running += 1;
                entry.node_id = Some(actor.node_id);
                entry.worker_id = Some(actor.worker_id);
                effects.assignments.push(TaskAssignment {
                    spec: entry.spec.clone(),
                    node_id: actor.node_id,
                    worker_id: actor.worker_id,
                    new_worker: false,
                    attempt: entry.attempt,
                });
            }
        }
    }

    /// The worker picked the task up. Returns false if the task was
    /// cancelled or reassigned in the meantime and must be skipped.
    pub fn task_started(&self, task_id: &TaskID) -> bool {
        let mut events = Vec::new();
        let started = {
            let mut state = self.state.lock();
            match state.tasks.get_mut(task_id) {
                Some(entry) if entry.state == TaskState::Queued => {
                    if let Some(worker_id) = entry.worker_id {
                        self.workers.record_task(&worker_id);
                    }
                    entry.transition(TaskState::Running, &mut events)
                }
                _ => false,
            }
        };
        self.emit(events);
        started
    }

    /// The task ran to completion. `succeeded` is false when user code
    /// returned an error; the task is `DONE` either way.
    pub fn task_finished(&self, task_id: &TaskID, succeeded: bool) {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let Some(entry) = state.tasks.get_mut(task_id) else {
                return;
            };
            if !entry.transition(TaskState::Done, &mut effects.events) {
                return;
            }
            let allocated = entry.allocated.take();
            let kind = entry.spec.kind.clone();
            match (&kind, entry.node_id, entry.worker_id) {
                (TaskKind::ActorMethodCall { actor_id, .. }, _, _) => {
                    if let Some(actor) = state.actors.get_mut(actor_id) {
                        actor.running = actor.running.saturating_sub(1);
                    }
                }
                (TaskKind::ActorCreation { actor_id, .. }, Some(node_id), Some(worker_id)) => {
                    let actor = state.actors.get_mut(actor_id);
                    match actor {
                        Some(actor) if succeeded => {
                            actor.status = ActorStatus::Alive;
                            actor.resources = allocated.unwrap_or_default();
                            self.workers.assign_actor(&worker_id, *actor_id);
                            tracing::info!(actor_id = %actor_id, node_id = %node_id, "actor is alive");
                        }
                        other => {
                            if let Some(actor) = other {
                                actor.status = ActorStatus::Dead;
                                Self::fail_actor_queue(actor, &mut state.tasks, &mut effects);
                            }
                            if let Some(resources) = allocated {
                                self.resources.release(&node_id, &resources);
                            }
                            self.workers.push_worker(&worker_id);
                        }
                    }
                }
                (TaskKind::RemoteFunctionCall { .. }, Some(node_id), Some(worker_id)) => {
                    if let Some(resources) = allocated {
                        self.resources.release(&node_id, &resources);
                    }
                    self.workers.push_worker(&worker_id);
                }
                _ => {}
            }
            self.schedule_locked(state, &mut effects);
        }
        self.apply(effects);
    }

    fn fail_actor_queue(actor: &mut ActorEntry, tasks: &mut HashMap<TaskID, TaskEntry>, effects: &mut Effects) {
        for task_id in actor.queue.drain(..) {
            if let Some(entry) = tasks.get_mut(&task_id) {
                if entry.transition(TaskState::Done, &mut effects.events) {
                    let object_id = entry
                        .spec
                        .actor_id()
                        .map(|actor_id| ObjectID::for_actor_handle(&actor_id))
                        .unwrap_or_else(ObjectID::nil);
                    effects.failures.push((
                        entry.spec.clone(),
                        ObjectError::Unreconstructable {
                            object_id,
                            reason: UnreconstructableReason::ActorTask,
                        },
                    ));
                }
            }
        }
    }

    /// A worker died. Tasks it had been handed become `LOST` and are
    /// returned for the reconstruction decision.
    pub fn worker_died(&self, worker_id: &WorkerID) -> Vec<TaskSpec> {
        let mut effects = Effects::default();
        let lost = {
            let mut state = self.state.lock();
            self.workers.disconnect_worker(worker_id);
            let lost = self.handle_dead_worker(&mut state, worker_id, &mut effects);
            self.schedule_locked(&mut state, &mut effects);
            lost
        };
        self.apply(effects);
        lost
    }

    fn handle_dead_worker(&self, state: &mut SchedulerState, worker_id: &WorkerID, effects: &mut Effects) -> Vec<TaskSpec> {
        let mut lost = Vec::new();
        for entry in state.tasks.values_mut() {
            if entry.worker_id != Some(*worker_id) || !matches!(entry.state, TaskState::Queued | TaskState::Running) {
                continue;
            }
            entry.transition(TaskState::Lost, &mut effects.events);
            if let (Some(node_id), Some(resources)) = (entry.node_id, entry.allocated.take()) {
                self.resources.release(&node_id, &resources);
            }
            lost.push(entry.spec.clone());
        }

        let dead_actors: Vec<ActorID> = state
            .actors
            .iter()
            .filter(|(_, actor)| actor.worker_id == *worker_id && actor.status != ActorStatus::Dead)
            .map(|(actor_id, _)| *actor_id)
            .collect();
        for actor_id in dead_actors {
            if let Some(actor) = state.actors.get_mut(&actor_id) {
                tracing::warn!(actor_id = %actor_id, worker_id = %worker_id, "actor died with its worker");
                actor.status = ActorStatus::Dead;
                actor.running = 0;
                self.resources.release(&actor.node_id, &actor.resources);
                actor.resources = ResourceSet::new();
                Self::fail_actor_queue(actor, &mut state.tasks, effects);
            }
        }
        lost
    }

    /// A node left the cluster. Every worker on it died.
    pub fn node_removed(&self, node_id: &NodeID) -> Vec<TaskSpec> {
        let mut effects = Effects::default();
        let lost = {
            let mut state = self.state.lock();
            self.resources.remove_node(node_id);
            let mut lost = Vec::new();
            for worker in self.workers.remove_node(node_id) {
                lost.extend(self.handle_dead_worker(&mut state, &worker.worker_id, &mut effects));
            }
            self.schedule_locked(&mut state, &mut effects);
            lost
        };
        self.apply(effects);
        lost
    }

    /// Withdraw a task that has not started. Returns its spec so the caller
    /// can resolve its returns as cancelled; `None` if it is unknown,
    /// running or finished.
    pub fn cancel(&self, task_id: &TaskID) -> Option<TaskSpec> {
        let mut effects = Effects::default();
        let spec = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let entry = state.tasks.get_mut(task_id)?;
            let previous = entry.state;
            if !previous.is_pending() || !entry.transition(TaskState::Done, &mut effects.events) {
                return None;
            }
            for object_id in entry.missing.drain() {
                if let Some(waiters) = state.waiting_on.get_mut(&object_id) {
                    waiters.retain(|id| id != task_id);
                }
            }
            if previous == TaskState::Queued {
                match (&entry.spec.kind, entry.node_id, entry.worker_id) {
                    (TaskKind::ActorMethodCall { actor_id, .. }, _, _) => {
                        if let Some(actor) = state.actors.get_mut(actor_id) {
                            actor.running = actor.running.saturating_sub(1);
                        }
                    }
                    (_, Some(node_id), Some(worker_id)) => {
                        if let Some(resources) = entry.allocated.take() {
                            self.resources.release(&node_id, &resources);
                        }
                        self.workers.push_worker(&worker_id);
                    }
                    _ => {}
                }
            }
            for actor in state.actors.values_mut() {
                actor.queue.retain(|id| id != task_id);
            }
            let spec = entry.spec.clone();
            tracing::info!(task_id = %task_id, from = %previous, "task cancelled");
            self.schedule_locked(state, &mut effects);
            spec
        };
        self.apply(effects);
        Some(spec)
    }

    /// Drop a finished task's record.
    pub fn forget(&self, task_id: &TaskID) {
        let mut state = self.state.lock();
        if state.tasks.get(task_id).is_some_and(|e| matches!(e.state, TaskState::Done | TaskState::Lost)) {
            state.tasks.remove(task_id);
        }
    }

    pub fn task_state(&self, task_id: &TaskID) -> Option<TaskState> {
        self.state.lock().tasks.get(task_id).map(|e| e.state)
    }

    pub fn task_record(&self, task_id: &TaskID) -> Option<TaskRecord> {
        self.state.lock().tasks.get(task_id).map(TaskEntry::record)
    }

    pub fn task_spec(&self, task_id: &TaskID) -> Option<TaskSpec> {
        self.state.lock().tasks.get(task_id).map(|e| e.spec.clone())
    }

    pub fn task_table(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.state.lock().tasks.values().map(TaskEntry::record).collect();
        records.sort_by_key(|r| r.task_id);
        records
    }

    /// Resource requests of tasks waiting for a node.
    pub fn pending_demand(&self) -> Vec<ResourceSet> {
        let state = self.state.lock();
        state
            .ready
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|e| !e.spec.is_actor_method())
            .map(|e| e.spec.resources.clone())
            .collect()
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().tasks.values().filter(|e| e.state.is_pending()).count()
    }

    pub fn is_actor_alive(&self, actor_id: &ActorID) -> bool {
        self.state
            .lock()
            .actors
            .get(actor_id)
            .is_some_and(|a| a.status == ActorStatus::Alive)
    }

    /// Node and worker hosting an actor.
    pub fn actor_location(&self, actor_id: &ActorID) -> Option<(NodeID, WorkerID)> {
        self.state
            .lock()
            .actors
            .get(actor_id)
            .filter(|a| a.status != ActorStatus::Dead)
            .map(|a| (a.node_id, a.worker_id))
    }

    fn emit(&self, events: Vec<CoreEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn apply(&self, effects: Effects) {
        self.emit(effects.events);
        let dispatcher = self.dispatcher.read().clone();
        match dispatcher {
            Some(dispatcher) => {
                for (spec, error) in effects.failures {
                    dispatcher.fail(&spec, error);
                }
                for assignment in effects.assignments {
                    dispatcher.dispatch(assignment);
                }
            }
            None if !effects.assignments.is_empty() => {
                tracing::error!(count = effects.assignments.len(), "no dispatcher installed; assignments dropped");
            }
            None => {}
        }
        if !effects.infeasible.is_empty() {
            let lifecycle = self.lifecycle.read().clone();
            match lifecycle {
                Some(lifecycle) if self.enable_autoscaling => lifecycle.request_resources(&effects.infeasible),
                _ => {
                    tracing::warn!(count = effects.infeasible.len(), "infeasible tasks pending; autoscaling is off");
                }
            }
        }
    }
}
