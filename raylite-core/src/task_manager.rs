// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Lineage and reconstruction.
//!
//! Every submitted task keeps its spec here until all of its return objects
//! are freed and no retained task consumes them. A consumer pins its
//! producers' lineage even after the intermediate values are freed, so a
//! lost output can be rebuilt through any number of levels. When a worker dies mid-task, or a getter finds no live copy of
//! a finished task's output, the spec is resubmitted until its retry budget
//! runs out. Outputs that cannot come back get a permanent failure recorded
//! against their ObjectID, so later `get`s fail fast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use raylite_common::id::{ObjectID, ObjectType, TaskID, WorkerID};
use raylite_common::{ObjectError, RayError, RayResult, UnreconstructableReason};
use raylite_object_store::ObjectManager;
use raylite_observability::{domain_events, EventSink};
use raylite_scheduler::{TaskScheduler, TaskSpec, TaskState};

use crate::reference_counter::OwnerRegistry;

struct LineageEntry {
    spec: TaskSpec,
    retries_left: u32,
    /// Re-executions so far.
    attempts: u32,
    live_returns: HashSet<ObjectID>,
    /// Submitted-task references taken on arguments, by owner.
    arg_refs: Vec<(WorkerID, ObjectID)>,
    finished: bool,
    cancel_requested: bool,
    /// Producers of task-return arguments whose lineage this entry pins.
    parents: Vec<TaskID>,
    /// Retained entries that list this task as a parent.
    lineage_refs: u32,
}

impl LineageEntry {
    fn releasable(&self) -> bool {
        self.finished && self.live_returns.is_empty() && self.lineage_refs == 0
    }
}

type Released = Vec<(TaskID, Vec<(WorkerID, ObjectID)>)>;

#[derive(Default)]
struct LineageState {
    lineage: HashMap<TaskID, LineageEntry>,
    failures: HashMap<ObjectID, ObjectError>,
}

impl LineageState {
    /// Drop `task_id`'s lineage and unpin its parents, cascading to every
    /// parent nothing else needs.
    fn release(&mut self, task_id: TaskID) -> Released {
        let mut released = Vec::new();
        let mut queue = vec![task_id];
        while let Some(task_id) = queue.pop() {
            let Some(entry) = self.lineage.remove(&task_id) else {
                continue;
            };
            for parent_id in &entry.parents {
                if let Some(parent) = self.lineage.get_mut(parent_id) {
                    parent.lineage_refs = parent.lineage_refs.saturating_sub(1);
                    if parent.releasable() {
                        queue.push(*parent_id);
                    }
                }
            }
            released.push((task_id, entry.arg_refs));
        }
        released
    }
}

pub struct TaskManager {
    objects: Arc<ObjectManager>,
    scheduler: Arc<TaskScheduler>,
    owners: Arc<OwnerRegistry>,
    events: Arc<dyn EventSink>,
    state: Mutex<LineageState>,
}

impl TaskManager {
    pub fn new(
        objects: Arc<ObjectManager>,
        scheduler: Arc<TaskScheduler>,
        owners: Arc<OwnerRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            objects,
            scheduler,
            owners,
            events,
            state: Mutex::new(LineageState::default()),
        }
    }

    /// Record lineage, pin the arguments with submitted-task references and
    /// hand the task to the scheduler. Returns the task's return IDs.
    pub fn submit(&self, spec: TaskSpec) -> RayResult<Vec<ObjectID>> {
        let task_id = spec.task_id;
        let return_ids = spec.return_ids()?;
        let dependencies = spec.dependencies();

        let mut arg_refs = Vec::new();
        for object_id in &dependencies {
            if let Some(owner_id) = self.owners.owner_of(object_id) {
                if let Some(table) = self.owners.get(&owner_id) {
                    table.add_submitted_task_refs(&[*object_id]);
                    arg_refs.push((owner_id, *object_id));
                }
            }
        }

        let duplicate = {
            let mut state = self.state.lock();
            if state.lineage.contains_key(&task_id) {
                Some(arg_refs)
            } else {
                let producers: HashSet<TaskID> = dependencies
                    .iter()
                    .filter(|id| id.is_task_return())
                    .map(ObjectID::task_id)
                    .filter(|producer| *producer != task_id)
                    .collect();
                let mut parents = Vec::new();
                for producer in producers {
                    if let Some(parent) = state.lineage.get_mut(&producer) {
                        parent.lineage_refs += 1;
                        parents.push(producer);
                    }
                }
                state.lineage.insert(
                    task_id,
                    LineageEntry {
                        retries_left: spec.max_retries,
                        spec: spec.clone(),
                        attempts: 0,
                        live_returns: return_ids.iter().copied().collect(),
                        arg_refs,
                        finished: false,
                        cancel_requested: false,
                        parents,
                        lineage_refs: 0,
                    },
                );
                None
            }
        };
        if let Some(arg_refs) = duplicate {
            self.release_arg_refs(arg_refs);
            return Err(RayError::invalid_argument(format!("task {task_id} was already submitted")));
        }

        if let Err(e) = self.scheduler.submit(spec, |id| self.objects.is_resolved(id)) {
            let released = self.state.lock().release(task_id);
            for (released_id, arg_refs) in released {
                if released_id != task_id {
                    self.scheduler.forget(&released_id);
                }
                self.release_arg_refs(arg_refs);
            }
            return Err(e);
        }

        if self.objects.directory().is_available() {
            for object_id in dependencies.iter().filter(|id| !self.objects.is_resolved(id)) {
                self.on_object_missing(object_id);
            }
        }
        Ok(return_ids)
    }

    /// The task ran to completion, successfully or with a user error.
    pub fn task_completed(&self, task_id: &TaskID) {
        let (arg_refs, released) = {
            let mut state = self.state.lock();
            let Some(entry) = state.lineage.get_mut(task_id) else {
                return;
            };
            entry.finished = true;
            let arg_refs = std::mem::take(&mut entry.arg_refs);
            let released = if entry.releasable() {
                state.release(*task_id)
            } else {
                Vec::new()
            };
            (arg_refs, released)
        };
        self.release_arg_refs(arg_refs);
        self.release_lineage(released);
    }

    /// The task can never produce its outputs; resolve all of them to
    /// `error`.
    ///
    /// Calls on a dead actor surface the constructor's own failure when
    /// there is one.
    pub fn fail_task(&self, spec: &TaskSpec, error: ObjectError) {
        let error = match (&error, spec.actor_id()) {
            (ObjectError::Unreconstructable { .. }, Some(actor_id)) if spec.is_actor_method() => {
                self.actor_failure(&ObjectID::for_actor_handle(&actor_id)).unwrap_or(error)
            }
            _ => error,
        };
        self.fail_returns(spec, |_| error.clone());
    }

    fn actor_failure(&self, handle_id: &ObjectID) -> Option<ObjectError> {
        if let Some(err) = self.failure(handle_id) {
            return Some(err);
        }
        self.objects
            .locations(handle_id)
            .iter()
            .find_map(|node_id| self.objects.store(node_id).and_then(|store| store.get(handle_id)))
            .and_then(|object| object.error)
    }

    fn fail_returns(&self, spec: &TaskSpec, error_for: impl Fn(ObjectID) -> ObjectError) {
        let return_ids = match spec.return_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(task_id = %spec.task_id, error = %e, "cannot derive return ids");
                return;
            }
        };
        for object_id in return_ids {
            self.record_failure(object_id, error_for(object_id));
        }
        let arg_refs = {
            let mut state = self.state.lock();
            match state.lineage.get_mut(&spec.task_id) {
                Some(entry) => {
                    entry.finished = true;
                    std::mem::take(&mut entry.arg_refs)
                }
                None => Vec::new(),
            }
        };
        self.release_arg_refs(arg_refs);
    }

    /// Cache a permanent failure and wake everything waiting on the object.
    /// The first failure recorded for an object wins.
    pub fn record_failure(&self, object_id: ObjectID, error: ObjectError) {
        {
            let mut state = self.state.lock();
            if state.failures.contains_key(&object_id) {
                return;
            }
            state.failures.insert(object_id, error.clone());
        }
        tracing::debug!(object_id = %object_id, error = %error, "object failed permanently");
        if let ObjectError::Unreconstructable { reason, .. } = &error {
            self.events
                .emit(domain_events::object_unreconstructable(&object_id, &reason.to_string()));
        }
        self.objects.notify_resolved(&object_id);
    }

    pub fn failure(&self, object_id: &ObjectID) -> Option<ObjectError> {
        self.state.lock().failures.get(object_id).cloned()
    }

    /// Tasks a dead worker had been running or was about to run.
    pub fn handle_lost(&self, lost: Vec<TaskSpec>) {
        for spec in lost {
            let cancelled = self
                .state
                .lock()
                .lineage
                .get(&spec.task_id)
                .is_some_and(|entry| entry.cancel_requested);
            if cancelled {
                self.fail_task(&spec, ObjectError::Cancelled { task_id: spec.task_id });
            } else if spec.is_actor_creation() || spec.is_actor_method() {
                tracing::warn!(task_id = %spec.task_id, "actor task lost with its worker");
                self.fail_returns(&spec, |object_id| ObjectError::Unreconstructable {
                    object_id,
                    reason: UnreconstructableReason::ActorTask,
                });
            } else {
                self.resubmit(&spec.task_id);
            }
        }
    }

    /// Re-execute a task from its lineage, or fail its outputs for good when
    /// the retry budget is spent.
    fn resubmit(&self, task_id: &TaskID) {
        let plan = {
            let mut state = self.state.lock();
            let Some(entry) = state.lineage.get_mut(task_id) else {
                tracing::warn!(task_id = %task_id, "lost task has no lineage");
                return;
            };
            if entry.retries_left == 0 {
                Err((entry.spec.clone(), entry.attempts))
            } else {
                entry.retries_left -= 1;
                entry.attempts += 1;
                entry.finished = false;
                Ok((entry.spec.clone(), entry.attempts, entry.retries_left))
            }
        };

        match plan {
            Err((spec, attempts)) => {
                tracing::warn!(task_id = %task_id, attempts, "retry budget exhausted");
                self.fail_returns(&spec, |object_id| ObjectError::Unreconstructable {
                    object_id,
                    reason: UnreconstructableReason::RetriesExhausted { attempts },
                });
            }
            Ok((spec, attempt, retries_left)) => match self.scheduler.resubmit(task_id, |id| self.objects.is_resolved(id)) {
                Ok(_) => {
                    tracing::info!(task_id = %task_id, attempt, retries_left, "resubmitted task from lineage");
                    self.events
                        .emit(domain_events::task_resubmitted(task_id, attempt, retries_left));
                    for object_id in spec.dependencies().iter().filter(|id| !self.objects.is_resolved(id)) {
                        self.on_object_missing(object_id);
                    }
                }
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "task is already being re-executed");
                    if let Some(entry) = self.state.lock().lineage.get_mut(task_id) {
                        entry.retries_left += 1;
                        entry.attempts -= 1;
                    }
                }
            },
        }
    }

    fn has_physical_copy(&self, object_id: &ObjectID) -> bool {
        self.objects.stores().all().iter().any(|store| store.contains(object_id))
    }

    /// No copy of `object_id` is visible. Start recovery if it has been
    /// produced and lost; do nothing while its producer is still on the way.
    pub fn on_object_missing(&self, object_id: &ObjectID) {
        if object_id.object_type() == Some(ObjectType::Signal)
            || self.failure(object_id).is_some()
            || self.has_physical_copy(object_id)
        {
            return;
        }
        if object_id.is_put() {
            self.record_failure(
                *object_id,
                ObjectError::Unreconstructable {
                    object_id: *object_id,
                    reason: UnreconstructableReason::NoLineage,
                },
            );
            return;
        }

        let task_id = object_id.task_id();
        let spec = self.state.lock().lineage.get(&task_id).map(|entry| entry.spec.clone());
        let Some(spec) = spec else {
            self.record_failure(
                *object_id,
                ObjectError::Unreconstructable {
                    object_id: *object_id,
                    reason: UnreconstructableReason::LineageReleased,
                },
            );
            return;
        };

        if self.scheduler.task_state(&task_id) != Some(TaskState::Done) {
            return;
        }
        if spec.is_actor_creation() || spec.is_actor_method() {
            self.record_failure(
                *object_id,
                ObjectError::Unreconstructable {
                    object_id: *object_id,
                    reason: UnreconstructableReason::ActorTask,
                },
            );
            return;
        }
        tracing::info!(object_id = %object_id, task_id = %task_id, "reconstructing lost object");
        self.resubmit(&task_id);
    }

    /// Withdraw a task that has not started. Its outputs resolve to
    /// `Cancelled`.
    pub fn cancel_pending(&self, task_id: &TaskID) -> bool {
        match self.scheduler.cancel(task_id) {
            Some(spec) => {
                self.fail_task(&spec, ObjectError::Cancelled { task_id: *task_id });
                true
            }
            None => false,
        }
    }

    /// Ask a running task to stop. If its worker dies, the outputs resolve to
    /// `Cancelled` instead of being re-executed.
    pub fn request_cancel(&self, task_id: &TaskID) -> bool {
        match self.state.lock().lineage.get_mut(task_id) {
            Some(entry) => {
                entry.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    pub fn is_cancel_requested(&self, task_id: &TaskID) -> bool {
        self.state
            .lock()
            .lineage
            .get(task_id)
            .is_some_and(|entry| entry.cancel_requested)
    }

    /// Delete freed objects everywhere and drop lineage nobody can need.
    pub fn free_objects(&self, freed: &[ObjectID]) {
        if freed.is_empty() {
            return;
        }
        for object_id in freed {
            let copies = self.objects.delete_everywhere(object_id);
            tracing::debug!(object_id = %object_id, copies, "object freed");
        }

        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            for object_id in freed.iter().filter(|id| id.is_task_return()) {
                let task_id = object_id.task_id();
                let Some(entry) = state.lineage.get_mut(&task_id) else {
                    continue;
                };
                entry.live_returns.remove(object_id);
                if entry.releasable() {
                    released.extend(state.release(task_id));
                }
            }
        }
        self.release_lineage(released);
    }

    fn release_lineage(&self, released: Released) {
        for (task_id, arg_refs) in released {
            tracing::debug!(task_id = %task_id, "lineage released");
            self.scheduler.forget(&task_id);
            self.release_arg_refs(arg_refs);
        }
    }

    fn release_arg_refs(&self, arg_refs: Vec<(WorkerID, ObjectID)>) {
        let mut freed = Vec::new();
        for (owner_id, object_id) in arg_refs {
            if let Some(table) = self.owners.get(&owner_id) {
                freed.extend(table.remove_submitted_task_refs(&[object_id]));
            }
        }
        self.free_objects(&freed);
    }

    pub fn has_lineage(&self, task_id: &TaskID) -> bool {
        self.state.lock().lineage.contains_key(task_id)
    }

    /// Retained consumers pinning `task_id`'s lineage.
    pub fn lineage_refs(&self, task_id: &TaskID) -> Option<u32> {
        self.state.lock().lineage.get(task_id).map(|entry| entry.lineage_refs)
    }

    pub fn num_lineage_entries(&self) -> usize {
        self.state.lock().lineage.len()
    }

    /// Re-executions of `task_id` so far.
    pub fn attempts(&self, task_id: &TaskID) -> Option<u32> {
        self.state.lock().lineage.get(task_id).map(|entry| entry.attempts)
    }
}
