// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task specifications and the per-task state machine.

use std::fmt;

use bytes::Bytes;
use raylite_common::id::{ActorID, JobID, ObjectID, TaskID};
use raylite_common::scheduling::ResourceSet;
use raylite_common::RayResult;
use serde::Serialize;

/// The closed set of things a task can be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    RemoteFunctionCall {
        function: String,
    },
    ActorCreation {
        actor_id: ActorID,
        class_name: String,
        max_concurrency: u32,
    },
    ActorMethodCall {
        actor_id: ActorID,
        class_name: String,
        method: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskArg {
    /// Inlined by value.
    Value(Bytes),
    /// Resolved from the object store before the task runs.
    ObjectRef(ObjectID),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub task_id: TaskID,
    pub job_id: JobID,
    pub parent_task_id: TaskID,
    pub kind: TaskKind,
    pub args: Vec<TaskArg>,
    pub num_returns: u32,
    pub resources: ResourceSet,
    pub max_retries: u32,
}

impl TaskSpec {
    pub fn remote_function(
        task_id: TaskID,
        parent_task_id: TaskID,
        function: impl Into<String>,
        args: Vec<TaskArg>,
        num_returns: u32,
    ) -> Self {
        Self {
            task_id,
            job_id: task_id.job_id(),
            parent_task_id,
            kind: TaskKind::RemoteFunctionCall {
                function: function.into(),
            },
            args,
            num_returns,
            resources: ResourceSet::default_task_request(),
            max_retries: 0,
        }
    }

    pub fn actor_creation(
        actor_id: ActorID,
        parent_task_id: TaskID,
        class_name: impl Into<String>,
        args: Vec<TaskArg>,
        max_concurrency: u32,
    ) -> Self {
        let task_id = TaskID::for_actor_creation_task(&actor_id);
        Self {
            task_id,
            job_id: actor_id.job_id(),
            parent_task_id,
            kind: TaskKind::ActorCreation {
                actor_id,
                class_name: class_name.into(),
                max_concurrency: max_concurrency.max(1),
            },
            args,
            num_returns: 1,
            resources: ResourceSet::default_task_request(),
            max_retries: 0,
        }
    }

    /// Actor methods run on the actor's own worker and hold no resources.
    pub fn actor_method(
        task_id: TaskID,
        parent_task_id: TaskID,
        actor_id: ActorID,
        class_name: impl Into<String>,
        method: impl Into<String>,
        args: Vec<TaskArg>,
        num_returns: u32,
    ) -> Self {
        Self {
            task_id,
            job_id: actor_id.job_id(),
            parent_task_id,
            kind: TaskKind::ActorMethodCall {
                actor_id,
                class_name: class_name.into(),
                method: method.into(),
            },
            args,
            num_returns,
            resources: ResourceSet::new(),
            max_retries: 0,
        }
    }

    pub fn with_resources(mut self, resources: ResourceSet) -> Self {
        if !self.is_actor_method() {
            self.resources = resources;
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_actor_creation(&self) -> bool {
        matches!(self.kind, TaskKind::ActorCreation { .. })
    }

    pub fn is_actor_method(&self) -> bool {
        matches!(self.kind, TaskKind::ActorMethodCall { .. })
    }

    pub fn actor_id(&self) -> Option<ActorID> {
        match &self.kind {
            TaskKind::RemoteFunctionCall { .. } => None,
            TaskKind::ActorCreation { actor_id, .. } | TaskKind::ActorMethodCall { actor_id, .. } => Some(*actor_id),
        }
    }

    /// Human-readable name used in logs, events and task errors.
    pub fn function_name(&self) -> String {
        match &self.kind {
            TaskKind::RemoteFunctionCall { function } => function.clone(),
            TaskKind::ActorCreation { class_name, .. } => format!("{class_name}.__init__"),
            TaskKind::ActorMethodCall { class_name, method, .. } => format!("{class_name}.{method}"),
        }
    }

    /// Objects this task produces. An actor creation task produces only the
    /// actor handle object.
    pub fn return_ids(&self) -> RayResult<Vec<ObjectID>> {
        if let TaskKind::ActorCreation { actor_id, .. } = &self.kind {
            return Ok(vec![ObjectID::for_actor_handle(actor_id)]);
        }
        (1..=self.num_returns)
            .map(|index| ObjectID::for_task_return(&self.task_id, index))
            .collect()
    }

    /// Objects that must exist before the task may be scheduled.
    pub fn dependencies(&self) -> Vec<ObjectID> {
        let mut deps: Vec<ObjectID> = self
            .args
            .iter()
            .filter_map(|arg| match arg {
                TaskArg::ObjectRef(id) => Some(*id),
                TaskArg::Value(_) => None,
            })
            .collect();
        if let TaskKind::ActorMethodCall { actor_id, .. } = &self.kind {
            deps.push(ObjectID::for_actor_handle(actor_id));
        }
        deps.sort();
        deps.dedup();
        deps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Dependencies unresolved.
    Waiting,
    /// Dependencies resolved, awaiting a resource match.
    Scheduled,
    /// Matched to a node and worker, awaiting the worker.
    Queued,
    Running,
    Done,
    /// The worker or node died mid-execution.
    Lost,
    Reconstructing,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "WAITING",
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Lost => "LOST",
            TaskState::Reconstructing => "RECONSTRUCTING",
        }
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Waiting, Scheduled)
                | (Waiting, Done)
                | (Scheduled, Queued)
                | (Scheduled, Done)
                | (Queued, Running)
                | (Queued, Scheduled)
                | (Queued, Done)
                | (Running, Done)
                | (Queued, Lost)
                | (Running, Lost)
                | (Lost, Reconstructing)
                | (Done, Reconstructing)
                | (Reconstructing, Waiting)
                | (Reconstructing, Scheduled)
        )
    }

    /// Waiting for dependencies, resources or a worker.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskState::Waiting | TaskState::Scheduled | TaskState::Queued)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
