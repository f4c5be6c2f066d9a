// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Status and error types.
//!
//! `RayError` is the coarse, code-based error used by infrastructure and
//! API calls. `ObjectError` is the per-object outcome handed back by `get`;
//! it is also what gets stored in place of a value when a task fails, so it
//! must stay cheap to clone.

use std::fmt;

use crate::id::{NodeID, ObjectID, TaskID, WorkerID};

/// Coarse status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum StatusCode {
    OK,
    Invalid,
    InvalidArgument,
    InvalidIdentifier,
    IOError,
    NotFound,
    ObjectExists,
    ObjectNotFound,
    ObjectStoreFull,
    TimedOut,
    Disconnected,
    Unavailable,
    OwnerDied,
    Unreconstructable,
    TaskError,
    Cancelled,
    UnknownError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OK => "OK",
            Self::Invalid => "Invalid",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidIdentifier => "InvalidIdentifier",
            Self::IOError => "IOError",
            Self::NotFound => "NotFound",
            Self::ObjectExists => "ObjectExists",
            Self::ObjectNotFound => "ObjectNotFound",
            Self::ObjectStoreFull => "ObjectStoreFull",
            Self::TimedOut => "TimedOut",
            Self::Disconnected => "Disconnected",
            Self::Unavailable => "Unavailable",
            Self::OwnerDied => "OwnerDied",
            Self::Unreconstructable => "Unreconstructable",
            Self::TaskError => "TaskError",
            Self::Cancelled => "Cancelled",
            Self::UnknownError => "UnknownError",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RayError {
    pub code: StatusCode,
    pub message: String,
}

impl RayError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Invalid, msg)
    }
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, msg)
    }
    pub fn invalid_identifier(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidIdentifier, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, msg)
    }
    pub fn object_exists(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ObjectExists, msg)
    }
    pub fn object_not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ObjectNotFound, msg)
    }
    pub fn object_store_full(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::ObjectStoreFull, msg)
    }
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Disconnected, msg)
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, msg)
    }

    pub fn is_object_store_full(&self) -> bool {
        self.code == StatusCode::ObjectStoreFull
    }

    /// Conditions that may clear up on their own and are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            StatusCode::TimedOut | StatusCode::Unavailable | StatusCode::ObjectNotFound
        )
    }
}

pub type RayResult<T> = Result<T, RayError>;

/// Why an object can no longer be recovered.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum UnreconstructableReason {
    /// Created by `put`; there is no task to re-run.
    NoLineage,
    /// The producing task was re-executed `attempts` times and lost every time.
    RetriesExhausted { attempts: u32 },
    /// Produced by an actor whose state may already have advanced.
    ActorTask,
    /// The lineage record was released before the object was lost.
    LineageReleased,
}

impl fmt::Display for UnreconstructableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLineage => f.write_str("object was created by put and has no lineage"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "the producing task was retried {attempts} times")
            }
            Self::ActorTask => f.write_str("actor tasks cannot be replayed"),
            Self::LineageReleased => f.write_str("lineage of the producing task was released"),
        }
    }
}

/// A failure raised by user code inside a task.
///
/// Stored as the task's output and raised again when the caller gets it.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RayTaskError {
    pub function_name: String,
    pub task_id: TaskID,
    pub pid: u32,
    pub hostname: String,
    pub node_id: NodeID,
    pub worker_id: WorkerID,
    pub message: String,
    pub traceback: String,
}

impl fmt::Display for RayTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed (task={}, pid={}, host={}, node={}): {}",
            self.function_name,
            self.task_id.short_hex(),
            self.pid,
            self.hostname,
            self.node_id.short_hex(),
            self.message
        )?;
        if !self.traceback.is_empty() {
            write!(f, "\n{}", self.traceback)?;
        }
        Ok(())
    }
}

impl std::error::Error for RayTaskError {}

/// Per-object failure returned by `get`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObjectError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("object store full: {0}")]
    ObjectStoreFull(String),
    #[error("timed out waiting for object {object_id}")]
    TimedOut { object_id: ObjectID },
    #[error("owner of object {object_id} died")]
    OwnerDied { object_id: ObjectID },
    #[error("object {object_id} is unreconstructable: {reason}")]
    Unreconstructable {
        object_id: ObjectID,
        reason: UnreconstructableReason,
    },
    #[error(transparent)]
    TaskError(Box<RayTaskError>),
    #[error("task {task_id} producing this object was cancelled")]
    Cancelled { task_id: TaskID },
}

impl ObjectError {
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidIdentifier(_) => StatusCode::InvalidIdentifier,
            Self::ObjectStoreFull(_) => StatusCode::ObjectStoreFull,
            Self::TimedOut { .. } => StatusCode::TimedOut,
            Self::OwnerDied { .. } => StatusCode::OwnerDied,
            Self::Unreconstructable { .. } => StatusCode::Unreconstructable,
            Self::TaskError(_) => StatusCode::TaskError,
            Self::Cancelled { .. } => StatusCode::Cancelled,
        }
    }

    /// Permanent failures are cached against the object so later `get`s
    /// fail fast without attempting recovery again.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::OwnerDied { .. } | Self::Unreconstructable { .. } | Self::Cancelled { .. }
        )
    }
}

impl From<RayTaskError> for ObjectError {
    fn from(err: RayTaskError) -> Self {
        Self::TaskError(Box::new(err))
    }
}

impl From<ObjectError> for RayError {
    fn from(err: ObjectError) -> Self {
        RayError::new(err.code(), err.to_string())
    }
}
