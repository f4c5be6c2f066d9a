// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Error types of the core API.

use raylite_common::{ObjectError, RayError};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("context is not connected to a cluster")]
    NotConnected,

    #[error("no remote function registered as {0:?}")]
    UnknownFunction(String),

    #[error("no actor class registered as {0:?}")]
    UnknownActorClass(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("ray status error: {0}")]
    RayStatus(#[from] RayError),
}

pub type CoreResult<T> = Result<T, CoreError>;
