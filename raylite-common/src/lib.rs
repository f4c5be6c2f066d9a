// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared vocabulary of the raylite core.
//!
//! Identifier codec, error taxonomy, configuration and resource vectors.
//! Everything here is plain data; no module in this crate performs I/O.

pub mod config;
pub mod constants;
pub mod id;
pub mod scheduling;
pub mod status;

pub use status::{ObjectError, RayError, RayResult, RayTaskError, StatusCode, UnreconstructableReason};
