// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Leaf utilities shared by every raylite crate.
//!
//! Logging setup, retry backoff, wall-clock and deadline helpers, and
//! process identity used to annotate task errors.

pub mod backoff;
pub mod logging;
pub mod process;
pub mod random;
pub mod time;
