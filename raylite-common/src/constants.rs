// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Constants shared across crates.

/// Length of full-length unique IDs (`NodeID`, `WorkerID`) in bytes.
pub const UNIQUE_ID_SIZE: usize = 28;

/// Precision of fractional resource quantities.
pub const RESOURCE_UNIT_SCALING: i64 = 10000;

/// Well-known resource names.
pub const CPU_RESOURCE: &str = "CPU";
pub const GPU_RESOURCE: &str = "GPU";
pub const MEMORY_RESOURCE: &str = "memory";

/// Re-executions allowed for a lost task unless the caller overrides it.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 3;

/// First counter value used for signal object IDs.
pub const SIGNAL_COUNTER_START: u32 = 10000;

/// Prefix of environment variables that override configuration fields.
pub const CONFIG_ENV_PREFIX: &str = "RAYLITE_";

pub const RAYLITE_VERSION: &str = env!("CARGO_PKG_VERSION");
