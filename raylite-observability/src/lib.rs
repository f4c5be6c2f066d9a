// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Telemetry for the raylite core.
//!
//! The core emits flat key-value events (task state transitions, object
//! store occupancy, node membership) to an [`events::EventSink`]. What the
//! sink does with them is up to the embedding application.

pub mod domain_events;
pub mod events;

pub use events::{
    CoreEvent, EventSeverity, EventSink, EventSourceType, FanoutEventSink, LogEventSink, MemoryEventSink,
};
