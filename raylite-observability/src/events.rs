// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Structured event records and sinks.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// Component that emitted the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSourceType {
    ObjectStore,
    Scheduler,
    Ownership,
    Worker,
    Cluster,
}

impl EventSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectStore => "OBJECT_STORE",
            Self::Scheduler => "SCHEDULER",
            Self::Ownership => "OWNERSHIP",
            Self::Worker => "WORKER",
            Self::Cluster => "CLUSTER",
        }
    }
}

/// One telemetry record: a label plus flat string fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreEvent {
    pub event_id: String,
    pub source_type: EventSourceType,
    pub source_hostname: String,
    pub source_pid: u32,
    pub severity: EventSeverity,
    pub label: String,
    pub message: String,
    pub timestamp_ms: u64,
    pub fields: BTreeMap<String, String>,
}

impl CoreEvent {
    pub fn new(
        source_type: EventSourceType,
        severity: EventSeverity,
        label: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source_type,
            source_hostname: raylite_util::process::hostname(),
            source_pid: raylite_util::process::get_pid(),
            severity,
            label: label.into(),
            message: message.into(),
            timestamp_ms: raylite_util::time::current_time_ms(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Destination for core events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

/// Logs every event through `tracing` and, when a directory is configured,
/// appends it as one JSON line to `events_<SOURCE>.log`.
pub struct LogEventSink {
    log_dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl LogEventSink {
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        Self {
            log_dir,
            write_lock: Mutex::new(()),
        }
    }

    fn append(&self, dir: &std::path::Path, event: &CoreEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event).map_err(std::io::Error::other)?;
        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("events_{}.log", event.source_type.as_str())))?;
        writeln!(file, "{json}")
    }
}

impl EventSink for LogEventSink {
    fn emit(&self, event: CoreEvent) {
        match event.severity {
            EventSeverity::Info => tracing::debug!(
                source = event.source_type.as_str(),
                label = %event.label,
                fields = ?event.fields,
                "{}",
                event.message
            ),
            EventSeverity::Warning => tracing::warn!(
                source = event.source_type.as_str(),
                label = %event.label,
                fields = ?event.fields,
                "{}",
                event.message
            ),
            EventSeverity::Error | EventSeverity::Fatal => tracing::error!(
                source = event.source_type.as_str(),
                label = %event.label,
                fields = ?event.fields,
                "{}",
                event.message
            ),
        }

        if let Some(dir) = &self.log_dir {
            if let Err(e) = self.append(dir, &event) {
                tracing::warn!(error = %e, "failed to append event to log");
            }
        }
    }
}

/// Keeps every event in memory. Used by tests and by the CLI summary.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }

    pub fn with_label(&self, label: &str) -> Vec<CoreEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.label == label)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: CoreEvent) {
        self.events.lock().push(event);
    }
}

/// Fans every event out to several sinks.
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: CoreEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
