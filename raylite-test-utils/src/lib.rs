// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared test helpers for raylite crates.

use std::sync::Arc;

use raylite_common::config::RayConfig;
use raylite_common::scheduling::ResourceSet;
use raylite_common::RayResult;
use raylite_core::{Cluster, NodeSpec};
use raylite_observability::{EventSink, MemoryEventSink};

pub mod generators;
pub mod wait;

pub use generators::{random_job_id, random_node_id, random_object_id, random_task_id, random_worker_id};
pub use wait::{wait_for_condition, wait_for_condition_async};

/// Initialize tracing for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Create a temporary directory for test data.
pub fn test_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Builds a local cluster for tests. Heartbeats default to a long period
/// so the background health check only acts when a test ticks it.
pub struct TestClusterBuilder {
    config: RayConfig,
    nodes: Vec<NodeSpec>,
}

impl Default for TestClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClusterBuilder {
    pub fn new() -> Self {
        Self {
            config: RayConfig {
                worker_heartbeat_period_ms: 60_000,
                fetch_retry_initial_delay_ms: 5,
                fetch_retry_max_delay_ms: 50,
                ..RayConfig::default()
            },
            nodes: Vec::new(),
        }
    }

    /// Add a node with `cpus` CPUs.
    pub fn node(mut self, cpus: f64) -> Self {
        self.nodes.push(NodeSpec::with_cpus(cpus));
        self
    }

    pub fn node_with(mut self, resources: &[(&str, f64)]) -> Self {
        self.nodes
            .push(NodeSpec::new(ResourceSet::from_pairs(resources.iter().copied())));
        self
    }

    pub fn node_spec(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    pub fn config(mut self, update: impl FnOnce(&mut RayConfig)) -> Self {
        update(&mut self.config);
        self
    }

    pub fn build(self) -> RayResult<Arc<Cluster>> {
        Cluster::start(self.config, self.nodes)
    }

    /// Build and also capture every event the cluster emits.
    pub fn build_with_events(self) -> RayResult<(Arc<Cluster>, Arc<MemoryEventSink>)> {
        let sink = Arc::new(MemoryEventSink::new());
        let cluster = Cluster::start_with_events(self.config, self.nodes, Some(sink.clone() as Arc<dyn EventSink>))?;
        Ok((cluster, sink))
    }
}
