// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Node liveness.
//!
//! Every heartbeat period each live node either reports in or misses a
//! beat. A node that misses `health_check_failure_threshold` consecutive
//! beats is declared dead and removed from the cluster.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use raylite_common::id::NodeID;
use tokio::sync::watch;

use crate::cluster::Cluster;

pub struct HealthChecker {
    cluster: Weak<Cluster>,
    period: Duration,
    failure_threshold: u32,
    /// Consecutive missed heartbeats per node.
    missed: Mutex<HashMap<NodeID, u32>>,
    stop: watch::Sender<bool>,
}

impl HealthChecker {
    pub(crate) fn new(cluster: Weak<Cluster>, period: Duration, failure_threshold: u32) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            cluster,
            period,
            failure_threshold: failure_threshold.max(1),
            missed: Mutex::new(HashMap::new()),
            stop,
        }
    }

    pub(crate) fn start(&self, runtime: &tokio::runtime::Handle) {
        let cluster = self.cluster.clone();
        let period = self.period;
        let mut stop = self.stop.subscribe();
        runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    _ = interval.tick() => {
                        let Some(cluster) = cluster.upgrade() else {
                            break;
                        };
                        cluster.health().tick();
                    }
                }
            }
            tracing::debug!("health checker stopped");
        });
    }

    pub(crate) fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Run one heartbeat round. Returns the nodes declared dead.
    pub fn tick(&self) -> Vec<NodeID> {
        let Some(cluster) = self.cluster.upgrade() else {
            return Vec::new();
        };
        let mut dead = Vec::new();
        {
            let mut missed = self.missed.lock();
            let live: Vec<NodeID> = cluster.node_ids();
            missed.retain(|node_id, _| live.contains(node_id));
            for node_id in live {
                if !cluster.is_partitioned(&node_id) {
                    missed.remove(&node_id);
                    continue;
                }
                let count = missed.entry(node_id).or_insert(0);
                *count += 1;
                tracing::debug!(node_id = %node_id, missed = *count, "heartbeat missed");
                if *count >= self.failure_threshold {
                    missed.remove(&node_id);
                    dead.push(node_id);
                }
            }
        }
        for node_id in &dead {
            tracing::warn!(node_id = %node_id, threshold = self.failure_threshold, "node declared dead by health check");
            cluster.remove_node(node_id, "missed heartbeats");
        }
        dead
    }

    pub fn missed_heartbeats(&self, node_id: &NodeID) -> u32 {
        self.missed.lock().get(node_id).copied().unwrap_or(0)
    }
}
