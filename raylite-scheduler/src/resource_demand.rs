// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scale-up planning for demand the current cluster cannot satisfy.
//!
//! Packing is first-fit and makes no optimality claim; it only has to
//! decide which instance types to add so that the residual demand fits.

use std::collections::BTreeMap;
use std::sync::Arc;

use raylite_common::id::NodeID;
use raylite_common::scheduling::ResourceSet;
use raylite_common::{RayError, RayResult};
use raylite_observability::{domain_events, EventSink};

use crate::scheduling_resources::UtilizationScore;

/// Receives resource requests no existing node can ever satisfy.
pub trait ClusterLifecycleManager: Send + Sync {
    fn request_resources(&self, demands: &[ResourceSet]);
}

/// Launches and lists nodes of a named instance type.
pub trait NodeProvider: Send + Sync {
    /// Live nodes and the instance type each was launched as.
    fn non_terminated_nodes(&self) -> Vec<(NodeID, String)>;
    fn create_nodes(&self, instance_type: &str, count: usize) -> RayResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub resources: ResourceSet,
    /// Upper bound on nodes of this type.
    pub max_workers: usize,
}

/// First-fit `demands` onto `node_resources`; returns what did not fit.
pub fn get_bin_pack_residual(node_resources: &[ResourceSet], demands: &[ResourceSet]) -> Vec<ResourceSet> {
    let mut nodes = node_resources.to_vec();
    let mut unfulfilled = Vec::new();
    for demand in demands {
        match nodes.iter_mut().find(|node| node.is_superset_of(demand)) {
            Some(node) => node.subtract(demand),
            None => unfulfilled.push(demand.clone()),
        }
    }
    unfulfilled
}

/// Greedily choose instance types to add until `demands` fit, adding at
/// most `max_to_add` nodes and respecting each type's `max_workers`.
pub fn get_instances_for(
    instance_types: &BTreeMap<String, InstanceType>,
    existing: &BTreeMap<String, usize>,
    max_to_add: usize,
    demands: &[ResourceSet],
) -> BTreeMap<String, usize> {
    let mut to_add: BTreeMap<String, usize> = BTreeMap::new();
    let mut remaining = demands.to_vec();

    while !remaining.is_empty() && to_add.values().sum::<usize>() < max_to_add {
        let mut best: Option<(UtilizationScore, &String)> = None;
        for (name, instance) in instance_types {
            let count = existing.get(name).copied().unwrap_or(0) + to_add.get(name).copied().unwrap_or(0);
            if count >= instance.max_workers {
                continue;
            }
            let Some(score) = utilization_score(&instance.resources, &remaining) else {
                continue;
            };
            // Ties go to the later name.
            let better = best.as_ref().map_or(true, |(best_score, _)| score >= *best_score);
            if better {
                best = Some((score, name));
            }
        }
        let Some((_, name)) = best else {
            break;
        };
        *to_add.entry(name.clone()).or_insert(0) += 1;
        remaining = get_bin_pack_residual(std::slice::from_ref(&instance_types[name].resources), &remaining);
    }
    to_add
}

/// Score of a fresh node of `node` resources after packing whatever part
/// of `demands` fits. `None` if nothing fits.
fn utilization_score(node: &ResourceSet, demands: &[ResourceSet]) -> Option<UtilizationScore> {
    let mut remaining = node.clone();
    let mut fitted = 0;
    for demand in demands {
        if remaining.is_superset_of(demand) {
            remaining.subtract(demand);
            fitted += 1;
        }
    }
    (fitted > 0).then(|| UtilizationScore::compute(node, &remaining))
}

pub struct ResourceDemandScheduler {
    provider: Arc<dyn NodeProvider>,
    instance_types: BTreeMap<String, InstanceType>,
    max_workers: usize,
    events: Arc<dyn EventSink>,
}

impl ResourceDemandScheduler {
    pub fn new(
        provider: Arc<dyn NodeProvider>,
        instance_types: BTreeMap<String, InstanceType>,
        max_workers: usize,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            provider,
            instance_types,
            max_workers,
            events,
        }
    }

    /// Instance types and counts to launch so that `demands` fit.
    pub fn get_instances_to_launch(&self, demands: &[ResourceSet]) -> RayResult<BTreeMap<String, usize>> {
        if demands.is_empty() {
            return Ok(BTreeMap::new());
        }
        let nodes = self.provider.non_terminated_nodes();
        let mut node_resources = Vec::with_capacity(nodes.len());
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for (node_id, instance_type) in &nodes {
            let instance = self.instance_types.get(instance_type).ok_or_else(|| {
                RayError::invalid(format!("node {node_id} has unknown instance type {instance_type}"))
            })?;
            node_resources.push(instance.resources.clone());
            *counts.entry(instance_type.clone()).or_insert(0) += 1;
        }

        let unfulfilled = get_bin_pack_residual(&node_resources, demands);
        tracing::debug!(unfulfilled = unfulfilled.len(), "computed residual demand");
        Ok(get_instances_for(
            &self.instance_types,
            &counts,
            self.max_workers.saturating_sub(nodes.len()),
            &unfulfilled,
        ))
    }
}

impl ClusterLifecycleManager for ResourceDemandScheduler {
    fn request_resources(&self, demands: &[ResourceSet]) {
        let launches = match self.get_instances_to_launch(demands) {
            Ok(launches) => launches,
            Err(e) => {
                tracing::error!(error = %e, "failed to plan scale-up");
                return;
            }
        };
        let summary = demands.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        self.events
            .emit(domain_events::resource_demand(&format!("[{summary}]"), launches.values().sum()));
        for (instance_type, count) in launches {
            tracing::info!(instance_type = %instance_type, count, "launching nodes for pending demand");
            if let Err(e) = self.provider.create_nodes(&instance_type, count) {
                tracing::error!(instance_type = %instance_type, error = %e, "node launch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use raylite_observability::MemoryEventSink;

    fn res(pairs: &[(&str, f64)]) -> ResourceSet {
        ResourceSet::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    fn types() -> BTreeMap<String, InstanceType> {
        BTreeMap::from([
            (
                "m4.large".to_string(),
                InstanceType {
                    resources: res(&[("CPU", 2.0)]),
                    max_workers: 10,
                },
            ),
            (
                "p2.xlarge".to_string(),
                InstanceType {
                    resources: res(&[("CPU", 4.0), ("GPU", 1.0)]),
                    max_workers: 2,
                },
            ),
        ])
    }

    #[test]
    fn test_bin_pack_residual() {
        let nodes = vec![res(&[("CPU", 2.0)]), res(&[("CPU", 1.0), ("GPU", 1.0)])];
        let demands = vec![res(&[("CPU", 2.0)]), res(&[("GPU", 1.0)]), res(&[("GPU", 1.0)]), res(&[("CPU", 1.0)])];
        let residual = get_bin_pack_residual(&nodes, &demands);
        assert_eq!(residual, vec![res(&[("GPU", 1.0)])]);
    }

    #[test]
    fn test_instances_for_gpu_demand() {
        let demands = vec![res(&[("GPU", 1.0)]); 3];
        let to_add = get_instances_for(&types(), &BTreeMap::new(), 10, &demands);
        // Capped by the type's max_workers.
        assert_eq!(to_add, BTreeMap::from([("p2.xlarge".to_string(), 2)]));
    }

    #[test]
    fn test_instances_for_prefers_tight_fit() {
        let demands = vec![res(&[("CPU", 2.0)])];
        let to_add = get_instances_for(&types(), &BTreeMap::new(), 10, &demands);
        assert_eq!(to_add, BTreeMap::from([("m4.large".to_string(), 1)]));
    }

    #[test]
    fn test_instances_for_respects_max_to_add() {
        let demands = vec![res(&[("CPU", 2.0)]); 5];
        let to_add = get_instances_for(&types(), &BTreeMap::new(), 2, &demands);
        assert_eq!(to_add.values().sum::<usize>(), 2);
    }

    #[derive(Default)]
    struct FakeProvider {
        nodes: Mutex<Vec<(NodeID, String)>>,
    }

    impl NodeProvider for FakeProvider {
        fn non_terminated_nodes(&self) -> Vec<(NodeID, String)> {
            self.nodes.lock().clone()
        }
        fn create_nodes(&self, instance_type: &str, count: usize) -> RayResult<()> {
            let mut nodes = self.nodes.lock();
            for _ in 0..count {
                nodes.push((NodeID::from_random(), instance_type.to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_request_resources_launches_nodes() {
        let provider = Arc::new(FakeProvider::default());
        provider.create_nodes("m4.large", 1).unwrap();
        let events = Arc::new(MemoryEventSink::new());
        let scheduler = ResourceDemandScheduler::new(provider.clone(), types(), 4, events.clone());

        // The existing CPU node absorbs the CPU demand; the GPU needs a new node.
        scheduler.request_resources(&[res(&[("CPU", 2.0)]), res(&[("GPU", 1.0)])]);
        let nodes = provider.non_terminated_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].1, "p2.xlarge");
        assert_eq!(events.with_label(domain_events::RESOURCE_DEMAND).len(), 1);
    }

    #[test]
    fn test_unknown_instance_type_is_an_error() {
        let provider = Arc::new(FakeProvider::default());
        provider.create_nodes("mystery", 1).unwrap();
        let scheduler =
            ResourceDemandScheduler::new(provider, types(), 4, Arc::new(MemoryEventSink::new()));
        assert!(scheduler.get_instances_to_launch(&[res(&[("CPU", 1.0)])]).is_err());
    }
}
