// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cluster-wide resource view.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use raylite_common::id::NodeID;
use raylite_common::scheduling::ResourceSet;

use crate::scheduling_policy::{SchedulingDecision, SchedulingPolicy};
use crate::scheduling_resources::NodeResources;

#[derive(Default)]
pub struct ClusterResourceManager {
    nodes: RwLock<BTreeMap<NodeID, NodeResources>>,
}

impl ClusterResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, or reset an existing node to fully free.
    pub fn add_node(&self, node_id: NodeID, total: ResourceSet) {
        self.nodes.write().insert(node_id, NodeResources::new(total));
    }

    pub fn remove_node(&self, node_id: &NodeID) -> Option<NodeResources> {
        self.nodes.write().remove(node_id)
    }

    pub fn contains(&self, node_id: &NodeID) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// Pick a node with `policy` and allocate on it in one step.
    pub fn select_and_allocate(&self, policy: &dyn SchedulingPolicy, request: &ResourceSet) -> SchedulingDecision {
        let mut nodes = self.nodes.write();
        let decision = policy.select_node(request, &nodes);
        if let SchedulingDecision::Node(node_id) = decision {
            let allocated = nodes.get_mut(&node_id).is_some_and(|node| node.allocate(request));
            if !allocated {
                return SchedulingDecision::Unavailable;
            }
        }
        decision
    }

    pub fn allocate(&self, node_id: &NodeID, request: &ResourceSet) -> bool {
        self.nodes.write().get_mut(node_id).is_some_and(|node| node.allocate(request))
    }

    /// Return resources to a node. A removed node ignores the release.
    pub fn release(&self, node_id: &NodeID, resources: &ResourceSet) {
        if let Some(node) = self.nodes.write().get_mut(node_id) {
            node.release(resources);
        }
    }

    pub fn is_feasible_anywhere(&self, request: &ResourceSet) -> bool {
        self.nodes.read().values().any(|node| node.is_feasible(request))
    }

    pub fn node_resources(&self, node_id: &NodeID) -> Option<NodeResources> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn view(&self) -> BTreeMap<NodeID, NodeResources> {
        self.nodes.read().clone()
    }

    pub fn node_ids(&self) -> Vec<NodeID> {
        self.nodes.read().keys().copied().collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.read().len()
    }

    /// Sum of every node's total resources.
    pub fn cluster_resources(&self) -> ResourceSet {
        let mut sum = ResourceSet::new();
        for node in self.nodes.read().values() {
            sum.add(&node.total);
        }
        sum
    }

    /// Sum of every node's free resources.
    pub fn available_resources(&self) -> ResourceSet {
        let mut sum = ResourceSet::new();
        for node in self.nodes.read().values() {
            sum.add(&node.available);
        }
        sum
    }
}
