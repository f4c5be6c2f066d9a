// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placement policies.

use std::collections::BTreeMap;

use raylite_common::id::NodeID;
use raylite_common::scheduling::ResourceSet;

use crate::scheduling_resources::{NodeResources, UtilizationScore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingDecision {
    Node(NodeID),
    /// Some node could run the request, but none has it free now.
    Unavailable,
    /// No node's total resources cover the request.
    Infeasible,
}

pub trait SchedulingPolicy: Send + Sync {
    fn select_node(&self, request: &ResourceSet, nodes: &BTreeMap<NodeID, NodeResources>) -> SchedulingDecision;
}

/// Greedy best-fit bin packing.
///
/// Among nodes whose free vector dominates the request, pick the one with
/// the highest [`UtilizationScore`] after placement. Ties go to the lowest
/// node ID so placement is deterministic. The result is not globally
/// optimal.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestFitPolicy;

impl SchedulingPolicy for BestFitPolicy {
    fn select_node(&self, request: &ResourceSet, nodes: &BTreeMap<NodeID, NodeResources>) -> SchedulingDecision {
        let mut best: Option<(NodeID, UtilizationScore)> = None;
        let mut feasible = false;

        for (node_id, node) in nodes {
            if !node.is_feasible(request) {
                continue;
            }
            feasible = true;
            let Some(score) = node.score_after(request) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((_, best_score)) => score > *best_score,
            };
            if better {
                best = Some((*node_id, score));
            }
        }

        match best {
            Some((node_id, _)) => SchedulingDecision::Node(node_id),
            None if feasible => SchedulingDecision::Unavailable,
            None => SchedulingDecision::Infeasible,
        }
    }
}
