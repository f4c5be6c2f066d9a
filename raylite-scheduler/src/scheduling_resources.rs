// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-node resource accounting and the utilization score used for
//! best-fit placement.

use std::cmp::Ordering;

use raylite_common::scheduling::ResourceSet;
use serde::Serialize;

/// Total and currently free resources of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResources {
    pub total: ResourceSet,
    pub available: ResourceSet,
}

impl NodeResources {
    pub fn new(total: ResourceSet) -> Self {
        Self {
            available: total.clone(),
            total,
        }
    }

    /// Free resources cover the request right now.
    pub fn is_available(&self, request: &ResourceSet) -> bool {
        self.available.is_superset_of(request)
    }

    /// The node could run the request once idle.
    pub fn is_feasible(&self, request: &ResourceSet) -> bool {
        self.total.is_superset_of(request)
    }

    /// Take `request` out of the free pool. All-or-nothing.
    pub fn allocate(&mut self, request: &ResourceSet) -> bool {
        if !self.is_available(request) {
            return false;
        }
        self.available.subtract(request);
        true
    }

    /// Return resources, never exceeding the node's total.
    pub fn release(&mut self, resources: &ResourceSet) {
        self.available.add(resources);
        let mut excess = self.available.clone();
        excess.subtract(&self.total);
        if !excess.is_empty() {
            tracing::warn!(excess = %excess, "released more resources than allocated");
            self.available.subtract(&excess);
        }
    }

    /// Score of the node if `request` were placed on it now.
    pub fn score_after(&self, request: &ResourceSet) -> Option<UtilizationScore> {
        if !self.is_available(request) {
            return None;
        }
        let mut remaining = self.available.clone();
        remaining.subtract(request);
        Some(UtilizationScore::compute(&self.total, &remaining))
    }
}

/// `(min, mean)` over the per-resource terms `v * util^3`, where `v` is the
/// node's total of that resource and `util` the fraction in use.
///
/// Larger is better: the minimum rewards leaving no dimension idle, the
/// mean rewards overall balance. The cube makes the score favor nodes whose
/// scarce dimensions would be used up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationScore {
    pub min: f64,
    pub mean: f64,
}

impl UtilizationScore {
    pub fn compute(total: &ResourceSet, remaining: &ResourceSet) -> Self {
        let terms: Vec<f64> = total
            .iter()
            .filter(|(_, amount)| amount.is_positive())
            .map(|(name, amount)| {
                let v = amount.to_f64();
                let util = (v - remaining.get(name).to_f64()) / v;
                v * util.powi(3)
            })
            .collect();
        if terms.is_empty() {
            return Self { min: 0.0, mean: 0.0 };
        }
        Self {
            min: terms.iter().copied().fold(f64::INFINITY, f64::min),
            mean: terms.iter().sum::<f64>() / terms.len() as f64,
        }
    }
}

impl PartialOrd for UtilizationScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.min.partial_cmp(&other.min)? {
            Ordering::Equal => self.mean.partial_cmp(&other.mean),
            ord => Some(ord),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_all_or_nothing() {
        let mut node = NodeResources::new(ResourceSet::from_pairs([("CPU", 2.0), ("GPU", 1.0)]));
        assert!(!node.allocate(&ResourceSet::from_pairs([("CPU", 1.0), ("GPU", 2.0)])));
        assert_eq!(node.available, node.total);

        assert!(node.allocate(&ResourceSet::from_pairs([("CPU", 1.5)])));
        assert_eq!(node.available.get("CPU").to_f64(), 0.5);
        node.release(&ResourceSet::from_pairs([("CPU", 3.0)]));
        assert_eq!(node.available, node.total);
    }

    #[test]
    fn test_score_prefers_using_scarce_dimensions() {
        let cpu_node = NodeResources::new(ResourceSet::from_pairs([("CPU", 4.0)]));
        let gpu_node = NodeResources::new(ResourceSet::from_pairs([("CPU", 2.0), ("GPU", 1.0)]));
        let cpu_task = ResourceSet::from_pairs([("CPU", 1.0)]);

        let on_cpu = cpu_node.score_after(&cpu_task).unwrap();
        let on_gpu = gpu_node.score_after(&cpu_task).unwrap();
        // Leaving the GPU idle drags the minimum to zero.
        assert_eq!(on_gpu.min, 0.0);
        assert!(on_cpu > on_gpu);

        let gpu_task = ResourceSet::from_pairs([("GPU", 1.0)]);
        assert!(cpu_node.score_after(&gpu_task).is_none());
        assert!(gpu_node.score_after(&gpu_task).is_some());
    }

    #[test]
    fn test_full_node_scores_highest() {
        let total = ResourceSet::from_pairs([("CPU", 2.0)]);
        let full = UtilizationScore::compute(&total, &ResourceSet::new());
        let half = UtilizationScore::compute(&total, &ResourceSet::from_pairs([("CPU", 1.0)]));
        assert_eq!(full.min, 2.0);
        assert!(full > half);
    }
}
