// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Read-only snapshots of cluster state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use raylite_common::id::{NodeID, ObjectID, WorkerID};
use raylite_common::scheduling::ResourceSet;
use raylite_common::RayResult;
use raylite_scheduler::{TaskRecord, WorkerInfo};
use serde::Serialize;

use crate::cluster::Cluster;
use crate::reference_counter::RefCounts;

#[derive(Debug, Clone, Serialize)]
pub struct ObjectRecord {
    pub object_id: ObjectID,
    pub locations: Vec<NodeID>,
    pub size: Option<u64>,
    pub owner: Option<WorkerID>,
    pub owner_node: Option<NodeID>,
    pub ref_counts: Option<RefCounts>,
    /// Permanent failure the object resolves to, if any.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_id: NodeID,
    pub instance_type: String,
    pub alive: bool,
    pub partitioned: bool,
    pub missed_heartbeats: u32,
    pub resources_total: ResourceSet,
    pub resources_available: Option<ResourceSet>,
    pub num_objects: usize,
    pub num_pinned: usize,
    pub store_used_bytes: u64,
    pub store_capacity_bytes: u64,
    pub num_evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
struct Snapshot {
    nodes: Vec<NodeRecord>,
    tasks: Vec<TaskRecord>,
    objects: Vec<ObjectRecord>,
    workers: Vec<WorkerInfo>,
    cluster_resources: ResourceSet,
    available_resources: ResourceSet,
}

/// Query interface over a running cluster.
pub struct GlobalState {
    cluster: Arc<Cluster>,
}

impl GlobalState {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    pub fn task_table(&self) -> Vec<TaskRecord> {
        self.cluster.scheduler().task_table()
    }

    /// Every object that is stored somewhere, tracked by an owner or failed.
    pub fn object_table(&self) -> Vec<ObjectRecord> {
        let objects = self.cluster.objects();
        let owners = self.cluster.owners();
        let mut ids = BTreeSet::new();
        for store in objects.stores().all() {
            ids.extend(store.object_ids());
        }
        for table in owners.tables() {
            ids.extend(table.object_ids());
        }
        ids.into_iter().map(|object_id| self.object_record(object_id)).collect()
    }

    pub fn object_record(&self, object_id: ObjectID) -> ObjectRecord {
        let objects = self.cluster.objects();
        let size = objects
            .stores()
            .all()
            .iter()
            .find_map(|store| store.get_info(&object_id))
            .map(|info| info.size);
        ObjectRecord {
            object_id,
            locations: objects.locations(&object_id),
            size,
            owner: self.cluster.owners().owner_of(&object_id),
            owner_node: objects.directory().owner_node(&object_id),
            ref_counts: self.cluster.owners().counts(&object_id),
            failure: self
                .cluster
                .task_manager()
                .failure(&object_id)
                .map(|e| e.to_string()),
        }
    }

    /// Every node that ever joined, dead ones included.
    pub fn node_table(&self) -> Vec<NodeRecord> {
        let resources = self.cluster.scheduler().resources();
        self.cluster
            .nodes()
            .into_iter()
            .map(|node| {
                let stats = self.cluster.objects().store(&node.node_id).map(|s| s.stats());
                NodeRecord {
                    node_id: node.node_id,
                    instance_type: node.instance_type,
                    alive: node.alive,
                    partitioned: node.partitioned,
                    missed_heartbeats: self.cluster.health().missed_heartbeats(&node.node_id),
                    resources_total: node.resources,
                    resources_available: resources.node_resources(&node.node_id).map(|r| r.available),
                    num_objects: stats.as_ref().map_or(0, |s| s.num_objects),
                    num_pinned: stats.as_ref().map_or(0, |s| s.num_pinned),
                    store_used_bytes: stats.as_ref().map_or(0, |s| s.used_bytes),
                    store_capacity_bytes: stats.as_ref().map_or(0, |s| s.capacity_bytes),
                    num_evictions: stats.as_ref().map_or(0, |s| s.num_evictions),
                }
            })
            .collect()
    }

    /// Total resources of the live nodes.
    pub fn cluster_resources(&self) -> BTreeMap<String, f64> {
        self.cluster.scheduler().resources().cluster_resources().to_f64_map()
    }

    pub fn available_resources(&self) -> BTreeMap<String, f64> {
        self.cluster.scheduler().resources().available_resources().to_f64_map()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.cluster.scheduler().workers().all_workers()
    }

    /// Everything above as one pretty-printed JSON document.
    pub fn to_json(&self) -> RayResult<String> {
        let resources = self.cluster.scheduler().resources();
        let snapshot = Snapshot {
            nodes: self.node_table(),
            tasks: self.task_table(),
            objects: self.object_table(),
            workers: self.workers(),
            cluster_resources: resources.cluster_resources(),
            available_resources: resources.available_resources(),
        };
        serde_json::to_string_pretty(&snapshot)
            .map_err(|e| raylite_common::RayError::invalid(format!("failed to serialize state: {e}")))
    }
}
