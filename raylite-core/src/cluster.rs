// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The simulated multi-node cluster.
//!
//! One process hosts every node: each node has its own object store and
//! resource vector, and each worker is a tokio task bound to a node.
//! `Cluster` owns the shared services (object plane, scheduler, lineage,
//! ownership registry) and wires their callbacks to each other through
//! weak references, so dropping the last `Arc<Cluster>` tears everything
//! down.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use raylite_common::config::RayConfig;
use raylite_common::id::{JobID, NodeID, ObjectID, WorkerID};
use raylite_common::scheduling::ResourceSet;
use raylite_common::{ObjectError, RayError, RayResult};
use raylite_object_store::{ObjectManager, ObjectResolver};
use raylite_observability::{domain_events, EventSink, FanoutEventSink, LogEventSink};
use raylite_scheduler::resource_demand::InstanceType;
use raylite_scheduler::{
    BestFitPolicy, ClusterResourceManager, NodeProvider, ResourceDemandScheduler, TaskAssignment, TaskDispatcher,
    TaskScheduler, TaskSpec, WorkerPool,
};
use serde::Serialize;

use crate::function_manager::FunctionRegistry;
use crate::health_check::HealthChecker;
use crate::reference_counter::{OwnerRegistry, OwnershipGuard};
use crate::signal::SignalCounters;
use crate::task_manager::TaskManager;
use crate::worker::WorkerHandle;

/// Shape of a node to add.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub resources: ResourceSet,
    /// Falls back to `RayConfig::object_store_memory_bytes`.
    pub object_store_memory_bytes: Option<u64>,
    pub instance_type: String,
}

impl NodeSpec {
    pub fn new(resources: ResourceSet) -> Self {
        Self {
            resources,
            object_store_memory_bytes: None,
            instance_type: "local".to_string(),
        }
    }

    pub fn with_cpus(cpus: f64) -> Self {
        Self::new(ResourceSet::from_pairs([(raylite_common::constants::CPU_RESOURCE, cpus)]))
    }

    pub fn with_object_store_memory(mut self, bytes: u64) -> Self {
        self.object_store_memory_bytes = Some(bytes);
        self
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_id: NodeID,
    pub instance_type: String,
    pub resources: ResourceSet,
    pub object_store_memory_bytes: u64,
    pub alive: bool,
    /// Heartbeats are not getting through.
    pub partitioned: bool,
    pub joined_at_ms: u64,
}

pub struct Cluster {
    self_ref: Weak<Cluster>,
    config: RayConfig,
    runtime: tokio::runtime::Handle,
    events: Arc<dyn EventSink>,
    objects: Arc<ObjectManager>,
    scheduler: Arc<TaskScheduler>,
    tasks: TaskManager,
    owners: Arc<OwnerRegistry>,
    functions: Arc<FunctionRegistry>,
    signals: SignalCounters,
    health: HealthChecker,
    nodes: RwLock<BTreeMap<NodeID, NodeInfo>>,
    workers: Mutex<HashMap<WorkerID, WorkerHandle>>,
    next_job: AtomicU32,
    shut_down: AtomicBool,
}

impl Cluster {
    /// Start a cluster with the given nodes on the current tokio runtime.
    pub fn start(config: RayConfig, nodes: Vec<NodeSpec>) -> RayResult<Arc<Self>> {
        Self::start_with_events(config, nodes, None)
    }

    /// Like [`Cluster::start`], additionally sending every event to `sink`.
    pub fn start_with_events(
        config: RayConfig,
        nodes: Vec<NodeSpec>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> RayResult<Arc<Self>> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| RayError::invalid("a cluster must be started inside a tokio runtime"))?;

        let log_sink: Arc<dyn EventSink> = Arc::new(LogEventSink::new(config.event_log_dir()));
        let events: Arc<dyn EventSink> = match sink {
            Some(sink) => Arc::new(FanoutEventSink::new(vec![log_sink, sink])),
            None => log_sink,
        };

        let objects = ObjectManager::new(&config, events.clone());
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(ClusterResourceManager::new()),
            Arc::new(WorkerPool::new(config.max_workers_per_node as usize)),
            Box::new(BestFitPolicy),
            config.enable_autoscaling,
            events.clone(),
        ));
        let owners = Arc::new(OwnerRegistry::new());
        let tasks = TaskManager::new(objects.clone(), scheduler.clone(), owners.clone(), events.clone());

        let cluster = Arc::new_cyclic(|self_ref: &Weak<Cluster>| Self {
            self_ref: self_ref.clone(),
            health: HealthChecker::new(
                self_ref.clone(),
                Duration::from_millis(config.worker_heartbeat_period_ms),
                config.health_check_failure_threshold,
            ),
            signals: SignalCounters::new(config.signal_counter_start),
            config,
            runtime,
            events,
            objects: objects.clone(),
            scheduler: scheduler.clone(),
            tasks,
            owners: owners.clone(),
            functions: Arc::new(FunctionRegistry::new()),
            nodes: RwLock::new(BTreeMap::new()),
            workers: Mutex::new(HashMap::new()),
            next_job: AtomicU32::new(0),
            shut_down: AtomicBool::new(false),
        });

        objects.set_eviction_guard(Arc::new(OwnershipGuard(owners)));
        objects.set_resolver(Arc::new(ClusterHooks(Arc::downgrade(&cluster))));
        let weak_scheduler = Arc::downgrade(&scheduler);
        objects.add_resolved_listener(Arc::new(move |object_id| {
            if let Some(scheduler) = weak_scheduler.upgrade() {
                scheduler.handle_object_available(object_id);
            }
        }));
        scheduler.set_dispatcher(Arc::new(ClusterHooks(Arc::downgrade(&cluster))));

        for spec in nodes {
            cluster.add_node(spec);
        }
        cluster.health.start(&cluster.runtime);
        tracing::info!(nodes = cluster.node_ids().len(), "cluster started");
        Ok(cluster)
    }

    pub fn config(&self) -> &RayConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn objects(&self) -> &Arc<ObjectManager> {
        &self.objects
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn owners(&self) -> &Arc<OwnerRegistry> {
        &self.owners
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn signals(&self) -> &SignalCounters {
        &self.signals
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub(crate) fn weak(&self) -> Weak<Cluster> {
        self.self_ref.clone()
    }

    pub(crate) fn next_job_id(&self) -> JobID {
        JobID::from_int(self.next_job.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // ─── Membership ─────────────────────────────────────────────────────

    /// Bring up a node: its object store, its resources and its heartbeat.
    pub fn add_node(&self, spec: NodeSpec) -> NodeID {
        let node_id = NodeID::from_random();
        let capacity = spec
            .object_store_memory_bytes
            .unwrap_or(self.config.object_store_memory_bytes);
        self.objects.add_node(node_id, capacity);
        self.nodes.write().insert(
            node_id,
            NodeInfo {
                node_id,
                instance_type: spec.instance_type.clone(),
                resources: spec.resources.clone(),
                object_store_memory_bytes: capacity,
                alive: true,
                partitioned: false,
                joined_at_ms: raylite_util::time::current_time_ms(),
            },
        );
        tracing::info!(node_id = %node_id, resources = %spec.resources, "node joined");
        self.events
            .emit(domain_events::node_added(&node_id, &spec.resources.to_string()));
        self.scheduler.node_added(node_id, spec.resources);
        node_id
    }

    /// Take a node out of the cluster. Its workers die, its store goes away
    /// and the tasks it was running are handed to reconstruction.
    pub fn remove_node(&self, node_id: &NodeID, reason: &str) -> bool {
        {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(node_id) {
                Some(info) if info.alive => info.alive = false,
                _ => return false,
            }
        }
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            let ids: Vec<WorkerID> = workers
                .values()
                .filter(|w| w.node_id() == *node_id)
                .map(WorkerHandle::worker_id)
                .collect();
            ids.iter().filter_map(|id| workers.remove(id)).collect()
        };
        for handle in &handles {
            handle.kill();
        }

        let orphaned = self.objects.remove_node(node_id);
        let lost = self.scheduler.node_removed(node_id);
        tracing::warn!(
            node_id = %node_id,
            reason,
            workers = handles.len(),
            lost_tasks = lost.len(),
            orphaned_objects = orphaned.len(),
            "node left"
        );
        self.events.emit(domain_events::node_removed(node_id, reason));
        self.tasks.handle_lost(lost);
        true
    }

    pub fn node_ids(&self) -> Vec<NodeID> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.alive)
            .map(|n| n.node_id)
            .collect()
    }

    /// Every node that ever joined, dead ones included.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn node_info(&self, node_id: &NodeID) -> Option<NodeInfo> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn is_node_alive(&self, node_id: &NodeID) -> bool {
        self.nodes.read().get(node_id).is_some_and(|n| n.alive)
    }

    /// Cut a node off from heartbeats (or restore it). The health checker
    /// declares it dead after enough missed periods.
    pub fn partition_node(&self, node_id: &NodeID, partitioned: bool) -> bool {
        match self.nodes.write().get_mut(node_id) {
            Some(info) if info.alive => {
                info.partitioned = partitioned;
                tracing::info!(node_id = %node_id, partitioned, "node partition changed");
                true
            }
            _ => false,
        }
    }

    pub fn is_partitioned(&self, node_id: &NodeID) -> bool {
        self.nodes.read().get(node_id).is_some_and(|n| n.partitioned)
    }

    /// Make the location directory unreachable or reachable again. On
    /// recovery, waiters and dependent tasks catch up on what they missed.
    pub fn set_directory_available(&self, available: bool) {
        self.objects.set_directory_available(available);
        if available {
            self.scheduler.recheck_dependencies(|object_id| self.objects.is_resolved(object_id));
        }
    }

    /// Let the scheduler launch nodes of `instance_types` for infeasible
    /// demand. Requires `enable_autoscaling`.
    pub fn enable_autoscaler(&self, instance_types: BTreeMap<String, InstanceType>, max_workers: usize) {
        if !self.config.enable_autoscaling {
            tracing::warn!("autoscaler installed but enable_autoscaling is off");
        }
        let provider = Arc::new(SimulatedNodeProvider {
            cluster: self.weak(),
            instance_types: instance_types.clone(),
        });
        let demand_scheduler = ResourceDemandScheduler::new(provider, instance_types, max_workers, self.events.clone());
        self.scheduler.set_lifecycle_manager(Arc::new(demand_scheduler));
    }

    // ─── Workers ────────────────────────────────────────────────────────

    fn dispatch(&self, assignment: TaskAssignment) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let worker_id = assignment.worker_id;
        let sent = {
            let mut workers = self.workers.lock();
            let handle = workers.entry(worker_id).or_insert_with(|| {
                WorkerHandle::spawn(self.weak(), worker_id, assignment.node_id, &self.runtime)
            });
            handle.send(assignment)
        };
        if !sent {
            tracing::warn!(worker_id = %worker_id, "worker mailbox closed");
            self.handle_worker_died(&worker_id);
        }
    }

    /// Kill a worker as if its process crashed.
    pub fn kill_worker(&self, worker_id: &WorkerID) -> bool {
        if !self.workers.lock().contains_key(worker_id) {
            return false;
        }
        self.handle_worker_died(worker_id);
        true
    }

    pub(crate) fn handle_worker_died(&self, worker_id: &WorkerID) {
        let handle = self.workers.lock().remove(worker_id);
        let node_id = match &handle {
            Some(handle) => {
                handle.kill();
                handle.node_id()
            }
            None => match self.scheduler.workers().get_worker(worker_id) {
                Some(info) if !self.scheduler.workers().is_worker_dead(worker_id) => info.node_id,
                _ => return,
            },
        };
        let lost = self.scheduler.worker_died(worker_id);
        tracing::warn!(worker_id = %worker_id, node_id = %node_id, lost_tasks = lost.len(), "worker died");
        self.events.emit(domain_events::worker_died(
            worker_id,
            &node_id,
            lost.first().map(|spec| &spec.task_id),
        ));
        self.tasks.handle_lost(lost);
    }

    // ─── Owners ─────────────────────────────────────────────────────────

    /// An owner went away: everything it owned fails with `OwnerDied` and
    /// is freed, and everything it borrowed is released.
    pub(crate) fn handle_owner_died(&self, owner_id: &WorkerID) {
        let released = self.owners.remove_borrower(owner_id);
        self.tasks.free_objects(&released);

        let Some(table) = self.owners.unregister(owner_id) else {
            return;
        };
        let owned = table.drain();
        tracing::info!(owner_id = %owner_id, objects = owned.len(), "owner disconnected");
        for object_id in &owned {
            self.tasks
                .record_failure(*object_id, ObjectError::OwnerDied { object_id: *object_id });
        }
        self.tasks.free_objects(&owned);
    }

    /// Stop every worker and the health checker. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.health.stop();
        let handles: Vec<WorkerHandle> = self.workers.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.kill();
        }
        tracing::info!(workers = handles.len(), "cluster shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Callbacks from the scheduler and the object plane into the cluster.
struct ClusterHooks(Weak<Cluster>);

impl TaskDispatcher for ClusterHooks {
    fn dispatch(&self, assignment: TaskAssignment) {
        if let Some(cluster) = self.0.upgrade() {
            cluster.dispatch(assignment);
        }
    }

    fn fail(&self, spec: &TaskSpec, error: ObjectError) {
        if let Some(cluster) = self.0.upgrade() {
            cluster.tasks.fail_task(spec, error);
        }
    }
}

impl ObjectResolver for ClusterHooks {
    fn failure(&self, object_id: &ObjectID) -> Option<ObjectError> {
        self.0.upgrade().and_then(|cluster| cluster.tasks.failure(object_id))
    }

    fn on_object_missing(&self, object_id: &ObjectID) {
        if let Some(cluster) = self.0.upgrade() {
            cluster.tasks.on_object_missing(object_id);
        }
    }
}

/// Launches nodes inside this process on behalf of the autoscaler.
struct SimulatedNodeProvider {
    cluster: Weak<Cluster>,
    instance_types: BTreeMap<String, InstanceType>,
}

impl NodeProvider for SimulatedNodeProvider {
    fn non_terminated_nodes(&self) -> Vec<(NodeID, String)> {
        let Some(cluster) = self.cluster.upgrade() else {
            return Vec::new();
        };
        cluster
            .nodes()
            .into_iter()
            .filter(|n| n.alive && self.instance_types.contains_key(&n.instance_type))
            .map(|n| (n.node_id, n.instance_type))
            .collect()
    }

    fn create_nodes(&self, instance_type: &str, count: usize) -> RayResult<()> {
        let cluster = self
            .cluster
            .upgrade()
            .ok_or_else(|| RayError::disconnected("cluster is gone"))?;
        let instance = self
            .instance_types
            .get(instance_type)
            .ok_or_else(|| RayError::invalid_argument(format!("unknown instance type {instance_type}")))?;
        for _ in 0..count {
            cluster.add_node(NodeSpec::new(instance.resources.clone()).with_instance_type(instance_type));
        }
        Ok(())
    }
}
