// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The driver-facing API.
//!
//! A [`ClusterContext`] is one owner: it creates objects with `put`,
//! submits tasks and actors, and owns every object it creates. Reads go
//! through the node it is attached to, fetching remote copies as needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use raylite_common::id::{NodeID, ObjectID, TaskID, WorkerID};
use raylite_common::scheduling::ResourceSet;
use raylite_common::{ObjectError, RayError};
use raylite_object_store::{RayObject, WaitResult};
use raylite_scheduler::{TaskArg, TaskSpec, TaskState};
use raylite_util::time::Deadline;

use crate::cluster::Cluster;
use crate::context::WorkerContext;
use crate::error::{CoreError, CoreResult};
use crate::function_manager::ActorInstance;
use crate::object_ref::{ActorHandle, ObjectRef};
use crate::reference_counter::OwnershipTable;
use crate::signal::{Signal, SignalReceiver};
use crate::worker::TaskContext;

/// Per-call options of a remote function.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub num_returns: u32,
    /// `None` requests one CPU.
    pub resources: Option<ResourceSet>,
    /// `None` uses `RayConfig::max_task_retries`.
    pub max_retries: Option<u32>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            num_returns: 1,
            resources: None,
            max_retries: None,
        }
    }
}

impl TaskOptions {
    pub fn num_returns(mut self, num_returns: u32) -> Self {
        self.num_returns = num_returns;
        self
    }

    pub fn resources(mut self, resources: ResourceSet) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActorOptions {
    pub resources: Option<ResourceSet>,
    pub max_concurrency: Option<u32>,
}

impl ActorOptions {
    pub fn resources(mut self, resources: ResourceSet) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }
}

pub struct ClusterContext {
    cluster: Arc<Cluster>,
    worker: WorkerContext,
    table: Arc<OwnershipTable>,
    signals: SignalReceiver,
    connected: AtomicBool,
}

impl ClusterContext {
    /// Attach to the first live node of `cluster`.
    pub fn connect(cluster: &Arc<Cluster>) -> CoreResult<Self> {
        let node_id = cluster
            .node_ids()
            .into_iter()
            .next()
            .ok_or_else(|| RayError::unavailable("cluster has no live nodes"))?;
        Self::connect_on(cluster, node_id)
    }

    pub fn connect_on(cluster: &Arc<Cluster>, node_id: NodeID) -> CoreResult<Self> {
        if !cluster.is_node_alive(&node_id) {
            return Err(RayError::not_found(format!("node {node_id} is not alive")).into());
        }
        let worker = WorkerContext::new(WorkerID::from_random(), node_id, cluster.next_job_id());
        let table = Arc::new(OwnershipTable::new(worker.worker_id()));
        cluster.owners().register(table.clone());
        tracing::info!(
            worker_id = %worker.worker_id(),
            node_id = %node_id,
            job_id = %worker.job_id(),
            "driver connected"
        );
        Ok(Self {
            cluster: cluster.clone(),
            worker,
            table,
            signals: SignalReceiver::new(cluster.config().signal_counter_start),
            connected: AtomicBool::new(true),
        })
    }

    /// Leave the cluster. Objects this context owns are freed; anyone still
    /// borrowing them gets `OwnerDied`. Idempotent.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cluster.handle_owner_died(&self.worker.worker_id());
        tracing::info!(worker_id = %self.worker.worker_id(), "driver disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> CoreResult<()> {
        if self.is_connected() && !self.cluster.is_shut_down() {
            Ok(())
        } else {
            Err(CoreError::NotConnected)
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn worker_id(&self) -> WorkerID {
        self.worker.worker_id()
    }

    pub fn node_id(&self) -> NodeID {
        self.worker.node_id()
    }

    /// Task ID under which this driver's puts and submissions are derived.
    pub fn current_task_id(&self) -> TaskID {
        self.worker.current_task_id()
    }

    fn owned_ref(&self, object_id: ObjectID) -> ObjectRef {
        ObjectRef::owned(self.cluster.weak(), object_id, self.worker.worker_id(), self.worker.node_id())
    }

    /// Track `object_ids` as owned by this context with one local ref each.
    fn own(&self, object_ids: &[ObjectID]) -> Vec<ObjectRef> {
        object_ids
            .iter()
            .map(|object_id| {
                self.table.add_owned_object(*object_id, &[]);
                self.table.add_local_ref(*object_id);
                self.cluster.objects().directory().set_owner(*object_id, self.worker.node_id());
                self.owned_ref(*object_id)
            })
            .collect()
    }

    // ─── Objects ────────────────────────────────────────────────────────

    pub fn put(&self, data: impl Into<Bytes>) -> CoreResult<ObjectRef> {
        self.put_with_refs(data, &[])
    }

    /// Store `data`, recording that it embeds `nested`. The nested objects
    /// stay alive at least as long as the new one.
    pub fn put_with_refs(&self, data: impl Into<Bytes>, nested: &[&ObjectRef]) -> CoreResult<ObjectRef> {
        self.check_connected()?;
        if let Some(foreign) = nested.iter().find(|r| r.owner_id() != self.worker.worker_id()) {
            return Err(CoreError::InvalidArgument(format!(
                "nested object {} is owned by another context",
                foreign.object_id()
            )));
        }
        let object_id = self.worker.next_put_id()?;
        let inner: Vec<ObjectID> = nested.iter().map(|r| r.object_id()).collect();
        self.table.add_owned_object(object_id, &inner);
        self.table.add_local_ref(object_id);
        self.cluster.objects().directory().set_owner(object_id, self.worker.node_id());
        let object_ref = self.owned_ref(object_id);

        let object = RayObject::new(data.into()).with_nested_refs(inner);
        self.cluster
            .objects()
            .put(&self.worker.node_id(), object_id, object, false)?;
        tracing::debug!(object_id = %object_id, "put");
        Ok(object_ref)
    }

    /// Fetch each object, in order, sharing one deadline. A per-object
    /// failure is returned in place; only API misuse fails the whole call.
    pub async fn get(&self, object_ids: &[ObjectID], timeout_ms: Option<u64>) -> CoreResult<Vec<Result<Bytes, ObjectError>>> {
        self.check_connected()?;
        let deadline = Deadline::from_timeout_ms(timeout_ms);
        let mut results = Vec::with_capacity(object_ids.len());
        for object_id in object_ids {
            let result = self
                .cluster
                .objects()
                .get(&self.worker.node_id(), object_id, deadline)
                .await
                .and_then(RayObject::into_result);
            results.push(result);
        }
        Ok(results)
    }

    /// Get a single object, surfacing its failure as an error.
    pub async fn get_one(&self, object_id: &ObjectID, timeout_ms: Option<u64>) -> CoreResult<Bytes> {
        let mut results = self.get(std::slice::from_ref(object_id), timeout_ms).await?;
        match results.pop() {
            Some(result) => Ok(result?),
            None => Err(CoreError::InvalidArgument("empty get".to_string())),
        }
    }

    /// Return once `num_returns` of `object_ids` are ready or the timeout
    /// passes. Failed objects count as ready.
    pub async fn wait(&self, object_ids: &[ObjectID], num_returns: usize, timeout_ms: Option<u64>) -> CoreResult<WaitResult> {
        self.check_connected()?;
        if num_returns > object_ids.len() {
            return Err(CoreError::InvalidArgument(format!(
                "num_returns {num_returns} exceeds the {} objects given",
                object_ids.len()
            )));
        }
        let deadline = Deadline::from_timeout_ms(timeout_ms);
        Ok(self.cluster.objects().wait(object_ids, num_returns, deadline).await)
    }

    /// Take a borrow on an object owned by another context. The borrow is
    /// released when the returned handle drops.
    pub fn borrow(&self, object_ref: &ObjectRef) -> CoreResult<ObjectRef> {
        self.check_connected()?;
        let owner_id = object_ref.owner_id();
        if owner_id == self.worker.worker_id() {
            return Ok(object_ref.clone());
        }
        let table = self
            .cluster
            .owners()
            .get(&owner_id)
            .ok_or(ObjectError::OwnerDied {
                object_id: object_ref.object_id(),
            })?;
        table.add_borrower(&object_ref.object_id(), self.worker.worker_id())?;
        Ok(ObjectRef::borrowed(
            self.cluster.weak(),
            object_ref.object_id(),
            owner_id,
            self.worker.worker_id(),
            self.worker.node_id(),
        ))
    }

    // ─── Tasks ──────────────────────────────────────────────────────────

    pub fn register_function<F>(&self, name: &str, function: F)
    where
        F: Fn(&TaskContext, Vec<Bytes>) -> anyhow::Result<Vec<Bytes>> + Send + Sync + 'static,
    {
        self.cluster.functions().register_function(name, function);
    }

    pub fn register_actor_class<F>(&self, name: &str, factory: F)
    where
        F: Fn(&TaskContext, Vec<Bytes>) -> anyhow::Result<Box<dyn ActorInstance>> + Send + Sync + 'static,
    {
        self.cluster.functions().register_actor_class(name, factory);
    }

    /// Submit a remote function call. Returns one handle per return value.
    pub fn submit_task(&self, function: &str, args: Vec<TaskArg>, options: TaskOptions) -> CoreResult<Vec<ObjectRef>> {
        self.check_connected()?;
        if !self.cluster.functions().has_function(function) {
            return Err(CoreError::UnknownFunction(function.to_string()));
        }
        let task_id = self.worker.next_task_id(None)?;
        let mut spec = TaskSpec::remote_function(task_id, self.worker.current_task_id(), function, args, options.num_returns)
            .with_max_retries(options.max_retries.unwrap_or(self.cluster.config().max_task_retries));
        if let Some(resources) = options.resources {
            spec = spec.with_resources(resources);
        }
        self.submit_spec(spec)
    }

    fn submit_spec(&self, spec: TaskSpec) -> CoreResult<Vec<ObjectRef>> {
        let task_id = spec.task_id;
        let refs = self.own(&spec.return_ids()?);
        self.cluster.task_manager().submit(spec)?;
        tracing::debug!(task_id = %task_id, returns = refs.len(), "task submitted");
        Ok(refs)
    }

    pub fn create_actor(&self, class_name: &str, args: Vec<TaskArg>, options: ActorOptions) -> CoreResult<ActorHandle> {
        self.check_connected()?;
        if !self.cluster.functions().has_actor_class(class_name) {
            return Err(CoreError::UnknownActorClass(class_name.to_string()));
        }
        let actor_id = self.worker.next_actor_id();
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(self.cluster.config().default_actor_max_concurrency);
        let mut spec = TaskSpec::actor_creation(actor_id, self.worker.current_task_id(), class_name, args, max_concurrency);
        if let Some(resources) = options.resources {
            spec = spec.with_resources(resources);
        }
        let handle_ref = self
            .submit_spec(spec)?
            .pop()
            .ok_or_else(|| RayError::invalid("actor creation produced no handle object"))?;
        tracing::info!(actor_id = %actor_id, class_name, "actor created");
        Ok(ActorHandle::new(actor_id, class_name.to_string(), handle_ref))
    }

    /// Call `method` on an actor. Calls from one context run in submission
    /// order when the actor's concurrency is 1.
    pub fn call_actor(
        &self,
        actor: &ActorHandle,
        method: &str,
        args: Vec<TaskArg>,
        num_returns: u32,
    ) -> CoreResult<Vec<ObjectRef>> {
        self.check_connected()?;
        let actor_id = actor.actor_id();
        let task_id = self.worker.next_task_id(Some(&actor_id))?;
        let spec = TaskSpec::actor_method(
            task_id,
            self.worker.current_task_id(),
            actor_id,
            actor.class_name(),
            method,
            args,
            num_returns,
        );
        self.submit_spec(spec)
    }

    /// Kill the worker hosting an actor. Pending and future calls fail.
    pub fn kill_actor(&self, actor: &ActorHandle) -> CoreResult<bool> {
        self.check_connected()?;
        match self.cluster.scheduler().actor_location(&actor.actor_id()) {
            Some((_, worker_id)) => Ok(self.cluster.kill_worker(&worker_id)),
            None => Ok(false),
        }
    }

    /// Cancel the task producing `object_id`.
    ///
    /// A task that has not started is withdrawn and its outputs resolve to
    /// `Cancelled`. A running task is asked to stop; with `force` its worker
    /// is killed, which actors refuse. Returns false if the task already
    /// finished.
    pub fn cancel(&self, object_id: &ObjectID, force: bool) -> CoreResult<bool> {
        self.check_connected()?;
        if !object_id.is_task_return() {
            return Err(CoreError::InvalidArgument(format!("{object_id} is not a task output")));
        }
        let task_id = object_id.task_id();
        let tasks = self.cluster.task_manager();
        if tasks.cancel_pending(&task_id) {
            return Ok(true);
        }
        let Some(record) = self.cluster.scheduler().task_record(&task_id) else {
            return Ok(false);
        };
        if record.state != TaskState::Running {
            return Ok(false);
        }
        let is_actor_task = self
            .cluster
            .scheduler()
            .task_spec(&task_id)
            .is_some_and(|spec| spec.actor_id().is_some());
        tasks.request_cancel(&task_id);
        if force {
            if is_actor_task {
                return Err(CoreError::InvalidArgument("force-cancelling an actor task is not supported".to_string()));
            }
            if let Some(worker_id) = record.worker_id {
                tracing::info!(task_id = %task_id, worker_id = %worker_id, "force-cancelling running task");
                self.cluster.kill_worker(&worker_id);
            }
        }
        Ok(true)
    }

    // ─── Signals ────────────────────────────────────────────────────────

    /// Send a signal from this driver. Receivers read it under
    /// [`ClusterContext::current_task_id`].
    pub fn send_signal(&self, signal: &Signal) -> CoreResult<ObjectID> {
        self.check_connected()?;
        Ok(self.cluster.signals().send(
            self.cluster.objects(),
            &self.worker.node_id(),
            &self.worker.current_task_id(),
            signal,
        )?)
    }

    /// Every signal `sources` sent since the last call. Waits until at
    /// least one arrives or the timeout passes.
    pub async fn receive_signals(&self, sources: &[TaskID], timeout_ms: Option<u64>) -> CoreResult<Vec<(TaskID, Signal)>> {
        self.check_connected()?;
        Ok(self
            .signals
            .receive(
                self.cluster.objects(),
                &self.worker.node_id(),
                sources,
                Deadline::from_timeout_ms(timeout_ms),
            )
            .await?)
    }

    pub fn forget_signals(&self, sources: &[TaskID]) {
        self.signals.forget(self.cluster.signals(), sources);
    }

    pub fn reset_signals(&self) {
        self.signals.reset();
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        self.disconnect();
    }
}
