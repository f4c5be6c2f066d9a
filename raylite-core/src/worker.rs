// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker runtime.
//!
//! A worker is a tokio task bound to one node, fed task assignments through
//! a mailbox. For each task it fetches the arguments through the object
//! plane, runs the user code on the blocking pool, stores the outputs in
//! its node's store and reports completion to the scheduler. A panic in
//! user code takes the whole worker down, the way a crashed worker process
//! would; the tasks it held are then lost and go through reconstruction.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use raylite_common::id::{NodeID, ObjectID, TaskID, WorkerID};
use raylite_common::{ObjectError, RayTaskError};
use raylite_object_store::RayObject;
use raylite_scheduler::{TaskArg, TaskAssignment, TaskKind, TaskSpec};
use raylite_util::time::Deadline;
use tokio::sync::{mpsc, watch};

use crate::cluster::Cluster;
use crate::error::{CoreError, CoreResult};
use crate::function_manager::{ActorInstance, FunctionRegistry};
use crate::signal::Signal;

/// What user code sees of the task it is running.
pub struct TaskContext {
    task_id: TaskID,
    attempt: u32,
    node_id: NodeID,
    worker_id: WorkerID,
    signal_source: TaskID,
    cluster: Weak<Cluster>,
}

impl TaskContext {
    pub fn task_id(&self) -> TaskID {
        self.task_id
    }

    /// 0 for the first execution, N for the Nth re-execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn node_id(&self) -> NodeID {
        self.node_id
    }

    pub fn worker_id(&self) -> WorkerID {
        self.worker_id
    }

    /// Source ID receivers use to read this task's signals. Every method of
    /// an actor shares the actor's source.
    pub fn signal_source(&self) -> TaskID {
        self.signal_source
    }

    pub fn send_signal(&self, signal: &Signal) -> CoreResult<ObjectID> {
        let cluster = self.cluster.upgrade().ok_or(CoreError::NotConnected)?;
        Ok(cluster
            .signals()
            .send(cluster.objects(), &self.node_id, &self.signal_source, signal)?)
    }

    /// A caller asked for this task to stop. Cooperative; the task may
    /// ignore it.
    pub fn is_cancel_requested(&self) -> bool {
        self.cluster
            .upgrade()
            .is_some_and(|cluster| cluster.task_manager().is_cancel_requested(&self.task_id))
    }
}

/// Cluster-side handle of a running worker.
pub struct WorkerHandle {
    worker_id: WorkerID,
    node_id: NodeID,
    mailbox: mpsc::UnboundedSender<TaskAssignment>,
    kill: watch::Sender<bool>,
}

impl WorkerHandle {
    pub fn spawn(cluster: Weak<Cluster>, worker_id: WorkerID, node_id: NodeID, runtime: &tokio::runtime::Handle) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (kill, killed) = watch::channel(false);
        let worker = Arc::new(Worker {
            worker_id,
            node_id,
            cluster,
            actor: RwLock::new(None),
            killed,
        });
        runtime.spawn(worker.run(inbox));
        tracing::debug!(worker_id = %worker_id, node_id = %node_id, "worker started");
        Self {
            worker_id,
            node_id,
            mailbox,
            kill,
        }
    }

    pub fn worker_id(&self) -> WorkerID {
        self.worker_id
    }

    pub fn node_id(&self) -> NodeID {
        self.node_id
    }

    /// False if the worker is gone.
    pub fn send(&self, assignment: TaskAssignment) -> bool {
        self.mailbox.send(assignment).is_ok()
    }

    /// Stop the worker. A task in flight is abandoned without reporting.
    pub fn kill(&self) {
        let _ = self.kill.send(true);
    }
}

enum Outcome {
    Returned(Vec<Bytes>),
    Failed(ObjectError),
    Crashed(String),
}

struct Worker {
    worker_id: WorkerID,
    node_id: NodeID,
    cluster: Weak<Cluster>,
    actor: RwLock<Option<Arc<dyn ActorInstance>>>,
    killed: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<TaskAssignment>) {
        let mut killed = self.killed.clone();
        loop {
            let assignment = tokio::select! {
                _ = killed.wait_for(|k| *k) => break,
                next = inbox.recv() => match next {
                    Some(assignment) => assignment,
                    None => break,
                },
            };
            if assignment.spec.is_actor_method() {
                // Concurrency across methods is bounded by the scheduler.
                let worker = self.clone();
                tokio::spawn(async move { worker.execute(assignment).await });
            } else {
                self.execute(assignment).await;
            }
        }
        tracing::debug!(worker_id = %self.worker_id, "worker exited");
    }

    async fn execute(self: &Arc<Self>, assignment: TaskAssignment) {
        let Some(cluster) = self.cluster.upgrade() else {
            return;
        };
        let spec = assignment.spec;
        let task_id = spec.task_id;
        if !cluster.scheduler().task_started(&task_id) {
            tracing::debug!(task_id = %task_id, "skipping task withdrawn before it started");
            return;
        }

        let mut killed = self.killed.clone();
        let mut pinned = Vec::new();
        let args = tokio::select! {
            _ = killed.wait_for(|k| *k) => return,
            args = self.resolve_args(&cluster, &spec, &mut pinned) => args,
        };

        let outcome = match args {
            Err(err) => Outcome::Failed(err),
            Ok(args) => {
                let ctx = TaskContext {
                    task_id,
                    attempt: assignment.attempt,
                    node_id: self.node_id,
                    worker_id: self.worker_id,
                    signal_source: signal_source(&spec),
                    cluster: self.cluster.clone(),
                };
                let worker = self.clone();
                let functions = cluster.functions().clone();
                let job_spec = spec.clone();
                let job = tokio::task::spawn_blocking(move || {
                    let result = worker.invoke(&functions, &ctx, &job_spec, args);
                    worker.check_returns(&job_spec, result)
                });
                tokio::select! {
                    _ = killed.wait_for(|k| *k) => return,
                    joined = job => match joined {
                        Ok(Ok(values)) => Outcome::Returned(values),
                        Ok(Err(err)) => Outcome::Failed(ObjectError::from(self.task_error(&spec, &err))),
                        Err(e) if e.is_panic() => Outcome::Crashed(panic_message(e.into_panic())),
                        Err(_) => return,
                    },
                }
            }
        };

        if let Some(store) = cluster.objects().store(&self.node_id) {
            for object_id in &pinned {
                let _ = store.unpin(object_id);
            }
        }

        let succeeded = match outcome {
            Outcome::Crashed(message) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    task_id = %task_id,
                    panic = %message,
                    "worker crashed while running a task"
                );
                cluster.handle_worker_died(&self.worker_id);
                return;
            }
            Outcome::Returned(values) => {
                self.store_returns(&cluster, &spec, Ok(values));
                true
            }
            Outcome::Failed(err) => {
                tracing::debug!(task_id = %task_id, error = %err, "task failed");
                self.store_returns(&cluster, &spec, Err(err.clone()));
                if let Err(e) = cluster.signals().send(
                    cluster.objects(),
                    &self.node_id,
                    &signal_source(&spec),
                    &Signal::Error(err.to_string()),
                ) {
                    tracing::warn!(task_id = %task_id, error = %e, "could not send error signal");
                }
                false
            }
        };
        cluster.scheduler().task_finished(&task_id, succeeded);
        cluster.task_manager().task_completed(&task_id);
    }

    /// Fetch every argument into the local store and pin it for the
    /// duration of the task. The first failed argument fails the task.
    async fn resolve_args(
        &self,
        cluster: &Cluster,
        spec: &TaskSpec,
        pinned: &mut Vec<ObjectID>,
    ) -> Result<Vec<Bytes>, ObjectError> {
        let mut values = Vec::with_capacity(spec.args.len());
        for arg in &spec.args {
            match arg {
                TaskArg::Value(data) => values.push(data.clone()),
                TaskArg::ObjectRef(object_id) => {
                    let object = cluster
                        .objects()
                        .get(&self.node_id, object_id, Deadline::never())
                        .await?;
                    if let Some(store) = cluster.objects().store(&self.node_id) {
                        if store.pin(object_id).is_ok() {
                            pinned.push(*object_id);
                        }
                    }
                    values.push(object.into_result()?);
                }
            }
        }
        Ok(values)
    }

    fn invoke(
        &self,
        functions: &FunctionRegistry,
        ctx: &TaskContext,
        spec: &TaskSpec,
        args: Vec<Bytes>,
    ) -> anyhow::Result<Vec<Bytes>> {
        match &spec.kind {
            TaskKind::RemoteFunctionCall { function } => {
                let function = functions.function(function)?;
                function(ctx, args)
            }
            TaskKind::ActorCreation { actor_id, class_name, .. } => {
                let factory = functions.actor_class(class_name)?;
                let instance = factory(ctx, args)?;
                *self.actor.write() = Some(Arc::from(instance));
                Ok(vec![Bytes::from(actor_id.hex())])
            }
            TaskKind::ActorMethodCall { method, .. } => {
                let actor = self
                    .actor
                    .read()
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("no actor instance lives on this worker"))?;
                actor.call(ctx, method, args)
            }
        }
    }

    fn check_returns(&self, spec: &TaskSpec, result: anyhow::Result<Vec<Bytes>>) -> anyhow::Result<Vec<Bytes>> {
        let values = result?;
        let expected = if spec.is_actor_creation() { 1 } else { spec.num_returns as usize };
        if values.len() != expected {
            anyhow::bail!("{} returned {} values, expected {expected}", spec.function_name(), values.len());
        }
        Ok(values)
    }

    fn task_error(&self, spec: &TaskSpec, err: &anyhow::Error) -> RayTaskError {
        let traceback = err
            .chain()
            .skip(1)
            .map(|cause| format!("  caused by: {cause}"))
            .collect::<Vec<_>>()
            .join("\n");
        RayTaskError {
            function_name: spec.function_name(),
            task_id: spec.task_id,
            pid: raylite_util::process::get_pid(),
            hostname: raylite_util::process::hostname(),
            node_id: self.node_id,
            worker_id: self.worker_id,
            message: err.to_string(),
            traceback,
        }
    }

    fn store_returns(&self, cluster: &Cluster, spec: &TaskSpec, result: Result<Vec<Bytes>, ObjectError>) {
        let return_ids = match spec.return_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(task_id = %spec.task_id, error = %e, "cannot derive return ids");
                return;
            }
        };
        for (index, object_id) in return_ids.into_iter().enumerate() {
            let object = match &result {
                Ok(values) => RayObject::new(values[index].clone()),
                Err(err) => RayObject::from_error(err.clone()),
            };
            match cluster.objects().put(&self.node_id, object_id, object, false) {
                Ok(_) => {}
                Err(e) if e.is_object_store_full() => {
                    tracing::warn!(object_id = %object_id, error = %e, "store full, storing the failure instead");
                    let failure = RayObject::from_error(ObjectError::ObjectStoreFull(e.message));
                    if let Err(e) = cluster.objects().put(&self.node_id, object_id, failure, false) {
                        tracing::error!(object_id = %object_id, error = %e, "could not store task output");
                    }
                }
                Err(e) => tracing::warn!(object_id = %object_id, error = %e, "could not store task output"),
            }
        }
    }
}

fn signal_source(spec: &TaskSpec) -> TaskID {
    match spec.actor_id() {
        Some(actor_id) => TaskID::for_actor_creation_task(&actor_id),
        None => spec.task_id,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
