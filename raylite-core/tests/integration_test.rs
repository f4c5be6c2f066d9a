// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end scenarios against a local simulated cluster.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use raylite_common::id::{NodeID, ObjectID};
use raylite_common::scheduling::ResourceSet;
use raylite_common::{ObjectError, UnreconstructableReason};
use raylite_core::{
    ActorInstance, ActorOptions, Cluster, ClusterContext, CoreError, NodeSpec, Signal, TaskContext, TaskOptions,
};
use raylite_observability::domain_events;
use raylite_scheduler::{TaskArg, TaskState};
use raylite_test_utils::{init_test_logging, wait_for_condition, TestClusterBuilder};

fn int(value: i64) -> Bytes {
    Bytes::from(serde_json::to_vec(&value).unwrap())
}

fn parse(data: &[u8]) -> i64 {
    serde_json::from_slice(data).unwrap()
}

async fn get_int(ctx: &ClusterContext, object_id: &ObjectID) -> i64 {
    parse(&ctx.get_one(object_id, Some(5_000)).await.unwrap())
}

async fn get_err(ctx: &ClusterContext, object_id: &ObjectID) -> ObjectError {
    match ctx.get(&[*object_id], Some(5_000)).await.unwrap().remove(0) {
        Ok(data) => panic!("expected a failure, got {} bytes", data.len()),
        Err(err) => err,
    }
}

/// Blocks until cancellation is requested or `max` elapses.
fn block_until_cancelled(ctx: &TaskContext, max: Duration) {
    let start = std::time::Instant::now();
    while !ctx.is_cancel_requested() && start.elapsed() < max {
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn register_basics(ctx: &ClusterContext) {
    ctx.register_function("add", |_, args| Ok(vec![int(args.iter().map(|a| parse(a)).sum())]));
    ctx.register_function("sleep_ms", |_, args| {
        let ms = parse(&args[0]);
        std::thread::sleep(Duration::from_millis(ms as u64));
        Ok(vec![int(ms)])
    });
    ctx.register_function("until_cancelled", |ctx, _| {
        block_until_cancelled(ctx, Duration::from_secs(10));
        Ok(vec![int(0)])
    });
    ctx.register_function("whereami", |ctx, _| Ok(vec![Bytes::from(ctx.node_id().hex())]));
}

struct Counter {
    value: AtomicI64,
}

impl ActorInstance for Counter {
    fn call(&self, ctx: &TaskContext, method: &str, args: Vec<Bytes>) -> anyhow::Result<Vec<Bytes>> {
        match method {
            "add" => Ok(vec![int(self.value.fetch_add(parse(&args[0]), Ordering::SeqCst) + parse(&args[0]))]),
            "get" => Ok(vec![int(self.value.load(Ordering::SeqCst))]),
            "emit" => {
                for i in 0..parse(&args[0]) {
                    ctx.send_signal(&Signal::User(serde_json::json!(i)))?;
                }
                ctx.send_signal(&Signal::Done)?;
                Ok(vec![int(0)])
            }
            other => anyhow::bail!("no method {other}"),
        }
    }
}

fn register_counter(ctx: &ClusterContext) {
    ctx.register_actor_class("Counter", |_, args| {
        let start = args.first().map(|a| parse(a)).unwrap_or(0);
        if start < 0 {
            anyhow::bail!("counter cannot start below zero");
        }
        Ok(Box::new(Counter {
            value: AtomicI64::new(start),
        }) as Box<dyn ActorInstance>)
    });
}

#[tokio::test]
async fn test_put_get_round_trip() {
    init_test_logging();
    let cluster = TestClusterBuilder::new().node(2.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    let object_ref = ctx.put(&b"hello"[..]).unwrap();
    let results = ctx.get(&[object_ref.object_id()], Some(1_000)).await.unwrap();
    assert_eq!(results, vec![Ok(Bytes::from_static(b"hello"))]);
    assert_eq!(object_ref.resolve().await.unwrap(), Bytes::from_static(b"hello"));
}

#[tokio::test]
async fn test_get_times_out_on_pending_object() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);
    let pending = ctx
        .submit_task("until_cancelled", vec![], TaskOptions::default())
        .unwrap()
        .remove(0);
    let results = ctx.get(&[pending.object_id()], Some(50)).await.unwrap();
    assert!(matches!(results[0], Err(ObjectError::TimedOut { .. })));
    assert!(ctx.cancel(&pending.object_id(), false).unwrap());
}

#[tokio::test]
async fn test_immutable_across_nodes() {
    let cluster = TestClusterBuilder::new().node(1.0).node(1.0).build().unwrap();
    let nodes = cluster.node_ids();
    let writer = ClusterContext::connect_on(&cluster, nodes[0]).unwrap();
    let reader = ClusterContext::connect_on(&cluster, nodes[1]).unwrap();
    let object_ref = writer.put(vec![7u8; 64]).unwrap();

    let first = reader.get_one(&object_ref.object_id(), Some(1_000)).await.unwrap();
    let second = reader.get_one(&object_ref.object_id(), Some(1_000)).await.unwrap();
    let local = writer.get_one(&object_ref.object_id(), Some(1_000)).await.unwrap();
    assert_eq!(first, local);
    assert_eq!(second, local);
    let mut locations = object_ref_locations(&cluster, &object_ref.object_id());
    locations.sort();
    let mut expected = nodes.clone();
    expected.sort();
    assert_eq!(locations, expected);
}

fn object_ref_locations(cluster: &Cluster, object_id: &ObjectID) -> Vec<NodeID> {
    cluster.objects().locations(object_id)
}

#[tokio::test]
async fn test_dependent_task_runs_after_its_dependency() {
    let cluster = TestClusterBuilder::new().node(4.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    ctx.register_function("source", move |_, _| {
        std::thread::sleep(Duration::from_millis(100));
        o.lock().push("source done");
        Ok(vec![int(20)])
    });
    let o = order.clone();
    ctx.register_function("consumer", move |_, args| {
        o.lock().push("consumer started");
        Ok(vec![int(parse(&args[0]) + 1)])
    });

    let source = ctx.submit_task("source", vec![], TaskOptions::default()).unwrap().remove(0);
    let consumer = ctx
        .submit_task("consumer", vec![TaskArg::from(&source)], TaskOptions::default())
        .unwrap()
        .remove(0);
    assert_eq!(
        cluster.scheduler().task_state(&consumer.task_id()),
        Some(TaskState::Waiting)
    );
    assert_eq!(get_int(&ctx, &consumer.object_id()).await, 21);
    assert_eq!(*order.lock(), vec!["source done", "consumer started"]);
}

#[tokio::test]
async fn test_gpu_task_lands_on_gpu_node() {
    let cluster = TestClusterBuilder::new()
        .node_with(&[("CPU", 4.0)])
        .node_with(&[("CPU", 4.0), ("GPU", 1.0)])
        .build()
        .unwrap();
    let gpu_node = cluster
        .nodes()
        .into_iter()
        .find(|n| n.resources.get("GPU").is_positive())
        .unwrap()
        .node_id;
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);

    for _ in 0..3 {
        let placed = ctx
            .submit_task(
                "whereami",
                vec![],
                TaskOptions::default().resources(ResourceSet::from_pairs([("GPU", 1.0)])),
            )
            .unwrap()
            .remove(0);
        let node = ctx.get_one(&placed.object_id(), Some(5_000)).await.unwrap();
        assert_eq!(node, Bytes::from(gpu_node.hex()));
    }
}

#[tokio::test]
async fn test_crashing_task_is_retried_then_unreconstructable() {
    init_test_logging();
    let (cluster, events) = TestClusterBuilder::new().node(2.0).build_with_events().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    ctx.register_function("crash", move |_, _| {
        r.fetch_add(1, Ordering::SeqCst);
        panic!("worker process died");
    });

    let out = ctx
        .submit_task("crash", vec![], TaskOptions::default().max_retries(3))
        .unwrap()
        .remove(0);
    let err = get_err(&ctx, &out.object_id()).await;
    assert_eq!(
        err,
        ObjectError::Unreconstructable {
            object_id: out.object_id(),
            reason: UnreconstructableReason::RetriesExhausted { attempts: 3 },
        }
    );
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(events.with_label(domain_events::TASK_RESUBMITTED).len(), 3);
    assert_eq!(events.with_label(domain_events::WORKER_DIED).len(), 4);

    // Cached: a second get fails fast with the same error.
    assert_eq!(get_err(&ctx, &out.object_id()).await, err);
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_user_error_is_not_retried_and_propagates() {
    let cluster = TestClusterBuilder::new().node(2.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    ctx.register_function("fails", move |_, _| {
        r.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("disk quota").context("boom"))
    });

    let failed = ctx.submit_task("fails", vec![], TaskOptions::default()).unwrap().remove(0);
    let downstream = ctx
        .submit_task("add", vec![TaskArg::from(&failed)], TaskOptions::default())
        .unwrap()
        .remove(0);

    let ObjectError::TaskError(task_error) = get_err(&ctx, &failed.object_id()).await else {
        panic!("expected a task error");
    };
    assert_eq!(task_error.function_name, "fails");
    assert_eq!(task_error.message, "boom");
    assert!(task_error.traceback.contains("disk quota"));
    assert_eq!(task_error.task_id, failed.task_id());

    let ObjectError::TaskError(propagated) = get_err(&ctx, &downstream.object_id()).await else {
        panic!("expected the upstream task error");
    };
    assert_eq!(propagated.function_name, "fails");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wait_returns_ready_in_completion_order() {
    let cluster = TestClusterBuilder::new().node(4.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);

    let a = ctx
        .submit_task("sleep_ms", vec![TaskArg::Value(int(300))], TaskOptions::default())
        .unwrap()
        .remove(0);
    let b = ctx
        .submit_task("sleep_ms", vec![TaskArg::Value(int(10))], TaskOptions::default())
        .unwrap()
        .remove(0);
    let c = ctx
        .submit_task("until_cancelled", vec![], TaskOptions::default())
        .unwrap()
        .remove(0);

    let ids = [a.object_id(), b.object_id(), c.object_id()];
    let result = ctx.wait(&ids, 2, Some(3_000)).await.unwrap();
    assert_eq!(result.ready, vec![b.object_id(), a.object_id()]);
    assert_eq!(result.pending, vec![c.object_id()]);

    let partial = ctx.wait(&ids, 3, Some(50)).await.unwrap();
    assert_eq!(partial.ready, vec![a.object_id(), b.object_id()]);
    assert_eq!(partial.pending, vec![c.object_id()]);

    assert!(matches!(
        ctx.wait(&ids, 4, None).await,
        Err(CoreError::InvalidArgument(_))
    ));
    ctx.cancel(&c.object_id(), false).unwrap();
}

#[tokio::test]
async fn test_cancel_pending_task_propagates_to_dependents() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);

    let blocker = ctx
        .submit_task("until_cancelled", vec![], TaskOptions::default())
        .unwrap()
        .remove(0);
    let scheduler = cluster.scheduler().clone();
    let blocker_task = blocker.task_id();
    assert!(wait_for_condition(|| scheduler.task_state(&blocker_task) == Some(TaskState::Running), 2_000).await);

    let victim = ctx
        .submit_task("sleep_ms", vec![TaskArg::Value(int(1))], TaskOptions::default())
        .unwrap()
        .remove(0);
    let dependent = ctx
        .submit_task("add", vec![TaskArg::from(&victim)], TaskOptions::default())
        .unwrap()
        .remove(0);

    assert!(ctx.cancel(&victim.object_id(), false).unwrap());
    assert_eq!(
        get_err(&ctx, &victim.object_id()).await,
        ObjectError::Cancelled {
            task_id: victim.task_id()
        }
    );

    // Free the only CPU so the dependent can run and observe the cancellation.
    assert!(ctx.cancel(&blocker.object_id(), false).unwrap());
    assert_eq!(get_int(&ctx, &blocker.object_id()).await, 0);
    assert_eq!(
        get_err(&ctx, &dependent.object_id()).await,
        ObjectError::Cancelled {
            task_id: victim.task_id()
        }
    );
    assert!(!ctx.cancel(&blocker.object_id(), false).unwrap());
    assert!(matches!(
        ctx.cancel(&ctx.put(&b"x"[..]).unwrap().object_id(), false),
        Err(CoreError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_force_cancel_kills_running_task() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);
    let running = ctx
        .submit_task("until_cancelled", vec![], TaskOptions::default())
        .unwrap()
        .remove(0);
    let scheduler = cluster.scheduler().clone();
    let task_id = running.task_id();
    assert!(wait_for_condition(|| scheduler.task_state(&task_id) == Some(TaskState::Running), 2_000).await);

    assert!(ctx.cancel(&running.object_id(), true).unwrap());
    assert_eq!(
        get_err(&ctx, &running.object_id()).await,
        ObjectError::Cancelled { task_id }
    );
    // The CPU is free again.
    let next = ctx
        .submit_task("sleep_ms", vec![TaskArg::Value(int(1))], TaskOptions::default())
        .unwrap()
        .remove(0);
    assert_eq!(get_int(&ctx, &next.object_id()).await, 1);
}

#[tokio::test]
async fn test_referenced_objects_are_never_evicted() {
    let cluster = TestClusterBuilder::new()
        .node_spec(NodeSpec::with_cpus(1.0).with_object_store_memory(1_000))
        .build()
        .unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    let a = ctx.put(vec![1u8; 400]).unwrap();
    let b = ctx.put(vec![2u8; 400]).unwrap();

    match ctx.put(vec![3u8; 400]) {
        Err(CoreError::RayStatus(e)) => assert!(e.is_object_store_full()),
        other => panic!("expected a full store, got {other:?}"),
    }
    assert_eq!(ctx.get_one(&a.object_id(), Some(100)).await.unwrap().len(), 400);
    assert_eq!(ctx.get_one(&b.object_id(), Some(100)).await.unwrap().len(), 400);

    // Dropping a reference frees the space.
    drop(a);
    let c = ctx.put(vec![3u8; 400]).unwrap();
    assert_eq!(ctx.get_one(&c.object_id(), Some(100)).await.unwrap()[0], 3);
    let store = cluster.objects().store(&ctx.node_id()).unwrap();
    assert_eq!(store.stats().num_evictions, 0);
}

#[tokio::test]
async fn test_concurrent_ref_handling_converges() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    let object_ref = ctx.put(&b"shared"[..]).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let local = object_ref.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..100 {
                let extra = local.clone();
                tokio::task::yield_now().await;
                drop(extra);
            }
            local
        }));
    }
    let mut kept = Vec::new();
    for handle in handles {
        kept.push(handle.await.unwrap());
    }
    let counts = cluster.owners().counts(&object_ref.object_id()).unwrap();
    assert_eq!(counts.local, 9);
    drop(kept);
    assert_eq!(cluster.owners().counts(&object_ref.object_id()).unwrap().local, 1);
    drop(object_ref);
    assert!(cluster.objects().store(&ctx.node_id()).unwrap().object_ids().is_empty());
}

#[tokio::test]
async fn test_nested_refs_live_as_long_as_their_container() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    let inner = ctx.put(&b"inner"[..]).unwrap();
    let inner_id = inner.object_id();
    let outer = ctx.put_with_refs(&b"outer"[..], &[&inner]).unwrap();
    drop(inner);
    assert_eq!(ctx.get_one(&inner_id, Some(100)).await.unwrap(), Bytes::from_static(b"inner"));
    drop(outer);
    assert!(!cluster.objects().store(&ctx.node_id()).unwrap().contains(&inner_id));

    let other = ClusterContext::connect(&cluster).unwrap();
    let foreign = other.put(&b"foreign"[..]).unwrap();
    assert!(matches!(
        ctx.put_with_refs(&b"x"[..], &[&foreign]),
        Err(CoreError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_borrow_keeps_object_alive_until_released() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let owner = ClusterContext::connect(&cluster).unwrap();
    let borrower = ClusterContext::connect(&cluster).unwrap();
    let object_ref = owner.put(&b"lent"[..]).unwrap();
    let object_id = object_ref.object_id();
    let borrowed = borrower.borrow(&object_ref).unwrap();
    assert!(borrowed.is_borrowed());

    drop(object_ref);
    assert_eq!(borrowed.resolve().await.unwrap(), Bytes::from_static(b"lent"));
    let copy = borrowed.clone();
    drop(borrowed);
    assert!(cluster.objects().store(&owner.node_id()).unwrap().contains(&object_id));
    drop(copy);
    assert!(!cluster.objects().store(&owner.node_id()).unwrap().contains(&object_id));
}

#[tokio::test]
async fn test_owner_death_fails_borrowers() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let owner = ClusterContext::connect(&cluster).unwrap();
    let borrower = ClusterContext::connect(&cluster).unwrap();
    let object_ref = owner.put(&b"gone soon"[..]).unwrap();
    let borrowed = borrower.borrow(&object_ref).unwrap();

    owner.disconnect();
    let expected = ObjectError::OwnerDied {
        object_id: borrowed.object_id(),
    };
    assert_eq!(get_err(&borrower, &borrowed.object_id()).await, expected);
    assert_eq!(borrowed.resolve().await, Err(expected));
    assert!(matches!(owner.put(&b"x"[..]), Err(CoreError::NotConnected)));
}

#[tokio::test]
async fn test_lost_task_output_is_reconstructed() {
    let cluster = TestClusterBuilder::new()
        .node_with(&[("memory", 1.0)])
        .node(1.0)
        .build()
        .unwrap();
    let driver_node = cluster
        .nodes()
        .into_iter()
        .find(|n| n.resources.get("CPU").is_zero())
        .unwrap()
        .node_id;
    let ctx = ClusterContext::connect_on(&cluster, driver_node).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    ctx.register_function("produce", move |ctx, _| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Bytes::from(ctx.node_id().hex())])
    });

    let out = ctx.submit_task("produce", vec![], TaskOptions::default()).unwrap().remove(0);
    let scheduler = cluster.scheduler().clone();
    let task_id = out.task_id();
    assert!(wait_for_condition(|| scheduler.task_state(&task_id) == Some(TaskState::Done), 2_000).await);
    let first_node = cluster.objects().locations(&out.object_id())[0];
    assert_ne!(first_node, driver_node);

    assert!(cluster.remove_node(&first_node, "test"));
    let replacement = cluster.add_node(NodeSpec::with_cpus(1.0));
    let value = ctx.get_one(&out.object_id(), Some(5_000)).await.unwrap();
    assert_eq!(value, Bytes::from(replacement.hex()));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.task_manager().attempts(&task_id), Some(1));
}

#[tokio::test]
async fn test_lost_output_is_rebuilt_through_a_freed_intermediate() {
    let cluster = TestClusterBuilder::new()
        .node_with(&[("memory", 1.0)])
        .node(1.0)
        .build()
        .unwrap();
    let driver_node = cluster
        .nodes()
        .into_iter()
        .find(|n| n.resources.get("CPU").is_zero())
        .unwrap()
        .node_id;
    let ctx = ClusterContext::connect_on(&cluster, driver_node).unwrap();
    register_basics(&ctx);
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    ctx.register_function("one", move |_, _| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(vec![int(1)])
    });

    let first = ctx.submit_task("one", vec![], TaskOptions::default()).unwrap().remove(0);
    let first_id = first.object_id();
    let first_task = first.task_id();
    let second = ctx
        .submit_task("add", vec![TaskArg::from(&first), TaskArg::Value(int(3))], TaskOptions::default())
        .unwrap()
        .remove(0);
    let second_task = second.task_id();
    drop(first);

    let scheduler = cluster.scheduler().clone();
    assert!(wait_for_condition(|| scheduler.task_state(&second_task) == Some(TaskState::Done), 2_000).await);
    let objects = cluster.objects().clone();
    assert!(wait_for_condition(|| objects.locations(&first_id).is_empty(), 2_000).await);
    assert!(cluster.task_manager().has_lineage(&first_task));
    assert_eq!(cluster.task_manager().lineage_refs(&first_task), Some(1));
    assert_eq!(scheduler.task_state(&first_task), Some(TaskState::Done));

    let holder = cluster.objects().locations(&second.object_id())[0];
    assert_ne!(holder, driver_node);
    assert!(cluster.remove_node(&holder, "test"));
    cluster.add_node(NodeSpec::with_cpus(1.0));
    assert_eq!(get_int(&ctx, &second.object_id()).await, 4);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.task_manager().attempts(&second_task), Some(1));
    assert_eq!(cluster.task_manager().attempts(&first_task), Some(1));

    // Dropping the last output releases the whole chain.
    drop(second);
    let tasks = cluster.clone();
    assert!(
        wait_for_condition(
            || !tasks.task_manager().has_lineage(&second_task) && !tasks.task_manager().has_lineage(&first_task),
            2_000
        )
        .await
    );
    assert!(cluster.scheduler().task_state(&first_task).is_none());
}

#[tokio::test]
async fn test_lost_put_is_unreconstructable() {
    let cluster = TestClusterBuilder::new().node(1.0).node(1.0).build().unwrap();
    let nodes = cluster.node_ids();
    let writer = ClusterContext::connect_on(&cluster, nodes[1]).unwrap();
    let reader = ClusterContext::connect_on(&cluster, nodes[0]).unwrap();
    let object_ref = writer.put(&b"only copy"[..]).unwrap();

    cluster.remove_node(&nodes[1], "test");
    assert_eq!(
        get_err(&reader, &object_ref.object_id()).await,
        ObjectError::Unreconstructable {
            object_id: object_ref.object_id(),
            reason: UnreconstructableReason::NoLineage,
        }
    );
}

#[tokio::test]
async fn test_partitioned_node_is_declared_dead_and_work_moves() {
    let (cluster, events) = TestClusterBuilder::new()
        .node_with(&[("memory", 1.0)])
        .node(1.0)
        .node(1.0)
        .config(|c| c.health_check_failure_threshold = 3)
        .build_with_events()
        .unwrap();
    let driver_node = cluster
        .nodes()
        .into_iter()
        .find(|n| n.resources.get("CPU").is_zero())
        .unwrap()
        .node_id;
    let ctx = ClusterContext::connect_on(&cluster, driver_node).unwrap();
    ctx.register_function("slow_whereami", |ctx, _| {
        std::thread::sleep(Duration::from_millis(200));
        Ok(vec![Bytes::from(ctx.node_id().hex())])
    });
    let out = ctx.submit_task("slow_whereami", vec![], TaskOptions::default()).unwrap().remove(0);
    let scheduler = cluster.scheduler().clone();
    let task_id = out.task_id();
    assert!(wait_for_condition(|| scheduler.task_state(&task_id) == Some(TaskState::Running), 2_000).await);
    let doomed = scheduler.task_record(&task_id).unwrap().node_id.unwrap();

    cluster.partition_node(&doomed, true);
    assert!(cluster.health().tick().is_empty());
    assert!(cluster.health().tick().is_empty());
    assert_eq!(cluster.health().missed_heartbeats(&doomed), 2);
    assert_eq!(cluster.health().tick(), vec![doomed]);
    assert!(!cluster.is_node_alive(&doomed));
    assert_eq!(events.with_label(domain_events::NODE_REMOVED).len(), 1);

    let survivor = cluster
        .node_ids()
        .into_iter()
        .find(|id| *id != driver_node)
        .unwrap();
    let value = ctx.get_one(&out.object_id(), Some(5_000)).await.unwrap();
    assert_eq!(value, Bytes::from(survivor.hex()));
    assert_eq!(cluster.task_manager().attempts(&task_id), Some(1));
}

#[tokio::test]
async fn test_actor_methods_share_state() {
    let cluster = TestClusterBuilder::new().node(2.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_counter(&ctx);
    let counter = ctx
        .create_actor("Counter", vec![TaskArg::Value(int(10))], ActorOptions::default())
        .unwrap();
    for delta in 1..=3 {
        ctx.call_actor(&counter, "add", vec![TaskArg::Value(int(delta))], 1).unwrap();
    }
    let total = ctx.call_actor(&counter, "get", vec![], 1).unwrap().remove(0);
    assert_eq!(get_int(&ctx, &total.object_id()).await, 16);
    counter.ready().await.unwrap();

    assert!(ctx.kill_actor(&counter).unwrap());
    let after = ctx.call_actor(&counter, "get", vec![], 1).unwrap().remove(0);
    assert!(matches!(
        get_err(&ctx, &after.object_id()).await,
        ObjectError::Unreconstructable {
            reason: UnreconstructableReason::ActorTask,
            ..
        }
    ));
}

#[tokio::test]
async fn test_failed_constructor_fails_method_calls() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_counter(&ctx);
    let broken = ctx
        .create_actor("Counter", vec![TaskArg::Value(int(-1))], ActorOptions::default())
        .unwrap();
    let call = ctx.call_actor(&broken, "get", vec![], 1).unwrap().remove(0);

    let Err(ObjectError::TaskError(ctor_error)) = broken.ready().await else {
        panic!("constructor should have failed");
    };
    assert_eq!(ctor_error.function_name, "Counter.__init__");
    let ObjectError::TaskError(call_error) = get_err(&ctx, &call.object_id()).await else {
        panic!("the call should surface the constructor's error");
    };
    assert_eq!(call_error.task_id, broken.creation_task_id());
}

#[tokio::test]
async fn test_signals_from_actor_and_driver() {
    let cluster = TestClusterBuilder::new().node(2.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_counter(&ctx);
    let emitter = ctx.create_actor("Counter", vec![], ActorOptions::default()).unwrap();
    let done = ctx
        .call_actor(&emitter, "emit", vec![TaskArg::Value(int(3))], 1)
        .unwrap()
        .remove(0);
    get_int(&ctx, &done.object_id()).await;

    let source = emitter.signal_source();
    let received = ctx.receive_signals(&[source], Some(1_000)).await.unwrap();
    let signals: Vec<Signal> = received.into_iter().map(|(from, s)| {
        assert_eq!(from, source);
        s
    }).collect();
    assert_eq!(
        signals,
        vec![
            Signal::User(serde_json::json!(0)),
            Signal::User(serde_json::json!(1)),
            Signal::User(serde_json::json!(2)),
            Signal::Done,
        ]
    );
    assert!(ctx.receive_signals(&[source], Some(50)).await.unwrap().is_empty());

    let listener = ClusterContext::connect(&cluster).unwrap();
    ctx.send_signal(&Signal::User(serde_json::json!("first"))).unwrap();
    listener.forget_signals(&[ctx.current_task_id()]);
    ctx.send_signal(&Signal::User(serde_json::json!("second"))).unwrap();
    let heard = listener
        .receive_signals(&[ctx.current_task_id()], Some(1_000))
        .await
        .unwrap();
    assert_eq!(heard, vec![(ctx.current_task_id(), Signal::User(serde_json::json!("second")))]);

    listener.reset_signals();
    let replay = listener
        .receive_signals(&[ctx.current_task_id()], Some(1_000))
        .await
        .unwrap();
    assert_eq!(replay.len(), 2);
}

#[tokio::test]
async fn test_directory_outage_delays_readiness() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);

    cluster.set_directory_available(false);
    let out = ctx
        .submit_task("sleep_ms", vec![TaskArg::Value(int(1))], TaskOptions::default())
        .unwrap()
        .remove(0);
    let scheduler = cluster.scheduler().clone();
    let task_id = out.task_id();
    assert!(wait_for_condition(|| scheduler.task_state(&task_id) == Some(TaskState::Done), 2_000).await);
    let blocked = ctx.wait(&[out.object_id()], 1, Some(50)).await.unwrap();
    assert!(blocked.ready.is_empty());

    cluster.set_directory_available(true);
    let ready = ctx.wait(&[out.object_id()], 1, Some(2_000)).await.unwrap();
    assert_eq!(ready.ready, vec![out.object_id()]);
    assert_eq!(get_int(&ctx, &out.object_id()).await, 1);
}

#[tokio::test]
async fn test_unknown_function_is_rejected() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    assert!(matches!(
        ctx.submit_task("missing", vec![], TaskOptions::default()),
        Err(CoreError::UnknownFunction(_))
    ));
    assert!(matches!(
        ctx.create_actor("Missing", vec![], ActorOptions::default()),
        Err(CoreError::UnknownActorClass(_))
    ));
    assert_eq!(cluster.task_manager().num_lineage_entries(), 0);
}

#[tokio::test]
async fn test_lineage_released_when_outputs_are_dropped() {
    let cluster = TestClusterBuilder::new().node(1.0).build().unwrap();
    let ctx = ClusterContext::connect(&cluster).unwrap();
    register_basics(&ctx);
    let input = ctx.put(int(2)).unwrap();
    let input_id = input.object_id();
    let out = ctx
        .submit_task("add", vec![TaskArg::from(&input), TaskArg::Value(int(3))], TaskOptions::default())
        .unwrap()
        .remove(0);
    drop(input);
    assert_eq!(get_int(&ctx, &out.object_id()).await, 5);
    let task_id = out.task_id();
    assert!(cluster.task_manager().has_lineage(&task_id));

    // The argument goes once the task has finished with it.
    let store = cluster.objects().store(&ctx.node_id()).unwrap();
    assert!(wait_for_condition(|| !store.contains(&input_id), 2_000).await);

    drop(out);
    let tasks = cluster.clone();
    assert!(wait_for_condition(|| !tasks.task_manager().has_lineage(&task_id), 2_000).await);
    assert!(cluster.scheduler().task_state(&task_id).is_none());
}

#[tokio::test]
async fn test_cluster_events_are_written_to_the_log_dir() {
    let dir = raylite_test_utils::test_temp_dir();
    let log_dir = dir.path().join("events");
    let log_dir_str = log_dir.to_string_lossy().into_owned();
    let cluster = TestClusterBuilder::new()
        .node(1.0)
        .config(move |c| c.event_log_dir = log_dir_str)
        .build()
        .unwrap();
    let node_id = cluster.node_ids()[0];
    cluster.remove_node(&node_id, "test");

    let contents = std::fs::read_to_string(log_dir.join("events_CLUSTER.log")).unwrap();
    let lines: Vec<serde_json::Value> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    let labels: Vec<&str> = lines.iter().filter_map(|e| e["label"].as_str()).collect();
    assert_eq!(labels, vec![domain_events::NODE_ADDED, domain_events::NODE_REMOVED]);
}
