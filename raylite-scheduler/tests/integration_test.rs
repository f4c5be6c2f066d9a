// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Integration tests for placement and dependency-driven dispatch.

use std::sync::Arc;

use parking_lot::Mutex;

use raylite_common::id::{JobID, NodeID, ObjectID, TaskID};
use raylite_common::scheduling::ResourceSet;
use raylite_common::ObjectError;
use raylite_observability::domain_events::TASK_STATE_CHANGED;
use raylite_observability::MemoryEventSink;
use raylite_scheduler::{
    BestFitPolicy, ClusterResourceManager, TaskArg, TaskAssignment, TaskDispatcher, TaskScheduler, TaskSpec,
    TaskState, WorkerPool,
};

#[derive(Default)]
struct Recorder {
    assignments: Mutex<Vec<TaskAssignment>>,
}

impl TaskDispatcher for Recorder {
    fn dispatch(&self, assignment: TaskAssignment) {
        self.assignments.lock().push(assignment);
    }
    fn fail(&self, _spec: &TaskSpec, _error: ObjectError) {}
}

fn make_scheduler() -> (TaskScheduler, Arc<Recorder>, Arc<MemoryEventSink>) {
    let events = Arc::new(MemoryEventSink::new());
    let scheduler = TaskScheduler::new(
        Arc::new(ClusterResourceManager::new()),
        Arc::new(WorkerPool::new(8)),
        Box::new(BestFitPolicy),
        false,
        events.clone(),
    );
    let recorder = Arc::new(Recorder::default());
    scheduler.set_dispatcher(recorder.clone());
    (scheduler, recorder, events)
}

fn driver() -> TaskID {
    TaskID::for_driver_task(&JobID::from_int(11))
}

fn make_task(counter: u64, resources: &[(&str, f64)], args: Vec<TaskArg>) -> TaskSpec {
    let task_id = TaskID::derive(&driver(), counter, None).unwrap();
    TaskSpec::remote_function(task_id, driver(), "work", args, 1)
        .with_resources(ResourceSet::from_pairs(resources.iter().map(|(k, v)| (*k, *v))))
}

#[test]
fn test_gpu_task_bin_packed_onto_gpu_node() {
    let (scheduler, recorder, _) = make_scheduler();
    let cpu_node = NodeID::from_random();
    let gpu_node = NodeID::from_random();
    scheduler.node_added(cpu_node, ResourceSet::from_pairs([("CPU", 4.0)]));
    scheduler.node_added(gpu_node, ResourceSet::from_pairs([("CPU", 2.0), ("GPU", 1.0)]));

    scheduler.submit(make_task(1, &[("GPU", 1.0)], vec![]), |_| true).unwrap();
    scheduler.submit(make_task(2, &[("CPU", 1.0)], vec![]), |_| true).unwrap();
    scheduler.submit(make_task(3, &[("CPU", 3.0)], vec![]), |_| true).unwrap();

    let assignments = recorder.assignments.lock();
    assert_eq!(assignments[0].node_id, gpu_node);
    // Best fit packs the partly used node: its min term is 2 * 0.5^3 = 0.25,
    // against 4 * 0.25^3 = 0.0625 on the idle CPU node.
    assert_eq!(assignments[1].node_id, gpu_node);
    // Only the CPU node still has three CPUs free.
    assert_eq!(assignments[2].node_id, cpu_node);
}

#[test]
fn test_dependent_task_runs_after_producer() {
    let (scheduler, recorder, events) = make_scheduler();
    scheduler.node_added(NodeID::from_random(), ResourceSet::from_pairs([("CPU", 2.0)]));

    let producer = make_task(1, &[("CPU", 1.0)], vec![]);
    let output = producer.return_ids().unwrap()[0];
    let consumer = make_task(2, &[("CPU", 1.0)], vec![TaskArg::ObjectRef(output)]);
    let (producer_id, consumer_id) = (producer.task_id, consumer.task_id);

    let available: Arc<Mutex<Vec<ObjectID>>> = Arc::default();
    let resolved = |id: &ObjectID| available.lock().contains(id);
    scheduler.submit(producer, resolved).unwrap();
    scheduler.submit(consumer, resolved).unwrap();

    assert!(scheduler.task_started(&producer_id));
    assert!(!scheduler.task_started(&consumer_id));
    assert_eq!(scheduler.task_state(&consumer_id), Some(TaskState::Waiting));

    available.lock().push(output);
    scheduler.task_finished(&producer_id, true);
    scheduler.handle_object_available(&output);
    assert!(scheduler.task_started(&consumer_id));
    assert_eq!(recorder.assignments.lock().len(), 2);

    let transitions: Vec<String> = events
        .with_label(TASK_STATE_CHANGED)
        .iter()
        .filter(|e| e.field("task_id") == Some(consumer_id.hex().as_str()))
        .filter_map(|e| e.field("to").map(str::to_string))
        .collect();
    assert_eq!(transitions, vec!["SCHEDULED", "QUEUED", "RUNNING"]);
}

#[test]
fn test_node_loss_returns_lost_tasks() {
    let (scheduler, recorder, _) = make_scheduler();
    let node = NodeID::from_random();
    scheduler.node_added(node, ResourceSet::from_pairs([("CPU", 2.0)]));
    let first = make_task(1, &[("CPU", 1.0)], vec![]);
    let second = make_task(2, &[("CPU", 1.0)], vec![]);
    let (first_id, second_id) = (first.task_id, second.task_id);
    scheduler.submit(first, |_| true).unwrap();
    scheduler.submit(second, |_| true).unwrap();
    scheduler.task_started(&first_id);

    let mut lost: Vec<TaskID> = scheduler.node_removed(&node).iter().map(|s| s.task_id).collect();
    lost.sort();
    let mut expected = vec![first_id, second_id];
    expected.sort();
    assert_eq!(lost, expected);
    assert_eq!(scheduler.resources().num_nodes(), 0);
    assert_eq!(scheduler.workers().num_workers(&node), 0);

    // With a replacement node the re-executions are placed there.
    let replacement = NodeID::from_random();
    scheduler.node_added(replacement, ResourceSet::from_pairs([("CPU", 2.0)]));
    scheduler.resubmit(&first_id, |_| true).unwrap();
    assert_eq!(scheduler.task_state(&first_id), Some(TaskState::Queued));
    assert_eq!(recorder.assignments.lock().last().unwrap().node_id, replacement);
}
