// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Signals between tasks, actors and drivers.
//!
//! A signal is an ordinary object whose ID is derived from the sending
//! task (or, for actors, the actor creation task) and a per-source counter,
//! so a receiver can compute the ID of the next signal without any lookup.
//! Receivers keep their own read position per source.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use raylite_common::id::{NodeID, ObjectID, TaskID};
use raylite_common::{RayError, RayResult};
use raylite_object_store::{ObjectManager, RayObject};
use raylite_util::time::Deadline;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Signal {
    User(serde_json::Value),
    /// The source finished; nothing follows.
    Done,
    /// The source failed with this message.
    Error(String),
}

impl Signal {
    pub fn encode(&self) -> RayResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| RayError::invalid(format!("cannot encode signal: {e}")))
    }

    pub fn decode(data: &[u8]) -> RayResult<Self> {
        serde_json::from_slice(data).map_err(|e| RayError::invalid(format!("malformed signal: {e}")))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

/// Send side: the last counter used by each source.
pub struct SignalCounters {
    start: u32,
    sent: Mutex<HashMap<TaskID, u32>>,
}

impl SignalCounters {
    pub fn new(start: u32) -> Self {
        Self {
            start,
            sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    /// Store `signal` as the next object of `source` on `node_id`.
    pub fn send(&self, objects: &ObjectManager, node_id: &NodeID, source: &TaskID, signal: &Signal) -> RayResult<ObjectID> {
        let data = signal.encode()?;
        let object_id = {
            let mut sent = self.sent.lock();
            let counter = sent.get(source).map_or(self.start, |last| last + 1);
            let object_id = ObjectID::for_signal(source, counter)?;
            sent.insert(*source, counter);
            object_id
        };
        objects.put(node_id, object_id, RayObject::new(data), false)?;
        tracing::debug!(source = %source, object_id = %object_id, "signal sent");
        Ok(object_id)
    }

    /// Counter of the most recent signal from `source`.
    pub fn last_sent(&self, source: &TaskID) -> Option<u32> {
        self.sent.lock().get(source).copied()
    }
}

/// Receive side of one context.
pub struct SignalReceiver {
    start: u32,
    next: Mutex<HashMap<TaskID, u32>>,
}

impl SignalReceiver {
    pub fn new(start: u32) -> Self {
        Self {
            start,
            next: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self, source: &TaskID) -> RayResult<ObjectID> {
        let counter = self.next.lock().get(source).copied().unwrap_or(self.start);
        ObjectID::for_signal(source, counter)
    }

    fn advance(&self, source: &TaskID) {
        let mut next = self.next.lock();
        let counter = next.entry(*source).or_insert(self.start);
        *counter += 1;
    }

    /// Every signal sent by `sources` since the last call, in send order per
    /// source. Waits until at least one is available or the deadline
    /// passes. Reading from a source stops after its `Done`.
    pub async fn receive(
        &self,
        objects: &ObjectManager,
        node_id: &NodeID,
        sources: &[TaskID],
        deadline: Deadline,
    ) -> RayResult<Vec<(TaskID, Signal)>> {
        loop {
            let mut received = Vec::new();
            let mut next_ids = Vec::with_capacity(sources.len());
            for source in sources {
                loop {
                    let object_id = self.next_id(source)?;
                    if !objects.is_resolved(&object_id) {
                        next_ids.push(object_id);
                        break;
                    }
                    let object = objects
                        .get(node_id, &object_id, deadline)
                        .await
                        .map_err(RayError::from)?;
                    let signal = match object.into_result() {
                        Ok(data) => Signal::decode(&data)?,
                        Err(e) => Signal::Error(e.to_string()),
                    };
                    let done = signal == Signal::Done;
                    received.push((*source, signal));
                    self.advance(source);
                    if done {
                        break;
                    }
                }
            }
            if !received.is_empty() || next_ids.is_empty() || deadline.expired() {
                return Ok(received);
            }
            let ready = objects.wait(&next_ids, 1, deadline).await;
            if ready.ready.is_empty() {
                return Ok(received);
            }
        }
    }

    /// Skip everything `sources` have sent so far.
    pub fn forget(&self, counters: &SignalCounters, sources: &[TaskID]) {
        let mut next = self.next.lock();
        for source in sources {
            if let Some(last) = counters.last_sent(source) {
                next.insert(*source, last + 1);
            }
        }
    }

    pub fn reset(&self) {
        self.next.lock().clear();
    }
}
