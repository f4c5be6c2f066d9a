// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Suspension queue for `get` and `wait`.
//!
//! Each pending request registers the objects it waits on and how many of
//! them must resolve. When an object resolves (sealed somewhere in the
//! cluster, or permanently failed), the requests waiting on it are visited
//! in registration order. Ready lists keep completion order; pending lists
//! keep input order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use raylite_common::id::ObjectID;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitResult {
    pub ready: Vec<ObjectID>,
    pub pending: Vec<ObjectID>,
}

struct WaitRequest {
    object_ids: Vec<ObjectID>,
    num_required: usize,
    ready: Vec<ObjectID>,
    sender: oneshot::Sender<WaitResult>,
}

impl WaitRequest {
    fn result(&self) -> WaitResult {
        let ready_set: HashSet<_> = self.ready.iter().collect();
        WaitResult {
            ready: self.ready.clone(),
            pending: self
                .object_ids
                .iter()
                .filter(|id| !ready_set.contains(id))
                .copied()
                .collect(),
        }
    }
}

#[derive(Default)]
struct WaitState {
    next_wait_id: u64,
    requests: HashMap<u64, WaitRequest>,
    /// Registration-ordered waiters per object.
    waiters: HashMap<ObjectID, Vec<u64>>,
}

impl WaitState {
    fn unindex(&mut self, wait_id: u64, object_ids: &[ObjectID]) {
        for object_id in object_ids {
            if let Some(ids) = self.waiters.get_mut(object_id) {
                ids.retain(|id| *id != wait_id);
                if ids.is_empty() {
                    self.waiters.remove(object_id);
                }
            }
        }
    }

    fn withdraw(&mut self, wait_id: u64) -> Option<WaitRequest> {
        let request = self.requests.remove(&wait_id)?;
        self.unindex(wait_id, &request.object_ids);
        Some(request)
    }
}

/// A registered, not yet satisfied request.
///
/// Dropping the handle withdraws the request, so a caller whose future is
/// cancelled leaves nothing behind in the manager.
pub struct WaitHandle {
    wait_id: u64,
    object_ids: Vec<ObjectID>,
    receiver: oneshot::Receiver<WaitResult>,
    state: Weak<Mutex<WaitState>>,
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().withdraw(self.wait_id);
        }
    }
}

pub enum Registration {
    /// Enough objects were already resolved at registration time.
    Ready(WaitResult),
    Pending(WaitHandle),
}

#[derive(Default)]
pub struct WaitManager {
    state: Arc<Mutex<WaitState>>,
}

impl WaitManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `object_ids` until `num_required` of them resolve.
    ///
    /// `is_resolved` is evaluated under the manager's lock, so an object that
    /// resolves concurrently is either seen here or delivered through
    /// [`WaitManager::handle_object_resolved`], never lost. Duplicate IDs are
    /// collapsed.
    pub fn register(
        &self,
        object_ids: &[ObjectID],
        num_required: usize,
        is_resolved: impl Fn(&ObjectID) -> bool,
    ) -> Registration {
        let mut seen = HashSet::new();
        let object_ids: Vec<ObjectID> = object_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let num_required = num_required.min(object_ids.len());

        let mut state = self.state.lock();
        let ready: Vec<ObjectID> = object_ids.iter().copied().filter(|id| is_resolved(id)).collect();
        let (sender, receiver) = oneshot::channel();
        let request = WaitRequest {
            object_ids: object_ids.clone(),
            num_required,
            ready,
            sender,
        };
        if request.ready.len() >= num_required {
            return Registration::Ready(request.result());
        }

        state.next_wait_id += 1;
        let wait_id = state.next_wait_id;
        for object_id in &object_ids {
            if !request.ready.contains(object_id) {
                state.waiters.entry(*object_id).or_default().push(wait_id);
            }
        }
        state.requests.insert(wait_id, request);
        Registration::Pending(WaitHandle {
            wait_id,
            object_ids,
            receiver,
            state: Arc::downgrade(&self.state),
        })
    }

    /// Mark `object_id` resolved and release every request it satisfies.
    /// Returns the number of requests released.
    pub fn handle_object_resolved(&self, object_id: &ObjectID) -> usize {
        let mut completed = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(wait_ids) = state.waiters.remove(object_id) else {
                return 0;
            };
            for wait_id in wait_ids {
                let satisfied = match state.requests.get_mut(&wait_id) {
                    Some(request) => {
                        request.ready.push(*object_id);
                        request.ready.len() >= request.num_required
                    }
                    None => false,
                };
                if satisfied {
                    completed.extend(state.withdraw(wait_id));
                }
            }
        }
        let released = completed.len();
        for request in completed {
            let result = request.result();
            let _ = request.sender.send(result);
        }
        released
    }

    /// Wait for `handle` to complete or for `timeout` to pass.
    ///
    /// On timeout the request is withdrawn and whatever resolved so far is
    /// returned.
    pub async fn wait_for(&self, mut handle: WaitHandle, timeout: Option<Duration>) -> WaitResult {
        let received = match timeout {
            Some(t) => tokio::time::timeout(t, &mut handle.receiver).await.ok(),
            None => Some((&mut handle.receiver).await),
        };
        if let Some(Ok(result)) = received {
            return result;
        }
        if let Some(result) = self.cancel(handle.wait_id) {
            return result;
        }
        // Completed between the timeout and the cancel.
        handle.receiver.try_recv().unwrap_or_else(|_| WaitResult {
            ready: Vec::new(),
            pending: handle.object_ids.clone(),
        })
    }

    /// Withdraw a request, returning its partial result.
    pub fn cancel(&self, wait_id: u64) -> Option<WaitResult> {
        self.state.lock().withdraw(wait_id).map(|request| request.result())
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Objects some request is still waiting on.
    pub fn waiting_objects(&self) -> Vec<ObjectID> {
        self.state.lock().waiters.keys().copied().collect()
    }

    /// Number of requests waiting on `object_id`.
    pub fn num_waiters(&self, object_id: &ObjectID) -> usize {
        self.state.lock().waiters.get(object_id).map_or(0, Vec::len)
    }
}
