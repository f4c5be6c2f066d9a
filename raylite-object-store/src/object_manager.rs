// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cluster-wide object plane.
//!
//! Owns every node's store, the location directory, the pull manager and the
//! waiter queue, and wires them together: a seal in any store publishes the
//! location and then wakes waiters, so a woken waiter can always find the
//! object through the directory.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use raylite_common::config::RayConfig;
use raylite_common::id::{NodeID, ObjectID};
use raylite_common::{ObjectError, RayError, RayResult};
use raylite_observability::EventSink;
use raylite_util::backoff::{retry_with_backoff, Attempt, ExponentialBackoff};
use raylite_util::time::Deadline;

use crate::common::{AllowAllEvictions, EvictionGuard, ObjectInfo, ObjectResolver, RayObject, RemovalReason};
use crate::object_directory::LocationDirectory;
use crate::pull_manager::{PullConfig, PullManager};
use crate::store::{ObjectStore, PutOutcome, StoreRegistry};
use crate::wait_manager::{Registration, WaitManager, WaitResult};

/// Invoked once an object is visible through the directory or has failed
/// for good.
pub type ResolvedListener = Arc<dyn Fn(&ObjectID) + Send + Sync>;

pub struct ObjectManager {
    self_ref: Weak<ObjectManager>,
    stores: Arc<StoreRegistry>,
    directory: Arc<LocationDirectory>,
    pulls: PullManager,
    waiters: WaitManager,
    resolver: RwLock<Option<Arc<dyn ObjectResolver>>>,
    guard: RwLock<Arc<dyn EvictionGuard>>,
    listeners: RwLock<Vec<ResolvedListener>>,
    publish_backoff: ExponentialBackoff,
    publish_max_attempts: u32,
    events: Arc<dyn EventSink>,
}

impl ObjectManager {
    pub fn new(config: &RayConfig, events: Arc<dyn EventSink>) -> Arc<Self> {
        let stores = Arc::new(StoreRegistry::new());
        let directory = Arc::new(LocationDirectory::new());
        let pulls = PullManager::new(directory.clone(), stores.clone(), PullConfig::from(config));
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            stores,
            directory,
            pulls,
            waiters: WaitManager::new(),
            resolver: RwLock::new(None),
            guard: RwLock::new(Arc::new(AllowAllEvictions)),
            listeners: RwLock::new(Vec::new()),
            publish_backoff: ExponentialBackoff::new(
                Duration::from_millis(config.fetch_retry_initial_delay_ms),
                2.0,
                Duration::from_millis(config.fetch_retry_max_delay_ms),
            ),
            publish_max_attempts: config.location_publish_max_attempts,
            events,
        })
    }

    pub fn set_resolver(&self, resolver: Arc<dyn ObjectResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    pub fn add_resolved_listener(&self, listener: ResolvedListener) {
        self.listeners.write().push(listener);
    }

    fn fire_resolved(&self, object_id: &ObjectID) {
        self.waiters.handle_object_resolved(object_id);
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(object_id);
        }
    }

    /// Install the ownership check on every current and future store.
    pub fn set_eviction_guard(&self, guard: Arc<dyn EvictionGuard>) {
        for store in self.stores.all() {
            store.set_eviction_guard(guard.clone());
        }
        *self.guard.write() = guard;
    }

    /// Create the store of a newly joined node.
    pub fn add_node(&self, node_id: NodeID, capacity_bytes: u64) -> Arc<ObjectStore> {
        let store = Arc::new(ObjectStore::new(node_id, capacity_bytes, self.events.clone()));
        store.set_eviction_guard(self.guard.read().clone());

        let weak = self.self_ref.clone();
        store.add_object_callback(Arc::new(move |node_id, info| {
            if let Some(manager) = weak.upgrade() {
                manager.on_object_sealed(*node_id, info);
            }
        }));
        let weak = self.self_ref.clone();
        store.add_remove_callback(Arc::new(move |node_id, object_id, reason| {
            if let Some(manager) = weak.upgrade() {
                manager.on_object_removed(node_id, object_id, reason);
            }
        }));

        self.stores.insert(store.clone());
        store
    }

    /// Drop a dead node's store. Returns objects that lost their last copy.
    pub fn remove_node(&self, node_id: &NodeID) -> Vec<ObjectID> {
        self.stores.remove(node_id);
        self.directory.handle_node_removed(node_id)
    }

    pub fn store(&self, node_id: &NodeID) -> Option<Arc<ObjectStore>> {
        self.stores.get(node_id)
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    pub fn directory(&self) -> &LocationDirectory {
        &self.directory
    }

    pub fn waiters(&self) -> &WaitManager {
        &self.waiters
    }

    pub fn pulls(&self) -> &PullManager {
        &self.pulls
    }

    pub fn put(&self, node_id: &NodeID, object_id: ObjectID, object: RayObject, pin: bool) -> RayResult<PutOutcome> {
        let store = self
            .stores
            .get(node_id)
            .ok_or_else(|| RayError::not_found(format!("node {node_id} has no object store")))?;
        store.put(object_id, object, pin)
    }

    fn on_object_sealed(&self, node_id: NodeID, info: &ObjectInfo) {
        let object_id = info.object_id;
        match self.directory.publish(object_id, node_id, info.size) {
            Ok(()) => self.fire_resolved(&object_id),
            Err(e) => {
                tracing::warn!(object_id = %object_id, node_id = %node_id, error = %e, "location publish failed, retrying");
                self.spawn_publish_retry(object_id, node_id, info.size);
            }
        }
    }

    fn spawn_publish_retry(&self, object_id: ObjectID, node_id: NodeID, size: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(object_id = %object_id, "no runtime to retry location publish on");
            return;
        };
        let weak = self.self_ref.clone();
        let backoff = self.publish_backoff.clone();
        let max_attempts = self.publish_max_attempts;
        handle.spawn(async move {
            let result = retry_with_backoff(backoff, max_attempts, |_| {
                let outcome = match weak.upgrade() {
                    None => Attempt::Fail(RayError::disconnected("object manager shut down")),
                    Some(manager) if !manager.stores.get(&node_id).is_some_and(|s| s.contains(&object_id)) => {
                        Attempt::Fail(RayError::object_not_found("object left the store before publish"))
                    }
                    Some(manager) => match manager.directory.publish(object_id, node_id, size) {
                        Ok(()) => Attempt::Done(()),
                        Err(e) => Attempt::Retry(e),
                    },
                };
                async move { outcome }
            })
            .await;
            match (result, weak.upgrade()) {
                (Ok(()), Some(manager)) => manager.fire_resolved(&object_id),
                (Err(e), _) => {
                    tracing::error!(object_id = %object_id, node_id = %node_id, error = %e, "gave up publishing location");
                }
                _ => {}
            }
        });
    }

    fn on_object_removed(&self, node_id: &NodeID, object_id: &ObjectID, reason: RemovalReason) {
        if reason != RemovalReason::Freed {
            self.directory.invalidate(object_id, node_id);
        }
    }

    /// Visible somewhere in the cluster, or failed for good.
    pub fn is_resolved(&self, object_id: &ObjectID) -> bool {
        !self.directory.lookup(object_id).is_empty() || self.failure(object_id).is_some()
    }

    fn failure(&self, object_id: &ObjectID) -> Option<ObjectError> {
        self.resolver.read().as_ref().and_then(|r| r.failure(object_id))
    }

    /// Wake waiters on an object that resolved outside the store path, e.g.
    /// a recorded permanent failure.
    pub fn notify_resolved(&self, object_id: &ObjectID) {
        self.fire_resolved(object_id);
    }

    /// Toggle directory reachability. Coming back wakes every waiter whose
    /// object became visible in the meantime.
    pub fn set_directory_available(&self, available: bool) {
        self.directory.set_available(available);
        if available {
            for object_id in self.waiters.waiting_objects() {
                if self.is_resolved(&object_id) {
                    self.fire_resolved(&object_id);
                }
            }
        }
    }

    /// Fetch `object_id` into `node_id`'s store, waiting until it exists.
    ///
    /// Error-valued objects come back as `Ok`; the caller decides how to
    /// surface them. Permanent failures recorded by the resolver come back
    /// as `Err`, as does hitting the deadline.
    pub async fn get(&self, node_id: &NodeID, object_id: &ObjectID, deadline: Deadline) -> Result<RayObject, ObjectError> {
        loop {
            if let Some(object) = self.stores.get(node_id).and_then(|s| s.get(object_id)) {
                return Ok(object);
            }
            if let Some(err) = self.failure(object_id) {
                return Err(err);
            }

            match self.waiters.register(&[*object_id], 1, |id| self.is_resolved(id)) {
                Registration::Ready(_) => {
                    if let Some(err) = self.failure(object_id) {
                        return Err(err);
                    }
                    match self.fetch(node_id, object_id).await {
                        Ok(object) => return Ok(object),
                        Err(e) => {
                            tracing::debug!(object_id = %object_id, error = %e, "fetch failed, re-resolving");
                            if deadline.expired() {
                                return Err(ObjectError::TimedOut { object_id: *object_id });
                            }
                        }
                    }
                }
                Registration::Pending(handle) => {
                    if self.directory.is_available() {
                        let resolver = self.resolver.read().clone();
                        if let Some(resolver) = resolver {
                            resolver.on_object_missing(object_id);
                        }
                    }
                    let result = self.waiters.wait_for(handle, deadline.remaining()).await;
                    if result.ready.is_empty() {
                        return Err(ObjectError::TimedOut { object_id: *object_id });
                    }
                }
            }
        }
    }

    async fn fetch(&self, node_id: &NodeID, object_id: &ObjectID) -> RayResult<RayObject> {
        if self.stores.get(node_id).is_some() {
            return self.pulls.pull(object_id, node_id).await;
        }
        // The caller's own node is gone; read a copy without caching it.
        self.directory
            .lookup(object_id)
            .iter()
            .find_map(|holder| self.stores.get(holder).and_then(|s| s.get(object_id)))
            .ok_or_else(|| RayError::object_not_found(format!("no live copy of {object_id}")))
    }

    /// Wait until `num_returns` of `object_ids` resolve or the deadline passes.
    pub async fn wait(&self, object_ids: &[ObjectID], num_returns: usize, deadline: Deadline) -> WaitResult {
        match self.waiters.register(object_ids, num_returns, |id| self.is_resolved(id)) {
            Registration::Ready(result) => result,
            Registration::Pending(handle) => self.waiters.wait_for(handle, deadline.remaining()).await,
        }
    }

    /// Physically delete every copy and forget the locations.
    pub fn delete_everywhere(&self, object_id: &ObjectID) -> usize {
        self.directory.remove_object(object_id);
        self.stores
            .all()
            .into_iter()
            .filter(|store| store.delete(object_id))
            .count()
    }

    pub fn locations(&self, object_id: &ObjectID) -> Vec<NodeID> {
        self.directory.lookup(object_id)
    }
}
