// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Copies objects between node stores.
//!
//! A pull walks the directory's locations for the object, copies the first
//! live copy into the destination store and publishes nothing itself: the
//! destination store's add callback does that, exactly as for a local seal.
//! Stale locations are invalidated; a directory that is unreachable is
//! retried with backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use raylite_common::config::RayConfig;
use raylite_common::id::{NodeID, ObjectID};
use raylite_common::{RayError, RayResult, StatusCode};
use raylite_util::backoff::{retry_with_backoff, Attempt, ExponentialBackoff};

use crate::common::RayObject;
use crate::object_directory::LocationDirectory;
use crate::store::StoreRegistry;

#[derive(Debug, Clone, Copy)]
pub struct PullConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl From<&RayConfig> for PullConfig {
    fn from(config: &RayConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.fetch_retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.fetch_retry_max_delay_ms),
            max_attempts: config.fetch_max_attempts,
        }
    }
}

pub struct PullManager {
    directory: Arc<LocationDirectory>,
    stores: Arc<StoreRegistry>,
    config: PullConfig,
    num_pulls: AtomicU64,
    bytes_pulled: AtomicU64,
}

impl PullManager {
    pub fn new(directory: Arc<LocationDirectory>, stores: Arc<StoreRegistry>, config: PullConfig) -> Self {
        Self {
            directory,
            stores,
            config,
            num_pulls: AtomicU64::new(0),
            bytes_pulled: AtomicU64::new(0),
        }
    }

    /// Bring `object_id` into `dest`'s store.
    ///
    /// Fails with `ObjectNotFound` once no live copy is known. If the
    /// destination store is full the object is still returned, just not
    /// cached locally.
    pub async fn pull(&self, object_id: &ObjectID, dest: &NodeID) -> RayResult<RayObject> {
        let backoff = ExponentialBackoff::new(self.config.initial_delay, 2.0, self.config.max_delay);
        retry_with_backoff(backoff, self.config.max_attempts, |attempt| {
            let outcome = self.try_pull_once(object_id, dest, attempt);
            async move { outcome }
        })
        .await
    }

    fn try_pull_once(&self, object_id: &ObjectID, dest: &NodeID, attempt: u32) -> Attempt<RayObject, RayError> {
        let Some(dest_store) = self.stores.get(dest) else {
            return Attempt::Fail(RayError::not_found(format!("destination node {dest} has no store")));
        };
        if let Some(object) = dest_store.get(object_id) {
            return Attempt::Done(object);
        }

        let holders: Vec<NodeID> = self
            .directory
            .lookup(object_id)
            .into_iter()
            .filter(|node| node != dest)
            .collect();
        if holders.is_empty() {
            return if self.directory.is_available() {
                Attempt::Fail(RayError::object_not_found(format!("no live copy of {object_id}")))
            } else {
                Attempt::Retry(RayError::unavailable("location directory is unreachable"))
            };
        }

        for holder in holders {
            let copy = self.stores.get(&holder).and_then(|store| store.get(object_id));
            let Some(object) = copy else {
                tracing::debug!(object_id = %object_id, node_id = %holder, attempt, "stale location");
                self.directory.invalidate(object_id, &holder);
                continue;
            };

            self.num_pulls.fetch_add(1, Ordering::Relaxed);
            self.bytes_pulled.fetch_add(object.size(), Ordering::Relaxed);
            match dest_store.put(*object_id, object.clone(), false) {
                Ok(_) => {}
                Err(e) if e.code == StatusCode::ObjectStoreFull => {
                    tracing::warn!(object_id = %object_id, node_id = %dest, error = %e, "pulled object not cached");
                }
                Err(e) => return Attempt::Fail(e),
            }
            tracing::debug!(object_id = %object_id, from = %holder, to = %dest, "pulled object");
            return Attempt::Done(object);
        }

        Attempt::Retry(RayError::object_not_found(format!(
            "every known location of {object_id} was stale"
        )))
    }

    pub fn num_pulls(&self) -> u64 {
        self.num_pulls.load(Ordering::Relaxed)
    }

    pub fn bytes_pulled(&self) -> u64 {
        self.bytes_pulled.load(Ordering::Relaxed)
    }
}
