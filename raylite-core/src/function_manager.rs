// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Registry of remote functions and actor classes.
//!
//! Task specs name what to run; the worker resolves the name here. Each
//! cluster carries its own registry, so independent clusters in one process
//! never see each other's code.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::worker::TaskContext;

/// Body of a remote function: argument payloads in, return payloads out.
pub type RemoteFunction = Arc<dyn Fn(&TaskContext, Vec<Bytes>) -> anyhow::Result<Vec<Bytes>> + Send + Sync>;

/// A live actor's state and its methods.
pub trait ActorInstance: Send + Sync {
    fn call(&self, ctx: &TaskContext, method: &str, args: Vec<Bytes>) -> anyhow::Result<Vec<Bytes>>;
}

/// Constructor of an actor class.
pub type ActorFactory = Arc<dyn Fn(&TaskContext, Vec<Bytes>) -> anyhow::Result<Box<dyn ActorInstance>> + Send + Sync>;

#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, RemoteFunction>>,
    actor_classes: RwLock<HashMap<String, ActorFactory>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any earlier definition.
    pub fn register_function<F>(&self, name: &str, function: F)
    where
        F: Fn(&TaskContext, Vec<Bytes>) -> anyhow::Result<Vec<Bytes>> + Send + Sync + 'static,
    {
        if self.functions.write().insert(name.to_string(), Arc::new(function)).is_some() {
            tracing::debug!(function = name, "remote function redefined");
        }
    }

    pub fn register_actor_class<F>(&self, name: &str, factory: F)
    where
        F: Fn(&TaskContext, Vec<Bytes>) -> anyhow::Result<Box<dyn ActorInstance>> + Send + Sync + 'static,
    {
        self.actor_classes.write().insert(name.to_string(), Arc::new(factory));
    }

    pub fn function(&self, name: &str) -> CoreResult<RemoteFunction> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownFunction(name.to_string()))
    }

    pub fn actor_class(&self, name: &str) -> CoreResult<ActorFactory> {
        self.actor_classes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownActorClass(name.to_string()))
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub fn has_actor_class(&self, name: &str) -> bool {
        self.actor_classes.read().contains_key(name)
    }
}
