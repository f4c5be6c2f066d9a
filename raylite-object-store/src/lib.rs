// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Object storage for raylite.
//!
//! - [`store::ObjectStore`]: one per node, immutable blobs with pinning and
//!   LRU eviction under memory pressure.
//! - [`object_directory::LocationDirectory`]: which nodes hold a copy of
//!   each object.
//! - [`pull_manager::PullManager`]: copies objects between node stores.
//! - [`wait_manager::WaitManager`]: FIFO suspension queue for `get`/`wait`.
//! - [`object_manager::ObjectManager`]: ties the above together and
//!   implements the blocking, location-transparent `get`.

pub mod common;
pub mod eviction;
pub mod object_directory;
pub mod object_manager;
pub mod pull_manager;
pub mod store;
pub mod wait_manager;

pub use common::{EvictionGuard, ObjectInfo, ObjectResolver, RayObject};
pub use object_directory::LocationDirectory;
pub use object_manager::ObjectManager;
pub use store::{ObjectStore, StoreRegistry};
pub use wait_manager::{WaitManager, WaitResult};
