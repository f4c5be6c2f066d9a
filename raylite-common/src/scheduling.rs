// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource vectors: `FixedPoint` quantities and `ResourceSet`.
//!
//! Quantities may be fractional (0.5 CPU), so they are stored as integers
//! scaled by `RESOURCE_UNIT_SCALING` to keep arithmetic exact.

use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{CPU_RESOURCE, RESOURCE_UNIT_SCALING};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FixedPoint(i64);

impl FixedPoint {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(RESOURCE_UNIT_SCALING);

    pub fn from_f64(value: f64) -> Self {
        Self((value * RESOURCE_UNIT_SCALING as f64).round() as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / RESOURCE_UNIT_SCALING as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl std::ops::Add for FixedPoint {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for FixedPoint {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for FixedPoint {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for FixedPoint {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// A bundle of named resource quantities. Zero entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
    resources: BTreeMap<String, FixedPoint>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, quantity)` pairs; non-positive quantities are dropped.
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, f64)>) -> Self {
        let mut set = Self::new();
        for (name, value) in pairs {
            set.set(name.into(), FixedPoint::from_f64(value));
        }
        set
    }

    /// The implicit request of a task that declares nothing: one CPU.
    pub fn default_task_request() -> Self {
        Self::from_pairs([(CPU_RESOURCE, 1.0)])
    }

    pub fn get(&self, resource: &str) -> FixedPoint {
        self.resources.get(resource).copied().unwrap_or(FixedPoint::ZERO)
    }

    pub fn set(&mut self, resource: String, value: FixedPoint) {
        if value.is_positive() {
            self.resources.insert(resource, value);
        } else {
            self.resources.remove(&resource);
        }
    }

    pub fn add(&mut self, other: &ResourceSet) {
        for (name, amount) in &other.resources {
            let total = self.get(name) + *amount;
            self.set(name.clone(), total);
        }
    }

    /// Subtract `other`, clamping every entry at zero.
    pub fn subtract(&mut self, other: &ResourceSet) {
        for (name, amount) in &other.resources {
            let remaining = self.get(name) - *amount;
            self.set(name.clone(), remaining);
        }
    }

    /// True if every quantity in `other` is available here.
    pub fn is_superset_of(&self, other: &ResourceSet) -> bool {
        other.resources.iter().all(|(name, amount)| self.get(name) >= *amount)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FixedPoint)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn to_f64_map(&self) -> BTreeMap<String, f64> {
        self.resources.iter().map(|(k, v)| (k.clone(), v.to_f64())).collect()
    }
}

impl fmt::Display for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, amount)) in self.resources.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {amount}")?;
        }
        f.write_str("}")
    }
}

impl serde::Serialize for ResourceSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_f64_map().serialize(serializer)
    }
}
