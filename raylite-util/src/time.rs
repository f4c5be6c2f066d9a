// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Wall-clock and deadline helpers.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An optional point in time after which a blocking call gives up.
///
/// `None` timeouts never expire.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn from_timeout_ms(timeout_ms: Option<u64>) -> Self {
        Self::after(timeout_ms.map(Duration::from_millis))
    }

    pub fn never() -> Self {
        Self { at: None }
    }

    /// Time left, or `None` when the deadline is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    pub fn is_bounded(&self) -> bool {
        self.at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_ms() {
        let t1 = current_time_ms();
        let t2 = current_time_ms();
        assert!(t2 >= t1);
        assert!(t1 > 1_577_836_800_000);
    }

    #[test]
    fn test_unbounded_deadline() {
        let deadline = Deadline::from_timeout_ms(None);
        assert!(!deadline.is_bounded());
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::after(Some(Duration::from_millis(5)));
        assert!(deadline.remaining().unwrap() <= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(deadline.expired());
        assert_eq!(Deadline::from_timeout_ms(Some(0)).remaining(), Some(Duration::ZERO));
    }
}
