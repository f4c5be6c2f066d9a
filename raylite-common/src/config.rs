// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Runtime configuration.
//!
//! A plain struct with defaults. Overrides come from a JSON document (also
//! accepted base64-encoded, the way launchers pass it on a command line) and
//! from `RAYLITE_<field_name>` environment variables. The config is handed
//! to the cluster explicitly; there is no process-wide instance.

use crate::constants::{CONFIG_ENV_PREFIX, DEFAULT_MAX_TASK_RETRIES, SIGNAL_COUNTER_START};
use crate::status::{RayError, RayResult};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RayConfig {
    // ─── Object store ─────────────────────────────────────────
    /// Capacity of each node's object store.
    pub object_store_memory_bytes: u64,

    // ─── Fetch / publish retries ──────────────────────────────
    pub fetch_retry_initial_delay_ms: u64,
    pub fetch_retry_max_delay_ms: u64,
    pub fetch_max_attempts: u32,
    pub location_publish_max_attempts: u32,

    // ─── Tasks and workers ────────────────────────────────────
    pub max_task_retries: u32,
    pub max_workers_per_node: u32,
    pub default_actor_max_concurrency: u32,

    // ─── Health ───────────────────────────────────────────────
    pub worker_heartbeat_period_ms: u64,
    pub health_check_failure_threshold: u32,

    // ─── Autoscaling / telemetry / signals ────────────────────
    pub enable_autoscaling: bool,
    /// Directory for the JSON event log; events only go to tracing when unset.
    pub event_log_dir: String,
    pub signal_counter_start: u32,
}

impl Default for RayConfig {
    fn default() -> Self {
        Self {
            object_store_memory_bytes: 256 * 1024 * 1024,
            fetch_retry_initial_delay_ms: 10,
            fetch_retry_max_delay_ms: 1_000,
            fetch_max_attempts: 5,
            location_publish_max_attempts: 10,
            max_task_retries: DEFAULT_MAX_TASK_RETRIES,
            max_workers_per_node: 16,
            default_actor_max_concurrency: 1,
            worker_heartbeat_period_ms: 100,
            health_check_failure_threshold: 5,
            enable_autoscaling: false,
            event_log_dir: String::new(),
            signal_counter_start: SIGNAL_COUNTER_START,
        }
    }
}

impl RayConfig {
    /// Parse from base64-encoded JSON.
    pub fn from_base64_json(b64: &str) -> RayResult<Self> {
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
            .map_err(|e| RayError::invalid(format!("base64 decode error: {e}")))?;
        let json = String::from_utf8(decoded)
            .map_err(|e| RayError::invalid(format!("config is not UTF-8: {e}")))?;
        Self::from_json(&json)
    }

    /// Parse from a JSON object. Unknown keys are logged and ignored.
    pub fn from_json(json: &str) -> RayResult<Self> {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| RayError::invalid(format!("JSON parse error: {e}")))?;

        let mut config = Self::default();

        macro_rules! set_field {
            ($field:ident, u64) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = v;
                }
            };
            ($field:ident, u32) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = u32::try_from(v).map_err(|_| {
                        RayError::invalid(format!("{} out of range: {v}", stringify!($field)))
                    })?;
                }
            };
            ($field:ident, bool) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_bool()) {
                    config.$field = v;
                }
            };
            ($field:ident, String) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_str()) {
                    config.$field = v.to_string();
                }
            };
        }

        set_field!(object_store_memory_bytes, u64);
        set_field!(fetch_retry_initial_delay_ms, u64);
        set_field!(fetch_retry_max_delay_ms, u64);
        set_field!(fetch_max_attempts, u32);
        set_field!(location_publish_max_attempts, u32);
        set_field!(max_task_retries, u32);
        set_field!(max_workers_per_node, u32);
        set_field!(default_actor_max_concurrency, u32);
        set_field!(worker_heartbeat_period_ms, u64);
        set_field!(health_check_failure_threshold, u32);
        set_field!(enable_autoscaling, bool);
        set_field!(event_log_dir, String);
        set_field!(signal_counter_start, u32);

        let known = serde_json::to_value(&config)
            .ok()
            .and_then(|v| v.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()))
            .unwrap_or_default();
        for key in map.keys().filter(|k| !known.contains(k)) {
            tracing::warn!(key = %key, "ignoring unknown config key");
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `RAYLITE_<field_name>` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:ident, $ty:ty) => {
                let key = format!("{}{}", CONFIG_ENV_PREFIX, stringify!($field));
                if let Ok(raw) = std::env::var(&key) {
                    match raw.parse::<$ty>() {
                        Ok(v) => self.$field = v,
                        Err(_) => tracing::warn!(key = %key, value = %raw, "unparsable config override"),
                    }
                }
            };
        }

        env_override!(object_store_memory_bytes, u64);
        env_override!(fetch_retry_initial_delay_ms, u64);
        env_override!(fetch_retry_max_delay_ms, u64);
        env_override!(fetch_max_attempts, u32);
        env_override!(location_publish_max_attempts, u32);
        env_override!(max_task_retries, u32);
        env_override!(max_workers_per_node, u32);
        env_override!(default_actor_max_concurrency, u32);
        env_override!(worker_heartbeat_period_ms, u64);
        env_override!(health_check_failure_threshold, u32);
        env_override!(enable_autoscaling, bool);
        env_override!(event_log_dir, String);
        env_override!(signal_counter_start, u32);
    }

    pub fn validate(&self) -> RayResult<()> {
        if self.object_store_memory_bytes == 0 {
            return Err(RayError::invalid("object_store_memory_bytes must be positive"));
        }
        if self.max_workers_per_node == 0 {
            return Err(RayError::invalid("max_workers_per_node must be positive"));
        }
        if self.default_actor_max_concurrency == 0 {
            return Err(RayError::invalid("default_actor_max_concurrency must be positive"));
        }
        if self.fetch_retry_initial_delay_ms > self.fetch_retry_max_delay_ms {
            return Err(RayError::invalid(
                "fetch_retry_initial_delay_ms exceeds fetch_retry_max_delay_ms",
            ));
        }
        if self.worker_heartbeat_period_ms == 0 {
            return Err(RayError::invalid("worker_heartbeat_period_ms must be positive"));
        }
        if self.signal_counter_start == 0 {
            return Err(RayError::invalid("signal_counter_start must be positive"));
        }
        Ok(())
    }

    pub fn event_log_dir(&self) -> Option<std::path::PathBuf> {
        (!self.event_log_dir.is_empty()).then(|| std::path::PathBuf::from(&self.event_log_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn test_default_config() {
        let config = RayConfig::default();
        assert_eq!(config.max_task_retries, 3);
        assert_eq!(config.signal_counter_start, 10000);
        assert!(!config.enable_autoscaling);
        assert!(config.event_log_dir().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_json_parse() {
        let json = r#"{"max_task_retries": 5, "enable_autoscaling": true, "object_store_memory_bytes": 1024}"#;
        let config = RayConfig::from_json(json).unwrap();
        assert_eq!(config.max_task_retries, 5);
        assert!(config.enable_autoscaling);
        assert_eq!(config.object_store_memory_bytes, 1024);
    }

    #[test]
    fn test_base64_json() {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD.encode(r#"{"fetch_max_attempts": 2}"#);
        let config = RayConfig::from_base64_json(&b64).unwrap();
        assert_eq!(config.fetch_max_attempts, 2);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = RayConfig::from_json(r#"{"object_store_memory_bytes": 0}"#).unwrap_err();
        assert_eq!(err.code, StatusCode::Invalid);
        assert!(RayConfig::from_json("not json").is_err());
        assert!(RayConfig::from_json(r#"{"max_task_retries": 99999999999}"#).is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("RAYLITE_max_workers_per_node", "3");
        let mut config = RayConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("RAYLITE_max_workers_per_node");
        assert_eq!(config.max_workers_per_node, 3);
    }
}
