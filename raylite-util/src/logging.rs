// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup using the `tracing` ecosystem.

use std::path::Path;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Environment variable consulted before falling back to `RUST_LOG`.
pub const LOG_LEVEL_ENV: &str = "RAYLITE_LOG_LEVEL";

fn default_level(verbosity: i32) -> &'static str {
    match verbosity {
        i32::MIN..=0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Build the filter used by [`init_logging`].
pub fn build_env_filter(verbosity: i32) -> EnvFilter {
    EnvFilter::try_from_env(LOG_LEVEL_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)))
}

/// Initialize process-wide logging for one component.
///
/// Writes to `<log_dir>/<component>.log` when a directory is given, otherwise
/// to stderr. Calling this more than once is a no-op; the first
/// configuration wins.
pub fn init_logging(component: &str, log_dir: Option<&Path>, verbosity: i32) -> std::io::Result<()> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(verbosity))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let installed = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{component}.log")))?;
            subscriber
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
                .is_ok()
        }
        None => subscriber.try_init().is_ok(),
    };

    let _ = LOGGING_INITIALIZED.set(());
    if installed {
        tracing::info!(component, "raylite logging initialized");
    }
    Ok(())
}
