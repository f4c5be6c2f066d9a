// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! `raylite` binary: start a local simulated cluster, run a small
//! workload against it and print the resulting global state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use raylite_common::config::RayConfig;
use raylite_common::scheduling::ResourceSet;
use raylite_core::{
    ActorInstance, ActorOptions, Cluster, ClusterContext, GlobalState, NodeSpec, Signal, TaskContext, TaskOptions,
};
use raylite_scheduler::TaskArg;

#[derive(Parser, Debug)]
#[command(name = "raylite", about = "Run a workload on a local simulated raylite cluster")]
struct Args {
    /// Node layout: nodes separated by ';', resources as comma-separated
    /// key:value pairs (e.g. "CPU:4;CPU:2,GPU:1")
    #[arg(long, default_value = "CPU:4;CPU:2")]
    nodes: String,

    /// Number of independent tasks in the demo workload
    #[arg(long, default_value_t = 8)]
    tasks: u32,

    /// Base64-encoded JSON config
    #[arg(long)]
    ray_config: Option<String>,

    /// Log directory; stderr when unset
    #[arg(long)]
    log_dir: Option<String>,

    /// Timeout for each get, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_node_layout(layout: &str) -> anyhow::Result<Vec<NodeSpec>> {
    layout
        .split(';')
        .filter(|node| !node.trim().is_empty())
        .map(|node| {
            let pairs = node
                .split(',')
                .map(|pair| {
                    let (name, value) = pair
                        .split_once(':')
                        .with_context(|| format!("resource {pair:?} is not name:value"))?;
                    let value: f64 = value
                        .trim()
                        .parse()
                        .with_context(|| format!("bad quantity in {pair:?}"))?;
                    Ok((name.trim().to_string(), value))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(NodeSpec::new(ResourceSet::from_pairs(pairs)))
        })
        .collect()
}

fn encode(value: i64) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

fn decode(data: &[u8]) -> anyhow::Result<i64> {
    Ok(serde_json::from_slice(data)?)
}

struct Counter {
    value: AtomicI64,
}

impl ActorInstance for Counter {
    fn call(&self, ctx: &TaskContext, method: &str, args: Vec<Bytes>) -> anyhow::Result<Vec<Bytes>> {
        match method {
            "add" => {
                let delta = args.first().map(|a| decode(a)).transpose()?.unwrap_or(1);
                let value = self.value.fetch_add(delta, Ordering::SeqCst) + delta;
                ctx.send_signal(&Signal::User(serde_json::json!({ "value": value })))?;
                Ok(vec![encode(value)?])
            }
            "get" => Ok(vec![encode(self.value.load(Ordering::SeqCst))?]),
            other => anyhow::bail!("Counter has no method {other}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    raylite_util::logging::init_logging(
        "raylite",
        args.log_dir.as_ref().map(std::path::Path::new),
        i32::from(args.verbose),
    )?;

    let mut config = match &args.ray_config {
        Some(b64) => RayConfig::from_base64_json(b64)?,
        None => RayConfig::default(),
    };
    config.apply_env_overrides();

    let nodes = parse_node_layout(&args.nodes)?;
    let cluster = Cluster::start(config, nodes)?;
    let ctx = ClusterContext::connect(&cluster)?;

    ctx.register_function("square", |_, args| {
        let x = decode(args.first().context("square takes one argument")?)?;
        Ok(vec![encode(x * x)?])
    });
    ctx.register_function("sum", |_, args| {
        let total = args.iter().map(|a| decode(a)).sum::<anyhow::Result<i64>>()?;
        Ok(vec![encode(total)?])
    });
    ctx.register_actor_class("Counter", |_, args| {
        let start = args.first().map(|a| decode(a)).transpose()?.unwrap_or(0);
        Ok(Box::new(Counter {
            value: AtomicI64::new(start),
        }) as Box<dyn ActorInstance>)
    });

    let mut squares = Vec::new();
    for i in 0..i64::from(args.tasks) {
        let input = ctx.put(encode(i)?)?;
        let mut refs = ctx.submit_task("square", vec![TaskArg::from(&input)], TaskOptions::default())?;
        squares.extend(refs.pop());
    }
    let sum_args = squares.iter().map(TaskArg::from).collect();
    let total_ref = ctx
        .submit_task("sum", sum_args, TaskOptions::default())?
        .pop()
        .context("sum produced no output")?;

    let ids: Vec<_> = squares.iter().map(|r| r.object_id()).collect();
    let ready = ctx.wait(&ids, ids.len(), Some(args.timeout_ms)).await?;
    tracing::info!(ready = ready.ready.len(), pending = ready.pending.len(), "squares finished");

    let total = decode(&ctx.get_one(&total_ref.object_id(), Some(args.timeout_ms)).await?)?;
    println!("sum of squares below {}: {total}", args.tasks);

    let counter = ctx.create_actor("Counter", vec![TaskArg::Value(encode(0)?)], ActorOptions::default())?;
    for delta in 1..=3 {
        ctx.call_actor(&counter, "add", vec![TaskArg::Value(encode(delta)?)], 1)?;
    }
    let value_ref = ctx
        .call_actor(&counter, "get", vec![], 1)?
        .pop()
        .context("get produced no output")?;
    let value = decode(&ctx.get_one(&value_ref.object_id(), Some(args.timeout_ms)).await?)?;
    println!("counter: {value}");

    let signals = ctx
        .receive_signals(&[counter.signal_source()], Some(args.timeout_ms))
        .await?;
    println!("counter signals received: {}", signals.len());

    // Let in-flight completions settle before the snapshot.
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("{}", GlobalState::new(cluster.clone()).to_json()?);

    ctx.disconnect();
    cluster.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_layout() {
        let nodes = parse_node_layout("CPU:4; CPU:2,GPU:1").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].resources, ResourceSet::from_pairs([("CPU", 2.0), ("GPU", 1.0)]));
        assert!(parse_node_layout("CPU").is_err());
        assert!(parse_node_layout("CPU:x").is_err());
    }
}
