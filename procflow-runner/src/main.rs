//! procflow runner
//!
//! Runs the age-check process on an in-memory runtime and prints one JSON
//! line per started instance.
//!
//! Usage:
//!   procflow-runner                      # ages 10 and 30
//!   procflow-runner --age 17 --age 18 --var name='"Ada"'
//!
//! Config is read from `--config` / `PROCFLOW_CONFIG` (YAML), then
//! `PROCFLOW_*` environment overrides apply.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use procflow_core::constraint::Constraint;
use procflow_core::definition::GatewayKind;
use procflow_core::{EngineConfig, NodeKind, ProcessDefinition, ProcessRuntime, Value};
use serde_json::json;

const PROCESS_ID: &str = "age-check";

/// Start age-check instances and report their outcome.
#[derive(Parser, Debug)]
#[command(name = "procflow-runner", about = "Start age-check instances and report their outcome")]
struct Args {
    /// Engine config (YAML)
    #[arg(long, env = "PROCFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// One instance is started per age
    #[arg(long = "age", default_values_t = [10, 30])]
    ages: Vec<i64>,

    /// Extra start variables as name=json
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, Value)>,
}

fn parse_var(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got '{}'", raw))?;
    // Bare words are taken as strings.
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => {
            let mut config = EngineConfig::default();
            config.apply_env(|key| std::env::var(key).ok())?;
            Ok(config)
        }
    }
}

/// Start -> XOR split (age < 18 -> child, default -> adult) -> End
fn age_check() -> Result<ProcessDefinition> {
    let definition = ProcessDefinition::builder(PROCESS_ID)
        .name("Age check")
        .node(1, "start", NodeKind::start())
        .node(2, "age?", NodeKind::Split { gateway: GatewayKind::Xor })
        .node(3, "child path", NodeKind::set("path", "child"))
        .node(4, "adult path", NodeKind::set("path", "adult"))
        .node(5, "end", NodeKind::end())
        .connect(1, 2)
        .connect_when(2, 3, 1, Constraint::parse("age < 18")?)
        .connect_default(2, 4)
        .connect(3, 5)
        .connect(4, 5)
        .build()?;
    Ok(definition)
}

async fn run_one(runtime: &ProcessRuntime, vars: BTreeMap<String, Value>) -> Result<()> {
    let report = match runtime.start_process(PROCESS_ID, vars.clone()).await {
        Ok(id) => {
            let instance = runtime.get_instance(id).await?;
            json!({
                "instance": id,
                "state": instance.state(),
                "active_nodes": instance.active_nodes(),
                "variables": runtime.variables(id).await?,
            })
        }
        Err(e) => {
            tracing::warn!(process_id = PROCESS_ID, error = %e, "Start failed");
            json!({ "input": vars, "error": e.to_string() })
        }
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .init();

    let runtime = ProcessRuntime::builder().config(config).build();
    runtime.register_definition(age_check()?)?;
    runtime.init().await?;

    tracing::info!(ages = ?args.ages, "Running age check");
    for age in &args.ages {
        let mut vars: BTreeMap<String, Value> = args.vars.iter().cloned().collect();
        vars.insert("age".to_string(), json!(age));
        run_one(&runtime, vars).await?;
    }

    runtime.shutdown().await?;
    Ok(())
}
