//! Command-line interface for meshkit.
//!
//! Provides commands for checking and running simulated service
//! topologies and for inspecting the resolved configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, RuntimeConfig};
use crate::core::{Runtime, ServiceRegistry, Topology};

/// meshkit - In-process service orchestration runtime
#[derive(Parser, Debug)]
#[command(name = "meshkit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a topology and print its load order
    Check {
        /// Topology YAML file
        topology: PathBuf,
    },

    /// Run a topology's scripted calls against simulated services
    Run {
        /// Topology YAML file
        topology: PathBuf,

        /// Config file (overrides discovery of .meshkit/config.yaml)
        #[arg(short, long, env = "MESHKIT_CONFIG")]
        config: Option<PathBuf>,

        /// Do not read or write the runtime snapshot
        #[arg(long)]
        no_snapshot: bool,

        /// Print the final runtime snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Check { topology } => check_topology(&topology),
            Commands::Run {
                topology,
                config,
                no_snapshot,
                json,
            } => run_topology(&topology, config, no_snapshot, json).await,
            Commands::Config => show_config(),
        }
    }
}

fn load_topology(path: &Path) -> Result<Topology> {
    let topology = Topology::from_file(path)?;
    topology
        .validate()
        .with_context(|| format!("Invalid topology: {}", path.display()))?;
    Ok(topology)
}

/// Register every service and print the load order
fn check_topology(path: &Path) -> Result<()> {
    let topology = load_topology(path)?;

    let registry = ServiceRegistry::default();
    for definition in topology.definitions() {
        registry.register(definition)?;
    }
    let order = registry.load_order()?;

    println!("Topology: {}", display_name(&topology, path));
    println!("Services: {}", topology.services.len());
    println!("Scripted calls: {}", topology.calls.len());
    println!();
    println!("Load order:");
    for (i, name) in order.iter().enumerate() {
        let Some(service) = topology.get_service(name) else {
            continue;
        };
        let mut flags = Vec::new();
        if service.critical {
            flags.push("critical");
        }
        if !service.lazy {
            flags.push("eager");
        }
        println!(
            "  {:>2}. {:<24} priority {:<4} {}",
            i + 1,
            name,
            service.priority,
            flags.join(", ")
        );
    }

    Ok(())
}

/// Start a runtime, execute the scripted calls, print the outcome
async fn run_topology(
    path: &Path,
    config_path: Option<PathBuf>,
    no_snapshot: bool,
    json: bool,
) -> Result<()> {
    let topology = load_topology(path)?;

    let mut runtime_config: RuntimeConfig = match config_path {
        Some(ref p) => config::load_config_from(p)?,
        None => config::config()?.clone(),
    };
    if no_snapshot {
        runtime_config.snapshot.enabled = false;
    }

    let runtime = Runtime::new(runtime_config);
    for definition in topology.definitions() {
        runtime.register(definition)?;
    }

    let report = runtime.start().await?;
    eprintln!(
        "[Loaded {} critical service(s), {} failed]",
        report.loaded.len(),
        report.failed.len()
    );
    for failure in &report.failed {
        eprintln!("  {}: {}", failure.service, failure.error);
    }

    println!("{:<36} {:<8} {:<12}", "CALL", "RESULT", "DETAIL");
    println!("{}", "-".repeat(80));
    for call in &topology.calls {
        for i in 0..call.count {
            let target = format!("{}.{} #{}", call.service, call.method, i + 1);
            match runtime
                .mesh()
                .call(&call.service, &call.method, call.args.clone(), call.options())
                .await
            {
                Ok(value) => println!("{:<36} {:<8} {}", target, "ok", value),
                Err(e) => println!("{:<36} {:<8} {}", target, e.kind(), e),
            }
        }
    }

    let metrics = runtime.mesh().aggregate_metrics().await;
    let snapshot = runtime.snapshot();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?
        );
    } else {
        println!();
        println!("Health:");
        let mut health: Vec<_> = snapshot.health.iter().collect();
        health.sort_by(|a, b| a.0.cmp(b.0));
        for (name, status) in health {
            match &status.error {
                Some(err) => println!("  {:<24} {} ({})", name, status.state, err),
                None => println!("  {:<24} {}", name, status.state),
            }
        }

        println!();
        println!(
            "{:<24} {:>8} {:>8} {:>8} {:>10} {:>8}",
            "SERVICE", "CALLS", "OK", "FAILED", "AVG MS", "RETRIES"
        );
        for (name, service) in &metrics.services {
            println!(
                "{:<24} {:>8} {:>8} {:>8} {:>10.1} {:>8}",
                name,
                service.total_requests,
                service.successful,
                service.failed,
                service.average_duration_ms,
                service.retries
            );
        }

        println!();
        println!("Circuits:");
        for (name, breaker) in &snapshot.circuits {
            println!(
                "  {:<24} {:<10} failures {} trips {}",
                name, breaker.state, breaker.failures, breaker.trips
            );
        }

        println!();
        println!("Dead letters: {}", snapshot.dead_letters.len());
        for entry in &snapshot.dead_letters {
            println!(
                "  {} {} ({})",
                entry.event.id, entry.event.event_type, entry.error
            );
        }
    }

    runtime.shutdown().await
}

fn display_name(topology: &Topology, path: &Path) -> String {
    if topology.name.is_empty() {
        path.display().to_string()
    } else {
        topology.name.clone()
    }
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("meshkit configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home:        {}", cfg.home.display());
    println!(
        "Snapshot:    {}{}",
        cfg.snapshot_path().display(),
        if cfg.snapshot.enabled { "" } else { " (disabled)" }
    );
    println!();
    println!(
        "{}",
        serde_yaml::to_string(cfg).context("Failed to render configuration")?
    );

    Ok(())
}
