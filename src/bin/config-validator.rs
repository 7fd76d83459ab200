//! # Agentflow Configuration Validator
//!
//! Command-line tool that loads an engine configuration file, validates it,
//! and prints the resulting phase plan. Catches plan mistakes (unknown
//! stages, stages in two phases, zero thresholds) before a worker starts.

use agentflow_core::config::{AgentflowConfig, ConfigManager};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "agentflow-config-validator")]
#[command(about = "Validate agentflow engine configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (TOML); falls back to AGENTFLOW_CONFIG_PATH
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment name exported as AGENTFLOW_ENV while loading
    #[arg(short, long)]
    environment: Option<String>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the whole configuration and print the phase plan
    All,

    /// Show one configuration section
    Component {
        /// circuit_breaker, execution, retry, stages, phases, worker or workflow
        name: String,
    },

    /// Print the phase plan only
    Plan,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = load(&cli).and_then(|config| match &cli.command {
        Some(Commands::All) | None => validate_all(&cli, &config),
        Some(Commands::Component { name }) => show_component(&cli, &config, name),
        Some(Commands::Plan) => show_plan(&cli, &config),
    });

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            println!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<AgentflowConfig> {
    if let Some(environment) = &cli.environment {
        std::env::set_var("AGENTFLOW_ENV", environment);
    }

    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigManager::load().context("loading configuration from environment")?,
    };

    println!("🔧 Validating agentflow configuration");
    println!("Environment: {}", manager.environment());
    if let Some(path) = manager.config_path() {
        println!("Config file: {}", path.display());
    }
    println!();

    Ok(manager.config().clone())
}

fn validate_all(cli: &Cli, config: &AgentflowConfig) -> Result<()> {
    println!("✅ Configuration loaded and validated");
    println!(
        "   circuit breaker threshold: {}",
        config.circuit_breaker.failure_threshold
    );
    println!(
        "   stage timeout: {}ms (max {}ms), orchestrator attempts: {}",
        config.execution.stage_timeout_ms,
        config.execution.max_stage_timeout_ms,
        config.execution.orchestrator_attempts
    );
    println!("   stages declared: {}", config.stages.len());

    let unphased: Vec<&str> = config
        .stages
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| !config.phases.iter().any(|p| p.stages.iter().any(|s| s == id)))
        .collect();
    if !unphased.is_empty() {
        println!("   ℹ️  stages outside any phase (workflow-only): {}", unphased.join(", "));
    }

    println!();
    show_plan(cli, config)?;

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn show_plan(cli: &Cli, config: &AgentflowConfig) -> Result<()> {
    if cli.format == "json" {
        println!("{}", serde_json::to_string_pretty(&config.phases)?);
        return Ok(());
    }

    println!("📋 Phase plan:");
    if config.phases.is_empty() {
        println!("   (no phases configured)");
    }
    for (index, phase) in config.phases.iter().enumerate() {
        println!(
            "   {}. {}{} → {}",
            index + 1,
            phase.name,
            if phase.critical { " [critical]" } else { "" },
            phase.stages.join(", ")
        );
    }
    Ok(())
}

fn show_component(cli: &Cli, config: &AgentflowConfig, name: &str) -> Result<()> {
    let value = match name.to_lowercase().replace('-', "_").as_str() {
        "circuit_breaker" | "circuit_breakers" => serde_json::to_value(&config.circuit_breaker)?,
        "execution" => serde_json::to_value(&config.execution)?,
        "retry" => serde_json::to_value(&config.retry)?,
        "stages" => serde_json::to_value(&config.stages)?,
        "phases" => serde_json::to_value(&config.phases)?,
        "worker" => serde_json::to_value(&config.worker)?,
        "workflow" => serde_json::to_value(&config.workflow)?,
        _ => bail!("Unknown component: {name}"),
    };

    if cli.format == "json" {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("✅ Component '{name}' is valid:");
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
