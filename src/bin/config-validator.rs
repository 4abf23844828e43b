//! # Workbus Configuration Validator
//!
//! Loads the layered configuration the same way the bus does and prints the
//! effective result, credentials masked. Exits non-zero when loading or
//! validation fails.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process;
use workbus::config::ConfigManager;
use workbus::logging::init_structured_logging;

#[derive(Debug, Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate Workbus configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Environment to load (defaults to WORKBUS_ENV, then development)
    #[arg(short, long)]
    environment: Option<String>,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// How to print the effective configuration
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Only the validation summary
    Summary,
    /// The full configuration as JSON, then the summary
    Json,
}

fn run(cli: Cli) -> Result<()> {
    println!("🔧 Validating Workbus Configuration");

    let manager = match &cli.environment {
        Some(environment) => {
            ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)
        }
        None => ConfigManager::load_from_directory(cli.config_dir.clone()),
    }
    .context("failed to load configuration")?;

    println!("Environment: {}", manager.environment());
    println!("Config Directory: {}", manager.config_directory().display());

    if cli.format == OutputFormat::Json {
        println!();
        println!(
            "{}",
            serde_json::to_string_pretty(&manager.debug_config())
                .context("failed to render configuration")?
        );
    }

    println!();
    println!("✅ Configuration valid");
    println!(
        "   retry: {} attempts, {}ms base delay",
        manager.config().retry.max_retries,
        manager.config().retry.base_delay_ms
    );
    println!(
        "   saga lock lease: {:?}",
        manager.config().saga.lock_lease()
    );
    println!(
        "   circuit breaker overrides: {}",
        manager.config().circuit_breakers.components.len()
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_structured_logging();

    if let Err(e) = run(cli) {
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}
