//! # Activity Engine Configuration Validator
//!
//! Command-line tool for validating activity engine configuration across
//! environments before starting an execution node.

use activity_engine::config::{ActivityEngineConfig, ConfigManager};
use activity_engine::logging::init_structured_logging;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate activity engine configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, env = "ACTIVITY_ENGINE_ENV", default_value = "development")]
    environment: String,

    /// Configuration directory holding activity-engine[.<env>].toml
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the merged configuration
    Validate,

    /// Print the merged configuration as JSON with credentials masked
    Show,

    /// Validate and summarize a single section
    Section {
        /// Section name (engine, worker_pool, backoff, database)
        name: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // without -v the engine's environment-driven subscriber applies
    let level = match cli.verbose {
        0 => None,
        1 => Some(Level::INFO),
        2 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    };
    match level {
        Some(level) => {
            let _ = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .try_init();
        }
        None => init_structured_logging(),
    }

    let result = match &cli.command {
        Some(Commands::Validate) | None => validate(&cli),
        Some(Commands::Show) => show(&cli),
        Some(Commands::Section { name }) => section(&cli, name),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<std::sync::Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(Some(cli.config_dir.clone()), &cli.environment)
        .with_context(|| {
            format!(
                "loading configuration for '{}' from {}",
                cli.environment,
                cli.config_dir.display()
            )
        })
}

fn validate(cli: &Cli) -> Result<()> {
    println!("🔧 Validating activity engine configuration");
    println!("Environment: {}", cli.environment);
    println!("Config Directory: {}", cli.config_dir.display());
    println!();

    let manager = load(cli)?;
    let config = manager.config();
    println!("✅ Configuration loaded and validated");
    print_engine(config);
    print_worker_pool(config);
    print_backoff(config);
    print_database(config);

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn show(cli: &Cli) -> Result<()> {
    let manager = load(cli)?;
    let rendered = serde_json::to_string_pretty(&manager.debug_config())
        .context("rendering configuration as JSON")?;
    println!("{rendered}");
    Ok(())
}

fn section(cli: &Cli, name: &str) -> Result<()> {
    let manager = load(cli)?;
    let config = manager.config();
    match name.to_lowercase().replace('-', "_").as_str() {
        "engine" => print_engine(config),
        "worker_pool" => print_worker_pool(config),
        "backoff" => print_backoff(config),
        "database" => print_database(config),
        other => bail!("unknown section: {other}"),
    }
    Ok(())
}

fn print_engine(config: &ActivityEngineConfig) {
    let engine = &config.engine;
    println!("\n⚙️  engine");
    println!("   node_id: {}", engine.node_id);
    println!("   poll_interval: {:?}", engine.poll_interval());
    println!("   max_claim_attempts: {}", engine.max_claim_attempts);
    println!("   claim_timeout: {:?}", engine.claim_timeout());
    println!("   heartbeat_interval: {:?}", engine.heartbeat_interval());
    println!("   auto_resume_delay: {:?}", engine.auto_resume_delay());
}

fn print_worker_pool(config: &ActivityEngineConfig) {
    let pool = &config.worker_pool;
    println!("\n👷 worker_pool");
    println!("   default_concurrency: {}", pool.default_concurrency);
    println!(
        "   queue capacity at default concurrency: {}",
        pool.default_concurrency * pool.queue_factor
    );
    println!("   recent_failure_limit: {}", pool.recent_failure_limit);
}

fn print_backoff(config: &ActivityEngineConfig) {
    let backoff = &config.backoff;
    println!("\n⏱️  backoff");
    println!(
        "   base {}ms x{} capped at {}ms",
        backoff.base_delay_ms, backoff.multiplier, backoff.max_delay_ms
    );
    if backoff.jitter_enabled {
        println!("   jitter: ±{:.0}%", backoff.max_jitter * 100.0);
    } else {
        println!("   jitter: disabled");
    }
}

fn print_database(config: &ActivityEngineConfig) {
    let database = &config.database;
    println!("\n🗄️  database");
    match database.database_url() {
        Some(_) => println!("   url: configured"),
        None => println!("   url: not set (in-memory store only)"),
    }
    println!("   max_connections: {}", database.max_connections);
    println!("   acquire_timeout: {}s", database.acquire_timeout_seconds);
}
