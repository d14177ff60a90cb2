//! Larder command-line tool
//!
//! Inspects and edits a file-backed durable tier from the shell.
//!
//! ```text
//! larder --store-dir ./cache --namespace vendors set pizza-9 '{"name":"Pizza"}' --ttl-secs 60
//! larder --store-dir ./cache --namespace vendors get pizza-9
//! larder --store-dir ./cache --namespace vendors keys
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use larder::{CacheContext, FileStore, LarderConfig, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Larder - tiered cache inspection tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding durable records
    #[arg(long, env = "LARDER_STORE_DIR", default_value = ".larder")]
    store_dir: PathBuf,

    /// Cache namespace (overrides the config file)
    #[arg(long, env = "LARDER_NAMESPACE")]
    namespace: Option<String>,

    /// YAML configuration file
    #[arg(long, env = "LARDER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the JSON value stored under KEY
    Get { key: String },
    /// Store a JSON value under KEY
    Set {
        key: String,
        json: String,
        /// Time-to-live in seconds (config default when omitted)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Delete KEY
    Remove { key: String },
    /// Delete every key in the namespace
    Clear,
    /// List live keys in the namespace
    Keys,
    /// Print durable store statistics
    Stats,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => LarderConfig::from_yaml_file(path).await?,
        None => LarderConfig::default(),
    };
    if let Some(namespace) = &args.namespace {
        config.cache.namespace = namespace.clone();
    }
    config.validate()?;

    info!("Opening store at {}", args.store_dir.display());
    let store = FileStore::open(&args.store_dir).await?;
    let ctx = CacheContext::new(Arc::new(store));
    let cache = ctx.cache(config.cache)?;

    let code = match args.command {
        Command::Get { key } => match cache.get::<Value>(&key).await {
            Some(value) => {
                println!("{}", value);
                ExitCode::SUCCESS
            }
            None => {
                debug!(key = %key, "Key not found");
                ExitCode::FAILURE
            }
        },
        Command::Set {
            key,
            json,
            ttl_secs,
        } => {
            let value: Value = serde_json::from_str(&json)?;
            cache.set(&key, value, ttl_secs.map(Duration::from_secs));
            ExitCode::SUCCESS
        }
        Command::Remove { key } => {
            cache.remove(&key).await;
            ExitCode::SUCCESS
        }
        Command::Clear => {
            let removed = cache.clear_all().await;
            println!("{}", removed);
            ExitCode::SUCCESS
        }
        Command::Keys => {
            for key in cache.keys().await {
                println!("{}", key);
            }
            ExitCode::SUCCESS
        }
        Command::Stats => {
            let keys = cache.keys().await.len();
            let report = json!({
                "namespace": cache.namespace(),
                "keys": keys,
                "store": ctx.store().stats(),
                "writer": ctx.writer_stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            ExitCode::SUCCESS
        }
    };

    // Queued durable writes must land before the process exits
    ctx.shutdown().await;
    Ok(code)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "error" => "error",
        _ => "warn",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("larder={},warn", level)));

    // Logs go to stderr so command output stays pipeable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
