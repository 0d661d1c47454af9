//! # mvkv command line
//!
//! Runs single operations against a durable mvkv data directory. Each invocation opens the
//! engine, performs one command in its own transaction or snapshot, flushes and exits.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use mvkv::{BackendConfig, Condition, Engine, EngineConfig, SledBackend, StorageError};

/// Serializable MVCC key-value store.
#[derive(Parser, Debug)]
#[command(name = "mvkv", version, about = "Serializable MVCC key-value store")]
struct Args {
    /// Directory holding the sled database.
    #[arg(long, default_value = "default.mvkv")]
    data_dir: PathBuf,

    /// JSON engine configuration; omitted fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 256)]
    cache_size_mb: u64,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value of a key.
    Get { key: String },

    /// Set a key.
    Put { key: String, value: String },

    /// Delete a key.
    Delete { key: String },

    /// Print the pairs matching one bound, ascending for --gt/--gte and descending for --lt/--lte.
    Scan(ScanArgs),

    /// Print engine statistics as JSON.
    Stats,

    /// Run garbage collection steps and print each report as JSON.
    Gc {
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
}

#[derive(ClapArgs, Debug)]
struct ScanArgs {
    #[arg(long)]
    gt: Option<String>,

    #[arg(long)]
    gte: Option<String>,

    #[arg(long)]
    lt: Option<String>,

    #[arg(long)]
    lte: Option<String>,

    /// Stop after this many pairs.
    #[arg(long)]
    limit: Option<usize>,
}

impl ScanArgs {
    fn condition(&self) -> anyhow::Result<Condition> {
        match (&self.gt, &self.gte, &self.lt, &self.lte) {
            (Some(k), None, None, None) => Ok(Condition::gt(k.as_str())),
            (None, Some(k), None, None) => Ok(Condition::gte(k.as_str())),
            (None, None, Some(k), None) => Ok(Condition::lt(k.as_str())),
            (None, None, None, Some(k)) => Ok(Condition::lte(k.as_str())),
            _ => anyhow::bail!("exactly one of --gt, --gte, --lt, --lte is required"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let backend = BackendConfig {
        data_dir: args.data_dir.clone(),
        cache_size_mb: args.cache_size_mb,
        ..BackendConfig::default()
    };

    let engine = Engine::open_sled(backend, config)
        .with_context(|| format!("opening {}", args.data_dir.display()))?;
    run(&engine, &args.command)?;
    engine.flush()?;
    Ok(())
}

fn run(engine: &Engine<SledBackend>, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Get { key } => {
            let value = engine.snapshot(|snap| snap.get(key.as_bytes()))?;
            match value {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => anyhow::bail!("key not found: {}", key),
            }
        }
        Command::Put { key, value } => {
            engine.transact(|tx| tx.put(key.as_str(), value.as_str()))?;
            info!(version = engine.current_version(), "Put committed");
        }
        Command::Delete { key } => {
            let existed = engine.transact(|tx| {
                let existed = tx.get(key.as_bytes())?.is_some();
                if existed {
                    tx.delete(key.as_str())?;
                }
                Ok::<_, StorageError>(existed)
            })?;
            if !existed {
                anyhow::bail!("key not found: {}", key);
            }
        }
        Command::Scan(scan) => {
            let condition = scan.condition()?;
            let limit = scan.limit.unwrap_or(usize::MAX);
            let pairs = engine.snapshot(|snap| {
                snap.query(condition.clone())
                    .take(limit)
                    .collect::<Result<Vec<_>, StorageError>>()
            })?;
            for (key, value) in pairs {
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
        }
        Command::Stats => {
            let stats = engine.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Gc { steps } => {
            for _ in 0..*steps {
                let report = engine.collect_garbage()?;
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }
    Ok(())
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {}. Using 'warn'", log_level);
            EnvFilter::new("warn")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
