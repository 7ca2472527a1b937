//! Command-line interface for inspecting and maintaining a call cache

use crate::tracing::{LogLevel, TracingFormat};
use calltape_cache::{
    CacheConfig, CallCache, CallRecord, Error, Fingerprint, FlatFileBackend, RecacheFilter,
};
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

/// Inspect and maintain calltape record/replay caches.
#[derive(Parser, Debug)]
#[command(name = "calltape")]
#[command(about = "Inspect and maintain calltape record/replay caches")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Cache directory (defaults to CALLTAPE_CACHE_DIR, then the user cache dir).
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Logging verbosity level.
    #[arg(
        short = 'L',
        long,
        global = true,
        default_value = "warn",
        value_enum
    )]
    pub log_level: LogLevel,

    /// Log output format.
    #[arg(long, global = true, default_value = "compact", value_enum)]
    pub log_format: TracingFormat,

    /// Tracing filter directives, overriding RUST_LOG and --log-level.
    #[arg(long, global = true, value_name = "DIRECTIVES")]
    pub log_filter: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print one call record.
    Show {
        /// Fingerprint of the record
        fingerprint: String,
    },

    /// List stored call records.
    List,

    /// Delete records by method name and/or call site; no filter clears the cache.
    Recache {
        /// Only records of this method
        #[arg(long)]
        method: Option<String>,
        /// Only records whose call site contains this text
        #[arg(long)]
        source: Option<String>,
    },

    /// Drop records and seeds not referenced recently.
    #[command(group(ArgGroup::new("watermark").required(true).args(["older_than", "since"])))]
    Purge {
        /// Drop entries unused for this long (e.g. "30d", "12h")
        #[arg(long, value_parser = humantime::parse_duration)]
        older_than: Option<Duration>,
        /// Drop entries unused since this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// Delete one call record.
    Delete {
        /// Fingerprint of the record
        fingerprint: String,
    },
}

fn open_cache(cli: &Cli) -> miette::Result<CallCache<FlatFileBackend>> {
    let mut config = CacheConfig::from_env()?;
    if let Some(dir) = &cli.cache_dir {
        config = config.with_root(dir);
    }
    let cache = config.open()?;
    tracing::debug!(root = %cache.store().backend().root().display(), "Opened call cache");
    Ok(cache)
}

fn record_json(record: &CallRecord) -> serde_json::Value {
    json!({
        "fingerprint": record.fingerprint,
        "method_name": record.method_name,
        "call_site": record.call_site,
        "args": record.args,
        "kwargs": record.kwargs,
        "returnval": record.returnval,
    })
}

fn watermark(
    older_than: Option<Duration>,
    since: Option<DateTime<Utc>>,
) -> miette::Result<DateTime<Utc>> {
    match (older_than, since) {
        (_, Some(since)) => Ok(since),
        (Some(age), None) => {
            let age = chrono::Duration::from_std(age)
                .map_err(|e| miette::miette!("Invalid --older-than duration: {e}"))?;
            Ok(Utc::now() - age)
        }
        (None, None) => Err(miette::miette!("Either --older-than or --since is required")),
    }
}

fn pretty(value: &serde_json::Value) -> miette::Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| miette::miette!("Failed to render output: {e}"))
}

/// Execute a parsed command line
pub fn run(cli: Cli) -> miette::Result<()> {
    let mut cache = open_cache(&cli)?;

    match cli.command {
        Commands::Show { fingerprint } => {
            let fingerprint = Fingerprint::from_hex(fingerprint)?;
            let record = cache
                .fetch(&fingerprint)?
                .ok_or_else(|| Error::not_found(fingerprint.as_hex()))?;
            println!("{}", pretty(&record_json(&record))?);
        }
        Commands::List => {
            let mut rows = Vec::new();
            for fingerprint in cache.store().fingerprints()? {
                let packets = cache.store().packet_count(&fingerprint)?;
                let record = cache.store().fetch(&fingerprint)?;
                let method = record.map(|r| r.method_name);
                rows.push((fingerprint, method, packets));
            }
            if cli.json {
                let items: Vec<_> = rows
                    .iter()
                    .map(|(fp, method, packets)| {
                        json!({ "fingerprint": fp, "method_name": method, "packets": packets })
                    })
                    .collect();
                println!("{}", pretty(&json!(items))?);
            } else {
                for (fp, method, packets) in rows {
                    let method = method.as_deref().unwrap_or("<incomplete>");
                    println!("{fp}  {method}  {packets} packet(s)");
                }
            }
        }
        Commands::Recache { method, source } => {
            let filter = RecacheFilter {
                method_name: method,
                source,
            };
            let removed = cache.recache(&filter)?;
            if cli.json {
                println!("{}", json!({ "removed": removed }));
            } else {
                println!("Removed {removed} record(s)");
            }
        }
        Commands::Purge { older_than, since } => {
            let report = cache.purge(watermark(older_than, since)?)?;
            if cli.json {
                println!("{}", json!(report));
            } else {
                println!(
                    "Removed {} record(s) and {} seed(s)",
                    report.records_removed, report.seeds_removed
                );
            }
        }
        Commands::Delete { fingerprint } => {
            let fingerprint = Fingerprint::from_hex(fingerprint)?;
            if cache.store().packet_count(&fingerprint)? == 0 {
                return Err(Error::not_found(fingerprint.as_hex()).into());
            }
            cache.delete(&fingerprint)?;
            println!("Deleted {fingerprint}");
        }
    }
    Ok(())
}
