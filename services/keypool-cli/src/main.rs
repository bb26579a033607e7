//! Key pool command-line front-end
//!
//! Single binary over a file-backed key pool, for shell scripts and operators:
//! 1. Loads config and key material
//! 2. Restores pool state from the storage file
//! 3. Runs one command (select a key, report an outcome, inspect, reset)
//! 4. Flushes state back to the storage file on exit

mod config;
mod error;
mod metrics;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use key_pool::{ErrorResponse, FileStorage, KeyPool, SystemClock, fingerprint};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::Error as CliError;

/// Exit code when every key is dead.
const EXIT_EXHAUSTED: u8 = 3;

const USAGE: &str = "keypool [--config PATH] <status|next|ok KEY|fail KEY STATUS [RETRY_AFTER_SECS]|reset|metrics>";

/// A single CLI invocation
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status,
    Next,
    Ok { key: String },
    Fail { key: String, response: ErrorResponse },
    Reset,
    Metrics,
}

/// Parsed arguments: optional `--config` value plus the command.
#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    config_path: Option<String>,
    command: Command,
}

fn parse_args(args: &[String]) -> error::Result<Invocation> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter
                .next()
                .ok_or_else(|| CliError::Usage("--config requires a path".into()))?;
            config_path = Some(value.clone());
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        [] | ["status"] => Command::Status,
        ["next"] => Command::Next,
        ["ok", key] => Command::Ok {
            key: key.to_string(),
        },
        ["fail", key, status] => Command::Fail {
            key: key.to_string(),
            response: parse_failure(status, None)?,
        },
        ["fail", key, status, retry_after] => Command::Fail {
            key: key.to_string(),
            response: parse_failure(status, Some(*retry_after))?,
        },
        ["reset"] => Command::Reset,
        ["metrics"] => Command::Metrics,
        [cmd @ ("ok" | "fail" | "status" | "next" | "reset" | "metrics"), ..] => {
            return Err(CliError::Usage(format!("{cmd}: {USAGE}")));
        }
        [other, ..] => return Err(CliError::UnknownCommand(other.to_string())),
    };

    Ok(Invocation {
        config_path,
        command,
    })
}

/// `network` means no response at all; anything else must be an HTTP status.
fn parse_failure(status: &str, retry_after: Option<&str>) -> error::Result<ErrorResponse> {
    let mut response = if status == "network" {
        ErrorResponse::network()
    } else {
        let code: u16 = status
            .parse()
            .map_err(|_| CliError::Usage(format!("invalid status {status:?}: {USAGE}")))?;
        ErrorResponse::from_status(code)
    };
    if let Some(secs) = retry_after {
        response = response.with_header("retry-after", secs);
    }
    Ok(response)
}

/// Accept either the raw key or its fingerprint, so keys need not appear in
/// shell history.
fn resolve_key(keys: &[String], arg: &str) -> error::Result<String> {
    keys.iter()
        .find(|k| k.as_str() == arg || fingerprint(k) == arg)
        .cloned()
        .ok_or(CliError::UnknownKey)
}

fn execute(
    pool: &KeyPool,
    keys: &[String],
    command: &Command,
    prometheus: Option<&PrometheusHandle>,
    out: &mut impl Write,
) -> Result<ExitCode> {
    match command {
        Command::Status => {
            writeln!(out, "{}", serde_json::to_string_pretty(&pool.health())?)?;
        }
        Command::Next => match pool.get_key() {
            Some(key) => writeln!(out, "{key}")?,
            None => {
                writeln!(out, "{}", serde_json::json!({"error": "pool_exhausted", "stats": pool.stats()}))?;
                return Ok(ExitCode::from(EXIT_EXHAUSTED));
            }
        },
        Command::Ok { key } => {
            let key = resolve_key(keys, key)?;
            pool.mark_success(&key);
            writeln!(out, "{}", serde_json::to_string(&pool.stats())?)?;
        }
        Command::Fail { key, response } => {
            let key = resolve_key(keys, key)?;
            let classification = pool.classify_error(response);
            pool.mark_failed(&key, &classification);
            writeln!(out, "{}", serde_json::to_string(&classification)?)?;
        }
        Command::Reset => {
            pool.reset().context("failed to clear pool storage")?;
            info!("persisted pool state cleared");
            writeln!(out, "{}", serde_json::json!({"reset": true}))?;
        }
        Command::Metrics => {
            let handle = prometheus.context("metrics recorder not installed")?;
            write!(out, "{}", handle.render())?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries command output for scripts.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    // Installed before the pool exists so its initial gauges are recorded.
    let prometheus = match invocation.command {
        Command::Metrics => Some(metrics::install_recorder()?),
        _ => None,
    };

    let config_path = Config::resolve_path(invocation.config_path.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        storage = %config.storage.path.display(),
        keys = config.resolved_keys.len(),
        "configuration loaded"
    );

    let storage = FileStorage::open(&config.storage.path).with_context(|| {
        format!(
            "failed to open pool storage at {}",
            config.storage.path.display()
        )
    })?;
    let keys = config.key_list();
    let pool = KeyPool::with_options(
        keys.clone(),
        Arc::new(storage),
        config.pool.clone(),
        Arc::new(SystemClock),
    )
    .context("failed to build key pool")?;

    let stdout = std::io::stdout();
    let code = execute(
        &pool,
        &keys,
        &invocation.command,
        prometheus.as_ref(),
        &mut stdout.lock(),
    )?;
    pool.flush();
    Ok(code)
}
