//! Replay a captured event log through a coordinator.
//!
//! Usage: `mise-replay --config <path> --events <jsonl>`
//!
//! Every line of the log is one push payload carrying its event type in
//! `"type"`. Lines are emitted in order on an in-process channel over an
//! in-memory cache; pending batches are flushed on shutdown and the final
//! counters are printed as JSON.

use mise_cache::InMemoryCacheStore;
use mise_core::{ConfigError, EventType, MiseResult, SyncConfig};
use mise_sync::{init_tracing, LocalPushChannel, SyncCoordinator, TelemetryConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(err) = init_tracing(&TelemetryConfig::default()) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Replay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> MiseResult<()> {
    let config = SyncConfig::load()?;
    let events_path = events_path_from_args().ok_or_else(|| ConfigError::MissingRequired {
        field: "--events".to_string(),
    })?;
    let lines = read_lines(&events_path)?;

    let channel = Arc::new(LocalPushChannel::new());
    let store = Arc::new(InMemoryCacheStore::new());
    let coordinator = SyncCoordinator::spawn(&config, channel.clone(), store.clone())?;

    let mut emitted = 0usize;
    for (index, line) in lines.iter().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let payload: Value = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping unparseable line");
                continue;
            }
        };
        let Some(event_type) = payload.get("type").and_then(Value::as_str) else {
            warn!(line = line_no, "Skipping line without a type");
            continue;
        };
        channel.emit(&EventType::new(event_type), &payload);
        emitted += 1;
        // Let the loop take the event before the next emission.
        tokio::task::yield_now().await;
    }

    let stats = coordinator.shutdown().await?;
    info!(
        emitted,
        flushes = stats.flushes,
        entries = store.stats()?.entry_count,
        "Replay complete"
    );

    match serde_json::to_string_pretty(&stats) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => warn!(error = %e, "Failed to render stats"),
    }
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<String>, ConfigError> {
    std::fs::read_to_string(path)
        .map(|contents| contents.lines().map(str::to_string).collect())
        .map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn events_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--events" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
