//! Optional JSON-line trace sinks.
//!
//! Purely observational: when `PLEX_RPC_TRACE` or `PLEX_POOL_TRACE` is set
//! to a non-empty value, matching events are written as one JSON object
//! per line, to stderr or to the file named by `PLEX_RPC_TRACE_PATH` /
//! `PLEX_POOL_TRACE_PATH`. Never affects call semantics.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

enum Sink {
    Disabled,
    Stderr,
    File(Mutex<File>),
}

fn sink_for(enable_key: &str, path_key: &str) -> Sink {
    let enabled = std::env::var(enable_key)
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false);
    if !enabled {
        return Sink::Disabled;
    }
    match std::env::var(path_key) {
        Ok(path) if !path.is_empty() => {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Sink::File(Mutex::new(file)),
                Err(e) => {
                    tracing::warn!("trace path {} unusable ({}), using stderr", path, e);
                    Sink::Stderr
                }
            }
        }
        _ => Sink::Stderr,
    }
}

fn rpc_sink() -> &'static Sink {
    static SINK: OnceLock<Sink> = OnceLock::new();
    SINK.get_or_init(|| sink_for("PLEX_RPC_TRACE", "PLEX_RPC_TRACE_PATH"))
}

fn pool_sink() -> &'static Sink {
    static SINK: OnceLock<Sink> = OnceLock::new();
    SINK.get_or_init(|| sink_for("PLEX_POOL_TRACE", "PLEX_POOL_TRACE_PATH"))
}

fn emit(sink: &Sink, event: &impl Serialize) {
    let line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(_) => return,
    };
    match sink {
        Sink::Disabled => {}
        Sink::Stderr => eprintln!("{}", line),
        Sink::File(file) => {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{}", line);
            }
        }
    }
}

/// True when the RPC trace sink is active; callers skip building events
/// otherwise.
pub(crate) fn rpc_enabled() -> bool {
    !matches!(rpc_sink(), Sink::Disabled)
}

/// Emit an RPC-layer trace event when tracing is enabled.
pub(crate) fn rpc_event(event: &impl Serialize) {
    let sink = rpc_sink();
    if !matches!(sink, Sink::Disabled) {
        emit(sink, event);
    }
}

/// Emit a pool-layer trace event when tracing is enabled.
pub(crate) fn pool_event(event: &impl Serialize) {
    let sink = pool_sink();
    if !matches!(sink, Sink::Disabled) {
        emit(sink, event);
    }
}
