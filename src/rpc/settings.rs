//! Operational tuning for the RPC layer.
//!
//! All knobs are optional environment variables, read once:
//!
//! - `PLEX_RPC_MAX_REQUEST_BYTES`: per-request payload cap (262144).
//! - `PLEX_RPC_MAX_CLIENT_ROUTES` / `PLEX_RPC_MAX_SERVER_ROUTES`:
//!   in-flight limits (256; `0` disables).
//! - `PLEX_RPC_CLIENT_TIMEOUT_MS`: default per-call timeout (`0` disables).
//! - `PLEX_RPC_ORPHAN_TTL_MS`: recently-closed retention (2000).
//! - `PLEX_RPC_CLIENT_STALL_WARN_MS` / `PLEX_RPC_PENDING_LOG_MS`:
//!   diagnostic timers, off by default.

use std::time::Duration;

/// Default per-request payload cap in bytes (256 KiB).
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 262_144;
/// Default in-flight route limit on either end.
pub const DEFAULT_MAX_ROUTES: usize = 256;
/// Default recently-closed retention for orphan tolerance.
pub const DEFAULT_ORPHAN_TTL: Duration = Duration::from_millis(2000);

/// Resolved RPC settings shared by client and server.
#[derive(Debug, Clone)]
pub struct RpcSettings {
    /// Per-request payload cap in bytes.
    pub max_request_bytes: usize,
    /// Client in-flight route limit; `0` disables.
    pub max_client_routes: usize,
    /// Server in-flight route limit; `0` disables.
    pub max_server_routes: usize,
    /// Default per-call timeout; `None` disables.
    pub client_timeout: Option<Duration>,
    /// Recently-closed retention window.
    pub orphan_ttl: Duration,
    /// Diagnostic: warn once when a route has no response after this long.
    pub stall_warn: Option<Duration>,
    /// Diagnostic: log pending routes at this interval.
    pub pending_log: Option<Duration>,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_client_routes: DEFAULT_MAX_ROUTES,
            max_server_routes: DEFAULT_MAX_ROUTES,
            client_timeout: None,
            orphan_ttl: DEFAULT_ORPHAN_TTL,
            stall_warn: None,
            pending_log: None,
        }
    }
}

impl RpcSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through a key→value closure (test seam).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_request_bytes: parse_usize(&lookup, "PLEX_RPC_MAX_REQUEST_BYTES")
                .unwrap_or(defaults.max_request_bytes),
            max_client_routes: parse_usize(&lookup, "PLEX_RPC_MAX_CLIENT_ROUTES")
                .unwrap_or(defaults.max_client_routes),
            max_server_routes: parse_usize(&lookup, "PLEX_RPC_MAX_SERVER_ROUTES")
                .unwrap_or(defaults.max_server_routes),
            client_timeout: parse_millis(&lookup, "PLEX_RPC_CLIENT_TIMEOUT_MS"),
            orphan_ttl: parse_millis(&lookup, "PLEX_RPC_ORPHAN_TTL_MS")
                .unwrap_or(defaults.orphan_ttl),
            stall_warn: parse_millis(&lookup, "PLEX_RPC_CLIENT_STALL_WARN_MS"),
            pending_log: parse_millis(&lookup, "PLEX_RPC_PENDING_LOG_MS"),
        }
    }
}

fn parse_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    lookup(key).and_then(|v| v.trim().parse::<usize>().ok())
}

/// Parse a millisecond knob; `0` means disabled (`None` at call sites that
/// treat absence as disabled).
fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = RpcSettings::default();
        assert_eq!(s.max_request_bytes, 262_144);
        assert_eq!(s.max_client_routes, 256);
        assert_eq!(s.max_server_routes, 256);
        assert_eq!(s.client_timeout, None);
        assert_eq!(s.orphan_ttl, Duration::from_millis(2000));
    }

    #[test]
    fn test_lookup_overrides() {
        let s = RpcSettings::from_lookup(|key| match key {
            "PLEX_RPC_MAX_REQUEST_BYTES" => Some("1024".into()),
            "PLEX_RPC_MAX_CLIENT_ROUTES" => Some("1".into()),
            "PLEX_RPC_CLIENT_TIMEOUT_MS" => Some("250".into()),
            "PLEX_RPC_ORPHAN_TTL_MS" => Some("100".into()),
            _ => None,
        });
        assert_eq!(s.max_request_bytes, 1024);
        assert_eq!(s.max_client_routes, 1);
        assert_eq!(s.client_timeout, Some(Duration::from_millis(250)));
        assert_eq!(s.orphan_ttl, Duration::from_millis(100));
        // Untouched knobs keep defaults.
        assert_eq!(s.max_server_routes, 256);
    }

    #[test]
    fn test_zero_disables_timers_and_limits() {
        let s = RpcSettings::from_lookup(|key| match key {
            "PLEX_RPC_CLIENT_TIMEOUT_MS" => Some("0".into()),
            "PLEX_RPC_MAX_CLIENT_ROUTES" => Some("0".into()),
            _ => None,
        });
        assert_eq!(s.client_timeout, None);
        assert_eq!(s.max_client_routes, 0);
    }

    #[test]
    fn test_garbage_values_fall_back() {
        let s = RpcSettings::from_lookup(|key| match key {
            "PLEX_RPC_MAX_REQUEST_BYTES" => Some("lots".into()),
            _ => None,
        });
        assert_eq!(s.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
    }
}
