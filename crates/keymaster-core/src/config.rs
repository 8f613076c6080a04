//! Runtime configuration, loaded from the environment the way
//! `SovereignConfig::from_env` does it elsewhere in this workspace: every
//! field has a sane default and an environment-variable override, so a bare
//! `KeymasterConfig::from_env()` is always usable in tests and in
//! production alike.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the transport, deploy/audit orchestrators, and fleet
/// scheduler. All timeouts are in whole seconds; all durations that cross
/// the public API are converted to [`Duration`] via the `*_duration`
/// accessors rather than exposed as raw integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeymasterConfig {
    /// TCP dial timeout. Env: `KEYMASTER_DIAL_TIMEOUT_SECS` (default 10).
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Timeout for a single remote command/exec-channel round trip. Env:
    /// `KEYMASTER_COMMAND_TIMEOUT_SECS` (default 30).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Timeout for the full SFTP deploy sequence (write, chmod, rename).
    /// Env: `KEYMASTER_SFTP_TIMEOUT_SECS` (default 60).
    #[serde(default = "default_sftp_timeout_secs")]
    pub sftp_timeout_secs: u64,

    /// Timeout for the initial host-key probe during bootstrap. Env:
    /// `KEYMASTER_HOST_KEY_PROBE_TIMEOUT_SECS` (default 5).
    #[serde(default = "default_host_key_probe_timeout_secs")]
    pub host_key_probe_timeout_secs: u64,

    /// Number of attempts the post-deploy store update makes against
    /// transient contention (§4.7: "5 attempts with jittered backoff
    /// starting ~20ms") before giving up. Env: `KEYMASTER_DEPLOY_RETRY_COUNT`
    /// (default 5).
    #[serde(default = "default_deploy_retry_count")]
    pub deploy_retry_count: u32,

    /// Base backoff delay before the jitter is applied (§4.7). Env:
    /// `KEYMASTER_DEPLOY_RETRY_BASE_MILLIS` (default 20).
    #[serde(default = "default_deploy_retry_base_millis")]
    pub deploy_retry_base_millis: u64,

    /// Maximum number of accounts a fleet run will dial concurrently (§4.9).
    /// Env: `KEYMASTER_FLEET_CONCURRENCY` (default 16).
    #[serde(default = "default_fleet_concurrency")]
    pub fleet_concurrency: usize,

    /// How long an unconfirmed bootstrap session stays `Active` before the
    /// reaper marks it `Expired` (§4.10). Env:
    /// `KEYMASTER_BOOTSTRAP_SESSION_TTL_SECS` (default 900).
    #[serde(default = "default_bootstrap_session_ttl_secs")]
    pub bootstrap_session_ttl_secs: i64,

    /// How often the bootstrap reaper sweeps for expired/orphaned sessions.
    /// Env: `KEYMASTER_REAPER_INTERVAL_SECS` (default 60).
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_dial_timeout_secs() -> u64 {
    10
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_sftp_timeout_secs() -> u64 {
    60
}
fn default_host_key_probe_timeout_secs() -> u64 {
    5
}
fn default_deploy_retry_count() -> u32 {
    5
}
fn default_deploy_retry_base_millis() -> u64 {
    20
}
fn default_fleet_concurrency() -> usize {
    16
}
fn default_bootstrap_session_ttl_secs() -> i64 {
    900
}
fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for KeymasterConfig {
    fn default() -> Self {
        KeymasterConfig {
            dial_timeout_secs: default_dial_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            sftp_timeout_secs: default_sftp_timeout_secs(),
            host_key_probe_timeout_secs: default_host_key_probe_timeout_secs(),
            deploy_retry_count: default_deploy_retry_count(),
            deploy_retry_base_millis: default_deploy_retry_base_millis(),
            fleet_concurrency: default_fleet_concurrency(),
            bootstrap_session_ttl_secs: default_bootstrap_session_ttl_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl KeymasterConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = KeymasterConfig::default();
        if let Some(v) = env_u64("KEYMASTER_DIAL_TIMEOUT_SECS") {
            cfg.dial_timeout_secs = v;
        }
        if let Some(v) = env_u64("KEYMASTER_COMMAND_TIMEOUT_SECS") {
            cfg.command_timeout_secs = v;
        }
        if let Some(v) = env_u64("KEYMASTER_SFTP_TIMEOUT_SECS") {
            cfg.sftp_timeout_secs = v;
        }
        if let Some(v) = env_u64("KEYMASTER_HOST_KEY_PROBE_TIMEOUT_SECS") {
            cfg.host_key_probe_timeout_secs = v;
        }
        if let Some(v) = std::env::var("KEYMASTER_DEPLOY_RETRY_COUNT").ok().and_then(|s| s.parse().ok()) {
            cfg.deploy_retry_count = v;
        }
        if let Some(v) = env_u64("KEYMASTER_DEPLOY_RETRY_BASE_MILLIS") {
            cfg.deploy_retry_base_millis = v;
        }
        if let Some(v) = std::env::var("KEYMASTER_FLEET_CONCURRENCY").ok().and_then(|s| s.parse().ok()) {
            cfg.fleet_concurrency = v;
        }
        if let Some(v) = std::env::var("KEYMASTER_BOOTSTRAP_SESSION_TTL_SECS").ok().and_then(|s| s.parse().ok()) {
            cfg.bootstrap_session_ttl_secs = v;
        }
        if let Some(v) = env_u64("KEYMASTER_REAPER_INTERVAL_SECS") {
            cfg.reaper_interval_secs = v;
        }
        cfg
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn sftp_timeout(&self) -> Duration {
        Duration::from_secs(self.sftp_timeout_secs)
    }

    pub fn host_key_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.host_key_probe_timeout_secs)
    }

    pub fn deploy_retry_base(&self) -> Duration {
        Duration::from_millis(self.deploy_retry_base_millis)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = KeymasterConfig::default();
        assert_eq!(cfg.dial_timeout_secs, 10);
        assert_eq!(cfg.command_timeout_secs, 30);
        assert_eq!(cfg.sftp_timeout_secs, 60);
        assert_eq!(cfg.host_key_probe_timeout_secs, 5);
        assert_eq!(cfg.deploy_retry_count, 5);
        assert_eq!(cfg.deploy_retry_base_millis, 20);
        assert_eq!(cfg.fleet_concurrency, 16);
        assert_eq!(cfg.bootstrap_session_ttl_secs, 900);
    }

    #[test]
    fn unset_env_falls_back_to_defaults() {
        std::env::remove_var("KEYMASTER_DIAL_TIMEOUT_SECS");
        let cfg = KeymasterConfig::from_env();
        assert_eq!(cfg.dial_timeout_secs, default_dial_timeout_secs());
    }
}
