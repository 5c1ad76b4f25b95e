//! Runtime configuration (§6: the full list of knobs named in spec.md).
//!
//! Plain struct + `Default`, no config-file crate: the teacher's own
//! binaries read configuration from `std::env::var` with `unwrap_or_else`
//! fallbacks rather than a config-loading crate, and `cadence` follows that.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// §4.D: default tick period, jittered +/-10% by the caller.
    pub tick_interval: Duration,
    /// §4.D step 2: max tasks considered per tick.
    pub tick_batch_limit: usize,
    /// §4.D `fire_all_missed`: max due-work rows inserted per task per tick.
    pub tick_catchup_cap: usize,
    /// §4.E: lease visibility timeout.
    pub default_visibility: chrono::Duration,
    pub default_max_attempts: u32,
    pub default_base_delay: chrono::Duration,
    pub default_max_delay: chrono::Duration,
    pub default_jitter: f64,
    /// §4.J step 4: per-step tool-call timeout absent an explicit `step.timeout`.
    pub default_step_timeout: Duration,
    /// §4.F: sibling worker tasks run per process.
    pub worker_concurrency: usize,
    /// §4.E: heartbeat every `visibility / lease_heartbeat_ratio`.
    pub lease_heartbeat_ratio: u32,
    /// Ambient: connection string for `PostgresStore`/`SqliteStore`, and the
    /// HTTP bind address for `cadence-server`. Neither is named in spec.md's
    /// core but both are needed to run the system end to end.
    pub database_url: String,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            tick_batch_limit: 512,
            tick_catchup_cap: 64,
            default_visibility: chrono::Duration::seconds(60),
            default_max_attempts: 5,
            default_base_delay: chrono::Duration::seconds(1),
            default_max_delay: chrono::Duration::seconds(300),
            default_jitter: 0.2,
            default_step_timeout: Duration::from_secs(30),
            worker_concurrency: 4,
            lease_heartbeat_ratio: 3,
            database_url: "sqlite::memory:".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Config {
    /// Reads every knob from its `CADENCE_*` environment variable, falling
    /// back to the documented default when unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tick_interval: env_secs("CADENCE_TICK_INTERVAL_SECS", defaults.tick_interval),
            tick_batch_limit: env_usize("CADENCE_TICK_BATCH_LIMIT", defaults.tick_batch_limit),
            tick_catchup_cap: env_usize("CADENCE_TICK_CATCHUP_CAP", defaults.tick_catchup_cap),
            default_visibility: env_chrono_secs("CADENCE_DEFAULT_VISIBILITY_SECS", defaults.default_visibility),
            default_max_attempts: env_u32("CADENCE_DEFAULT_MAX_ATTEMPTS", defaults.default_max_attempts),
            default_base_delay: env_chrono_secs("CADENCE_DEFAULT_BASE_DELAY_SECS", defaults.default_base_delay),
            default_max_delay: env_chrono_secs("CADENCE_DEFAULT_MAX_DELAY_SECS", defaults.default_max_delay),
            default_jitter: env_f64("CADENCE_DEFAULT_JITTER", defaults.default_jitter),
            default_step_timeout: env_secs("CADENCE_DEFAULT_STEP_TIMEOUT_SECS", defaults.default_step_timeout),
            worker_concurrency: env_usize("CADENCE_WORKER_CONCURRENCY", defaults.worker_concurrency),
            lease_heartbeat_ratio: env_u32("CADENCE_LEASE_HEARTBEAT_RATIO", defaults.lease_heartbeat_ratio),
            database_url: std::env::var("CADENCE_DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: std::env::var("CADENCE_BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.default_visibility
            .to_std()
            .unwrap_or(Duration::from_secs(60))
            / self.lease_heartbeat_ratio.max(1)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_chrono_secs(key: &str, default: chrono::Duration) -> chrono::Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(chrono::Duration::seconds)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.tick_batch_limit, 512);
        assert_eq!(cfg.tick_catchup_cap, 64);
        assert_eq!(cfg.default_max_attempts, 5);
        assert_eq!(cfg.default_jitter, 0.2);
    }

    #[test]
    fn heartbeat_interval_divides_visibility_by_ratio() {
        let cfg = Config {
            default_visibility: chrono::Duration::seconds(60),
            lease_heartbeat_ratio: 3,
            ..Config::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(20));
    }
}
