// crates/server/src/config.rs
//! Environment-driven configuration, resolved once at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::publisher::DEFAULT_THROTTLE_PERCENT;
use crate::reaper::ReaperConfig;
use crate::runner::RunnerConfig;

/// Default port for the server.
const DEFAULT_PORT: u16 = 48610;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Database file; `None` uses the platform default data directory.
    pub db_path: Option<PathBuf>,
    pub runner: RunnerConfig,
    pub reaper: ReaperConfig,
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("JOBSTREAM_PORT").unwrap_or(DEFAULT_PORT),
            db_path: std::env::var("JOBSTREAM_DB").ok().map(PathBuf::from),
            runner: RunnerConfig {
                max_concurrent_jobs: env_parse("JOBSTREAM_MAX_CONCURRENT_JOBS").unwrap_or(4),
                throttle_percent: env_parse("JOBSTREAM_THROTTLE_PERCENT")
                    .unwrap_or(DEFAULT_THROTTLE_PERCENT),
            },
            reaper: ReaperConfig {
                stall_timeout: Duration::from_secs(
                    env_parse("JOBSTREAM_STALL_TIMEOUT_SECS").unwrap_or(300),
                ),
                poll_interval: Duration::from_secs(
                    env_parse("JOBSTREAM_REAPER_POLL_SECS").unwrap_or(30),
                ),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: None,
            runner: RunnerConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.runner.throttle_percent, 5);
        assert_eq!(config.reaper.stall_timeout, Duration::from_secs(300));
    }
}
