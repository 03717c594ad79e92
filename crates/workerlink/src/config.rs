//! Connection tuning.

use std::time::Duration;

const DEFAULT_SHUTDOWN_YIELD: Duration = Duration::from_millis(10);

pub const SHUTDOWN_YIELD_ENV: &str = "WORKERLINK_SHUTDOWN_YIELD_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Pause after posting a terminate-class token before local teardown,
    /// so the peer's reply can still be delivered.
    pub shutdown_yield: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self {
            shutdown_yield: DEFAULT_SHUTDOWN_YIELD,
        }
    }

    pub fn with_shutdown_yield(mut self, shutdown_yield: Duration) -> Self {
        self.shutdown_yield = shutdown_yield;
        self
    }

    /// Defaults overridden by `WORKERLINK_SHUTDOWN_YIELD_MS` when it parses.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(raw) = lookup(SHUTDOWN_YIELD_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.shutdown_yield = Duration::from_millis(ms),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring invalid {SHUTDOWN_YIELD_ENV}")
                }
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_yield() {
        assert_eq!(LinkConfig::default().shutdown_yield, Duration::from_millis(10));
    }

    #[test]
    fn builder_overrides() {
        let config = LinkConfig::new().with_shutdown_yield(Duration::ZERO);
        assert_eq!(config.shutdown_yield, Duration::ZERO);
    }

    #[test]
    fn env_override() {
        let config = LinkConfig::from_lookup(|key| {
            (key == SHUTDOWN_YIELD_ENV).then(|| " 25 ".to_string())
        });
        assert_eq!(config.shutdown_yield, Duration::from_millis(25));
    }

    #[test]
    fn invalid_env_falls_back() {
        let config = LinkConfig::from_lookup(|_| Some("soon".to_string()));
        assert_eq!(config, LinkConfig::new());
    }
}
