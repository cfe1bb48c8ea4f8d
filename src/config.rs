//! Env-var-overridable configuration for dial timeout, retry policy, and
//! the idle/receive timeouts.

use std::time::Duration;

/// Tunables for connection dialing, retry, and timeout behavior. All
/// fields fall back to the documented defaults when their env var is
/// absent or fails to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub dial_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub idle_close_timeout: Duration,
    pub receive_timeout: Duration,
    /// Register to read as a write pre-check (spec §4.5: "pre-check device
    /// readiness by issuing a READ of a status register"). The protocol
    /// names no fixed status register id, so this is host-supplied; when
    /// absent the pre-check is skipped.
    pub status_register_id: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_millis(5000),
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            idle_close_timeout: Duration::from_millis(90_000),
            receive_timeout: Duration::from_millis(3000),
            status_register_id: None,
        }
    }
}

impl Config {
    /// Build a `Config` by overlaying `DIAL_TIMEOUT`, `MAX_RETRIES`,
    /// `INITIAL_BACKOFF`, and `BACKOFF_MULTIPLIER` env vars over the
    /// defaults. A present-but-unparseable var logs a warning and keeps
    /// the default rather than failing construction.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = env_u64("DIAL_TIMEOUT") {
            cfg.dial_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("MAX_RETRIES") {
            cfg.max_retries = n;
        }
        if let Some(ms) = env_u64("INITIAL_BACKOFF") {
            cfg.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(m) = env_parse::<f64>("BACKOFF_MULTIPLIER") {
            cfg.backoff_multiplier = m;
        }

        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_parse::<u64>(key)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "failed to parse env override, using default");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.dial_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.max_retries, 10);
        assert_eq!(cfg.initial_backoff, Duration::from_millis(100));
        assert_eq!(cfg.backoff_multiplier, 2.0);
        assert_eq!(cfg.idle_close_timeout, Duration::from_millis(90_000));
        assert_eq!(cfg.receive_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn unparseable_override_falls_back_to_default() {
        // SAFETY (test-only): no other test in this process reads
        // MAX_RETRIES concurrently; std::env::set_var is process-global.
        unsafe {
            std::env::set_var("MAX_RETRIES", "not-a-number");
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.max_retries, 10);
        unsafe {
            std::env::remove_var("MAX_RETRIES");
        }
    }
}
