use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

pub const ENV_SETTLE_WINDOW_MS: &str = "MIMA_SETTLE_WINDOW_MS";
pub const ENV_QUERY_TIMEOUT_MS: &str = "MIMA_QUERY_TIMEOUT_MS";
pub const ENV_MAX_CACHED_DOMAINS: &str = "MIMA_MAX_CACHED_DOMAINS";

/// Tunables of the sync engine. Only these keys are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub settle_window_ms: u64,
    pub query_timeout_ms: u64,
    pub max_cached_domains: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_window_ms: 400,
            query_timeout_ms: 3_000,
            max_cached_domains: 500,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CoreError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Applies `MIMA_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = parse_override(&lookup, ENV_SETTLE_WINDOW_MS)? {
            self.settle_window_ms = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_QUERY_TIMEOUT_MS)? {
            self.query_timeout_ms = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_MAX_CACHED_DOMAINS)? {
            self.max_cached_domains = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.settle_window_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "settle_window_ms must be positive".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "query_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_cached_domains == 0 {
            return Err(CoreError::InvalidConfig(
                "max_cached_domains must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    #[must_use]
    pub fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_cached_domains).unwrap_or(NonZeroUsize::MIN)
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| CoreError::InvalidConfig(format!("{key}={trimmed:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.settle_window(), Duration::from_millis(400));
        assert_eq!(config.query_timeout(), Duration::from_secs(3));
        assert_eq!(config.cache_capacity().get(), 500);
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let config = SyncConfig::from_toml_str("query_timeout_ms = 1500\n").expect("parse");
        assert_eq!(config.query_timeout_ms, 1_500);
        assert_eq!(config.settle_window_ms, 400);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SyncConfig::from_toml_str("retry_forever = true\n").expect_err("unknown");
        assert!(matches!(err, CoreError::Toml(_)));
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(SyncConfig::from_toml_str("max_cached_domains = 0\n").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            (ENV_SETTLE_WINDOW_MS, "50"),
            (ENV_MAX_CACHED_DOMAINS, " 12 "),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::default()
            .with_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .expect("overrides");
        assert_eq!(config.settle_window_ms, 50);
        assert_eq!(config.max_cached_domains, 12);
        assert_eq!(config.query_timeout_ms, 3_000);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let err = SyncConfig::default()
            .with_overrides(|key| (key == ENV_QUERY_TIMEOUT_MS).then(|| "soon".to_string()))
            .expect_err("not a number");
        assert!(err.to_string().contains(ENV_QUERY_TIMEOUT_MS));
    }
}
