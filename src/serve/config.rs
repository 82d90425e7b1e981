//! Runtime configuration for the live transport.
//!
//! Values start from the defaults in `constants` and can be overridden from
//! the process environment or from a `.env` style file.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::LiveError;
use crate::serve::constants::{
    ERROR_CAPACITY, FIRST_PAINT_CACHE, OUTBOUND_CAPACITY, REPAIR_PARAM, WRITE_TIMEOUT,
};

pub const ENV_WRITE_TIMEOUT_MS: &str = "LIVE_WRITE_TIMEOUT_MS";
pub const ENV_OUTBOUND_CAPACITY: &str = "LIVE_OUTBOUND_CAPACITY";
pub const ENV_ERROR_CAPACITY: &str = "LIVE_ERROR_CAPACITY";
pub const ENV_IGNORE_FAVICON: &str = "LIVE_IGNORE_FAVICON";
pub const ENV_FIRST_PAINT_CACHE: &str = "LIVE_FIRST_PAINT_CACHE";

#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    /// Timeout for every single write to a live connection.
    pub write_timeout: Duration,
    /// Messages a socket may queue before it is dropped as too slow.
    pub outbound_capacity: usize,
    /// Error events a socket may queue.
    pub error_capacity: usize,
    pub ignore_favicon: bool,
    /// Query parameter marking a session repair redirect.
    pub repair_param: String,
    /// First-paint snapshots kept for sockets about to connect. Zero disables the cache.
    pub first_paint_cache: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            write_timeout: WRITE_TIMEOUT,
            outbound_capacity: OUTBOUND_CAPACITY,
            error_capacity: ERROR_CAPACITY,
            ignore_favicon: true,
            repair_param: REPAIR_PARAM.to_string(),
            first_paint_cache: FIRST_PAINT_CACHE,
        }
    }
}

impl LiveConfig {
    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Result<Self, LiveError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides from a `.env` style file, falling back to the
    /// process environment for keys the file does not set. A missing file
    /// behaves like an empty one; any other read failure is an error.
    pub fn from_env_file(path: &Path) -> Result<Self, LiveError> {
        let vars = match std::fs::read_to_string(path) {
            Ok(content) => parse_env_file(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(LiveError::config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Self::from_lookup(|key| vars.get(key).cloned().or_else(|| std::env::var(key).ok()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LiveError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_WRITE_TIMEOUT_MS)? {
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var(&lookup, ENV_OUTBOUND_CAPACITY)? {
            config.outbound_capacity = capacity;
        }
        if let Some(capacity) = parse_var(&lookup, ENV_ERROR_CAPACITY)? {
            config.error_capacity = capacity;
        }
        if let Some(ignore) = parse_var(&lookup, ENV_IGNORE_FAVICON)? {
            config.ignore_favicon = ignore;
        }
        if let Some(size) = parse_var(&lookup, ENV_FIRST_PAINT_CACHE)? {
            config.first_paint_cache = size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<(), LiveError> {
        if self.write_timeout.is_zero() {
            return Err(LiveError::config("write timeout must be positive"));
        }
        if self.outbound_capacity == 0 {
            return Err(LiveError::config("outbound capacity must be positive"));
        }
        if self.error_capacity == 0 {
            return Err(LiveError::config("error capacity must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, LiveError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| LiveError::config(format!("{}: cannot parse '{}'", key, raw)))
}

/// Parse `KEY=value` lines, skipping blanks and `#` comments.
fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LiveConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LiveConfig::default());
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert_eq!(config.outbound_capacity, 32);
        assert_eq!(config.repair_param, "live-repair");
    }

    #[test]
    fn test_overrides() {
        let config = LiveConfig::from_lookup(lookup(&[
            (ENV_WRITE_TIMEOUT_MS, "250"),
            (ENV_OUTBOUND_CAPACITY, "8"),
            (ENV_IGNORE_FAVICON, "false"),
            (ENV_FIRST_PAINT_CACHE, "0"),
        ]))
        .unwrap();
        assert_eq!(config.write_timeout, Duration::from_millis(250));
        assert_eq!(config.outbound_capacity, 8);
        assert!(!config.ignore_favicon);
        assert_eq!(config.first_paint_cache, 0);
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        let err = LiveConfig::from_lookup(lookup(&[(ENV_OUTBOUND_CAPACITY, "lots")])).unwrap_err();
        assert!(matches!(err, LiveError::Config(_)));
        assert!(err.to_string().contains(ENV_OUTBOUND_CAPACITY));

        let err = LiveConfig::from_lookup(lookup(&[(ENV_WRITE_TIMEOUT_MS, "0")])).unwrap_err();
        assert!(matches!(err, LiveError::Config(_)));
    }

    #[test]
    fn test_env_file_read_errors() {
        let missing =
            std::env::temp_dir().join(format!("liveview-missing-{}.env", uuid::Uuid::new_v4()));
        assert!(LiveConfig::from_env_file(&missing).is_ok());

        // A directory exists but cannot be read as a file.
        let err = LiveConfig::from_env_file(&std::env::temp_dir()).unwrap_err();
        assert!(matches!(err, LiveError::Config(_)));
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn test_validate_rejects_zero_capacities() {
        let config = LiveConfig {
            error_capacity: 0,
            ..LiveConfig::default()
        };
        assert!(matches!(config.validate(), Err(LiveError::Config(_))));
        assert!(LiveConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_env_file() {
        let vars = parse_env_file(
            "# live settings\n\nLIVE_OUTBOUND_CAPACITY = \"64\"\nLIVE_IGNORE_FAVICON='true'\nnot a pair\n",
        );
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["LIVE_OUTBOUND_CAPACITY"], "64");
        assert_eq!(vars["LIVE_IGNORE_FAVICON"], "true");
    }
}
