use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::{ConflictRule, SchedulerPolicy};
use crate::model::{HOUR_MS, Ms, SessionStatus};

/// Runtime settings, read once from `MENTORD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    /// Sessions starting before `now - horizon_ms` are archived.
    pub horizon_ms: Ms,
    pub policy: SchedulerPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            horizon_ms: 24 * HOUR_MS,
            policy: SchedulerPolicy::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid {var}={value:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(bind) = lookup("MENTORD_BIND") {
            config.bind = bind;
        }
        if let Some(port) = parse(&lookup, "MENTORD_PORT")? {
            config.port = port;
        }
        if let Some(dir) = lookup("MENTORD_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.metrics_port = parse(&lookup, "MENTORD_METRICS_PORT")?;
        if let Some(threshold) = parse(&lookup, "MENTORD_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        if let Some(hours) = parse::<u32>(&lookup, "MENTORD_HORIZON_HOURS")? {
            config.horizon_ms = Ms::from(hours) * HOUR_MS;
        }
        if let Some(rule) = parse::<ConflictRule>(&lookup, "MENTORD_CONFLICT_RULE")? {
            config.policy.conflict_rule = rule;
        }
        if let Some(auto_confirm) = parse_flag(&lookup, "MENTORD_AUTO_CONFIRM")? {
            config.policy.initial_status = if auto_confirm {
                SessionStatus::Confirmed
            } else {
                SessionStatus::Pending
            };
        }
        if let Some(cap) = parse(&lookup, "MENTORD_MAX_LIVE_SESSIONS")? {
            config.policy.max_live_sessions = cap;
        }

        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("mentord.wal")
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    match parsed {
        Ok(v) => Ok(Some(v)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            reason: "expected true or false".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.wal_path(), PathBuf::from("./data/mentord.wal"));
        assert_eq!(config.policy.conflict_rule, ConflictRule::Interval);
        assert_eq!(config.policy.initial_status, SessionStatus::Pending);
    }

    #[test]
    fn overrides_apply() {
        let config = from_pairs(&[
            ("MENTORD_BIND", "127.0.0.1"),
            ("MENTORD_PORT", "9000"),
            ("MENTORD_DATA_DIR", "/var/lib/mentord"),
            ("MENTORD_METRICS_PORT", "9100"),
            ("MENTORD_COMPACT_THRESHOLD", "50"),
            ("MENTORD_HORIZON_HOURS", "48"),
            ("MENTORD_CONFLICT_RULE", "slot-table"),
            ("MENTORD_AUTO_CONFIRM", "true"),
            ("MENTORD_MAX_LIVE_SESSIONS", "200"),
        ])
        .unwrap();
        assert_eq!(config.addr(), "127.0.0.1:9000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/mentord"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.horizon_ms, 48 * HOUR_MS);
        assert_eq!(config.policy.conflict_rule, ConflictRule::SlotTable);
        assert_eq!(config.policy.initial_status, SessionStatus::Confirmed);
        assert_eq!(config.policy.max_live_sessions, 200);
    }

    #[test]
    fn bad_values_are_reported() {
        let err = from_pairs(&[("MENTORD_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().starts_with("invalid MENTORD_PORT=\"eighty\""));

        let err = from_pairs(&[("MENTORD_CONFLICT_RULE", "fuzzy")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "MENTORD_CONFLICT_RULE", .. }));

        assert!(from_pairs(&[("MENTORD_AUTO_CONFIRM", "maybe")]).is_err());
        assert!(from_pairs(&[("MENTORD_HORIZON_HOURS", "-1")]).is_err());
    }
}
