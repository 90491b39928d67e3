//! Engine settings.
//!
//! Settings are given as string parameters in the same spirit as host
//! configuration variables, applied on top of the defaults.

use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

static DEFAULT_TOPIC_NAME: &str = "object-usage";
const DEFAULT_REPORT_INTERVAL_MS: i64 = 500;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized configuration parameter \"{0}\"")]
    UnknownParameter(String),

    #[error("invalid value for parameter \"{name}\": \"{value}\"")]
    InvalidValue { name: String, value: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UsageConfig {
    pub track_procedures: bool,
    pub track_relations: bool,
    /// Also account relations with ids below `FIRST_NORMAL_OBJECT_ID`.
    pub track_system_objects: bool,
    /// Zero each record after it has been reported.
    pub clear_on_report: bool,
    pub report_topic: String,
    /// Minimum time between two periodic reports.
    pub report_interval_ms: i64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        UsageConfig {
            track_procedures: true,
            track_relations: true,
            track_system_objects: false,
            clear_on_report: false,
            report_topic: DEFAULT_TOPIC_NAME.to_string(),
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

impl UsageConfig {
    /// Builds a config from the defaults and the given overrides.
    pub fn from_params(override_params: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        apply_override_params(UsageConfig::default(), override_params)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::milliseconds(self.report_interval_ms)
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "track_procedures" => self.track_procedures = parse_bool(name, value)?,
            "track_relations" => self.track_relations = parse_bool(name, value)?,
            "track_system_objects" => self.track_system_objects = parse_bool(name, value)?,
            "clear_on_report" => self.clear_on_report = parse_bool(name, value)?,
            "report_topic" => {
                if value.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        name: name.to_string(),
                        value: value.to_string(),
                    });
                }
                self.report_topic = value.to_string();
            }
            "report_interval_ms" => {
                self.report_interval_ms = value
                    .parse::<i64>()
                    .ok()
                    .filter(|ms| *ms >= 0)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        name: name.to_string(),
                        value: value.to_string(),
                    })?;
            }
            _ => return Err(ConfigError::UnknownParameter(name.to_string())),
        }
        Ok(())
    }
}

fn apply_override_params<V>(
    mut config: UsageConfig,
    override_params: Option<HashMap<String, V>>,
) -> Result<UsageConfig, ConfigError>
where
    V: AsRef<str>,
{
    if let Some(params) = override_params {
        for (param, value) in params {
            config.set(param.as_str(), value.as_ref())?;
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, UsageConfig};
    use chrono::Duration;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = UsageConfig::from_params(None).unwrap();
        assert!(config.track_procedures);
        assert!(config.track_relations);
        assert!(!config.track_system_objects);
        assert!(!config.clear_on_report);
        assert_eq!(config.report_topic, "object-usage");
        assert_eq!(config.report_interval(), Duration::milliseconds(500));
    }

    #[test]
    fn test_overrides() {
        let config = UsageConfig::from_params(Some(HashMap::from([
            ("clear_on_report".to_string(), "on".to_string()),
            ("track_relations".to_string(), "off".to_string()),
            ("report_interval_ms".to_string(), "10000".to_string()),
        ])))
        .unwrap();
        assert!(config.clear_on_report);
        assert!(!config.track_relations);
        assert_eq!(config.report_interval_ms, 10_000);
    }

    #[test]
    fn test_bad_params() {
        let res = UsageConfig::from_params(Some(HashMap::from([(
            "track_everything".to_string(),
            "on".to_string(),
        )])));
        assert_eq!(
            res,
            Err(ConfigError::UnknownParameter("track_everything".to_string()))
        );

        let res = UsageConfig::from_params(Some(HashMap::from([(
            "clear_on_report".to_string(),
            "maybe".to_string(),
        )])));
        assert!(matches!(res, Err(ConfigError::InvalidValue { .. })));

        let res = UsageConfig::from_params(Some(HashMap::from([(
            "report_interval_ms".to_string(),
            "-5".to_string(),
        )])));
        assert!(matches!(res, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: UsageConfig = serde_json::from_str(r#"{"clear_on_report": true}"#).unwrap();
        assert!(config.clear_on_report);
        assert!(config.track_procedures);
        assert_eq!(config.report_topic, "object-usage");
    }
}
