//! Settings for the counters and the daemon around them.
//!
//! Settings are read from a YAML file:
//!
//! ```yaml
//! url: mqtt://broker.lan:1883
//! user: counter
//! password: secret
//! client_id: topic_counter
//! path: /var/lib/tally
//! export_timeout_secs: 30
//! topics:
//!   - friendly_name: zigbee
//!     topic: zigbee2mqtt/+
//!     save_chart: "0 0 * * * *"
//!     save_json: "0 */5 * * * *"
//!     reset_data: "0 */5 * * * *"
//!     exclude_topics: ["/set", "/get"]
//! ```
//!
//! Cadences are six-field cron expressions (seconds first). An empty or
//! missing cadence disables that action for the topic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings file used when no path is given.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/default/mqtt_freq_analyzer.yaml";

/// Client identifier used when the settings leave it empty.
pub const DEFAULT_CLIENT_ID: &str = "mqtt_topic_freq";

/// Bound on a single export when the settings leave it unset.
pub const DEFAULT_EXPORT_TIMEOUT_SECS: u64 = 30;

/// One counter entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Name used for output files and chart titles.
    pub friendly_name: String,
    /// Topic filter to subscribe to.
    pub topic: String,
    /// Cadence of chart exports.
    #[serde(rename = "save_chart")]
    pub chart_cadence: String,
    /// Cadence of statistics exports.
    #[serde(rename = "save_json")]
    pub stats_cadence: String,
    /// Cadence of window resets.
    #[serde(rename = "reset_data")]
    pub reset_cadence: String,
    /// Topics containing any of these substrings are not counted.
    #[serde(rename = "exclude_topics")]
    pub exclude: Vec<String>,
}

impl TopicConfig {
    /// Creates an entry for `topic` with every action disabled.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// The name the counter will be known by: the friendly name, or the
    /// topic filter if no friendly name is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingName`] if both are empty.
    pub fn display_name(&self) -> Result<&str, ConfigError> {
        first_non_empty(&self.friendly_name, &self.topic).ok_or(ConfigError::MissingName)
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Counter entries, in registration order.
    pub topics: Vec<TopicConfig>,
    /// Broker URL, e.g. `mqtt://broker.lan:1883`.
    pub url: String,
    /// Broker user name.
    pub user: String,
    /// Broker password.
    pub password: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Output directory for artifacts; empty means the working directory.
    pub path: String,
    /// Upper bound for a single export, in seconds.
    pub export_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            url: String::new(),
            user: String::new(),
            password: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            path: String::new(),
            export_timeout_secs: DEFAULT_EXPORT_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from [`DEFAULT_SETTINGS_PATH`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid settings YAML.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH), Path::to_path_buf);

        tracing::info!(path = %path.display(), "reading settings");
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            source: e,
        })?;
        Self::from_yaml_str(&contents, &path)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { path, source })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::warn!(path = %path.display(), "settings file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Parses settings from YAML. `origin` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if `contents` is not valid settings YAML.
    pub fn from_yaml_str(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut settings: Self =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
                path: origin.to_path_buf(),
                source: e,
            })?;
        settings.fill_defaults();
        tracing::debug!(?settings, "parsed settings");
        Ok(settings)
    }

    /// Upper bound for a single export.
    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    fn fill_defaults(&mut self) {
        if self.client_id.is_empty() {
            self.client_id = DEFAULT_CLIENT_ID.to_string();
        }
        if self.export_timeout_secs == 0 {
            self.export_timeout_secs = DEFAULT_EXPORT_TIMEOUT_SECS;
        }
    }
}

/// Returns the first of `preferred` and `fallback` that is not empty.
pub fn first_non_empty<'a>(preferred: &'a str, fallback: &'a str) -> Option<&'a str> {
    if !preferred.is_empty() {
        Some(preferred)
    } else if !fallback.is_empty() {
        Some(fallback)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
url: mqtt://broker.lan:1883
user: counter
topics:
  - friendly_name: zigbee
    topic: zigbee2mqtt/+
    save_chart: "0 0 * * * *"
    save_json: "0 */5 * * * *"
    reset_data: "0 */5 * * * *"
    exclude_topics: ["/set"]
  - topic: sensors/#
"#;

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_yaml_str(SAMPLE, Path::new("sample.yaml")).unwrap();

        assert_eq!(settings.url, "mqtt://broker.lan:1883");
        assert_eq!(settings.user, "counter");
        assert_eq!(settings.password, "");
        assert_eq!(settings.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(settings.export_timeout(), Duration::from_secs(30));
        assert_eq!(settings.topics.len(), 2);

        let zigbee = &settings.topics[0];
        assert_eq!(zigbee.display_name().unwrap(), "zigbee");
        assert_eq!(zigbee.chart_cadence, "0 0 * * * *");
        assert_eq!(zigbee.stats_cadence, "0 */5 * * * *");
        assert_eq!(zigbee.reset_cadence, "0 */5 * * * *");
        assert_eq!(zigbee.exclude, vec!["/set"]);

        let sensors = &settings.topics[1];
        assert_eq!(sensors.display_name().unwrap(), "sensors/#");
        assert!(sensors.chart_cadence.is_empty());
        assert!(sensors.exclude.is_empty());
    }

    #[test]
    fn test_empty_client_id_and_timeout_get_defaults() {
        let yaml = "client_id: \"\"\nexport_timeout_secs: 0\n";
        let settings = Settings::from_yaml_str(yaml, Path::new("x.yaml")).unwrap();
        assert_eq!(settings.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(settings.export_timeout_secs, DEFAULT_EXPORT_TIMEOUT_SECS);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = Settings::from_yaml_str("topics: 12", Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.topics.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let settings = Settings::load_or_default(Some(&path)).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_display_name_fallback() {
        let mut entry = TopicConfig::new("");
        assert!(matches!(entry.display_name(), Err(ConfigError::MissingName)));

        entry.topic = "a/b".to_string();
        assert_eq!(entry.display_name().unwrap(), "a/b");

        entry.friendly_name = "nice".to_string();
        assert_eq!(entry.display_name().unwrap(), "nice");
    }

    #[test]
    fn test_first_non_empty() {
        assert_eq!(first_non_empty("a", "b"), Some("a"));
        assert_eq!(first_non_empty("", "b"), Some("b"));
        assert_eq!(first_non_empty("", ""), None);
    }
}
