//! Configuration file parser for ~/.config/calwindow/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`,
//! which has no sources. Unknown keys are accepted by serde and logged as a
//! warning so typos are visible.
use crate::feed::DEFAULT_MAX_FEED_SIZE;
use crate::storage::DEFAULT_CAPACITY;
use chrono_tz::Tz;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// One remote calendar feed.
///
/// Published ICS links embed an access token, so the URL is kept secret and
/// masked in `Debug` output.
#[derive(Deserialize)]
pub struct SourceConfig {
    /// Stable identifier used as the cache key and in logs
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(deserialize_with = "deserialize_secret")]
    pub url: SecretString,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            url: SecretString::from(url.into()),
            enabled: true,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &"[REDACTED]")
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sources: Vec<SourceConfig>,

    /// Seconds between refresh cycles.
    pub refresh_interval_seconds: u64,

    /// Simultaneous source fetches per cycle (1..=3).
    pub max_concurrent_fetches: usize,

    /// Days ahead to expand recurring events.
    pub expansion_days: u32,

    /// Maximum events in the published window.
    pub max_events: usize,

    /// IANA zone used to decide which calendar day "today" is.
    pub timezone: String,

    /// Hours before now the window starts, so earlier events today stay visible.
    pub lookback_hours: u32,

    /// Number of sources whose last good fetch is remembered.
    pub source_cache_capacity: usize,

    /// Fallback data older than this is still served, but logged as stale.
    pub staleness_ceiling_minutes: u64,

    /// Per-request timeout.
    pub fetch_timeout_seconds: u64,

    /// Wall-clock ceiling for the whole fetch fan-out of one cycle.
    pub cycle_timeout_seconds: u64,

    /// Maximum size of one feed body.
    pub max_feed_bytes: usize,

    /// Allow sources on localhost or private networks (self-hosted CalDAV).
    pub allow_private_hosts: bool,

    /// Event identifiers never shown.
    pub skip_ids: Vec<String>,

    /// Newline-delimited file of event identifiers to hide, re-read every cycle.
    pub skip_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            refresh_interval_seconds: 300,
            max_concurrent_fetches: 2,
            expansion_days: 14,
            max_events: 50,
            timezone: "UTC".to_string(),
            lookback_hours: 24,
            source_cache_capacity: DEFAULT_CAPACITY,
            staleness_ceiling_minutes: 60,
            fetch_timeout_seconds: 30,
            cycle_timeout_seconds: 120,
            max_feed_bytes: DEFAULT_MAX_FEED_SIZE,
            allow_private_hosts: false,
            skip_ids: Vec::new(),
            skip_file: None,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 15] = [
        "sources",
        "refresh_interval_seconds",
        "max_concurrent_fetches",
        "expansion_days",
        "max_events",
        "timezone",
        "lookback_hours",
        "source_cache_capacity",
        "staleness_ceiling_minutes",
        "fetch_timeout_seconds",
        "cycle_timeout_seconds",
        "max_feed_bytes",
        "allow_private_hosts",
        "skip_ids",
        "skip_file",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Invalid values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the refresh loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;

        if self.refresh_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "refresh_interval_seconds must be greater than 0".into(),
            ));
        }
        if self.cycle_timeout_seconds == 0 || self.fetch_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than 0".into()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(ConfigError::Invalid("source id must not be empty".into()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone '{}'", self.timezone)))
    }

    /// Concurrency gate size, clamped to what constrained hardware tolerates.
    pub fn fetch_concurrency(&self) -> usize {
        self.max_concurrent_fetches.clamp(1, 3)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_seconds)
    }

    pub fn staleness_ceiling(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.staleness_ceiling_minutes as i64)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookback_hours as i64)
    }

    /// Enabled sources, moved out of the config.
    pub fn take_enabled_sources(&mut self) -> Vec<SourceConfig> {
        std::mem::take(&mut self.sources)
            .into_iter()
            .filter(|s| {
                if !s.enabled {
                    tracing::info!(source = %s.id, "Source disabled, skipping");
                }
                s.enabled
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sources.is_empty());
        assert_eq!(config.refresh_interval_seconds, 300);
        assert_eq!(config.max_concurrent_fetches, 2);
        assert_eq!(config.expansion_days, 14);
        assert_eq!(config.max_events, 50);
        assert_eq!(config.source_cache_capacity, 10);
        assert_eq!(config.staleness_ceiling_minutes, 60);
        assert_eq!(config.lookback_hours, 24);
        assert_eq!(config.tz().unwrap(), Tz::UTC);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/calwindow_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let config = Config::from_toml("   \n  \n").unwrap();
        assert_eq!(config.max_events, 50);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
refresh_interval_seconds = 120
max_concurrent_fetches = 3
expansion_days = 30
max_events = 20
timezone = "America/Chicago"
lookback_hours = 12
source_cache_capacity = 5
staleness_ceiling_minutes = 90
skip_ids = ["uid-1", "uid-2"]
skip_file = "/tmp/skip.txt"

[[sources]]
id = "work"
name = "Work calendar"
url = "https://outlook.example.com/owa/calendar/secret-token/calendar.ics"

[[sources]]
id = "home"
url = "webcal://p01-calendars.example.com/published/2/abc"
enabled = false
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_secs(120));
        assert_eq!(config.fetch_concurrency(), 3);
        assert_eq!(config.expansion_days, 30);
        assert_eq!(config.max_events, 20);
        assert_eq!(config.tz().unwrap(), chrono_tz::America::Chicago);
        assert_eq!(config.lookback(), chrono::Duration::hours(12));
        assert_eq!(config.source_cache_capacity, 5);
        assert_eq!(config.staleness_ceiling(), chrono::Duration::minutes(90));
        assert_eq!(config.skip_ids, vec!["uid-1", "uid-2"]);
        assert_eq!(config.skip_file.as_deref(), Some(Path::new("/tmp/skip.txt")));

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].display_name(), "Work calendar");
        assert!(config.sources[0].url.expose_secret().contains("secret-token"));
        assert_eq!(config.sources[1].display_name(), "home");
        assert!(!config.sources[1].enabled);
    }

    #[test]
    fn test_take_enabled_sources() {
        let mut config = Config::from_toml(
            r#"
[[sources]]
id = "a"
url = "https://example.com/a.ics"

[[sources]]
id = "b"
url = "https://example.com/b.ics"
enabled = false
"#,
        )
        .unwrap();
        let sources = config.take_enabled_sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, "a");
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_concurrency_clamped() {
        let mut config = Config::default();
        config.max_concurrent_fetches = 0;
        assert_eq!(config.fetch_concurrency(), 1);
        config.max_concurrent_fetches = 16;
        assert_eq!(config.fetch_concurrency(), 3);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let err = Config::from_toml("timezone = \"Mars/Olympus_Mons\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_source_ids_rejected() {
        let err = Config::from_toml(
            r#"
[[sources]]
id = "a"
url = "https://example.com/1.ics"

[[sources]]
id = "a"
url = "https://example.com/2.ics"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate source id"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Config::from_toml("refresh_interval_seconds = 0\n").is_err());
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::from_toml("max_events = 5\ntotally_fake_key = 1\n").unwrap();
        assert_eq!(config.max_events, 5);
    }

    #[test]
    fn test_source_missing_url_rejected() {
        let err = Config::from_toml("[[sources]]\nid = \"a\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("calwindow_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join("calwindow_config_test_load");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "max_events = 7\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_events, 7);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_debug_masks_source_url() {
        let source = SourceConfig::new("work", "https://example.com/private/token-12345/basic.ics");
        let debug_output = format!("{:?}", source);
        assert!(!debug_output.contains("token-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
