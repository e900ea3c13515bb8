//! Application configuration management.
//!
//! Configuration is a TOML file with one table per concern:
//!
//! ```toml
//! [scale]
//! address = "F1:37:57:6C:DE:A8"
//! name = "013197"
//! model = "BS444"
//!
//! [session]
//! listen_secs = 30
//!
//! [sink]
//! url = "https://example.com/sensors/weight.php"
//! ```
//!
//! Any key can be overridden from the environment with the `BODYSCALE`
//! prefix and `__` as separator, e.g. `BODYSCALE__SCALE__ADDRESS`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::AddressType;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "BODYSCALE_CONFIG";

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "BODYSCALE";

/// Seconds between the Unix epoch and 2010-01-01T00:00:00Z, the epoch used by
/// the BS4xx family.
pub const BS4XX_EPOCH_OFFSET: i64 = 1_262_304_000;

/// Models that use public addressing and the 2010 epoch.
const BS4XX_MODELS: [&str; 2] = ["BS410", "BS444"];

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address pattern is valid")
});

// =============================================================================
// ERRORS
// =============================================================================

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file exists at the given path.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The layered sources could not be read or merged.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// The TOML document is invalid.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A single field failed validation.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted path of the field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Returns `true` for `AA:BB:CC:DD:EE:FF`-style addresses.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The scale to read from.
    pub scale: ScaleConfig,

    /// Session timings and retry budgets.
    #[serde(default)]
    pub session: SessionConfig,

    /// Radio initialisation.
    #[serde(default)]
    pub radio: RadioConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where finished reports go.
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Identity of the scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// Bluetooth MAC address.
    pub address: String,

    /// Advertised name used for discovery.
    pub name: String,

    /// Model string; selects addressing and clock epoch.
    #[serde(default)]
    pub model: String,
}

/// Connection parameters derived from the scale model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleProfile {
    /// Address type used when connecting.
    pub address_type: AddressType,
    /// Seconds added to device timestamps.
    pub time_offset_secs: i64,
}

impl ScaleProfile {
    /// Profile for a model string. BS410 and BS444 use public addressing and
    /// the 2010 epoch; everything else uses random addressing and Unix time.
    #[must_use]
    pub fn for_model(model: &str) -> Self {
        if BS4XX_MODELS.contains(&model) {
            Self {
                address_type: AddressType::Public,
                time_offset_secs: BS4XX_EPOCH_OFFSET,
            }
        } else {
            Self {
                address_type: AddressType::Random,
                time_offset_secs: 0,
            }
        }
    }
}

impl ScaleConfig {
    /// The connection profile of the configured model.
    #[must_use]
    pub fn profile(&self) -> ScaleProfile {
        ScaleProfile::for_model(&self.model)
    }
}

/// Timings and retry budgets for scanning, connecting and listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Length of the listening window once subscribed.
    pub listen_secs: u64,
    /// Total time to look for the scale before backing off.
    pub scan_timeout_secs: u64,
    /// Length of a single scan attempt.
    pub scan_window_secs: u64,
    /// Pause between scan attempts.
    pub scan_pause_millis: u64,
    /// Connection attempts per discovery.
    pub connect_tries: u32,
    /// Timeout of a single connection attempt.
    pub connect_timeout_secs: u64,
    /// Pause after a failed connection attempt.
    pub retry_delay_secs: u64,
    /// Pause before returning to scanning after a timeout or failure.
    pub idle_backoff_secs: u64,
    /// How long to wait for the time-sync write to be acknowledged.
    pub ack_timeout_secs: u64,
    /// Capacity of the indication queue.
    pub queue_capacity: usize,
    /// Height used for BMI instead of the scale's person record.
    pub height_cm_override: Option<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_secs: 30,
            scan_timeout_secs: 300,
            scan_window_secs: 10,
            scan_pause_millis: 500,
            connect_tries: 3,
            connect_timeout_secs: 8,
            retry_delay_secs: 2,
            idle_backoff_secs: 5,
            ack_timeout_secs: 5,
            queue_capacity: 64,
            height_cm_override: None,
        }
    }
}

impl SessionConfig {
    /// Listening window.
    #[must_use]
    pub const fn listen_window(&self) -> Duration {
        Duration::from_secs(self.listen_secs)
    }

    /// Total discovery timeout.
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Single scan attempt.
    #[must_use]
    pub const fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    /// Pause between scan attempts.
    #[must_use]
    pub const fn scan_pause(&self) -> Duration {
        Duration::from_millis(self.scan_pause_millis)
    }

    /// Single connection attempt.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Pause after a failed connection attempt.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Outer-loop backoff.
    #[must_use]
    pub const fn idle_backoff(&self) -> Duration {
        Duration::from_secs(self.idle_backoff_secs)
    }

    /// Write acknowledgement timeout.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Privileged radio initialisation run once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Whether to run the command at all.
    pub enabled: bool,
    /// Program and arguments enabling LE mode.
    pub enable_command: Vec<String>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_command: ["sudo", "btmgmt", "le", "on"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `bodyscale_core=debug`.
    pub level: String,
    /// Directory for rolling log files; platform default when unset.
    pub directory: Option<PathBuf>,
    /// JSON files plus compact stdout when `true`, pretty stdout otherwise.
    pub production: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            production: true,
        }
    }
}

/// Reporting sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Form endpoint; reports are only logged when unset.
    pub url: Option<String>,
    /// File holding the RFID token of the current user.
    pub rfid_path: PathBuf,
    /// File the sink's response is written to.
    pub response_path: PathBuf,
    /// `User-Agent` header sent with submissions.
    pub user_agent: String,
    /// Request timeout.
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            rfid_path: PathBuf::from("/home/pi/Start/rfid.txt"),
            response_path: PathBuf::from("/home/pi/Start/plugin_response.txt"),
            user_agent: "RaspberryPi/bodyscale".to_string(),
            timeout_secs: 30,
        }
    }
}

// =============================================================================
// LOADING
// =============================================================================

impl Config {
    /// Load configuration from `path`, applying environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is invalid or fails validation.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values, collecting every problem found.
    ///
    /// # Errors
    ///
    /// Returns the single failure, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if !is_valid_mac_address(&self.scale.address) {
            errors.push(invalid(
                "scale.address",
                format!("'{}' is not a MAC address", self.scale.address),
            ));
        }
        if self.scale.name.trim().is_empty() {
            errors.push(invalid("scale.name", "must not be empty"));
        }
        if self.session.listen_secs == 0 {
            errors.push(invalid("session.listen_secs", "must be greater than zero"));
        }
        if self.session.scan_window_secs == 0 {
            errors.push(invalid("session.scan_window_secs", "must be greater than zero"));
        }
        if self.session.connect_tries == 0 {
            errors.push(invalid("session.connect_tries", "must be greater than zero"));
        }
        if self.session.queue_capacity == 0 {
            errors.push(invalid("session.queue_capacity", "must be greater than zero"));
        }
        if self.radio.enabled && self.radio.enable_command.is_empty() {
            errors.push(invalid(
                "radio.enable_command",
                "must name a program when the radio step is enabled",
            ));
        }
        if let Some(url) = &self.sink.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(invalid("sink.url", "must be an http(s) URL"));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Location of the configuration file.
///
/// `BODYSCALE_CONFIG` wins; otherwise `/etc/bodyscale/config.toml` on Linux
/// and the platform config directory elsewhere.
#[must_use]
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/bodyscale/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "bodyscale").map_or_else(
            || PathBuf::from("config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [scale]
        address = "F1:37:57:6C:DE:A8"
        name = "013197"
        model = "BS444"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.scale.name, "013197");
        assert_eq!(config.session.listen_window(), Duration::from_secs(30));
        assert_eq!(config.session.connect_tries, 3);
        assert!(config.radio.enabled);
        assert_eq!(config.radio.enable_command, vec!["sudo", "btmgmt", "le", "on"]);
        assert!(config.sink.url.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_model_profiles() {
        for model in ["BS410", "BS444"] {
            let profile = ScaleProfile::for_model(model);
            assert_eq!(profile.address_type, AddressType::Public);
            assert_eq!(profile.time_offset_secs, 1_262_304_000);
        }
        let other = ScaleProfile::for_model("BS440");
        assert_eq!(other.address_type, AddressType::Random);
        assert_eq!(other.time_offset_secs, 0);
        assert_eq!(ScaleProfile::for_model("").address_type, AddressType::Random);
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("f1:37:57:6c:de:a8"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_mac_address(""));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let toml = MINIMAL.replace("F1:37:57:6C:DE:A8", "not-a-mac");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ValidationError { ref field, .. } if field == "scale.address"
        ));
    }

    #[test]
    fn test_multiple_errors_are_collected() {
        let toml = r#"
            [scale]
            address = "nope"
            name = " "

            [session]
            connect_tries = 0
        "#;
        match Config::from_toml_str(toml).unwrap_err() {
            ConfigError::MultipleValidationErrors(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_scale_table_is_parse_error() {
        let err = Config::from_toml_str("[session]\nlisten_secs = 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_sink_url_must_be_http() {
        let toml = format!("{MINIMAL}\n[sink]\nurl = \"ftp://example.com\"\n");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{MINIMAL}").unwrap();
        writeln!(file, "[session]\nlisten_secs = 45\nheight_cm_override = 172").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.session.listen_secs, 45);
        assert_eq!(config.session.height_cm_override, Some(172));
        assert_eq!(config.scale.profile().address_type, AddressType::Public);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
