//! Unified error types for the bodyscale core library.
//!
//! Each module has its own error type ([`ConfigError`], [`BleError`],
//! [`SinkError`]). [`ScaleError`] folds them into one enum for callers that
//! only need to log, classify, or exit. Codec errors never leave a session;
//! the offending indication is dropped where it is decoded.
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`BleError`]: crate::ble::BleError
//! [`SinkError`]: crate::sink::SinkError

use thiserror::Error;

/// The unified error type for all bodyscale operations.
#[derive(Debug, Error)]
pub enum ScaleError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and bluetoothd is running."
    )]
    BluetoothAdapterNotFound,

    /// The adapter or the Bluetooth stack failed.
    #[error("Bluetooth adapter fault: {0}")]
    BluetoothAdapterFault(String),

    /// The scale could not be reached or dropped the connection.
    #[error("Connection to scale failed: {0}")]
    ConnectionFailed(String),

    /// Enabling LE mode on the radio failed.
    #[error("Failed to enable the BLE radio: {0}. Check that btmgmt is installed and sudo is permitted.")]
    RadioInitFailed(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {0}")]
    ConfigNotFound(String),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // DELIVERY ERRORS
    // =========================================================================
    /// The reporting sink failed.
    #[error("Report delivery failed: {0}")]
    SinkFailed(String),
}

/// A specialized [`Result`] type for bodyscale operations.
pub type Result<T> = std::result::Result<T, ScaleError>;

impl ScaleError {
    /// Returns `true` if this error is related to Bluetooth operations.
    #[inline]
    #[must_use]
    pub const fn is_bluetooth_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound
                | Self::BluetoothAdapterFault(_)
                | Self::ConnectionFailed(_)
                | Self::RadioInitFailed(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if the outer loop can carry on after this error.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterFault(_) | Self::ConnectionFailed(_) | Self::SinkFailed(_)
        )
    }

    /// Returns `true` if the process should stop.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RadioInitFailed(_) | Self::BluetoothAdapterNotFound)
            || self.is_config_error()
    }

    /// Returns a machine-readable error code for logs.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothAdapterFault(_) => "BLUETOOTH_ADAPTER_FAULT",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::RadioInitFailed(_) => "RADIO_INIT_FAILED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::SinkFailed(_) => "SINK_FAILED",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for ScaleError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::ble::BleError> for ScaleError {
    fn from(err: crate::ble::BleError) -> Self {
        use crate::ble::BleError;
        match err {
            BleError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            BleError::Adapter { message } => Self::BluetoothAdapterFault(message),
            BleError::InvalidAddress { address } => {
                Self::ConfigValidationError(format!("Invalid Bluetooth address: {address}"))
            }
            other @ (BleError::Connection { .. }
            | BleError::CharacteristicNotFound { .. }
            | BleError::UnknownHandle { .. }
            | BleError::NotificationTimeout { .. }) => Self::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<crate::sink::SinkError> for ScaleError {
    fn from(err: crate::sink::SinkError) -> Self {
        Self::SinkFailed(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::BleError;
    use crate::config::ConfigError;
    use crate::sink::SinkError;

    #[test]
    fn test_bluetooth_error_classification() {
        assert!(ScaleError::BluetoothAdapterNotFound.is_bluetooth_error());
        assert!(ScaleError::BluetoothAdapterFault("hci0".into()).is_bluetooth_error());
        assert!(ScaleError::ConnectionFailed("gone".into()).is_bluetooth_error());
        assert!(ScaleError::RadioInitFailed("exit 1".into()).is_bluetooth_error());

        assert!(!ScaleError::SinkFailed("500".into()).is_bluetooth_error());
    }

    #[test]
    fn test_fatal_and_recoverable() {
        assert!(ScaleError::RadioInitFailed("exit 1".into()).is_fatal());
        assert!(ScaleError::ConfigNotFound("/etc".into()).is_fatal());
        assert!(!ScaleError::RadioInitFailed("exit 1".into()).is_recoverable());

        assert!(ScaleError::ConnectionFailed("gone".into()).is_recoverable());
        assert!(ScaleError::SinkFailed("503".into()).is_recoverable());
        assert!(!ScaleError::ConnectionFailed("gone".into()).is_fatal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ScaleError::BluetoothAdapterNotFound.error_code(),
            "BLUETOOTH_ADAPTER_NOT_FOUND"
        );
        assert_eq!(
            ScaleError::RadioInitFailed(String::new()).error_code(),
            "RADIO_INIT_FAILED"
        );
        assert_eq!(
            ScaleError::ConfigValidationError(String::new()).error_code(),
            "CONFIG_VALIDATION_ERROR"
        );
    }

    #[test]
    fn test_from_ble_error() {
        let err: ScaleError = BleError::adapter("NotReady").into();
        assert!(matches!(err, ScaleError::BluetoothAdapterFault(_)));

        let err: ScaleError = BleError::connection("abort").into();
        assert!(matches!(err, ScaleError::ConnectionFailed(_)));

        let err: ScaleError = BleError::InvalidAddress {
            address: "xx".into(),
        }
        .into();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_from_config_error() {
        let err: ScaleError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "scale.name".into(),
                message: "must not be empty".into(),
            },
            ConfigError::ValidationError {
                field: "session.connect_tries".into(),
                message: "must be greater than zero".into(),
            },
        ])
        .into();
        match err {
            ScaleError::ConfigValidationError(msg) => {
                assert!(msg.contains("scale.name"));
                assert!(msg.contains("; "));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_from_sink_error() {
        let err: ScaleError = SinkError::Transport("builder error".into()).into();
        assert_eq!(err.error_code(), "SINK_FAILED");
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_adapter_is_fatal() {
        let err: ScaleError = BleError::AdapterNotFound.into();
        assert!(err.is_fatal());
        assert!(err.is_bluetooth_error());
        assert_eq!(err.error_code(), "BLUETOOTH_ADAPTER_NOT_FOUND");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ScaleError>();
        assert_sync::<ScaleError>();
    }
}
