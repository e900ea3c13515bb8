//! Bluetooth Low Energy transport seam.
//!
//! The controller and the session orchestrator talk to the radio through two
//! traits:
//!
//! - [`BleAdapter`] - discovery, connection and adapter reset
//! - [`ScaleLink`] - one connected scale: handle resolution, indication
//!   subscription, command writes, disconnect
//!
//! The BlueZ implementation lives in [`bluez`] (feature `bluetooth`); an
//! in-memory implementation for tests lives in [`mock`].
//!
//! Indications are not delivered through callbacks. A link forwards every
//! indication as an [`Indication`] into the bounded channel handed to
//! [`ScaleLink::subscribe`], so the consumer owns the session's records
//! without shared mutable state.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

// =============================================================================
// TYPES
// =============================================================================

/// Link-layer address type used when connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// LE public address.
    Public,
    /// LE random address.
    Random,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Random => f.write_str("random"),
        }
    }
}

/// Opaque identifier of a resolved characteristic on a connected link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u16);

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// A value pushed by the device on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indication {
    /// Characteristic the value arrived on.
    pub handle: CharacteristicHandle,
    /// Raw payload.
    pub value: Vec<u8>,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised by the BLE transport.
///
/// Variants are grouped into the fault classes the controller reacts to:
/// adapter faults reset the adapter, connection faults consume a retry, and
/// acknowledgement timeouts are tolerated on best-effort writes.
#[derive(Debug, Error)]
pub enum BleError {
    /// No usable Bluetooth adapter is present.
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// The adapter or the Bluetooth stack failed.
    #[error("Bluetooth adapter fault: {message}")]
    Adapter {
        /// Description from the stack.
        message: String,
    },

    /// The device could not be reached or dropped the connection.
    #[error("Connection fault: {message}")]
    Connection {
        /// Description from the stack.
        message: String,
    },

    /// A required characteristic is missing on the connected device.
    #[error("Characteristic {uuid} not found on device")]
    CharacteristicNotFound {
        /// UUID that was looked up.
        uuid: Uuid,
    },

    /// A handle that was never resolved on this link was used.
    #[error("Unknown characteristic handle {handle}")]
    UnknownHandle {
        /// The offending handle.
        handle: CharacteristicHandle,
    },

    /// The device did not acknowledge a write in time.
    #[error("No acknowledgement within {}s", .waited.as_secs())]
    NotificationTimeout {
        /// How long the write waited.
        waited: Duration,
    },

    /// The configured device address could not be parsed.
    #[error("Invalid Bluetooth address: {address}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },
}

/// Result type for transport operations.
pub type BleResult<T> = std::result::Result<T, BleError>;

impl BleError {
    /// Create an adapter fault.
    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            message: message.into(),
        }
    }

    /// Create a connection fault.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Faults that are recovered by resetting the adapter.
    #[must_use]
    pub const fn is_adapter_fault(&self) -> bool {
        matches!(self, Self::AdapterNotFound | Self::Adapter { .. })
    }

    /// Faults local to one device connection.
    #[must_use]
    pub const fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::CharacteristicNotFound { .. } | Self::UnknownHandle { .. }
        )
    }

    /// Write acknowledgement timeouts.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::NotificationTimeout { .. })
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// A Bluetooth adapter able to find and connect to the scale.
///
/// One adapter instance lives for the whole process; only one link is open
/// at a time.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Connected-device type produced by [`BleAdapter::connect`].
    type Link: ScaleLink;

    /// Scan for up to `window` and report whether a device advertising
    /// `name` was seen.
    async fn scan_for(&self, name: &str, window: Duration) -> BleResult<bool>;

    /// Open a GATT connection to `address`, giving up after `timeout`.
    async fn connect(
        &self,
        address: &str,
        address_type: AddressType,
        timeout: Duration,
    ) -> BleResult<Self::Link>;

    /// Power-cycle the adapter. Must finish before the next scan.
    async fn reset(&self) -> BleResult<()>;
}

/// An open connection to the scale.
#[async_trait]
pub trait ScaleLink: Send + Sync {
    /// Look up the characteristic with `uuid`.
    async fn resolve(&self, uuid: Uuid) -> BleResult<CharacteristicHandle>;

    /// Enable indications on `handle`, forwarding each value into `sink`
    /// until the link is disconnected or the receiver is dropped.
    async fn subscribe(
        &self,
        handle: CharacteristicHandle,
        sink: mpsc::Sender<Indication>,
    ) -> BleResult<()>;

    /// Write `value` to `handle`, waiting up to `ack_timeout` for the
    /// acknowledgement.
    async fn write(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        ack_timeout: Duration,
    ) -> BleResult<()>;

    /// Close the connection and stop forwarding indications.
    async fn disconnect(&self) -> BleResult<()>;
}
