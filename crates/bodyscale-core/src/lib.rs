//! # bodyscale-core
//!
//! Core logic for reading a BLE body-composition scale (Medisana BS4xx
//! family) from a Raspberry Pi.
//!
//! This crate provides:
//! - Decoding of the scale's person, weight and body-composition indications
//! - Per-session aggregation, deduplication and BMI derivation
//! - A scan/connect state machine with retries and adapter recovery
//! - The session flow: subscribe, sync the clock, listen, report
//!
//! ## Architecture
//!
//! - [`codec`] - Binary payload layouts and the time-sync command
//! - [`aggregator`] - Record collections for a single session
//! - [`ble`] - Transport traits, with BlueZ and mock implementations
//! - [`controller`] - Discovery and connection state machine
//! - [`session`] - One connected session from subscription to report
//! - [`sink`] - Report delivery contract
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Decoded records and the session report

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod ble;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod session;
pub mod sink;
pub mod types;

// Re-export primary types for convenience
pub use aggregator::{Aggregator, RecordCounts};
#[cfg(feature = "bluetooth")]
pub use ble::bluez::{BluezAdapter, BluezLink};
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use ble::mock::{MockAdapter, MockLink};
pub use ble::{
    AddressType, BleAdapter, BleError, BleResult, CharacteristicHandle, Indication, ScaleLink,
};
pub use codec::{CharacteristicKind, CodecError, CodecResult};
pub use config::{
    default_config_path, is_valid_mac_address, Config, ConfigError, ConfigResult, LoggingConfig,
    RadioConfig, ScaleConfig, ScaleProfile, SessionConfig, SinkConfig,
};
pub use controller::{
    init_radio_mode, Acquisition, ControllerEvent, ControllerState, ScanController, ScanTarget,
};
pub use error::{Result, ScaleError};
pub use session::{
    CharacteristicMap, SessionContext, SessionOrchestrator, SessionOutcome, SessionPhase,
};
pub use sink::{LogSink, ReportSink, SinkError, SinkReceipt, SinkResult};
pub use types::{
    ActivityLevel, BodyRecord, Gender, Measurement, PersonRecord, Report, WeightRecord,
};
