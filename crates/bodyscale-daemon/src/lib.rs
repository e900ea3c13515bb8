//! # bodyscale-daemon
//!
//! Long-running reader for a BLE body-composition scale.
//!
//! This library provides the logging setup, the form-post reporting sink and
//! the outer scan/session loop used by the `bodyscale-daemon` binary.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod logging;
pub mod service;
pub mod sink;
