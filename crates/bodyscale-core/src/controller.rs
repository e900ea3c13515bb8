//! Discovery and connection state machine.
//!
//! One outer-loop iteration walks:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> (session) -> Idle
//!            |             |             |
//!            | timeout     | tries used  | adapter fault
//!            v             v             v
//!          Backoff <---- Backoff <--- Resetting
//!            |
//!            v
//!          Idle
//! ```
//!
//! Adapter faults seen while scanning are recovered in place (reset, keep
//! scanning); only a failed reset leaves the `Scanning` state.

use std::fmt;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ble::{AddressType, BleAdapter, BleError, BleResult};
use crate::config::SessionConfig;
use crate::error::{Result, ScaleError};

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Where the controller is in its outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing in progress.
    Idle,
    /// Looking for the scale's advertisement.
    Scanning,
    /// Opening a GATT connection.
    Connecting,
    /// A link is open and owned by a session.
    Connected,
    /// Power-cycling the adapter.
    Resetting,
    /// Sleeping before the next iteration.
    Backoff,
}

/// Inputs driving [`ControllerState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// An iteration begins.
    Start,
    /// The scale was seen.
    DeviceFound,
    /// The scan timeout elapsed.
    ScanTimedOut,
    /// A connection attempt succeeded.
    LinkUp,
    /// Every connection attempt failed.
    RetryExhausted,
    /// The adapter faulted and must be reset.
    AdapterFault,
    /// The reset attempt finished.
    ResetDone,
    /// The session released the link.
    SessionEnded,
    /// The backoff sleep finished.
    BackoffElapsed,
}

impl ControllerState {
    /// The state reached from `self` on `event`, or `None` if the event is
    /// not expected here.
    #[must_use]
    pub const fn on(self, event: ControllerEvent) -> Option<Self> {
        use ControllerEvent as E;
        let next = match (self, event) {
            (Self::Idle, E::Start) => Self::Scanning,
            (Self::Scanning, E::DeviceFound) => Self::Connecting,
            (Self::Scanning, E::ScanTimedOut) | (Self::Connecting, E::RetryExhausted) => {
                Self::Backoff
            }
            (Self::Connecting, E::LinkUp) => Self::Connected,
            (Self::Scanning | Self::Connecting | Self::Connected, E::AdapterFault) => {
                Self::Resetting
            }
            (Self::Resetting, E::ResetDone) => Self::Backoff,
            (Self::Connected, E::SessionEnded) | (Self::Backoff, E::BackoffElapsed) => Self::Idle,
            _ => return None,
        };
        Some(next)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Resetting => "resetting",
            Self::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// The scale the controller looks for.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    /// Advertised name.
    pub name: String,
    /// MAC address used to connect.
    pub address: String,
    /// Address type used to connect.
    pub address_type: AddressType,
}

/// Result of one outer-loop iteration.
#[derive(Debug)]
pub enum Acquisition<L> {
    /// A link is open; the controller is `Connected` until
    /// [`ScanController::release`] is called.
    Connected(L),
    /// The scale was not seen before the scan timeout.
    TimedOut,
    /// The scale was seen but every connection attempt failed.
    RetryExhausted,
    /// The adapter faulted and could not be recovered in place.
    AdapterFault(BleError),
}

/// Owns the adapter and drives discovery and connection.
pub struct ScanController<A: BleAdapter> {
    adapter: A,
    target: ScanTarget,
    timing: SessionConfig,
    state: ControllerState,
}

impl<A: BleAdapter> ScanController<A> {
    /// Create a controller in the `Idle` state.
    pub const fn new(adapter: A, target: ScanTarget, timing: SessionConfig) -> Self {
        Self {
            adapter,
            target,
            timing,
            state: ControllerState::Idle,
        }
    }

    /// Current state.
    pub const fn state(&self) -> ControllerState {
        self.state
    }

    /// The owned adapter.
    pub const fn adapter(&self) -> &A {
        &self.adapter
    }

    fn advance(&mut self, event: ControllerEvent) {
        match self.state.on(event) {
            Some(next) => {
                debug!(from = %self.state, to = %next, ?event, "Controller transition");
                self.state = next;
            }
            None => warn!(state = %self.state, ?event, "Ignoring unexpected controller event"),
        }
    }

    /// Scan until a device advertising `name` is seen or `timeout` elapses.
    ///
    /// Returns `Ok(false)` when the scale was not seen. Any fault during a
    /// scan resets the adapter and scanning resumes.
    ///
    /// # Errors
    ///
    /// Returns the reset error when the adapter cannot be recovered.
    pub async fn wait_for_device(&self, name: &str, timeout: Duration) -> BleResult<bool> {
        // A timeout past the clock's range means scanning never gives up.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining =
                deadline.map_or(timeout, |deadline| deadline.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                return Ok(false);
            }
            let window = self.timing.scan_window().min(remaining);

            match self.adapter.scan_for(name, window).await {
                Ok(true) => {
                    info!(name, "Scale found");
                    return Ok(true);
                }
                Ok(false) => debug!(name, "Scale not seen in this scan window"),
                Err(err) => {
                    warn!(error = %err, "Scan failed, resetting adapter");
                    self.adapter.reset().await?;
                }
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            tokio::time::sleep(self.timing.scan_pause()).await;
        }
    }

    /// Connect to `address`, trying up to `max_tries` times.
    ///
    /// Returns `Ok(None)` once the tries are used up.
    ///
    /// # Errors
    ///
    /// Returns adapter-level faults immediately; they are not retried here.
    pub async fn connect(
        &self,
        address: &str,
        address_type: AddressType,
        max_tries: u32,
    ) -> BleResult<Option<A::Link>> {
        for attempt in 1..=max_tries {
            match self
                .adapter
                .connect(address, address_type, self.timing.connect_timeout())
                .await
            {
                Ok(link) => {
                    info!(address, %address_type, attempt, "Connected to scale");
                    return Ok(Some(link));
                }
                Err(err) if err.is_connection_fault() => {
                    warn!(address, attempt, max_tries, error = %err, "Connection attempt failed");
                    if attempt < max_tries {
                        tokio::time::sleep(self.timing.retry_delay()).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn backoff(&mut self) {
        tokio::time::sleep(self.timing.idle_backoff()).await;
        self.advance(ControllerEvent::BackoffElapsed);
    }

    async fn recover(&mut self) {
        self.advance(ControllerEvent::AdapterFault);
        if let Err(err) = self.adapter.reset().await {
            error!(error = %err, "Adapter reset failed");
        }
        self.advance(ControllerEvent::ResetDone);
        self.backoff().await;
    }

    /// Run one iteration: scan, then connect.
    ///
    /// Every outcome except [`Acquisition::Connected`] leaves the controller
    /// `Idle` after its backoff sleep.
    pub async fn acquire(&mut self) -> Acquisition<A::Link> {
        self.advance(ControllerEvent::Start);

        let target = self.target.clone();
        match self
            .wait_for_device(&target.name, self.timing.scan_timeout())
            .await
        {
            Ok(true) => self.advance(ControllerEvent::DeviceFound),
            Ok(false) => {
                info!(name = %target.name, "Scale not found before scan timeout");
                self.advance(ControllerEvent::ScanTimedOut);
                self.backoff().await;
                return Acquisition::TimedOut;
            }
            Err(err) => {
                self.recover().await;
                return Acquisition::AdapterFault(err);
            }
        }

        match self
            .connect(&target.address, target.address_type, self.timing.connect_tries)
            .await
        {
            Ok(Some(link)) => {
                self.advance(ControllerEvent::LinkUp);
                Acquisition::Connected(link)
            }
            Ok(None) => {
                warn!(address = %target.address, "Giving up on scale after connection retries");
                self.advance(ControllerEvent::RetryExhausted);
                self.backoff().await;
                Acquisition::RetryExhausted
            }
            Err(err) => {
                warn!(error = %err, "Adapter fault while connecting");
                self.recover().await;
                Acquisition::AdapterFault(err)
            }
        }
    }

    /// Hand the link back after a session; resets the adapter first when the
    /// session hit an adapter fault.
    pub async fn release(&mut self, reset_adapter: bool) {
        if reset_adapter {
            self.recover().await;
        } else {
            self.advance(ControllerEvent::SessionEnded);
        }
    }
}

// =============================================================================
// RADIO
// =============================================================================

/// Enable LE mode on the radio by running `command` (e.g. `sudo btmgmt le on`).
///
/// # Errors
///
/// Returns [`ScaleError::RadioInitFailed`] if the command is empty, cannot be
/// spawned, or exits unsuccessfully. Callers treat this as fatal.
pub async fn init_radio_mode(command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| ScaleError::RadioInitFailed("no command configured".to_string()))?;

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ScaleError::RadioInitFailed(format!("{program}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScaleError::RadioInitFailed(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    info!(output = %stdout.trim(), "BLE radio enabled");
    Ok(())
}
