//! In-memory BLE transport with scripted behaviour.
//!
//! Used by the controller and session tests, and by the daemon when built
//! with `mock-bluetooth` on machines without BlueZ.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::{AddressType, BleAdapter, BleError, BleResult, CharacteristicHandle, Indication, ScaleLink};
use crate::codec::CharacteristicKind;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the mock answers command writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteBehaviour {
    /// The write is acknowledged.
    #[default]
    Ack,
    /// The acknowledgement never arrives.
    Timeout,
    /// The connection drops during the write.
    Drop,
    /// The adapter faults during the write.
    AdapterFault,
}

/// Scripted scan outcome.
#[derive(Debug)]
pub enum ScanStep {
    /// The device is seen.
    Found,
    /// The scan window elapses without the device.
    Missing,
    /// The adapter faults.
    Fault,
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Scripted adapter.
///
/// Scan and connect outcomes are consumed in order; once a script runs out,
/// scans report the device missing and connects fail with a connection fault.
#[derive(Debug, Default)]
pub struct MockAdapter {
    scans: Mutex<VecDeque<ScanStep>>,
    connects: Mutex<VecDeque<BleResult<MockLink>>>,
    fail_reset: AtomicBool,
    scan_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    resets: AtomicUsize,
}

impl MockAdapter {
    /// Create an adapter with empty scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append scan outcomes.
    #[must_use]
    pub fn with_scans(self, steps: impl IntoIterator<Item = ScanStep>) -> Self {
        lock(&self.scans).extend(steps);
        self
    }

    /// Append a successful connection yielding `link`.
    #[must_use]
    pub fn with_link(self, link: MockLink) -> Self {
        lock(&self.connects).push_back(Ok(link));
        self
    }

    /// Append `n` failed connection attempts.
    #[must_use]
    pub fn with_connect_failures(self, n: usize) -> Self {
        {
            let mut connects = lock(&self.connects);
            for _ in 0..n {
                connects.push_back(Err(BleError::connection("le-connection-abort-by-local")));
            }
        }
        self
    }

    /// Append an adapter fault on the next connection attempt.
    #[must_use]
    pub fn with_connect_adapter_fault(self) -> Self {
        lock(&self.connects).push_back(Err(BleError::adapter("hci0: I/O error")));
        self
    }

    /// Make every reset fail.
    #[must_use]
    pub fn with_failing_reset(self) -> Self {
        self.fail_reset.store(true, Ordering::SeqCst);
        self
    }

    /// Number of scan calls made.
    #[must_use]
    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    /// Number of connection attempts made.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of resets performed.
    #[must_use]
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    type Link = MockLink;

    async fn scan_for(&self, _name: &str, window: Duration) -> BleResult<bool> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let step = lock(&self.scans).pop_front().unwrap_or(ScanStep::Missing);
        match step {
            ScanStep::Found => Ok(true),
            ScanStep::Missing => {
                tokio::time::sleep(window).await;
                Ok(false)
            }
            ScanStep::Fault => Err(BleError::adapter("org.bluez.Error.NotReady")),
        }
    }

    async fn connect(
        &self,
        _address: &str,
        _address_type: AddressType,
        _timeout: Duration,
    ) -> BleResult<MockLink> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.connects)
            .pop_front()
            .unwrap_or_else(|| Err(BleError::connection("device unreachable")))
    }

    async fn reset(&self) -> BleResult<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(BleError::AdapterNotFound);
        }
        Ok(())
    }
}

// =============================================================================
// LINK
// =============================================================================

#[derive(Debug, Default)]
struct LinkState {
    characteristics: Mutex<HashMap<Uuid, CharacteristicHandle>>,
    pending: Mutex<Vec<(Indication, Duration)>>,
    stray: Mutex<Vec<Indication>>,
    write_behaviour: Mutex<WriteBehaviour>,
    fail_subscribe: AtomicBool,
    fail_disconnect: AtomicBool,
    disconnected: AtomicBool,
    writes: Mutex<Vec<(CharacteristicHandle, Vec<u8>)>>,
    subscriptions: Mutex<Vec<CharacteristicHandle>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

/// Scripted connection to a scale.
///
/// Clones share state, so a test can keep a clone to inspect writes and
/// disconnects after handing the link to the code under test.
#[derive(Debug, Clone)]
pub struct MockLink {
    state: Arc<LinkState>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// A link exposing all four scale characteristics.
    #[must_use]
    pub fn new() -> Self {
        let state = LinkState::default();
        {
            let mut chars = lock(&state.characteristics);
            for kind in CharacteristicKind::ALL {
                chars.insert(kind.uuid(), Self::handle_of(kind));
            }
        }
        Self {
            state: Arc::new(state),
        }
    }

    /// The handle this mock assigns to `kind`.
    #[must_use]
    pub const fn handle_of(kind: CharacteristicKind) -> CharacteristicHandle {
        match kind {
            CharacteristicKind::Person => CharacteristicHandle(0x0010),
            CharacteristicKind::Weight => CharacteristicHandle(0x0013),
            CharacteristicKind::Body => CharacteristicHandle(0x0016),
            CharacteristicKind::Command => CharacteristicHandle(0x0019),
        }
    }

    /// Remove a characteristic so resolving it fails.
    #[must_use]
    pub fn without(self, kind: CharacteristicKind) -> Self {
        lock(&self.state.characteristics).remove(&kind.uuid());
        self
    }

    /// Queue `value` for delivery once `kind` is subscribed.
    #[must_use]
    pub fn with_indication(self, kind: CharacteristicKind, value: impl Into<Vec<u8>>) -> Self {
        self.with_delayed_indication(kind, value, Duration::ZERO)
    }

    /// Queue `value` for delivery `after` the subscription to `kind`.
    #[must_use]
    pub fn with_delayed_indication(
        self,
        kind: CharacteristicKind,
        value: impl Into<Vec<u8>>,
        after: Duration,
    ) -> Self {
        let indication = Indication {
            handle: Self::handle_of(kind),
            value: value.into(),
        };
        lock(&self.state.pending).push((indication, after));
        self
    }

    /// Queue a value on a handle the scale never advertised; it is delivered
    /// with the first subscription.
    #[must_use]
    pub fn with_stray_indication(self, handle: CharacteristicHandle, value: impl Into<Vec<u8>>) -> Self {
        lock(&self.state.stray).push(Indication {
            handle,
            value: value.into(),
        });
        self
    }

    /// Choose how command writes are answered.
    #[must_use]
    pub fn with_write_behaviour(self, behaviour: WriteBehaviour) -> Self {
        *lock(&self.state.write_behaviour) = behaviour;
        self
    }

    /// Make subscriptions fail with a connection fault.
    #[must_use]
    pub fn with_failing_subscribe(self) -> Self {
        self.state.fail_subscribe.store(true, Ordering::SeqCst);
        self
    }

    /// Make disconnect fail.
    #[must_use]
    pub fn with_failing_disconnect(self) -> Self {
        self.state.fail_disconnect.store(true, Ordering::SeqCst);
        self
    }

    /// Values written so far.
    #[must_use]
    pub fn writes(&self) -> Vec<(CharacteristicHandle, Vec<u8>)> {
        lock(&self.state.writes).clone()
    }

    /// Handles subscribed so far, in order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<CharacteristicHandle> {
        lock(&self.state.subscriptions).clone()
    }

    /// Whether `disconnect` was called.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScaleLink for MockLink {
    async fn resolve(&self, uuid: Uuid) -> BleResult<CharacteristicHandle> {
        lock(&self.state.characteristics)
            .get(&uuid)
            .copied()
            .ok_or(BleError::CharacteristicNotFound { uuid })
    }

    async fn subscribe(
        &self,
        handle: CharacteristicHandle,
        sink: mpsc::Sender<Indication>,
    ) -> BleResult<()> {
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BleError::connection("device disconnected"));
        }

        let first = {
            let mut subs = lock(&self.state.subscriptions);
            subs.push(handle);
            subs.len() == 1
        };

        let mut batch: Vec<(Indication, Duration)> = if first {
            std::mem::take(&mut *lock(&self.state.stray))
                .into_iter()
                .map(|ind| (ind, Duration::ZERO))
                .collect()
        } else {
            Vec::new()
        };
        lock(&self.state.pending).retain(|(ind, after)| {
            if ind.handle == handle {
                batch.push((ind.clone(), *after));
                false
            } else {
                true
            }
        });
        batch.sort_by_key(|(_, after)| *after);

        let subscribed_at = Instant::now();
        let forwarder = tokio::spawn(async move {
            for (indication, after) in batch {
                tokio::time::sleep_until(subscribed_at + after).await;
                if sink.send(indication).await.is_err() {
                    break;
                }
            }
        });
        lock(&self.state.forwarders).push(forwarder);
        Ok(())
    }

    async fn write(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        ack_timeout: Duration,
    ) -> BleResult<()> {
        lock(&self.state.writes).push((handle, value.to_vec()));
        let behaviour = *lock(&self.state.write_behaviour);
        match behaviour {
            WriteBehaviour::Ack => Ok(()),
            WriteBehaviour::Timeout => Err(BleError::NotificationTimeout {
                waited: ack_timeout,
            }),
            WriteBehaviour::Drop => Err(BleError::connection("device disconnected")),
            WriteBehaviour::AdapterFault => Err(BleError::adapter("hci0: controller reset")),
        }
    }

    async fn disconnect(&self) -> BleResult<()> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        for forwarder in lock(&self.state.forwarders).drain(..) {
            forwarder.abort();
        }
        if self.state.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BleError::connection("not connected"));
        }
        Ok(())
    }
}
