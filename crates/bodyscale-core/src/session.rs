//! One connected session with the scale.
//!
//! A session resolves the characteristic handles, subscribes to indications,
//! pushes the current time to the scale, listens for a fixed window and then
//! reports whatever was collected. Indications are forwarded by the transport
//! into a bounded channel; a single collector task owns the [`Aggregator`]
//! and returns it when the session stops it.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, RecordCounts};
use crate::ble::{BleError, BleResult, CharacteristicHandle, Indication, ScaleLink};
use crate::codec::{self, CharacteristicKind};
use crate::config::Config;
use crate::sink::ReportSink;
use crate::types::Report;

/// Per-session parameters.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Address of the connected scale, for logging.
    pub address: String,
    /// Seconds between the Unix epoch and the scale's epoch.
    pub time_offset_secs: i64,
    /// How long to listen after subscribing.
    pub listen_window: Duration,
    /// How long to wait for the time-sync write to be acknowledged.
    pub ack_timeout: Duration,
    /// Capacity of the indication queue.
    pub queue_capacity: usize,
    /// Height used for BMI instead of the scale's person record.
    pub height_cm_override: Option<u8>,
}

impl SessionContext {
    /// Build the context from loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.scale.address.clone(),
            time_offset_secs: config.scale.profile().time_offset_secs,
            listen_window: config.session.listen_window(),
            ack_timeout: config.session.ack_timeout(),
            queue_capacity: config.session.queue_capacity,
            height_cm_override: config.session.height_cm_override,
        }
    }
}

/// Step at which a session gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Looking up characteristic handles.
    HandleResolution,
    /// Enabling indications.
    Subscribing,
    /// Writing the time-sync command.
    TimeSync,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HandleResolution => "handle-resolution",
            Self::Subscribing => "subscribing",
            Self::TimeSync => "time-sync",
        };
        f.write_str(name)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// All three record kinds arrived and the report went to the sink.
    /// `delivered` is `false` when the sink failed or declined it.
    Reported {
        /// The finalized report.
        report: Report,
        /// Whether the sink accepted the report.
        delivered: bool,
    },
    /// The window closed without a complete set of records.
    Incomplete(RecordCounts),
    /// The session stopped early.
    Aborted {
        /// Where it stopped.
        phase: SessionPhase,
        /// Whether the fault was in the adapter rather than the link.
        reset_adapter: bool,
    },
}

impl SessionOutcome {
    /// Whether the caller should power-cycle the adapter.
    #[must_use]
    pub const fn needs_adapter_reset(&self) -> bool {
        matches!(
            self,
            Self::Aborted {
                reset_adapter: true,
                ..
            }
        )
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Resolved handles of the four characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicMap {
    /// Person characteristic.
    pub person: CharacteristicHandle,
    /// Weight characteristic.
    pub weight: CharacteristicHandle,
    /// Body-composition characteristic.
    pub body: CharacteristicHandle,
    /// Command characteristic.
    pub command: CharacteristicHandle,
}

impl CharacteristicMap {
    /// Resolve every characteristic on `link`.
    ///
    /// # Errors
    ///
    /// Fails on the first characteristic that cannot be found.
    pub async fn resolve<L: ScaleLink + ?Sized>(link: &L) -> BleResult<Self> {
        Ok(Self {
            person: link.resolve(CharacteristicKind::Person.uuid()).await?,
            weight: link.resolve(CharacteristicKind::Weight.uuid()).await?,
            body: link.resolve(CharacteristicKind::Body.uuid()).await?,
            command: link.resolve(CharacteristicKind::Command.uuid()).await?,
        })
    }

    /// Handle of `kind`.
    #[must_use]
    pub const fn handle(&self, kind: CharacteristicKind) -> CharacteristicHandle {
        match kind {
            CharacteristicKind::Person => self.person,
            CharacteristicKind::Weight => self.weight,
            CharacteristicKind::Body => self.body,
            CharacteristicKind::Command => self.command,
        }
    }

    /// The characteristic behind `handle`, if it is one of ours.
    #[must_use]
    pub fn kind_of(&self, handle: CharacteristicHandle) -> Option<CharacteristicKind> {
        CharacteristicKind::ALL
            .into_iter()
            .find(|kind| self.handle(*kind) == handle)
    }
}

// =============================================================================
// COLLECTOR
// =============================================================================

fn route(aggregator: &mut Aggregator, map: &CharacteristicMap, offset_secs: i64, ind: &Indication) {
    let Some(kind) = map.kind_of(ind.handle) else {
        warn!(handle = %ind.handle, len = ind.value.len(), "Indication on unknown handle");
        return;
    };

    match codec::decode(kind, &ind.value, offset_secs) {
        Ok(measurement) => {
            if !measurement.is_valid() {
                debug!(%kind, "Record without the expected magic byte");
            }
            if aggregator.add(measurement) {
                debug!(%kind, counts = ?aggregator.counts(), "Record stored");
            } else {
                debug!(%kind, "Duplicate record ignored");
            }
        }
        Err(err) => warn!(handle = %ind.handle, error = %err, "Dropping indication"),
    }
}

async fn collect(
    map: CharacteristicMap,
    offset_secs: i64,
    mut indications: mpsc::Receiver<Indication>,
    mut stop: oneshot::Receiver<()>,
) -> Aggregator {
    let mut aggregator = Aggregator::new();
    loop {
        tokio::select! {
            biased;
            Some(ind) = indications.recv() => route(&mut aggregator, &map, offset_secs, &ind),
            _ = &mut stop => break,
            else => break,
        }
    }
    while let Ok(ind) = indications.try_recv() {
        route(&mut aggregator, &map, offset_secs, &ind);
    }
    aggregator
}

struct Collector {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Aggregator>,
}

impl Collector {
    fn spawn(map: CharacteristicMap, offset_secs: i64, indications: mpsc::Receiver<Indication>) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(collect(map, offset_secs, indications, stop_rx));
        Self { stop, task }
    }

    /// Stop collecting, drain what is queued and return the aggregator.
    async fn finish(self) -> Aggregator {
        let _ = self.stop.send(());
        match self.task.await {
            Ok(aggregator) => aggregator,
            Err(err) => {
                error!(error = %err, "Indication collector failed");
                Aggregator::new()
            }
        }
    }

    fn cancel(self) {
        self.task.abort();
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Runs sessions against connected links.
#[derive(Debug, Clone)]
pub struct SessionOrchestrator {
    ctx: SessionContext,
}

/// Subscription order; the scale starts sending history once weight and
/// body are enabled.
const SUBSCRIBE_ORDER: [CharacteristicKind; 3] = [
    CharacteristicKind::Weight,
    CharacteristicKind::Body,
    CharacteristicKind::Person,
];

impl SessionOrchestrator {
    /// Create an orchestrator with the given parameters.
    #[must_use]
    pub const fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    async fn abort<L: ScaleLink>(link: &L, phase: SessionPhase, err: &BleError) -> SessionOutcome {
        warn!(%phase, error = %err, "Session aborted");
        if let Err(disconnect_err) = link.disconnect().await {
            debug!(error = %disconnect_err, "Disconnect after abort failed");
        }
        SessionOutcome::Aborted {
            phase,
            reset_adapter: err.is_adapter_fault(),
        }
    }

    /// Run one session on `link` and deliver the report to `sink`.
    ///
    /// Never fails: every fault is folded into the returned outcome.
    pub async fn run<L: ScaleLink>(&self, link: L, sink: &dyn ReportSink) -> SessionOutcome {
        info!(address = %self.ctx.address, "Session started");

        let map = match CharacteristicMap::resolve(&link).await {
            Ok(map) => map,
            Err(err) => return Self::abort(&link, SessionPhase::HandleResolution, &err).await,
        };
        debug!(?map, "Characteristic handles resolved");

        let (tx, rx) = mpsc::channel(self.ctx.queue_capacity.max(1));
        let collector = Collector::spawn(map, self.ctx.time_offset_secs, rx);

        for kind in SUBSCRIBE_ORDER {
            if let Err(err) = link.subscribe(map.handle(kind), tx.clone()).await {
                collector.cancel();
                return Self::abort(&link, SessionPhase::Subscribing, &err).await;
            }
        }
        drop(tx);

        let command = codec::encode_time_sync(Utc::now().timestamp(), self.ctx.time_offset_secs);
        match link.write(map.command, &command, self.ctx.ack_timeout).await {
            Ok(()) => debug!("Scale clock synchronised"),
            Err(err) if err.is_timeout() => {
                warn!(error = %err, "Time-sync acknowledgement missing, continuing");
            }
            Err(err) => {
                collector.cancel();
                return Self::abort(&link, SessionPhase::TimeSync, &err).await;
            }
        }

        info!(window_secs = self.ctx.listen_window.as_secs(), "Listening for indications");
        tokio::time::sleep(self.ctx.listen_window).await;

        if let Err(err) = link.disconnect().await {
            warn!(error = %err, "Disconnect failed");
        }

        let aggregator = collector.finish().await;
        if !aggregator.is_complete() {
            let counts = aggregator.counts();
            info!(?counts, "Incomplete data, no report");
            return SessionOutcome::Incomplete(counts);
        }

        let report = aggregator.finalize(self.ctx.height_cm_override);
        let delivered = match sink.submit(&report).await {
            Ok(receipt) => {
                info!(accepted = receipt.accepted, response = %receipt.payload, "Report submitted");
                receipt.accepted
            }
            Err(err) => {
                error!(error = %err, "Report delivery failed");
                false
            }
        };
        SessionOutcome::Reported { report, delivered }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::ble::mock::{MockLink, WriteBehaviour};
    use crate::codec::TIME_SYNC_OPCODE;
    use crate::sink::{SinkError, SinkReceipt, SinkResult};

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<Report>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn reports(&self) -> Vec<Report> {
            self.reports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn submit(&self, report: &Report) -> SinkResult<SinkReceipt> {
            self.reports.lock().unwrap().push(report.clone());
            if self.fail {
                return Err(SinkError::Transport("503 Service Unavailable".into()));
            }
            Ok(SinkReceipt {
                accepted: true,
                payload: "OK".into(),
            })
        }
    }

    fn expect_report(outcome: SessionOutcome) -> (Report, bool) {
        match outcome {
            SessionOutcome::Reported { report, delivered } => (report, delivered),
            other => panic!("expected a report, got {other:?}"),
        }
    }

    fn ctx() -> SessionContext {
        SessionContext {
            address: "F1:37:57:6C:DE:A8".into(),
            time_offset_secs: 0,
            listen_window: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            queue_capacity: 8,
            height_cm_override: None,
        }
    }

    fn person(height_cm: u8) -> Vec<u8> {
        vec![0x84, 0x00, 0x01, 0x00, 0x00, 35, height_cm, 0x00, 0x01]
    }

    fn weight(raw_kg: u16, ts: u32) -> Vec<u8> {
        let mut buf = vec![0x1d];
        buf.extend_from_slice(&raw_kg.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0, 1]);
        buf
    }

    fn body(ts: u32) -> Vec<u8> {
        let mut buf = vec![0x6f];
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.push(1);
        for field in [1650u16, 0x00c8, 0x0258, 0x0190, 0x0032] {
            buf.extend_from_slice(&field.to_le_bytes());
        }
        buf
    }

    fn full_link() -> MockLink {
        MockLink::new()
            .with_indication(CharacteristicKind::Person, person(165))
            .with_indication(CharacteristicKind::Weight, weight(5050, 1000))
            .with_indication(CharacteristicKind::Weight, weight(5200, 2000))
            .with_indication(CharacteristicKind::Body, body(2000))
    }

    #[test]
    fn test_kind_of_handle() {
        let map = CharacteristicMap {
            person: CharacteristicHandle(1),
            weight: CharacteristicHandle(2),
            body: CharacteristicHandle(3),
            command: CharacteristicHandle(4),
        };
        assert_eq!(map.kind_of(CharacteristicHandle(2)), Some(CharacteristicKind::Weight));
        assert_eq!(map.kind_of(CharacteristicHandle(4)), Some(CharacteristicKind::Command));
        assert_eq!(map.kind_of(CharacteristicHandle(9)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listening_window_bounds_collection() {
        let link = MockLink::new()
            .with_indication(CharacteristicKind::Weight, weight(5200, 2000))
            .with_indication(CharacteristicKind::Body, body(2000))
            .with_delayed_indication(
                CharacteristicKind::Person,
                person(165),
                Duration::from_secs(20),
            )
            .with_delayed_indication(
                CharacteristicKind::Weight,
                weight(5050, 1000),
                Duration::from_secs(40),
            );
        let started = tokio::time::Instant::now();

        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;

        assert!(started.elapsed() >= Duration::from_secs(30));
        let (report, _) = expect_report(outcome);
        assert_eq!(report.persons.len(), 1);
        let timestamps: Vec<u64> = report.weights.iter().map(|w| w.timestamp).collect();
        assert_eq!(timestamps, vec![2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lasts_the_listening_window() {
        let mut context = ctx();
        context.listen_window = Duration::from_secs(45);
        let started = tokio::time::Instant::now();

        let outcome = SessionOrchestrator::new(context)
            .run(MockLink::new(), &RecordingSink::default())
            .await;

        assert!(matches!(outcome, SessionOutcome::Incomplete(_)));
        assert!(started.elapsed() >= Duration::from_secs(45));
        assert!(started.elapsed() < Duration::from_secs(46));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_session_is_reported() {
        let link = full_link();
        let observer = link.clone();
        let sink = RecordingSink::default();

        let outcome = SessionOrchestrator::new(ctx()).run(link, &sink).await;

        let (report, delivered) = expect_report(outcome);
        assert!(delivered);
        assert_eq!(report.persons.len(), 1);
        assert_eq!(report.bodies.len(), 1);
        let weights: Vec<(u64, f64)> = report.weights.iter().map(|w| (w.timestamp, w.bmi)).collect();
        assert_eq!(weights, vec![(2000, 19.1), (1000, 18.5)]);
        assert_eq!(sink.reports(), vec![report]);
        assert!(observer.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_in_order_and_syncs_clock() {
        let link = full_link();
        let observer = link.clone();
        let before = Utc::now().timestamp();

        SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;

        assert_eq!(
            observer.subscriptions(),
            vec![
                MockLink::handle_of(CharacteristicKind::Weight),
                MockLink::handle_of(CharacteristicKind::Body),
                MockLink::handle_of(CharacteristicKind::Person),
            ]
        );
        let writes = observer.writes();
        assert_eq!(writes.len(), 1);
        let (handle, value) = &writes[0];
        assert_eq!(*handle, MockLink::handle_of(CharacteristicKind::Command));
        assert_eq!(value.len(), 5);
        assert_eq!(value[0], TIME_SYNC_OPCODE);
        let sent = i64::from(u32::from_le_bytes([value[1], value[2], value[3], value[4]]));
        assert!((sent - before).abs() <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_are_collapsed() {
        let link = full_link()
            .with_indication(CharacteristicKind::Weight, weight(5200, 2000))
            .with_indication(CharacteristicKind::Person, person(165));
        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;

        let (report, _) = expect_report(outcome);
        assert_eq!(report.weights.len(), 2);
        assert_eq!(report.persons.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_handle_and_malformed_payload_are_dropped() {
        let link = full_link()
            .with_stray_indication(CharacteristicHandle(0x0042), vec![0xde, 0xad])
            .with_indication(CharacteristicKind::Body, vec![0x6f, 0x01, 0x02]);
        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;

        let (report, _) = expect_report(outcome);
        assert_eq!(report.bodies.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_person_is_incomplete() {
        let link = MockLink::new()
            .with_indication(CharacteristicKind::Weight, weight(5200, 2000))
            .with_indication(CharacteristicKind::Body, body(2000));
        let sink = RecordingSink::default();
        let outcome = SessionOrchestrator::new(ctx()).run(link, &sink).await;

        assert_eq!(
            outcome,
            SessionOutcome::Incomplete(RecordCounts {
                persons: 0,
                weights: 1,
                bodies: 1,
            })
        );
        assert!(sink.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_height_override_applies_to_bmi() {
        let mut context = ctx();
        context.height_cm_override = Some(180);
        let link = MockLink::new()
            .with_indication(CharacteristicKind::Person, person(0))
            .with_indication(CharacteristicKind::Weight, weight(6000, 1000))
            .with_indication(CharacteristicKind::Body, body(1000));
        let outcome = SessionOrchestrator::new(context)
            .run(link, &RecordingSink::default())
            .await;

        let (report, _) = expect_report(outcome);
        assert!((report.weights[0].bmi - 18.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_aborts() {
        let link = full_link().without(CharacteristicKind::Command);
        let observer = link.clone();
        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;

        assert_eq!(
            outcome,
            SessionOutcome::Aborted {
                phase: SessionPhase::HandleResolution,
                reset_adapter: false,
            }
        );
        assert!(observer.is_disconnected());
        assert!(observer.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_aborts() {
        let link = full_link().with_failing_subscribe();
        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;

        assert_eq!(
            outcome,
            SessionOutcome::Aborted {
                phase: SessionPhase::Subscribing,
                reset_adapter: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_is_tolerated() {
        let link = full_link().with_write_behaviour(WriteBehaviour::Timeout);
        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;
        assert!(matches!(outcome, SessionOutcome::Reported { delivered: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_during_sync_aborts() {
        let link = full_link().with_write_behaviour(WriteBehaviour::Drop);
        let observer = link.clone();
        let sink = RecordingSink::default();
        let outcome = SessionOrchestrator::new(ctx()).run(link, &sink).await;

        assert_eq!(
            outcome,
            SessionOutcome::Aborted {
                phase: SessionPhase::TimeSync,
                reset_adapter: false,
            }
        );
        assert!(!outcome.needs_adapter_reset());
        assert!(observer.is_disconnected());
        assert!(sink.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_fault_during_sync_requests_reset() {
        let link = full_link().with_write_behaviour(WriteBehaviour::AdapterFault);
        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;

        assert!(outcome.needs_adapter_reset());
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted {
                phase: SessionPhase::TimeSync,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_failure_still_reports() {
        let link = full_link().with_failing_disconnect();
        let outcome = SessionOrchestrator::new(ctx())
            .run(link, &RecordingSink::default())
            .await;
        assert!(matches!(outcome, SessionOutcome::Reported { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_not_delivered() {
        let sink = RecordingSink::failing();
        let outcome = SessionOrchestrator::new(ctx()).run(full_link(), &sink).await;
        assert!(matches!(outcome, SessionOutcome::Reported { delivered: false, .. }));
        assert_eq!(sink.reports().len(), 1);
    }

    #[test]
    fn test_context_from_config() {
        let config = Config::from_toml_str(
            r#"
            [scale]
            address = "F1:37:57:6C:DE:A8"
            name = "013197"
            model = "BS444"

            [session]
            listen_secs = 45
            height_cm_override = 172
            "#,
        )
        .unwrap();
        let ctx = SessionContext::from_config(&config);
        assert_eq!(ctx.time_offset_secs, 1_262_304_000);
        assert_eq!(ctx.listen_window, Duration::from_secs(45));
        assert_eq!(ctx.height_cm_override, Some(172));
    }
}
