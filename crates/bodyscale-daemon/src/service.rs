//! The daemon's outer loop.

use bodyscale_core::{
    Acquisition, BleAdapter, ReportSink, ScaleError, ScanController, SessionOrchestrator,
    SessionOutcome,
};
use tracing::{info, warn};

/// Run one discovery/connection attempt and, if a link comes up, one session.
///
/// Returns the session outcome, or `None` when no link was acquired.
pub async fn run_iteration<A: BleAdapter>(
    controller: &mut ScanController<A>,
    orchestrator: &SessionOrchestrator,
    sink: &dyn ReportSink,
) -> Option<SessionOutcome> {
    match controller.acquire().await {
        Acquisition::Connected(link) => {
            let outcome = orchestrator.run(link, sink).await;
            controller.release(outcome.needs_adapter_reset()).await;
            Some(outcome)
        }
        Acquisition::TimedOut | Acquisition::RetryExhausted => None,
        Acquisition::AdapterFault(err) => {
            let err = ScaleError::from(err);
            warn!(
                code = err.error_code(),
                recoverable = err.is_recoverable(),
                error = %err,
                "Adapter fault outside a session"
            );
            None
        }
    }
}

/// Read sessions until the process is stopped.
pub async fn run<A: BleAdapter>(
    mut controller: ScanController<A>,
    orchestrator: SessionOrchestrator,
    sink: Box<dyn ReportSink>,
) {
    let mut sessions: u64 = 0;
    loop {
        if let Some(outcome) = run_iteration(&mut controller, &orchestrator, sink.as_ref()).await {
            sessions += 1;
            match outcome {
                SessionOutcome::Reported { delivered, .. } => {
                    info!(sessions, delivered, "Session reported");
                }
                SessionOutcome::Incomplete(counts) => info!(sessions, ?counts, "Session incomplete"),
                SessionOutcome::Aborted {
                    phase,
                    reset_adapter,
                } => warn!(sessions, %phase, reset_adapter, "Session aborted"),
            }
        }
    }
}
