//! Hand-off point for finished reports.
//!
//! The core produces at most one [`Report`] per session and passes it to a
//! [`ReportSink`]. How the sink delivers it (HTTP form, file, log) is up to
//! the implementation; the core only logs the returned [`SinkReceipt`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::Report;

/// Outcome of a delivered report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkReceipt {
    /// Whether the receiving side accepted the report.
    pub accepted: bool,
    /// Opaque response body, kept for logging.
    pub payload: String,
}

/// Errors raised while delivering a report.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Reading or writing a side file failed.
    #[error("Sink I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The remote endpoint could not be reached or answered with an error.
    #[error("Sink transport error: {0}")]
    Transport(String),

    /// The report has nothing the sink can submit.
    #[error("Report has no {0} records")]
    EmptyReport(&'static str),

    /// The report could not be encoded.
    #[error("Failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Destination for session reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver `report`.
    async fn submit(&self, report: &Report) -> SinkResult<SinkReceipt>;
}

/// Sink that writes the report to the log as JSON.
///
/// Used when no remote endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn submit(&self, report: &Report) -> SinkResult<SinkReceipt> {
        let payload = serde_json::to_string(report)?;
        info!(report = %payload, "Session report");
        Ok(SinkReceipt {
            accepted: true,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WeightRecord;

    #[tokio::test]
    async fn test_log_sink_returns_json_payload() {
        let report = Report {
            persons: Vec::new(),
            weights: vec![WeightRecord {
                valid: true,
                weight_kg: 62.0,
                timestamp: 2000,
                person_index: 1,
                bmi: 19.1,
            }],
            bodies: Vec::new(),
        };
        let receipt = LogSink.submit(&report).await.unwrap();
        assert!(receipt.accepted);
        assert!(receipt.payload.contains("\"bmi\":19.1"));
        let decoded: Report = serde_json::from_str(&receipt.payload).unwrap();
        assert_eq!(decoded, report);
    }
}
