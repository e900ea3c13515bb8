//! Form-post reporting sink.
//!
//! The kiosk this daemon runs on keeps the RFID token of whoever is standing
//! at it in a text file. Each report is posted as a URL-encoded form together
//! with that token, and the server's answer is written to a response file
//! for the kiosk UI to display.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bodyscale_core::{LogSink, Report, ReportSink, SinkConfig, SinkError, SinkReceipt, SinkResult};
use tracing::{debug, info};

/// Response written when no card is present.
pub const NO_CARD: &str = "No card";

/// Posts the latest weight with the current RFID token.
#[derive(Debug, Clone)]
pub struct FormPostSink {
    client: reqwest::Client,
    url: String,
    rfid_path: PathBuf,
    response_path: PathBuf,
}

fn io_error(path: &Path, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn transport_error(err: reqwest::Error) -> SinkError {
    SinkError::Transport(err.to_string())
}

impl FormPostSink {
    /// Build a sink posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &SinkConfig, url: impl Into<String>) -> SinkResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(transport_error)?;

        Ok(Self {
            client,
            url: url.into(),
            rfid_path: config.rfid_path.clone(),
            response_path: config.response_path.clone(),
        })
    }

    async fn read_rfid(&self) -> SinkResult<String> {
        let raw = tokio::fs::read_to_string(&self.rfid_path)
            .await
            .map_err(|e| io_error(&self.rfid_path, e))?;
        Ok(raw.trim().to_string())
    }

    async fn write_response(&self, body: &str) -> SinkResult<()> {
        tokio::fs::write(&self.response_path, body)
            .await
            .map_err(|e| io_error(&self.response_path, e))
    }
}

#[async_trait]
impl ReportSink for FormPostSink {
    async fn submit(&self, report: &Report) -> SinkResult<SinkReceipt> {
        let rfid = self.read_rfid().await?;
        if rfid.is_empty() {
            info!("No card present, report not submitted");
            self.write_response(NO_CARD).await?;
            return Ok(SinkReceipt {
                accepted: false,
                payload: NO_CARD.to_string(),
            });
        }

        let weight = report
            .latest_weight()
            .ok_or(SinkError::EmptyReport("weight"))?;
        // `{:?}` keeps the decimal point on whole kilograms ("62.0")
        let form = [("rfid", rfid), ("one", format!("{:?}", weight.weight_kg))];

        debug!(url = %self.url, weight_kg = weight.weight_kg, "Posting report");
        let response = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        self.write_response(&body).await?;
        Ok(SinkReceipt {
            accepted: status.is_success(),
            payload: body,
        })
    }
}

/// The sink selected by `config`: a [`FormPostSink`] when a URL is set,
/// otherwise a [`LogSink`].
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built.
pub fn from_config(config: &SinkConfig) -> SinkResult<Box<dyn ReportSink>> {
    match &config.url {
        Some(url) => Ok(Box::new(FormPostSink::new(config, url.clone())?)),
        None => {
            info!("No sink URL configured, reports will only be logged");
            Ok(Box::new(LogSink))
        }
    }
}

#[cfg(test)]
mod tests {
    use bodyscale_core::WeightRecord;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn report() -> Report {
        Report {
            persons: Vec::new(),
            weights: vec![
                WeightRecord {
                    valid: true,
                    weight_kg: 62.0,
                    timestamp: 2000,
                    person_index: 1,
                    bmi: 19.1,
                },
                WeightRecord {
                    valid: true,
                    weight_kg: 61.5,
                    timestamp: 1000,
                    person_index: 1,
                    bmi: 19.0,
                },
            ],
            bodies: Vec::new(),
        }
    }

    fn config(dir: &TempDir, rfid: &str) -> SinkConfig {
        let rfid_path = dir.path().join("rfid.txt");
        std::fs::write(&rfid_path, rfid).unwrap();
        SinkConfig {
            url: None,
            rfid_path,
            response_path: dir.path().join("response.txt"),
            ..SinkConfig::default()
        }
    }

    /// Accept one request, return it as text and answer with `reply`.
    async fn serve_once(listener: TcpListener, reply: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            request.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
            reply.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8(request).unwrap()
    }

    #[tokio::test]
    async fn test_no_card_skips_submission() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "  \n");
        let sink = FormPostSink::new(&config, "http://127.0.0.1:9/weight.php").unwrap();

        let receipt = sink.submit(&report()).await.unwrap();
        assert!(!receipt.accepted);
        assert_eq!(receipt.payload, NO_CARD);
        assert_eq!(std::fs::read_to_string(&config.response_path).unwrap(), NO_CARD);
    }

    #[tokio::test]
    async fn test_missing_rfid_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let config = SinkConfig {
            rfid_path: dir.path().join("absent.txt"),
            response_path: dir.path().join("response.txt"),
            ..SinkConfig::default()
        };
        let sink = FormPostSink::new(&config, "http://127.0.0.1:9/weight.php").unwrap();

        let err = sink.submit(&report()).await.unwrap_err();
        assert!(matches!(err, SinkError::Io { .. }));
    }

    #[tokio::test]
    async fn test_report_without_weights_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "04A1B2C3");
        let sink = FormPostSink::new(&config, "http://127.0.0.1:9/weight.php").unwrap();

        let empty = Report {
            persons: Vec::new(),
            weights: Vec::new(),
            bodies: Vec::new(),
        };
        let err = sink.submit(&empty).await.unwrap_err();
        assert!(matches!(err, SinkError::EmptyReport("weight")));
    }

    #[tokio::test]
    async fn test_posts_latest_weight_with_rfid() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "04A1B2C3\n");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sensors/weight.php", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(listener, "Saved 62.0 kg"));

        let sink = FormPostSink::new(&config, url).unwrap();
        let receipt = sink.submit(&report()).await.unwrap();
        let request = server.await.unwrap();

        assert!(receipt.accepted);
        assert_eq!(receipt.payload, "Saved 62.0 kg");
        assert_eq!(
            std::fs::read_to_string(&config.response_path).unwrap(),
            "Saved 62.0 kg"
        );

        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /sensors/weight.php"));
        assert!(lower.contains("content-type: application/x-www-form-urlencoded"));
        assert!(lower.contains("user-agent: raspberrypi/bodyscale"));
        assert!(request.ends_with("rfid=04A1B2C3&one=62.0"));
    }

    #[test]
    fn test_from_config_without_url_logs_only() {
        assert!(from_config(&SinkConfig::default()).is_ok());
    }

    #[test]
    fn test_from_config_with_url_posts() {
        let config = SinkConfig {
            url: Some("https://example.com/sensors/weight.php".into()),
            ..SinkConfig::default()
        };
        assert!(from_config(&config).is_ok());
    }
}
