//! HTTP HEAD probe with HTTPS-then-HTTP fallback.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::probes::{HeadOutcome, HttpProbe};

pub struct HttpPinger {
    client: reqwest::Client,
}

struct AttemptError {
    message: String,
    timed_out: bool,
}

impl HttpPinger {
    pub fn new() -> Self {
        // Invalid upstream certs are common on internal ingresses and must
        // not read as DOWN.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn attempt(&self, url: &str, timeout: Duration) -> Result<u16, AttemptError> {
        match self.client.head(url).timeout(timeout).send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) => Err(AttemptError {
                message: if e.is_timeout() {
                    format!("timeout after {}ms", timeout.as_millis())
                } else {
                    e.to_string()
                },
                timed_out: e.is_timeout(),
            }),
        }
    }
}

impl Default for HttpPinger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpProbe for HttpPinger {
    async fn head(&self, host: &str, timeout: Duration) -> HeadOutcome {
        let started = Instant::now();

        match self.attempt(&format!("https://{host}"), timeout).await {
            Ok(code) => HeadOutcome {
                code: Some(code),
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
                timed_out: false,
            },
            Err(https_err) => {
                debug!(host = %host, error = %https_err.message, "https_probe_failed_trying_http");
                let fallback_started = Instant::now();
                match self.attempt(&format!("http://{host}"), timeout).await {
                    Ok(code) => HeadOutcome {
                        code: Some(code),
                        latency_ms: fallback_started.elapsed().as_millis() as u64,
                        error: None,
                        timed_out: false,
                    },
                    Err(http_err) => HeadOutcome {
                        code: None,
                        latency_ms: started.elapsed().as_millis() as u64,
                        timed_out: https_err.timed_out && http_err.timed_out,
                        error: Some(http_err.message),
                    },
                }
            }
        }
    }
}
