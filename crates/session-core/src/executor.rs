use crate::error::{LoadError, RequestFailure};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Per-request context handed to the executor.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Globally unique across the run.
    pub session_id: u64,
    /// Sessions completed by this worker so far.
    pub session_round: u64,
    /// Transitions taken in the current session.
    pub transition: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub latency_ms: u64,
}

pub type ExecuteFuture<'a> =
    Pin<Box<dyn std::future::Future<Output = Result<RequestOutcome, RequestFailure>> + Send + 'a>>;

/// Performs the network interaction behind one operation.
pub trait RequestExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(&'a self, operation: &'a str, context: &'a SessionContext) -> ExecuteFuture<'a>;
}

/// Mock executor for dry runs and tests: sleeps, then succeeds or fails.
pub struct MockExecutor {
    delay_ms: u64,
    fail: bool,
}

impl MockExecutor {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            fail: false,
        }
    }

    /// Every request is rejected after the delay.
    pub fn failing(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            fail: true,
        }
    }
}

impl RequestExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(&'a self, operation: &'a str, _context: &'a SessionContext) -> ExecuteFuture<'a> {
        Box::pin(async move {
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }

            if self.fail {
                Err(RequestFailure::Rejected(format!("mock failure for {operation}")))
            } else {
                Ok(RequestOutcome {
                    latency_ms: self.delay_ms,
                })
            }
        })
    }
}

/// Server-side technology of the emulated application; decides URL layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFlavor {
    #[default]
    Php,
    Servlets,
    Ejb,
}

impl BackendFlavor {
    pub fn path_for(&self, operation: &str) -> String {
        match self {
            BackendFlavor::Php => format!("PHP/{operation}.php"),
            BackendFlavor::Servlets => format!("servlet/edu.rice.rubis.servlets.{operation}"),
            BackendFlavor::Ejb => {
                format!("ejb_rubis_web/servlet/edu.rice.rubis.beans.servlets.{operation}")
            }
        }
    }
}

/// Issues one GET per operation against the configured backend.
pub struct HttpExecutor {
    client: reqwest::Client,
    base: url::Url,
    flavor: BackendFlavor,
}

impl HttpExecutor {
    pub fn new(base_url: &str, flavor: BackendFlavor, timeout_ms: u64) -> Result<Self, LoadError> {
        let mut base = url::Url::parse(base_url)
            .map_err(|e| LoadError::config(format!("invalid target.base_url {base_url:?}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|e| LoadError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            flavor,
        })
    }

    pub fn url_for(&self, operation: &str) -> Result<url::Url, url::ParseError> {
        self.base.join(&self.flavor.path_for(operation))
    }
}

impl RequestExecutor for HttpExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(&'a self, operation: &'a str, context: &'a SessionContext) -> ExecuteFuture<'a> {
        Box::pin(async move {
            let url = self
                .url_for(operation)
                .map_err(|e| RequestFailure::Transport(e.to_string()))?;
            let start = Instant::now();

            let response = self
                .client
                .get(url)
                .header("X-Session-Id", context.session_id.to_string())
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        RequestFailure::Timeout
                    } else {
                        RequestFailure::Transport(e.to_string())
                    }
                })?;

            let status = response.status();
            // Drain the body so the page is actually fetched.
            let body = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    RequestFailure::Timeout
                } else {
                    RequestFailure::Transport(e.to_string())
                }
            })?;
            let latency_ms = start.elapsed().as_millis() as u64;

            if !status.is_success() {
                return Err(RequestFailure::Status(status.as_u16()));
            }
            if body.is_empty() {
                return Err(RequestFailure::Rejected("empty page".to_string()));
            }

            Ok(RequestOutcome { latency_ms })
        })
    }
}
