use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::error::ProxyError;

/// The proxy's administrative API: read and replace the whole document.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility.
pub trait ProxyAdmin: Send + Sync {
    /// Fetch the full live configuration. An empty proxy yields `Value::Null`.
    fn fetch_config<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProxyError>> + Send + 'a>>;

    /// Replace the live configuration with `document`.
    fn load_config<'a>(
        &'a self,
        document: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + 'a>>;
}

/// HTTP client for the admin endpoint (`GET /config/`, `POST /load`).
pub struct HttpAdminClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAdminClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProxyError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Unreachable {
                url: base_url.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(url: &str, resp: reqwest::Response) -> Result<String, ProxyError> {
        let status = resp.status();
        let body = resp.text().await.map_err(|e| ProxyError::Unreachable {
            url: url.to_string(),
            message: format!("failed to read response: {e}"),
        })?;
        if !status.is_success() {
            return Err(ProxyError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

impl ProxyAdmin for HttpAdminClient {
    fn fetch_config<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/config/", self.base_url);
            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| ProxyError::Unreachable {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
            let body = Self::check(&url, resp).await?;
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body)
                .map_err(|e| ProxyError::InvalidDocument(format!("{url}: {e}")))
        })
    }

    fn load_config<'a>(
        &'a self,
        document: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/load", self.base_url);
            let resp = self
                .http
                .post(&url)
                .json(document)
                .send()
                .await
                .map_err(|e| ProxyError::Unreachable {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
            Self::check(&url, resp).await?;
            tracing::debug!(url = %url, "Loaded proxy configuration");
            Ok(())
        })
    }
}

/// In-memory admin API for tests. Counts round-trips.
pub struct MemoryAdminClient {
    document: Mutex<Value>,
    fetches: AtomicUsize,
    loads: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemoryAdminClient {
    pub fn new(document: Value) -> Self {
        Self {
            document: Mutex::new(document),
            fetches: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn document(&self) -> Value {
        self.document
            .lock()
            .map(|d| d.clone())
            .unwrap_or(Value::Null)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn reachable(&self) -> Result<(), ProxyError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProxyError::Unreachable {
                url: "memory://".into(),
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryAdminClient {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

impl ProxyAdmin for MemoryAdminClient {
    fn fetch_config<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.reachable()?;
            Ok(self.document())
        })
    }

    fn load_config<'a>(
        &'a self,
        document: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.reachable()?;
            if let Ok(mut current) = self.document.lock() {
                *current = document.clone();
            }
            Ok(())
        })
    }
}
