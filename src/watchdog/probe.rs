//! Health Probe Module
//!
//! One bounded-time HTTP request against a watched URL. Probes keep no state
//! between calls.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Why a probe failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),
}

/// Result of a single probe
pub type ProbeOutcome = Result<(), ProbeFailure>;

/// Basic auth credentials sent with every probe of a process
#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<SecretString>,
}

impl BasicAuth {
    /// Parse `user:password` (the password part is optional)
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((username, password)) => Self {
                username: username.to_string(),
                password: Some(SecretString::new(password.to_string())),
            },
            None => Self {
                username: raw.to_string(),
                password: None,
            },
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Transport used by watchdogs to check an endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Request `url` once. Connection errors, non-2xx statuses and exceeding
    /// `timeout` are all failures.
    async fn probe(&self, url: &Url, auth: Option<&BasicAuth>, timeout: Duration) -> ProbeOutcome;
}

/// reqwest-backed probe
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    /// Create a probe with its own HTTP client
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("pm2-watchdog/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Create a probe sharing an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &Url, auth: Option<&BasicAuth>, timeout: Duration) -> ProbeOutcome {
        let mut request = self.client.get(url.clone()).timeout(timeout);
        if let Some(auth) = auth {
            request = request.basic_auth(
                &auth.username,
                auth.password.as_ref().map(|password| password.expose_secret()),
            );
        }

        match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => Err(ProbeFailure::Timeout(timeout)),
            Ok(Err(e)) if e.is_timeout() => Err(ProbeFailure::Timeout(timeout)),
            Ok(Err(e)) => Err(ProbeFailure::Request(e.to_string())),
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(ProbeFailure::Status(response.status().as_u16())),
        }
    }
}
