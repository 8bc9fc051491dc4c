//! Endpoint probing
//!
//! A probe is a lightweight HTTP request whose only purpose is to learn
//! whether an endpoint answers, and how fast.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP method used for a probe request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Head,
    Get,
}

/// Why a probe failed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeError {
    #[error("timeout")]
    Timeout,
    #[error("dns resolution failed")]
    Dns,
    #[error("tls handshake failed")]
    Tls,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("blocked by cors policy")]
    Cors,
    #[error("http status {0}")]
    Status(u16),
    #[error("too slow ({0} ms)")]
    Slow(u64),
    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    /// Derive a failure label from an error description
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("timed out") || msg.contains("timeout") {
            ProbeError::Timeout
        } else if msg.contains("dns")
            || msg.contains("failed to lookup")
            || msg.contains("name or service not known")
            || msg.contains("no such host")
        {
            ProbeError::Dns
        } else if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            ProbeError::Tls
        } else if msg.contains("connection refused") || msg.contains("econnrefused") {
            ProbeError::ConnectionRefused
        } else if msg.contains("cors") || msg.contains("cross-origin") {
            ProbeError::Cors
        } else {
            ProbeError::Other(message.to_string())
        }
    }
}

/// Issues probe requests
///
/// Returns the response status code, or an error description.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn request(
        &self,
        endpoint: &str,
        method: ProbeMethod,
        timeout: Duration,
    ) -> Result<u16, ProbeError>;
}

/// Probe over HTTP with reqwest
#[derive(Debug, Clone, Default)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn request(
        &self,
        endpoint: &str,
        method: ProbeMethod,
        timeout: Duration,
    ) -> Result<u16, ProbeError> {
        let method = match method {
            ProbeMethod::Head => reqwest::Method::HEAD,
            ProbeMethod::Get => reqwest::Method::GET,
        };

        match self
            .client
            .request(method, endpoint)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout),
            Err(e) => Err(ProbeError::from_message(&error_chain(&e))),
        }
    }
}

/// Flatten an error and its sources into one line
///
/// reqwest hides the interesting part (dns, tls, refused) in the source chain.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_labels() {
        assert_eq!(ProbeError::from_message("operation timed out"), ProbeError::Timeout);
        assert_eq!(
            ProbeError::from_message("error sending request: dns error: failed to lookup address"),
            ProbeError::Dns
        );
        assert_eq!(
            ProbeError::from_message("invalid peer certificate: UnknownIssuer"),
            ProbeError::Tls
        );
        assert_eq!(
            ProbeError::from_message("tcp connect error: Connection refused (os error 111)"),
            ProbeError::ConnectionRefused
        );
        assert_eq!(
            ProbeError::from_message("blocked by CORS policy"),
            ProbeError::Cors
        );
        assert!(matches!(
            ProbeError::from_message("something odd"),
            ProbeError::Other(_)
        ));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Connection refused");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        let text = error_chain(&outer);
        assert!(text.contains("Connection refused"));
    }
}
