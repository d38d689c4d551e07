//! HTTP Transport for the K2 management API
//!
//! JSON over HTTPS with basic authentication against
//! `https://<mgmt-host>/api/v2`. Retries and locking live one layer up in
//! the resilient client.

use crate::domain::ports::{ApiRequest, ArrayTransport, Method};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// API root below the management address
pub const API_ROOT: &str = "/api/v2";

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings for one array
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Management host name or address
    pub host: String,
    pub login: String,
    pub password: String,
    /// Validate the array certificate
    pub ssl_validate: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(host: impl Into<String>, login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            login: login.into(),
            password: password.into(),
            ssl_validate: false,
            timeout: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// HTTP Transport
// =============================================================================

/// `reqwest` based transport
pub struct HttpTransport {
    config: HttpTransportConfig,
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.ssl_validate)
            .timeout(config.timeout)
            .build()?;
        let base_url = format!("https://{}{}", config.host, API_ROOT);

        Ok(Self {
            config,
            base_url,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ArrayTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value> {
        let url = self.url(&request.path);
        debug!("K2 {} {} {:?}", request.method, url, request.query);

        let builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Patch => self.http.patch(&url),
            Method::Delete => self.http.delete(&url),
        };
        let mut builder = builder
            .basic_auth(&self.config.login, Some(&self.config.password))
            .header(reqwest::header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| Error::MalformedResponse {
            path: request.path.clone(),
            reason: e.to_string(),
        })
    }

    fn endpoint(&self) -> &str {
        &self.config.host
    }
}
