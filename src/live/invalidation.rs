//! Downstream page revalidation
//!
//! `POST {base}/revalidate {secret, path}`. Best effort: callers log the
//! error and move on.

use anyhow::Context;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::config::LiveConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationError {
    NotConfigured,
    Timeout(Duration),
    Status(u16),
    Transport(String),
}

impl std::fmt::Display for InvalidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "revalidation endpoint not configured"),
            Self::Timeout(d) => write!(f, "revalidation timed out after {}ms", d.as_millis()),
            Self::Status(code) => write!(f, "revalidation returned HTTP {}", code),
            Self::Transport(reason) => write!(f, "revalidation transport error: {}", reason),
        }
    }
}

impl std::error::Error for InvalidationError {}

#[derive(Serialize)]
struct RevalidateRequest<'a> {
    secret: &'a str,
    path: &'a str,
}

#[derive(Clone)]
pub struct Revalidator {
    client: Client,
    endpoint: Option<String>,
    secret: String,
    timeout: Duration,
}

impl Revalidator {
    pub fn new(base_url: Option<&str>, secret: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build revalidation client")?;
        Ok(Self {
            client,
            endpoint: base_url.map(|u| format!("{}/revalidate", u.trim_end_matches('/'))),
            secret: secret.to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &LiveConfig) -> anyhow::Result<Self> {
        Self::new(
            config.revalidate_url.as_deref(),
            config.revalidate_secret.as_deref().unwrap_or_default(),
            config.revalidate_timeout(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn match_path(match_id: &str) -> String {
        format!("/matches/{}", match_id)
    }

    pub async fn revalidate(&self, path: &str) -> Result<(), InvalidationError> {
        let endpoint = self.endpoint.as_ref().ok_or(InvalidationError::NotConfigured)?;

        let send = self
            .client
            .post(endpoint)
            .json(&RevalidateRequest {
                secret: &self.secret,
                path,
            })
            .send();

        let resp = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => return Err(InvalidationError::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(InvalidationError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(InvalidationError::Transport(e.to_string())),
            Ok(Ok(resp)) => resp,
        };

        if resp.status() != reqwest::StatusCode::OK {
            return Err(InvalidationError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}
