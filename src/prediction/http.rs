//! JSON-over-HTTP collaborator adapters
//!
//! Endpoints (relative to each adapter's base URL):
//!   POST /infer              {segment, features} -> {probabilities, model_version}
//!   GET  /features/{match}   -> {features: {name: value}}
//!   GET  /odds/{match}       -> OddsBook
//! A 404 maps to the "not found" variant of each contract.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::collaborators::{
    FeatureError, FeatureProvider, Inference, ModelError, Predictor, Repository,
};
use super::models::{FeatureMap, OddsBook};

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .context("Failed to build collaborator HTTP client")
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    segment: &'a str,
    features: &'a FeatureMap,
}

#[derive(Clone)]
pub struct HttpPredictor {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPredictor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
            timeout,
        })
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn infer(&self, segment: &str, features: &FeatureMap) -> Result<Inference, ModelError> {
        let resp = self
            .client
            .post(format!("{}/infer", self.base_url))
            .json(&InferRequest { segment, features })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.timeout)
                } else {
                    ModelError::Transport(e.to_string())
                }
            })?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(ModelError::ModelUnavailable {
                segment: segment.to_string(),
            }),
            status if !status.is_success() => {
                let text = resp.text().await.unwrap_or_default();
                Err(ModelError::Transport(format!("POST /infer {}: {}", status, text)))
            }
            _ => resp
                .json::<Inference>()
                .await
                .map_err(|e| ModelError::InvalidOutput(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeaturesResponse {
    features: FeatureMap,
}

#[derive(Clone)]
pub struct HttpFeatureProvider {
    client: Client,
    base_url: String,
}

impl HttpFeatureProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl FeatureProvider for HttpFeatureProvider {
    async fn get_features(&self, match_id: &str) -> Result<FeatureMap, FeatureError> {
        let resp = self
            .client
            .get(format!("{}/features/{}", self.base_url, match_id))
            .send()
            .await
            .map_err(|e| FeatureError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(FeatureError::FeaturesNotFound {
                match_id: match_id.to_string(),
            }),
            status if !status.is_success() => Err(FeatureError::Transport(format!(
                "GET /features/{} {}",
                match_id, status
            ))),
            _ => resp
                .json::<FeaturesResponse>()
                .await
                .map(|r| r.features)
                .map_err(|e| FeatureError::Transport(e.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct HttpOddsRepository {
    client: Client,
    base_url: String,
}

impl HttpOddsRepository {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl Repository for HttpOddsRepository {
    async fn latest_odds(&self, match_id: &str) -> Result<Option<OddsBook>> {
        let path = format!("/odds/{}", match_id);
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET {} {}: {}", path, status, text));
        }

        let book = resp
            .json::<OddsBook>()
            .await
            .with_context(|| format!("Failed to parse GET {} response", path))?;
        Ok(Some(book))
    }
}
