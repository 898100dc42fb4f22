//! HTTP retrieval of the upstream launch dataset.

use std::time::Duration;

use anyhow::Context;
use launch_core::LaunchRecord;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "launch-fetch";

pub const DEFAULT_SOURCE_URL: &str = "https://api.spacexdata.com/v4/launches";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not a JSON array of objects: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-shot fetcher: one GET per call, no retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// Fetch the complete dataset and parse it into records.
    pub async fn fetch_records(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<Vec<LaunchRecord>, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async move {
            info!("requesting launch dataset");
            let response = self.fetch_bytes(url).await?;
            let records = decode_records(&response.final_url, &response.body)?;
            info!(
                status = response.status.as_u16(),
                bytes = response.body.len(),
                records = records.len(),
                "received launch dataset"
            );
            Ok(records)
        }
        .instrument(span)
        .await
    }
}

pub fn decode_records(url: &str, body: &[u8]) -> Result<Vec<LaunchRecord>, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}
