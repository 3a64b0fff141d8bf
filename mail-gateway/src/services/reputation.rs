use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, warn};

use super::ReputationCheck;
use crate::config::ReputationConfig;

#[derive(Error, Debug)]
pub enum ReputationError {
    #[error("send request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API returned non-200 status: {0}")]
    Status(u16),

    #[error("response IP mismatch: expected {expected}, got {actual}")]
    IpMismatch { expected: String, actual: String },

    #[error("IP {ip} flagged as abusive (score: {score})")]
    Flagged { ip: IpAddr, score: u32 },
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    data: CheckData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckData {
    ip_address: String,
    abuse_confidence_score: u32,
}

/// AbuseIPDB `check` endpoint client
pub struct AbuseIpDbClient {
    client: reqwest::Client,
    config: ReputationConfig,
}

impl AbuseIpDbClient {
    pub fn new(config: ReputationConfig) -> Result<Self, ReputationError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ReputationCheck for AbuseIpDbClient {
    async fn check(&self, ip: IpAddr) -> Result<(), ReputationError> {
        let ip_text = ip.to_string();
        let max_age = self.config.max_age_days.to_string();

        debug!(%ip, url = %self.config.api_url, "Checking IP reputation");

        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("ipAddress", ip_text.as_str()),
                ("maxAgeInDays", max_age.as_str()),
                ("verbose", ""),
            ])
            .header("Key", &self.config.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            warn!(%ip, status = %response.status(), "Reputation lookup failed");
            return Err(ReputationError::Status(response.status().as_u16()));
        }

        let body: CheckResponse = response.json().await?;

        // Compare as addresses so "::1" and "0:0::1" agree
        let echoed = body.data.ip_address.parse::<IpAddr>().ok();
        if echoed != Some(ip) {
            return Err(ReputationError::IpMismatch {
                expected: ip_text,
                actual: body.data.ip_address,
            });
        }

        let score = body.data.abuse_confidence_score;
        if score > self.config.score_threshold {
            return Err(ReputationError::Flagged { ip, score });
        }

        debug!(%ip, score, "IP reputation acceptable");
        Ok(())
    }
}
