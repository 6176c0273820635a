// ABOUTME: HTTP client for the traffic router API used during the cutover pointer flip
// ABOUTME: A redirect is acknowledged only when the router reports it as applied

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::info;

use super::models::{RedirectRequest, RedirectResponse};
use super::TrafficRouter;
use crate::config::Dsn;
use crate::error::{MigratorError, Result};

pub struct HttpTrafficRouter {
    client: Client,
    api_base_url: String,
}

impl HttpTrafficRouter {
    pub fn new(api_base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MigratorError::Router(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TrafficRouter for HttpTrafficRouter {
    async fn redirect(&self, pair_id: &str, target: &Dsn) -> Result<String> {
        let url = format!("{}/redirects", self.api_base_url);
        let request = RedirectRequest {
            pair_id: pair_id.to_string(),
            target: target.redacted(),
            requested_at: Utc::now(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                MigratorError::Router(format!(
                    "Failed to reach traffic router at {}: {}. Traffic may or may not have been redirected",
                    url, e
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MigratorError::Router(format!(
                "Redirect request failed with status {}: {}",
                status, body
            )));
        }

        let redirect: RedirectResponse = response
            .json()
            .await
            .map_err(|e| MigratorError::Router(format!("Failed to parse redirect response: {}", e)))?;

        if !redirect.is_applied() {
            return Err(MigratorError::Router(format!(
                "Router rejected redirect {}: {}",
                redirect.redirect_id,
                redirect.message.unwrap_or_else(|| redirect.status.clone())
            )));
        }

        info!(pair = pair_id, redirect_id = %redirect.redirect_id, "Traffic redirected");
        Ok(redirect.redirect_id)
    }
}
