// ABOUTME: Operator-driven pointer flip for setups without a router API
// ABOUTME: Prints the redirect to perform and waits for an interactive confirmation

use async_trait::async_trait;
use chrono::Utc;
use dialoguer::Confirm;

use super::TrafficRouter;
use crate::config::Dsn;
use crate::error::{MigratorError, Result};

pub struct ManualRouter;

#[async_trait]
impl TrafficRouter for ManualRouter {
    async fn redirect(&self, pair_id: &str, target: &Dsn) -> Result<String> {
        let prompt = format!(
            "Point application connections for {} at {} now. Confirm once traffic is redirected",
            pair_id,
            target.redacted()
        );
        let confirmed = tokio::task::spawn_blocking(move || {
            Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await
        .map_err(|e| MigratorError::Router(format!("confirmation prompt failed: {}", e)))?
        .map_err(|e| MigratorError::Router(format!("confirmation prompt failed: {}", e)))?;

        if confirmed {
            Ok(format!("manual-{}", Utc::now().format("%Y%m%dT%H%M%SZ")))
        } else {
            Err(MigratorError::Router(
                "operator did not confirm the redirect".into(),
            ))
        }
    }
}
