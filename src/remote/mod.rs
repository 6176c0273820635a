// ABOUTME: Traffic router collaborators used by the cutover pointer flip
// ABOUTME: An HTTP router API client, and a manual router that asks the operator to confirm

pub mod client;
pub mod manual;
pub mod models;

pub use client::HttpTrafficRouter;
pub use manual::ManualRouter;

use async_trait::async_trait;

use crate::config::Dsn;
use crate::error::Result;

/// Redirects new application connections for a pair. Returns the router's acknowledgment.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn redirect(&self, pair_id: &str, target: &Dsn) -> Result<String>;
}
