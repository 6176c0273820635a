// ABOUTME: Request and response bodies for the traffic router API
// ABOUTME: These are serialized to JSON for API communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectRequest {
    pub pair_id: String,
    /// Target connection string with the password removed.
    pub target: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectResponse {
    pub redirect_id: String,
    pub status: String, // "applied" or "rejected"
    pub message: Option<String>,
}

impl RedirectResponse {
    pub fn is_applied(&self) -> bool {
        self.status == "applied"
    }
}
