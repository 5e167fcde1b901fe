//! Fire-and-forget callbacks to the account service for quota and
//! contribution bookkeeping. Failures are logged and swallowed; nothing
//! here may block or fail the primary flow.

use serde_json::json;
use tracing::warn;

pub fn gigabytes(bytes: i64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

#[derive(Clone)]
pub struct AccountNotifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AccountNotifier {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    /// Mirror a peer's cumulative contribution counter to the account
    /// service after a confirmed replica.
    pub async fn sync_contribution(&self, user_id: i64, chunks_stored: i64) {
        let body = json!({
            "userId": user_id,
            "chunksStored": chunks_stored,
            "apiKey": self.api_key,
        });
        let url = format!("{}/sync-contribution", self.base_url);
        if let Err(e) = self.client.post(&url).json(&body).send().await {
            warn!("contribution sync for user {} failed: {}", user_id, e);
        }
    }

    /// Adjust a user's stored-data quota after file completion (positive)
    /// or deletion (negative).
    pub async fn update_storage(&self, user_id: i64, add_gb: f64) {
        let body = json!({
            "userId": user_id,
            "addGb": add_gb,
            "apiKey": self.api_key,
        });
        let url = format!("{}/update-storage", self.base_url);
        if let Err(e) = self.client.post(&url).json(&body).send().await {
            warn!("storage adjustment for user {} failed: {}", user_id, e);
        }
    }
}
