use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::IDENTITY_TIMEOUT_SECS;
use crate::error::Result;

/// Display-name lookups against the external identity service.
/// Best-effort: a slow or failing service yields no names, never an error.
#[derive(Clone)]
pub struct IdentityClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkUsers {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    fid: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl IdentityClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(IDENTITY_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, base_url, api_key })
    }

    /// fid -> display name for every fid the service knows.
    pub async fn display_names(&self, fids: &[i64]) -> HashMap<i64, String> {
        if fids.is_empty() {
            return HashMap::new();
        }
        match self.fetch(fids).await {
            Ok(names) => names,
            Err(e) => {
                warn!(fids = fids.len(), "identity lookup failed: {e}");
                HashMap::new()
            }
        }
    }

    async fn fetch(&self, fids: &[i64]) -> Result<HashMap<i64, String>> {
        let ids = fids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        let url = format!("{}/v2/farcaster/user/bulk?fids={ids}", self.base_url.trim_end_matches('/'));

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let body = request.send().await?.error_for_status()?.text().await?;
        let names = parse_users(&body)?;
        debug!(requested = fids.len(), resolved = names.len(), "identity lookup");
        Ok(names)
    }
}

fn parse_users(body: &str) -> Result<HashMap<i64, String>> {
    let parsed: BulkUsers = serde_json::from_str(body)?;
    Ok(parsed
        .users
        .into_iter()
        .filter_map(|u| {
            let name = u.display_name.filter(|n| !n.is_empty()).or(u.username)?;
            Some((u.fid, name))
        })
        .collect())
}
