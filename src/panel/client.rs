// =============================================================================
// Panel REST API client - bearer-authenticated, stateless
// =============================================================================
//
// SECURITY: the client never stores an API key. Every call takes the acting
// user's key so a fetch or action can only ever run with that user's panel
// permissions. No client-level retry: failed calls are logged by the caller
// and retried naturally on the next sampling cycle.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use super::types::{PowerSignal, ResourceStats, ServerListPage, ServerSummary, Wrapped};

/// Per-request timeout for all panel calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(25);
/// Error bodies are truncated to this many characters before logging.
const ERROR_BODY_MAX: usize = 500;

/// A non-2xx response from the panel, carrying the status and a truncated
/// body. Surfaced through `anyhow::Error`; use [`is_conflict`] to detect the
/// expected-during-transfer 409 case.
#[derive(Debug)]
pub struct PanelApiError {
    pub status: u16,
    pub body: String,
}

impl std::fmt::Display for PanelApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panel returned {}: {}", self.status, self.body)
    }
}

impl std::error::Error for PanelApiError {}

/// True when `err` is a panel 409 (install/transfer in progress).
pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PanelApiError>()
        .is_some_and(|e| e.status == 409)
}

/// Stateless HTTP client for the panel's client API.
#[derive(Clone)]
pub struct PanelClient {
    base_url: String,
    client: reqwest::Client,
}

impl PanelClient {
    /// Create a new client. `base_url` may carry a trailing slash.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build panel HTTP client")?;
        Ok(Self { base_url, client })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// GET /api/client/servers/{id}/resources
    pub async fn fetch_resources(&self, api_key: &str, server_id: &str) -> Result<ResourceStats> {
        let url = format!("{}/api/client/servers/{server_id}/resources", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("resources request for {server_id} failed"))?;

        let resp = check_status(resp).await?;
        let wrapped: Wrapped<ResourceStats> = resp
            .json()
            .await
            .context("failed to parse resources response")?;

        debug!(server_id, state = %wrapped.attributes.current_state, "resources fetched");
        Ok(wrapped.attributes)
    }

    /// GET /api/client?page=N, following `meta.pagination.total_pages`.
    pub async fn list_servers(&self, api_key: &str) -> Result<Vec<ServerSummary>> {
        let mut servers = Vec::new();
        let mut page = 1u32;
        loop {
            let url = format!("{}/api/client?page={page}", self.base_url);
            let resp = self
                .client
                .get(&url)
                .bearer_auth(api_key)
                .header("Accept", "application/json")
                .send()
                .await
                .with_context(|| format!("server list request (page {page}) failed"))?;

            let resp = check_status(resp).await?;
            let parsed: ServerListPage = resp
                .json()
                .await
                .context("failed to parse server list response")?;

            servers.extend(parsed.data.into_iter().map(|w| w.attributes));

            if page >= parsed.meta.pagination.total_pages {
                break;
            }
            page += 1;
        }

        debug!(count = servers.len(), "server list fetched");
        Ok(servers)
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// POST /api/client/servers/{id}/power
    pub async fn send_power_signal(
        &self,
        api_key: &str,
        server_id: &str,
        signal: PowerSignal,
    ) -> Result<()> {
        let url = format!("{}/api/client/servers/{server_id}/power", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&serde_json::json!({ "signal": signal.as_str() }))
            .send()
            .await
            .with_context(|| format!("power signal request for {server_id} failed"))?;

        check_status(resp).await?;
        debug!(server_id, %signal, "power signal sent");
        Ok(())
    }

    /// POST /api/client/servers/{id}/command
    pub async fn send_command(&self, api_key: &str, server_id: &str, command: &str) -> Result<()> {
        let url = format!("{}/api/client/servers/{server_id}/command", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await
            .with_context(|| format!("command request for {server_id} failed"))?;

        check_status(resp).await?;
        debug!(server_id, "console command sent");
        Ok(())
    }

    /// POST /api/client/servers/{id}/backups
    pub async fn create_backup(&self, api_key: &str, server_id: &str) -> Result<()> {
        let url = format!("{}/api/client/servers/{server_id}/backups", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&serde_json::json!({}))
            .send()
            .await
            .with_context(|| format!("backup request for {server_id} failed"))?;

        check_status(resp).await?;
        debug!(server_id, "backup requested");
        Ok(())
    }
}

impl std::fmt::Debug for PanelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Map any status >= 400 into a [`PanelApiError`] with a truncated body.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: String = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(ERROR_BODY_MAX)
        .collect();
    Err(PanelApiError {
        status: status.as_u16(),
        body,
    }
    .into())
}
