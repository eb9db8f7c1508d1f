//! Server listing and detail calls.
//!
//! The full server list is assembled by walking the panel's pagination and
//! cached for a short TTL. Concurrent cold reads collapse into one upstream
//! fetch. Next-page links are pinned to the configured panel origin the same
//! way redirects are, so a malicious `next` value cannot steer requests
//! elsewhere.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::error::PanelError;
use super::{http, PanelApi, ServerListEntry};

/// One server as it appears in the paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
}

/// Full detail for a single server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub environment: Option<Environment>,
}

/// Runtime environment metadata, when the panel reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    total: Option<u64>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<ServerSummary>,
    #[serde(default)]
    paging: Paging,
}

impl PanelApi {
    /// Lists all servers visible to the configured credentials.
    ///
    /// Serves from cache within the TTL. On a cold cache, concurrent
    /// callers share a single upstream fetch and all receive the same
    /// result.
    pub async fn list_servers(&self) -> Result<Arc<Vec<ServerSummary>>, PanelError> {
        let start = Instant::now();
        let base = self.credentials.get()?.base_url;

        if let Some(servers) = self.cached_servers(&base) {
            debug!(count = servers.len(), cache_hit = true, "Served server list");
            return Ok(servers);
        }

        // One in-flight fetch per base URL; latecomers wait and reuse it.
        // Flights for previously configured bases are stale and dropped.
        self.list_flights.retain(|flight_base, _| flight_base == &base);
        let flight = {
            let entry = self
                .list_flights
                .entry(base.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
            Arc::clone(entry.value())
        };
        let _guard = flight.lock().await;

        if let Some(servers) = self.cached_servers(&base) {
            debug!(count = servers.len(), deduped = true, "Served server list");
            return Ok(servers);
        }

        let servers = Arc::new(self.fetch_all_servers(&base).await?);
        self.server_cache.insert(
            base,
            ServerListEntry {
                servers: Arc::clone(&servers),
                fetched_at: Instant::now(),
            },
        );
        debug!(
            count = servers.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Fetched server list"
        );
        Ok(servers)
    }

    fn cached_servers(&self, base: &str) -> Option<Arc<Vec<ServerSummary>>> {
        let entry = self.server_cache.get(base)?;
        if entry.fetched_at.elapsed() < self.server_cache_ttl {
            return Some(Arc::clone(&entry.servers));
        }
        // Release the shard guard before removing the expired entry
        drop(entry);
        self.server_cache.remove(base);
        None
    }

    async fn fetch_all_servers(&self, base: &str) -> Result<Vec<ServerSummary>, PanelError> {
        let mut servers = Vec::new();
        let mut page_url = Url::parse(&format!("{}/api/servers?page=1", base))
            .map_err(|e| PanelError::Config(format!("invalid server list URL: {}", e)))?;
        let mut expected_total: Option<u64> = None;

        loop {
            let url = page_url.clone();
            let response = self
                .tokens
                .send_authorized(|| self.http.get(url.as_str()))
                .await?;
            let response = http::check_status(response).await?;
            let page: ServerPage = response.json().await?;

            if let Some(total) = page.paging.total {
                expected_total = Some(total);
            }
            if page.servers.is_empty() {
                break;
            }
            servers.extend(page.servers);

            // The panel's own total is a stop condition; next links past it
            // are not followed
            if let Some(total) = expected_total {
                if servers.len() as u64 >= total {
                    servers.truncate(total as usize);
                    break;
                }
            }
            if servers.len() >= self.max_servers {
                servers.truncate(self.max_servers);
                debug!(cap = self.max_servers, "Server list truncated at cap");
                break;
            }
            let Some(next) = page.paging.next else {
                break;
            };
            // Pin the next-page link to the panel origin, like redirects
            page_url = http::pin_to_origin(&page_url, &next).ok_or_else(|| {
                PanelError::Config("panel returned an unusable next-page link".to_string())
            })?;
        }

        if let Some(total) = expected_total {
            if (servers.len() as u64) < total && servers.len() < self.max_servers {
                warn!(
                    received = servers.len(),
                    total, "Server list shorter than panel-reported total"
                );
            }
        }
        Ok(servers)
    }

    /// Fetches full detail for one server.
    pub async fn get_server(&self, server_id: &str) -> Result<ServerDetail, PanelError> {
        let base = self.credentials.get()?.base_url;
        let url = format!("{}/api/servers/{}", base, urlencoding::encode(server_id));

        let response = self
            .tokens
            .send_authorized(|| self.http.get(url.as_str()))
            .await?;
        let response = http::check_status(response).await?;
        Ok(response.json().await?)
    }
}
