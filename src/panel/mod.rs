//! Panel API integration.
//!
//! This module owns everything that talks to the hosting panel: credential
//! storage and validation, OAuth2 token lifecycle, a hardened HTTP client,
//! and the server and file resource calls built on top of them.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        PanelApi                          │
//! │   list_servers / get_server / file operations            │
//! │   (server list cache + single-flight dedup)              │
//! └───────────────┬──────────────────────────┬───────────────┘
//!                 │                          │
//!                 ▼                          ▼
//! ┌───────────────────────────┐  ┌───────────────────────────┐
//! │       TokenManager        │  │      CredentialStore      │
//! │  cached OAuth2 tokens,    │  │  base URL / client id in  │
//! │  401 retry, background    │  │  settings, secret in the  │
//! │  proactive refresh        │  │  vault                    │
//! └───────────────┬───────────┘  └───────────────────────────┘
//!                 │
//!                 ▼
//! ┌───────────────────────────┐
//! │       http module         │
//! │  no proxy, no automatic   │
//! │  redirects, host-pinned   │
//! │  redirect following       │
//! └───────────────────────────┘
//! ```
//!
//! All requests to the panel go through [`http::execute_pinned`], so a
//! redirect can never carry a bearer token to a foreign host.

pub mod http;

mod credentials; // Credential persistence and validation
mod error; // Error taxonomy for panel operations
mod files; // Server file operations
mod servers; // Server listing and detail
mod token; // OAuth2 token lifecycle

pub use credentials::{CredentialStore, CredentialsSummary, PanelCredentials, DEFAULT_SCOPES};
pub use error::PanelError;
pub use files::FileEntry;
pub use servers::{Environment, ServerDetail, ServerSummary};
pub use token::TokenManager;

use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PanelConfig;

/// Client for the panel's server and file resources.
///
/// Cheap to share behind an `Arc`; all interior state is concurrent.
pub struct PanelApi {
    http: Client,
    credentials: Arc<CredentialStore>,
    tokens: Arc<TokenManager>,
    server_cache: DashMap<String, ServerListEntry>,
    list_flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    server_cache_ttl: Duration,
    max_servers: usize,
}

/// A cached server list, keyed by the panel base URL it came from.
struct ServerListEntry {
    servers: Arc<Vec<ServerSummary>>,
    fetched_at: Instant,
}

impl PanelApi {
    pub fn new(
        http: Client,
        credentials: Arc<CredentialStore>,
        tokens: Arc<TokenManager>,
        config: &PanelConfig,
    ) -> Self {
        Self {
            http,
            credentials,
            tokens,
            server_cache: DashMap::new(),
            list_flights: DashMap::new(),
            server_cache_ttl: config.server_cache_ttl(),
            max_servers: config.max_servers,
        }
    }

    /// Drops any cached server list and its in-flight locks; the next
    /// `list_servers` refetches.
    pub fn invalidate_server_cache(&self) {
        self.server_cache.clear();
        self.list_flights.clear();
    }
}
