//! Encrypted credential vault and authenticated panel API client.
//!
//! Two halves, wired together by the application:
//!
//! - `vault` keeps secrets encrypted at rest in SQLite. A master data key is
//!   generated once, wrapped with a key derived from the operator-supplied
//!   node secret, and used for AES-256-GCM encryption of individual secrets.
//! - `panel` talks to the game-server panel: OAuth2 client-credentials
//!   tokens, a hardened HTTP client that pins redirects to the panel host,
//!   cached server listings, and file operations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use panel_sync::config::SyncConfig;
//! use panel_sync::panel::{http, CredentialStore, PanelApi, TokenManager};
//! use panel_sync::settings::SettingsStore;
//! use panel_sync::vault::{MasterKeyManager, SecretService};
//!
//! # async fn wire() -> anyhow::Result<()> {
//! let config = SyncConfig::default();
//! let node_secret = std::env::var("PANEL_SYNC_NODE_SECRET")?;
//!
//! let settings = Arc::new(SettingsStore::new("panel-sync.db")?);
//! let keys = MasterKeyManager::load(Arc::clone(&settings), &node_secret)?;
//! let secrets = Arc::new(SecretService::new(
//!     "panel-sync.db",
//!     keys.aead(),
//!     config.vault.secret_cache_ttl(),
//! )?);
//!
//! let credentials = Arc::new(CredentialStore::new(
//!     Arc::clone(&settings),
//!     Arc::clone(&secrets),
//! ));
//! let client = http::build_client(&config.panel)?;
//! let tokens = Arc::new(TokenManager::new(
//!     Arc::clone(&credentials),
//!     Arc::clone(&secrets),
//!     client.clone(),
//!     &config.panel,
//! ));
//! let api = PanelApi::new(client, credentials, Arc::clone(&tokens), &config.panel);
//!
//! let refresher = tokens.start_refresh();
//! let servers = api.list_servers().await?;
//! println!("{} servers", servers.len());
//! refresher.abort();
//! # Ok(())
//! # }
//! ```

// Encrypted secret storage: master key, AEAD, secret records
pub mod vault;

// Plain key/value settings persistence
pub mod settings;

// Panel integration: credentials, tokens, HTTP hardening, resource clients
pub mod panel;

// TOML configuration
pub mod config;
