//! Panel credential persistence and validation.
//!
//! Non-secret fields (base URL, client id, scopes) live in the settings
//! store; the client secret is a vault record and never leaves the vault
//! unencrypted except for immediate use. Rotating credentials bumps a
//! generation counter that the token manager watches, so stale tokens are
//! dropped without the two stores referencing each other.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

use super::error::PanelError;
use super::{http, token};
use crate::config::PanelConfig;
use crate::settings::SettingsStore;
use crate::vault::SecretService;

const BASE_URL_SETTING: &str = "panel.base_url";
const CLIENT_ID_SETTING: &str = "panel.client_id";
const SCOPES_SETTING: &str = "panel.scopes";
const DEEP_SCAN_SETTING: &str = "panel.deep_scan";
const CONFIGURED_SETTING: &str = "panel.configured";

/// Vault record name for the client secret
pub(crate) const CLIENT_SECRET_NAME: &str = "panel.client_secret";

/// Vault record name for the persisted OAuth token
pub(crate) const TOKEN_SECRET_NAME: &str = "panel.token";

/// Scopes requested when none are configured
pub const DEFAULT_SCOPES: &str = "servers.read servers.files";

/// Connection settings for the panel, as entered by the operator.
#[derive(Clone)]
pub struct PanelCredentials {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Space-separated OAuth scopes; blank means `DEFAULT_SCOPES`
    pub scopes: String,
    /// Walk server files recursively during scans
    pub deep_scan: bool,
}

// The secret never rides along into logs via {:?}
impl fmt::Debug for PanelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelCredentials")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("scopes", &self.scopes)
            .field("deep_scan", &self.deep_scan)
            .finish()
    }
}

/// Redacted view for status surfaces. Carries the secret's last four
/// characters, never the secret itself.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialsSummary {
    pub configured: bool,
    pub base_url: String,
    pub client_id: String,
    pub scopes: String,
    pub deep_scan: bool,
    pub client_secret_last4: Option<String>,
    pub secret_updated_at: Option<DateTime<Utc>>,
}

/// Stores and validates panel credentials.
pub struct CredentialStore {
    settings: Arc<SettingsStore>,
    secrets: Arc<SecretService>,
    api_host: Mutex<Option<String>>,
    generation: AtomicU64,
}

impl CredentialStore {
    pub fn new(settings: Arc<SettingsStore>, secrets: Arc<SecretService>) -> Self {
        Self {
            settings,
            secrets,
            api_host: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Validates, normalizes, and persists credentials (upsert).
    ///
    /// The secret lands in the vault first, so a partial failure never
    /// leaves the configured flag set without a stored secret.
    pub fn set(&self, creds: PanelCredentials) -> Result<(), PanelError> {
        let normalized = validated(&creds)?;
        info!(
            base_url = %normalized.base_url,
            client_id = %normalized.client_id,
            "Storing panel credentials"
        );

        self.secrets
            .set(CLIENT_SECRET_NAME, normalized.client_secret.clone())?;
        self.settings.set_many(&[
            (BASE_URL_SETTING, normalized.base_url.clone()),
            (CLIENT_ID_SETTING, normalized.client_id.clone()),
            (SCOPES_SETTING, normalized.scopes.clone()),
            (DEEP_SCAN_SETTING, normalized.deep_scan.to_string()),
            (CONFIGURED_SETTING, "true".to_string()),
        ])?;
        // A token minted under the old credentials must not outlive them
        self.secrets.delete(TOKEN_SECRET_NAME)?;

        *self.api_host.lock().unwrap() = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Loads the full credentials, including the decrypted client secret.
    ///
    /// Stored fields are re-validated on the way out; a base URL or scope
    /// list that drifted from normal form is normalized and written back.
    pub fn get(&self) -> Result<PanelCredentials, PanelError> {
        if !self.exists()? {
            return Err(PanelError::Config(
                "panel credentials are not configured".to_string(),
            ));
        }

        let raw_base = self.settings.get(BASE_URL_SETTING)?.unwrap_or_default();
        let client_id = self.settings.get(CLIENT_ID_SETTING)?.unwrap_or_default();
        let raw_scopes = self.settings.get(SCOPES_SETTING)?.unwrap_or_default();
        let deep_scan = self
            .settings
            .get(DEEP_SCAN_SETTING)?
            .map(|value| value == "true")
            .unwrap_or(false);

        if client_id.trim().is_empty() {
            return Err(PanelError::Config(
                "stored panel client id is empty".to_string(),
            ));
        }

        let client_secret = self
            .secrets
            .decrypt_for_use(CLIENT_SECRET_NAME)?
            .ok_or_else(|| {
                PanelError::Config("panel client secret is missing from the vault".to_string())
            })?;

        let base_url = normalize_base_url(&raw_base)?;
        if base_url != raw_base {
            debug!(from = %raw_base, to = %base_url, "Normalized stored panel base URL");
            self.settings.set(BASE_URL_SETTING, &base_url)?;
        }
        let scopes = normalize_scopes(&raw_scopes);
        if scopes != raw_scopes {
            self.settings.set(SCOPES_SETTING, &scopes)?;
        }

        Ok(PanelCredentials {
            base_url,
            client_id,
            client_secret: client_secret.to_string(),
            scopes,
            deep_scan,
        })
    }

    /// Redacted summary for status endpoints and the UI.
    pub fn summary(&self) -> Result<CredentialsSummary, PanelError> {
        let configured = self.exists()?;
        let secret_status = self.secrets.status(CLIENT_SECRET_NAME)?;

        Ok(CredentialsSummary {
            configured,
            base_url: self.settings.get(BASE_URL_SETTING)?.unwrap_or_default(),
            client_id: self.settings.get(CLIENT_ID_SETTING)?.unwrap_or_default(),
            scopes: self.settings.get(SCOPES_SETTING)?.unwrap_or_default(),
            deep_scan: self
                .settings
                .get(DEEP_SCAN_SETTING)?
                .map(|value| value == "true")
                .unwrap_or(false),
            client_secret_last4: secret_status.as_ref().map(|s| s.last4.clone()),
            secret_updated_at: secret_status.map(|s| s.updated_at),
        })
    }

    /// Whether complete credentials are stored.
    pub fn exists(&self) -> Result<bool, PanelError> {
        let flagged = self.settings.get(CONFIGURED_SETTING)?.as_deref() == Some("true");
        Ok(flagged && self.secrets.exists(CLIENT_SECRET_NAME)?)
    }

    /// Removes all credential state, including any persisted token.
    pub fn clear(&self) -> Result<(), PanelError> {
        self.settings.delete_many(&[
            BASE_URL_SETTING,
            CLIENT_ID_SETTING,
            SCOPES_SETTING,
            DEEP_SCAN_SETTING,
            CONFIGURED_SETTING,
        ])?;
        self.secrets.delete(CLIENT_SECRET_NAME)?;
        self.secrets.delete(TOKEN_SECRET_NAME)?;

        *self.api_host.lock().unwrap() = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("Cleared panel credentials");
        Ok(())
    }

    /// Validates candidate credentials end to end by fetching a token.
    ///
    /// Nothing is persisted; the candidate is normalized the same way
    /// `set` would.
    pub async fn test_connection(
        &self,
        candidate: &PanelCredentials,
        config: &PanelConfig,
    ) -> Result<(), PanelError> {
        let normalized = validated(candidate)?;
        let client = http::build_client(config)?;
        token::fetch_token(&client, &normalized, None).await?;
        info!(base_url = %normalized.base_url, "Panel connection test succeeded");
        Ok(())
    }

    /// The panel's origin (`scheme://host[:port]`), cached until
    /// credentials change.
    pub fn api_host(&self) -> Result<String, PanelError> {
        if let Some(host) = self.api_host.lock().unwrap().clone() {
            return Ok(host);
        }

        let creds = self.get()?;
        let url = Url::parse(&creds.base_url)
            .map_err(|e| PanelError::Config(format!("invalid stored base URL: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| PanelError::Config("stored base URL has no host".to_string()))?;

        let mut origin = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            origin.push_str(&format!(":{}", port));
        }

        *self.api_host.lock().unwrap() = Some(origin.clone());
        Ok(origin)
    }

    /// Bumped on every `set` and `clear`; the token manager discards
    /// cached tokens whose generation is stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

fn validated(creds: &PanelCredentials) -> Result<PanelCredentials, PanelError> {
    let base_url = normalize_base_url(&creds.base_url)?;
    let client_id = creds.client_id.trim();
    if client_id.is_empty() {
        return Err(PanelError::Config("panel client id is required".to_string()));
    }
    if creds.client_secret.is_empty() {
        return Err(PanelError::Config(
            "panel client secret is required".to_string(),
        ));
    }

    Ok(PanelCredentials {
        base_url,
        client_id: client_id.to_string(),
        client_secret: creds.client_secret.clone(),
        scopes: normalize_scopes(&creds.scopes),
        deep_scan: creds.deep_scan,
    })
}

/// Normalizes a base URL to `scheme://host[:port][/path]` form.
///
/// Lowercases scheme and host, strips trailing slashes, and drops query
/// and fragment. Idempotent: normalizing a normalized URL is a no-op.
pub(crate) fn normalize_base_url(raw: &str) -> Result<String, PanelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PanelError::Config("panel base URL is required".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| PanelError::Config(format!("invalid panel base URL: {}", e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(PanelError::Config(format!(
                "panel base URL must be http or https, got {}",
                other
            )))
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| PanelError::Config("panel base URL must include a host".to_string()))?;

    let mut normalized = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    let path = url.path().trim_end_matches('/');
    if !path.is_empty() {
        normalized.push_str(path);
    }
    Ok(normalized)
}

fn normalize_scopes(raw: &str) -> String {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        DEFAULT_SCOPES.to_string()
    } else {
        joined
    }
}
