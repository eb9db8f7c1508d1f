//! OAuth2 token lifecycle for the panel API.
//!
//! Tokens are fetched with the client credentials grant, refreshed with the
//! refresh token grant when the panel issued one, and cached in memory until
//! close to expiry. Every access goes through `get_token`, which serializes
//! concurrent fetches behind one async mutex so a burst of requests produces
//! a single token call. An optional background task refreshes the token
//! ahead of expiry so request paths rarely pay the fetch.

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::credentials::{CredentialStore, PanelCredentials, TOKEN_SECRET_NAME};
use super::error::PanelError;
use super::http;
use crate::config::PanelConfig;
use crate::vault::SecretService;

/// Token endpoint path, relative to the configured base URL
const TOKEN_PATH: &str = "/oauth2/token";

/// A token this close to expiry is treated as already expired
const EXPIRY_LEEWAY_SECS: i64 = 10;

/// Proactive refresh fires this long before expiry
const REFRESH_LEAD_SECS: i64 = 300;

/// Assumed lifetime when the panel omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Poll interval while no token is cached
const IDLE_POLL: Duration = Duration::from_secs(60);

/// Lower bound between proactive refresh attempts, so short-lived tokens
/// cannot turn the refresh loop into a request storm
const REFRESH_MIN_WAIT: Duration = Duration::from_secs(10);

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(600);

/// A cached access token and its refresh state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TokenRecord {
    /// Client id the token was minted for
    pub subject: String,
    /// Scopes requested when the token was minted
    pub scope: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Credential generation this token was minted under. Not persisted;
    /// restarts re-stamp it and live rotations invalidate by mismatch.
    #[serde(skip, default)]
    pub generation: u64,
}

impl TokenRecord {
    /// Usable for a request right now, with leeway for clock skew and
    /// request latency.
    pub fn is_fresh(&self) -> bool {
        self.expires_at - chrono::Duration::seconds(EXPIRY_LEEWAY_SECS) > Utc::now()
    }

    /// When the proactive refresher should replace this token.
    pub fn refresh_due(&self) -> DateTime<Utc> {
        self.expires_at - chrono::Duration::seconds(REFRESH_LEAD_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// RFC 6749 error body from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    error_description: Option<String>,
}

/// Requests a token from the panel's token endpoint.
///
/// Uses the refresh token grant when one is supplied, otherwise the client
/// credentials grant. A response without a new refresh token keeps the old
/// one, since some panels only issue it once.
pub(crate) async fn fetch_token(
    client: &Client,
    creds: &PanelCredentials,
    refresh_token: Option<&str>,
) -> Result<TokenRecord, PanelError> {
    let token_url = format!("{}{}", creds.base_url, TOKEN_PATH);
    let form: Vec<(&str, &str)> = match refresh_token {
        Some(token) => vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", token),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
        ],
        None => vec![
            ("grant_type", "client_credentials"),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("scope", creds.scopes.as_str()),
        ],
    };

    let request = client.post(&token_url).form(&form).build()?;
    let response = http::execute_pinned(client, request).await?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        warn!(
            status = status.as_u16(),
            grant = if refresh_token.is_some() { "refresh_token" } else { "client_credentials" },
            "Token request failed"
        );
        return Err(token_error(status, &body));
    }

    let parsed: TokenResponse = response.json().await?;
    let expires_in = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    Ok(TokenRecord {
        subject: creds.client_id.clone(),
        scope: creds.scopes.clone(),
        access_token: parsed.access_token,
        // Keep the previous refresh token if this response omitted one
        refresh_token: parsed
            .refresh_token
            .or_else(|| refresh_token.map(|t| t.to_string())),
        expires_at: expiry_from_lifetime(expires_in),
        generation: 0,
    })
}

/// Turns a panel-reported lifetime into an expiry instant. Out-of-range
/// values get the default lifetime instead of overflowing.
fn expiry_from_lifetime(expires_in: u64) -> DateTime<Utc> {
    i64::try_from(expires_in)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .unwrap_or_else(|| {
            warn!(expires_in, "Panel returned unusable expires_in, assuming default lifetime");
            Utc::now() + chrono::Duration::seconds(DEFAULT_EXPIRES_IN_SECS as i64)
        })
}

/// Maps a token endpoint failure to the error taxonomy.
fn token_error(status: StatusCode, body: &str) -> PanelError {
    if let Ok(parsed) = serde_json::from_str::<TokenErrorBody>(body) {
        let code = parsed.error;
        let detail = parsed.error_description.unwrap_or_else(|| code.clone());
        return match code.as_str() {
            "invalid_client" | "invalid_grant" => PanelError::Auth(detail),
            "invalid_scope" => PanelError::Scope(detail),
            _ if status == StatusCode::UNAUTHORIZED => PanelError::Auth(detail),
            _ => PanelError::Upstream {
                status: status.as_u16(),
                code: Some(code.clone()),
                message: detail,
                request_id: None,
            },
        };
    }
    if status == StatusCode::UNAUTHORIZED {
        return PanelError::auth_from_body(body);
    }
    PanelError::from_error_body(status.as_u16(), body)
}

/// Caches panel tokens and transparently re-authenticates requests.
///
/// # Thread Safety
///
/// All state sits behind an async mutex. Concurrent `get_token` calls that
/// miss the cache serialize on it, so only one of them talks to the token
/// endpoint; the rest are served the fresh record it stored.
pub struct TokenManager {
    credentials: Arc<CredentialStore>,
    secrets: Arc<SecretService>,
    http: Client,
    state: tokio::sync::Mutex<Option<TokenRecord>>,
    persist: bool,
}

impl TokenManager {
    pub fn new(
        credentials: Arc<CredentialStore>,
        secrets: Arc<SecretService>,
        http: Client,
        config: &PanelConfig,
    ) -> Self {
        let persist = config.persist_tokens;
        let state = if persist {
            load_persisted(&credentials, &secrets)
        } else {
            None
        };
        Self {
            credentials,
            secrets,
            http,
            state: tokio::sync::Mutex::new(state),
            persist,
        }
    }

    /// Returns a fresh access token, fetching one if needed.
    pub async fn get_token(&self) -> Result<String, PanelError> {
        let generation = self.credentials.generation();
        let mut state = self.state.lock().await;

        if let Some(record) = state.as_ref() {
            if record.generation != generation {
                debug!("Panel credentials changed, discarding cached token");
                *state = None;
                self.discard_persisted();
            } else if record.is_fresh() {
                return Ok(record.access_token.clone());
            }
        }

        let refresh = state.as_ref().and_then(|r| r.refresh_token.clone());
        let creds = self.credentials.get()?;
        let mut record = self.fetch_with_fallback(&creds, refresh.as_deref()).await?;
        record.generation = generation;

        let token = record.access_token.clone();
        self.store_record(&record);
        *state = Some(record);
        Ok(token)
    }

    /// Tries the refresh grant first, falling back to client credentials
    /// when the panel no longer accepts the refresh token.
    async fn fetch_with_fallback(
        &self,
        creds: &PanelCredentials,
        refresh_token: Option<&str>,
    ) -> Result<TokenRecord, PanelError> {
        if let Some(token) = refresh_token {
            match fetch_token(&self.http, creds, Some(token)).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_auth() => {
                    warn!(error = %e, "Refresh token rejected, falling back to client credentials");
                }
                Err(e) => return Err(e),
            }
        }
        fetch_token(&self.http, creds, None).await
    }

    /// Attaches a bearer token to an outgoing request.
    pub async fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder, PanelError> {
        let token = self.get_token().await?;
        Ok(builder.bearer_auth(token))
    }

    /// Sends a request with authentication, retrying exactly once on 401
    /// with a freshly fetched token.
    ///
    /// The closure is called per attempt so the retry gets its own request.
    /// A 401 on the retry is returned as-is for the caller's status mapping,
    /// not retried again.
    pub async fn send_authorized<F>(&self, build: F) -> Result<Response, PanelError>
    where
        F: Fn() -> RequestBuilder,
    {
        let token = self.get_token().await?;
        let request = build().bearer_auth(&token).build()?;
        let response = http::execute_pinned(&self.http, request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("Panel returned 401, refreshing token and retrying once");
        self.reset().await;
        let token = self.get_token().await?;
        let request = build().bearer_auth(&token).build()?;
        let response = http::execute_pinned(&self.http, request).await?;
        Ok(response)
    }

    /// Drops the cached token and any persisted copy. The next `get_token`
    /// fetches from scratch.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = None;
        self.discard_persisted();
    }

    /// Spawns the proactive refresh task.
    ///
    /// The task sleeps until the cached token is due for refresh, replaces
    /// it, and on failure retries with doubling backoff capped at ten
    /// minutes. Abort the returned handle to stop it.
    pub fn start_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        info!("Starting proactive token refresh task");
        tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            loop {
                let wait = manager.next_refresh_wait().await;
                tokio::time::sleep(wait).await;
                match manager.refresh_now().await {
                    Ok(true) => {
                        backoff = BACKOFF_INITIAL;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in_secs = backoff.as_secs(),
                            "Proactive token refresh failed"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        })
    }

    async fn next_refresh_wait(&self) -> Duration {
        let state = self.state.lock().await;
        match state.as_ref() {
            Some(record) => {
                let until_due = (record.refresh_due() - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                until_due.max(REFRESH_MIN_WAIT)
            }
            None => IDLE_POLL,
        }
    }

    /// Refreshes the cached token if it is due. `Ok(true)` means a new
    /// token was stored.
    async fn refresh_now(&self) -> Result<bool, PanelError> {
        let generation = self.credentials.generation();
        let mut state = self.state.lock().await;

        if let Some(record) = state.as_ref() {
            if record.generation != generation {
                debug!("Panel credentials changed, discarding cached token");
                *state = None;
                self.discard_persisted();
                return Ok(false);
            }
        }
        let due = state
            .as_ref()
            .map(|record| Utc::now() >= record.refresh_due())
            .unwrap_or(false);
        if !due {
            return Ok(false);
        }

        let refresh = state.as_ref().and_then(|r| r.refresh_token.clone());
        let creds = self.credentials.get()?;
        let mut record = self.fetch_with_fallback(&creds, refresh.as_deref()).await?;
        record.generation = generation;

        info!(expires_at = %record.expires_at, "Proactively refreshed panel token");
        self.store_record(&record);
        *state = Some(record);
        Ok(true)
    }

    /// Persistence failures never fail the request path; the token still
    /// lives in memory.
    fn store_record(&self, record: &TokenRecord) {
        if !self.persist {
            return;
        }
        let serialized = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to serialize panel token for persistence");
                return;
            }
        };
        if let Err(e) = self.secrets.set(TOKEN_SECRET_NAME, serialized) {
            warn!(error = %e, "Failed to persist panel token");
        }
    }

    fn discard_persisted(&self) {
        if !self.persist {
            return;
        }
        if let Err(e) = self.secrets.delete(TOKEN_SECRET_NAME) {
            warn!(error = %e, "Failed to discard persisted panel token");
        }
    }
}

/// Loads a previously persisted token record, if one survives in the vault
/// and still belongs to the configured credentials.
fn load_persisted(credentials: &CredentialStore, secrets: &SecretService) -> Option<TokenRecord> {
    let raw = match secrets.decrypt_for_use(TOKEN_SECRET_NAME) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "Failed to load persisted panel token");
            return None;
        }
    };
    let mut record = match serde_json::from_str::<TokenRecord>(&raw) {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "Persisted panel token is malformed, discarding");
            let _ = secrets.delete(TOKEN_SECRET_NAME);
            return None;
        }
    };

    let creds = match credentials.get() {
        Ok(creds) => creds,
        Err(_) => {
            // A token with no owning credentials is useless
            let _ = secrets.delete(TOKEN_SECRET_NAME);
            return None;
        }
    };
    if record.subject != creds.client_id || record.scope != creds.scopes {
        debug!("Persisted panel token belongs to different credentials, discarding");
        let _ = secrets.delete(TOKEN_SECRET_NAME);
        return None;
    }

    record.generation = credentials.generation();
    debug!(expires_at = %record.expires_at, "Loaded persisted panel token");
    Some(record)
}
