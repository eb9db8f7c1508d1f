//! Hardened HTTP plumbing for panel traffic.
//!
//! The client ignores proxy environment variables and never follows
//! redirects on its own. Redirects are followed manually with the target
//! rewritten back to the original request's scheme, host, and port, so a
//! misbehaving panel cannot bounce a bearer token to a third-party host.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Request, Response, StatusCode};
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::error::PanelError;
use crate::config::PanelConfig;

/// User-Agent for all panel traffic
const USER_AGENT: &str = "panel-sync/0.1";

/// Redirect hops followed before giving the response back as-is
const MAX_REDIRECTS: usize = 5;

/// Longest error-body preview written to logs
const LOG_BODY_PREVIEW: usize = 256;

/// Matches key/value pairs whose key smells like a credential, in JSON
/// bodies, form bodies, and query strings alike.
static SENSITIVE_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)("?[a-z0-9_-]*(?:token|secret|password|key|authorization)[a-z0-9_-]*"?\s*[=:]\s*)("[^"]*"|[^&\s,}]+)"#,
    )
    .expect("sensitive-value pattern is valid")
});

/// Builds the hardened client used for every panel request.
///
/// - No proxy: environment proxy variables are never consulted
/// - No automatic redirects: `execute_pinned` follows them manually
/// - Connect and overall timeouts from configuration
pub fn build_client(config: &PanelConfig) -> Result<Client, PanelError> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .no_proxy()
        .redirect(Policy::none())
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .build()?;
    Ok(client)
}

/// Executes a request, following redirects pinned to the original host.
///
/// The redirect target's scheme, host, and port are rewritten back to the
/// original request's before following; path and query are kept. A 303
/// becomes a GET without a body. Targets that cannot be pinned, missing
/// Location headers, and chains past the hop limit return the redirect
/// response unfollowed.
pub async fn execute_pinned(client: &Client, request: Request) -> Result<Response, PanelError> {
    let origin = request.url().clone();
    let mut request = request;
    let mut hops = 0;

    loop {
        // Streaming bodies cannot be replayed; those requests never follow
        let replay = request.try_clone();
        let method = request.method().clone();
        let path = request.url().path().to_string();
        let started = Instant::now();

        let response = client.execute(request).await?;
        let status = response.status();
        debug!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Panel request completed"
        );

        if !status.is_redirection() || hops >= MAX_REDIRECTS {
            return Ok(response);
        }

        let location = match response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
        {
            Some(location) => location.to_string(),
            None => return Ok(response),
        };

        let target = match pin_to_origin(&origin, &location) {
            Some(target) => target,
            None => {
                warn!(
                    location = %location,
                    "Refusing redirect that cannot be pinned to the panel host"
                );
                return Ok(response);
            }
        };

        let mut next = match replay {
            Some(next) => next,
            None => return Ok(response),
        };
        *next.url_mut() = target;
        if status == StatusCode::SEE_OTHER {
            *next.method_mut() = Method::GET;
            *next.body_mut() = None;
        }

        hops += 1;
        request = next;
    }
}

/// Resolves a redirect or pagination link against `origin` and forces its
/// scheme, host, and port back to the origin's.
///
/// Returns `None` for targets that cannot be rewritten (non-hierarchical
/// URLs like `data:`), which callers treat as a refusal to follow.
pub(crate) fn pin_to_origin(origin: &Url, location: &str) -> Option<Url> {
    let mut target = origin.join(location).ok()?;
    target.set_scheme(origin.scheme()).ok()?;
    target.set_host(origin.host_str()).ok()?;
    target.set_port(origin.port()).ok()?;
    Some(target)
}

/// Passes 2xx responses through and maps everything else onto the error
/// taxonomy, logging a redacted preview of the error body.
pub(crate) async fn check_status(response: Response) -> Result<Response, PanelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    warn!(
        status = status.as_u16(),
        body = %redact(&preview(&body, LOG_BODY_PREVIEW)),
        "Panel returned error response"
    );

    Err(match status {
        StatusCode::UNAUTHORIZED => PanelError::auth_from_body(&body),
        StatusCode::FORBIDDEN => PanelError::Forbidden,
        StatusCode::NOT_FOUND => PanelError::NotFound,
        _ => PanelError::from_error_body(status.as_u16(), &body),
    })
}

/// Masks values of credential-looking keys in text bound for logs.
///
/// Handles JSON (`"access_token": "..."`), form bodies
/// (`client_secret=...`), and query strings. Keys are kept, values become
/// `***`.
pub fn redact(text: &str) -> String {
    SENSITIVE_VALUE.replace_all(text, "${1}***").into_owned()
}

/// Truncates text to a character budget for log output.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}
