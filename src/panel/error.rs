//! Error taxonomy for panel operations.
//!
//! Callers branch on these variants: `NotFound` drives fallback routes,
//! `Forbidden` marks servers the credentials cannot touch, `Auth` and
//! `Scope` surface misconfiguration to the operator.

use serde::Deserialize;
use thiserror::Error;

use crate::vault::VaultError;

/// Longest stretch of a raw error body carried into an error message
const MAX_BODY_IN_MESSAGE: usize = 200;

#[derive(Debug, Error)]
pub enum PanelError {
    /// Rejected locally, before any network traffic
    #[error("configuration error: {0}")]
    Config(String),

    /// Panel rejected our credentials
    #[error("panel authentication failed: {0}")]
    Auth(String),

    /// Panel rejected the requested scopes
    #[error("panel rejected requested scope: {0}")]
    Scope(String),

    /// 403 on a resource
    #[error("access to panel resource forbidden")]
    Forbidden,

    /// 404 on a resource
    #[error("panel resource not found")]
    NotFound,

    /// Any other non-2xx response from the panel
    #[error("panel returned status {status}: {message}")]
    Upstream {
        status: u16,
        code: Option<String>,
        message: String,
        request_id: Option<String>,
    },

    /// Connection, timeout, or body-read failure
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Vault failure while handling stored credentials
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Structured error body the panel returns on failures.
///
/// The panel sends camelCase (`requestId`); older builds sent snake_case.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "requestId", alias = "request_id")]
    request_id: Option<String>,
}

impl PanelError {
    /// Builds an `Upstream` error from a non-2xx response body.
    ///
    /// Parses the panel's structured error shape when present, otherwise
    /// carries a truncated slice of the raw body.
    pub(crate) fn from_error_body(status: u16, body: &str) -> Self {
        if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
            if parsed.code.is_some() || parsed.message.is_some() {
                return PanelError::Upstream {
                    status,
                    message: parsed
                        .message
                        .unwrap_or_else(|| format!("panel returned status {}", status)),
                    code: parsed.code,
                    request_id: parsed.request_id,
                };
            }
        }

        let raw = truncate_chars(body.trim(), MAX_BODY_IN_MESSAGE);
        PanelError::Upstream {
            status,
            code: None,
            message: if raw.is_empty() {
                format!("panel returned status {}", status)
            } else {
                raw
            },
            request_id: None,
        }
    }

    /// Builds an `Auth` error from a 401 response body.
    pub(crate) fn auth_from_body(body: &str) -> Self {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .ok()
            .and_then(|parsed| parsed.message)
            .unwrap_or_else(|| "token rejected".to_string());
        PanelError::Auth(message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PanelError::NotFound)
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, PanelError::Forbidden)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PanelError::Auth(_))
    }
}

impl From<rusqlite::Error> for PanelError {
    fn from(e: rusqlite::Error) -> Self {
        PanelError::Vault(VaultError::Storage(e))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_structured_body_camel_case() {
        let body = r#"{"code":"ServerSuspended","message":"Server is suspended","requestId":"req-123"}"#;
        let err = PanelError::from_error_body(409, body);

        match err {
            PanelError::Upstream {
                status,
                code,
                message,
                request_id,
            } => {
                assert_eq!(status, 409);
                assert_eq!(code.as_deref(), Some("ServerSuspended"));
                assert_eq!(message, "Server is suspended");
                assert_eq!(request_id.as_deref(), Some("req-123"));
            }
            other => panic!("Expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn test_parses_structured_body_snake_case_request_id() {
        let body = r#"{"message":"boom","request_id":"req-9"}"#;
        let err = PanelError::from_error_body(500, body);

        match err {
            PanelError::Upstream { request_id, .. } => {
                assert_eq!(request_id.as_deref(), Some("req-9"));
            }
            other => panic!("Expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_body_is_truncated() {
        let body = "x".repeat(500);
        let err = PanelError::from_error_body(502, &body);

        match err {
            PanelError::Upstream { message, .. } => {
                assert_eq!(message.chars().count(), MAX_BODY_IN_MESSAGE);
            }
            other => panic!("Expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_body_gets_default_message() {
        let err = PanelError::from_error_body(503, "");
        match err {
            PanelError::Upstream { message, .. } => {
                assert_eq!(message, "panel returned status 503");
            }
            other => panic!("Expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_from_body_uses_message() {
        let err = PanelError::auth_from_body(r#"{"message":"token expired"}"#);
        match err {
            PanelError::Auth(message) => assert_eq!(message, "token expired"),
            other => panic!("Expected Auth, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_from_body_fallback() {
        let err = PanelError::auth_from_body("not json");
        match err {
            PanelError::Auth(message) => assert_eq!(message, "token rejected"),
            other => panic!("Expected Auth, got {:?}", other),
        }
    }

    #[test]
    fn test_sentinel_helpers() {
        assert!(PanelError::NotFound.is_not_found());
        assert!(PanelError::Forbidden.is_forbidden());
        assert!(PanelError::Auth("x".to_string()).is_auth());
        assert!(!PanelError::Forbidden.is_not_found());
    }
}
