//! Token lifecycle against a mock panel: caching, expiry, the refresh
//! grant, the single 401 retry, persistence across restarts, and
//! invalidation on credential rotation.

use mockito::{Matcher, Server};
use panel_sync::config::PanelConfig;
use panel_sync::panel::{http, CredentialStore, PanelCredentials, TokenManager};
use panel_sync::settings::SettingsStore;
use panel_sync::vault::{AeadManager, SecretService};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn create_stack(
    base_url: String,
    config: &PanelConfig,
) -> (Arc<CredentialStore>, Arc<SecretService>, reqwest::Client) {
    let settings = Arc::new(SettingsStore::new(":memory:").unwrap());
    let secrets = Arc::new(
        SecretService::new(
            ":memory:",
            AeadManager::new(&[3u8; 32]).unwrap(),
            Duration::from_secs(600),
        )
        .unwrap(),
    );
    let credentials = Arc::new(CredentialStore::new(settings, Arc::clone(&secrets)));
    credentials
        .set(PanelCredentials {
            base_url,
            client_id: "sync-node".to_string(),
            client_secret: "csecret".to_string(),
            scopes: String::new(),
            deep_scan: false,
        })
        .unwrap();
    let client = http::build_client(config).unwrap();
    (credentials, secrets, client)
}

fn create_manager(
    credentials: &Arc<CredentialStore>,
    secrets: &Arc<SecretService>,
    client: &reqwest::Client,
    config: &PanelConfig,
) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(
        Arc::clone(credentials),
        Arc::clone(secrets),
        client.clone(),
        config,
    ))
}

/// Token endpoint that mints `token_1`, `token_2`, ... per hit.
async fn counting_token_endpoint(
    server: &mut Server,
    expires_in: u64,
    expected_hits: usize,
) -> mockito::Mock {
    let hits = Arc::new(AtomicUsize::new(0));
    server
        .mock("POST", "/oauth2/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body_from_request(move |_| {
            let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
            format!(
                r#"{{"access_token": "token_{}", "expires_in": {}}}"#,
                n, expires_in
            )
            .into_bytes()
        })
        .expect(expected_hits)
        .create_async()
        .await
}

#[tokio::test]
async fn test_token_cached_until_expiry() {
    let mut server = Server::new_async().await;
    let token_mock = counting_token_endpoint(&mut server, 3600, 1).await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    let first = manager.get_token().await.unwrap();
    let second = manager.get_token().await.unwrap();

    assert_eq!(first, "token_1");
    assert_eq!(first, second);
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_token_inside_expiry_leeway_is_refetched() {
    let mut server = Server::new_async().await;
    // 5 seconds is inside the 10 second leeway, so every call refetches
    let token_mock = counting_token_endpoint(&mut server, 5, 2).await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    let first = manager.get_token().await.unwrap();
    let second = manager.get_token().await.unwrap();

    assert_ne!(first, second);
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_refresh_grant_used_when_panel_issued_one() {
    let mut server = Server::new_async().await;
    let initial = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "client_credentials".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "at-1", "refresh_token": "rt-1", "expires_in": 5}"#)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "at-2", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    assert_eq!(manager.get_token().await.unwrap(), "at-1");
    // The first token is already stale, so this goes through the refresh grant
    assert_eq!(manager.get_token().await.unwrap(), "at-2");

    initial.assert_async().await;
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_rejected_refresh_token_falls_back_to_client_credentials() {
    let mut server = Server::new_async().await;
    let initial = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "client_credentials".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "at-1", "refresh_token": "rt-dead", "expires_in": 5}"#)
        .expect(2)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "refresh_token".into(),
        ))
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "invalid_grant", "error_description": "refresh token expired"}"#)
        .expect(1)
        .create_async()
        .await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    assert_eq!(manager.get_token().await.unwrap(), "at-1");
    // Refresh is rejected, then client credentials succeed in the same call
    assert_eq!(manager.get_token().await.unwrap(), "at-1");

    initial.assert_async().await;
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_unauthorized_request_retried_exactly_once() {
    let mut server = Server::new_async().await;
    let token_mock = counting_token_endpoint(&mut server, 3600, 2).await;
    let rejected = server
        .mock("GET", "/api/ping")
        .match_header("authorization", "Bearer token_1")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"code": "unauthorized", "message": "token revoked"}"#)
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/api/ping")
        .match_header("authorization", "Bearer token_2")
        .with_status(200)
        .with_body("pong")
        .expect(1)
        .create_async()
        .await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    let url = format!("{}/api/ping", server.url());
    let response = manager
        .send_authorized(|| client.get(url.as_str()))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    rejected.assert_async().await;
    accepted.assert_async().await;
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_persistent_unauthorized_is_not_retried_again() {
    let mut server = Server::new_async().await;
    let _token = counting_token_endpoint(&mut server, 3600, 2).await;
    // Initial attempt plus the single retry, never a third
    let api_mock = server
        .mock("GET", "/api/ping")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"code": "unauthorized", "message": "client disabled"}"#)
        .expect(2)
        .create_async()
        .await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    let url = format!("{}/api/ping", server.url());
    let response = manager
        .send_authorized(|| client.get(url.as_str()))
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_persisted_token_survives_restart() {
    let mut server = Server::new_async().await;
    let token_mock = counting_token_endpoint(&mut server, 3600, 1).await;

    let mut config = PanelConfig::default();
    config.persist_tokens = true;
    let (credentials, secrets, client) = create_stack(server.url(), &config);

    let manager = create_manager(&credentials, &secrets, &client, &config);
    let first = manager.get_token().await.unwrap();
    drop(manager);

    // A fresh manager over the same vault picks up the persisted record
    let manager = create_manager(&credentials, &secrets, &client, &config);
    let second = manager.get_token().await.unwrap();

    assert_eq!(first, second);
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_credential_rotation_invalidates_cached_token() {
    let mut server = Server::new_async().await;
    let token_mock = counting_token_endpoint(&mut server, 3600, 2).await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    let first = manager.get_token().await.unwrap();

    // Re-storing credentials bumps the generation; the cached token is
    // stale even though its expiry is hours away
    credentials
        .set(PanelCredentials {
            base_url: server.url(),
            client_id: "sync-node".to_string(),
            client_secret: "rotated-secret".to_string(),
            scopes: String::new(),
            deep_scan: false,
        })
        .unwrap();

    let second = manager.get_token().await.unwrap();

    assert_ne!(first, second);
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_reset_forces_a_fresh_fetch() {
    let mut server = Server::new_async().await;
    let token_mock = counting_token_endpoint(&mut server, 3600, 2).await;

    let config = PanelConfig::default();
    let (credentials, secrets, client) = create_stack(server.url(), &config);
    let manager = create_manager(&credentials, &secrets, &client, &config);

    let first = manager.get_token().await.unwrap();
    manager.reset().await;
    let second = manager.get_token().await.unwrap();

    assert_ne!(first, second);
    token_mock.assert_async().await;
}
