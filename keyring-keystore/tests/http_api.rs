//! Integration tests for the secrets HTTP API
//!
//! These tests run the router in-process against a container in a temp dir
//! and drive it over real HTTP.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keyring_keystore::{
    dispatcher::DEFAULT_QUEUE_DEPTH, secrets_router, Command, CommandExecutor, Dispatcher,
    KdfParams, KeystoreEngine, KeystoreError, KeystoreSettings, KeystoreState, Reply,
    AUTHORIZED_CONTAINER_TYPE,
};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

const TEST_KDF: KdfParams = KdfParams {
    memory_kib: 64,
    iterations: 1,
    parallelism: 1,
};

struct TestServer {
    base_url: String,
    client: Client,
    store: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Serve the secrets routes on a random port, returning the base URL
async fn serve<E: CommandExecutor>(executor: E, process_timeout: Duration) -> String {
    let (dispatcher, _worker) = Dispatcher::spawn(executor, DEFAULT_QUEUE_DEPTH).unwrap();
    let state = Arc::new(KeystoreState::new(dispatcher, process_timeout));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, secrets_router(state)).await.unwrap();
    });

    format!("http://127.0.0.1:{}", port)
}

/// Start a test server on a random port backed by a fresh container
async fn start_test_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("KeyringKeystore.store");
    let settings = KeystoreSettings::new(
        AUTHORIZED_CONTAINER_TYPE,
        "simplemotdepasse",
        store.clone(),
        "simplemotdepassecle",
    )
    .with_kdf(TEST_KDF);

    let engine = KeystoreEngine::open_with(&settings).unwrap();
    let base_url = serve(engine, Duration::from_secs(10)).await;

    TestServer {
        base_url,
        client: Client::new(),
        store,
        _dir: dir,
    }
}

/// Answers every command, but only after `delay`
struct SlowExecutor {
    delay: Duration,
}

impl CommandExecutor for SlowExecutor {
    fn execute(&mut self, _command: Command) -> Result<Reply, KeystoreError> {
        std::thread::sleep(self.delay);
        Ok(Reply::Aliases(BTreeSet::new()))
    }
}

/// Kills the worker thread on its first command
struct CrashingExecutor;

impl CommandExecutor for CrashingExecutor {
    fn execute(&mut self, command: Command) -> Result<Reply, KeystoreError> {
        panic!("worker crashed on {}", command.name());
    }
}

/// Status, error body and request id header of an error response
async fn error_parts(response: reqwest::Response) -> (StatusCode, Value, String) {
    let status = response.status();
    let request_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body: Value = response.json().await.unwrap();
    (status, body, request_id)
}

fn key_body(alias: &str, b64_key: &str) -> Value {
    json!({
        "alias": alias,
        "algorithm": "AES",
        "format": "RAW",
        "b64Key": b64_key,
    })
}

#[tokio::test]
async fn test_empty_store() {
    let server = start_test_server().await;

    let response = server.client.get(server.url("/secrets/aliases")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = server.client.get(server.url("/secrets/keys")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = server
        .client
        .get(server.url("/secrets/keys/invalide"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_unknown_key() {
    let server = start_test_server().await;

    let response = server
        .client
        .delete(server.url("/secrets/keys/invalid"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_key_lifecycle() {
    let server = start_test_server().await;

    let response = server
        .client
        .post(server.url("/secrets/keys"))
        .json(&key_body("k1", "QUJD"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "/secrets/keys/k1"
    );

    let response = server.client.get(server.url("/secrets/aliases")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let aliases: Vec<String> = response.json().await.unwrap();
    assert_eq!(aliases, vec!["k1"]);

    let response = server.client.get(server.url("/secrets/keys")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let keys: Value = response.json().await.unwrap();
    assert_eq!(keys["k1"]["b64Key"], "QUJD");

    let response = server.client.get(server.url("/secrets/keys/k1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let key: Value = response.json().await.unwrap();
    assert_eq!(key, key_body("k1", "QUJD"));

    let response = server
        .client
        .delete(server.url("/secrets/keys/k1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = server.client.get(server.url("/secrets/keys/k1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_add_rejects_invalid_and_duplicate_keys() {
    let server = start_test_server().await;

    let response = server
        .client
        .post(server.url("/secrets/keys"))
        .json(&json!({ "algorithm": "AES", "b64Key": "QUJD" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], "ValidationError");
    assert_eq!(error["message"], "Alias is missing");

    let response = server
        .client
        .post(server.url("/secrets/keys"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().contains_key("x-request-id"));

    let response = server
        .client
        .post(server.url("/secrets/keys"))
        .json(&key_body("k1", "QUJD"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = server
        .client
        .post(server.url("/secrets/keys"))
        .json(&key_body("k1", "REVG"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // The original key is untouched
    let key: Value = server
        .client
        .get(server.url("/secrets/keys/k1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(key["b64Key"], "QUJD");
}

#[tokio::test]
async fn test_alias_is_escaped_in_location() {
    let server = start_test_server().await;

    let response = server
        .client
        .post(server.url("/secrets/keys"))
        .json(&key_body("team a/db", "QUJD"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let location = response.headers().get("location").unwrap().to_str().unwrap().to_string();
    assert_eq!(location, "/secrets/keys/team%20a%2Fdb");

    let response = server.client.get(server.url(&location)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let key: Value = response.json().await.unwrap();
    assert_eq!(key["alias"], "team a/db");
}

#[tokio::test]
async fn test_concurrent_posts_are_all_stored() {
    const N: usize = 20;
    let server = Arc::new(start_test_server().await);

    let posts = (0..N).map(|i| {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .client
                .post(server.url("/secrets/keys"))
                .json(&key_body(&format!("key-{:02}", i), "QUJD"))
                .send()
                .await
                .unwrap()
                .status()
        })
    });
    for status in futures::future::join_all(posts).await {
        assert_eq!(status.unwrap(), StatusCode::CREATED);
    }

    let aliases: Vec<String> = server
        .client
        .get(server.url("/secrets/aliases"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(aliases.len(), N);
    assert_eq!(aliases[0], "key-00");
}

#[tokio::test]
async fn test_timeout_maps_to_service_unavailable() {
    let base_url = serve(
        SlowExecutor {
            delay: Duration::from_millis(500),
        },
        Duration::from_millis(50),
    )
    .await;

    let response = Client::new()
        .get(format!("{}/secrets/aliases", base_url))
        .send()
        .await
        .unwrap();
    let (status, body, request_id) = error_parts(response).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "Timeout");
    assert_eq!(body["message"], "Server unavailable, retry later");
    assert_eq!(body["requestId"], request_id.as_str());
}

#[tokio::test]
async fn test_stopped_worker_maps_to_internal_error() {
    let base_url = serve(CrashingExecutor, Duration::from_secs(10)).await;
    let client = Client::new();

    // First request loses its reply, later ones find the queue closed
    for _ in 0..2 {
        let response = client
            .get(format!("{}/secrets/keys", base_url))
            .send()
            .await
            .unwrap();
        let (status, body, _) = error_parts(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "NoHandler");
        assert_eq!(body["message"], "Internal Server Error");
    }
}

#[tokio::test]
async fn test_persistence_failure_maps_to_internal_error() {
    let server = start_test_server().await;

    // A directory squatting on the staging path makes the commit fail
    let mut staging = server.store.clone().into_os_string();
    staging.push(".tmp");
    std::fs::create_dir(&staging).unwrap();

    let response = server
        .client
        .post(server.url("/secrets/keys"))
        .json(&key_body("k1", "QUJD"))
        .send()
        .await
        .unwrap();
    let (status, body, _) = error_parts(response).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "PersistenceError");
    assert_eq!(body["message"], "Unable to save the key");

    let dir = server.store.parent().unwrap().to_string_lossy().to_string();
    assert!(!body.to_string().contains(&dir));

    // Nothing was stored
    let response = server.client.get(server.url("/secrets/aliases")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
