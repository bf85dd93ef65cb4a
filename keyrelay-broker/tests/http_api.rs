use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::AUTHORIZATION};
use serde_json::{Value, json};
use std::path::PathBuf;
use tower::ServiceExt;

use keyrelay_broker::config::ServiceConfig;

const DEPLOYER_TOKEN: &str = "tok-deployer";
const AUDITOR_TOKEN: &str = "tok-auditor";

struct TestEnv {
    router: Router,
    audit_path: PathBuf,
    _dir: tempfile::TempDir,
}

async fn bootstrap() -> TestEnv {
    let dir = tempfile::TempDir::new().expect("tempdir");

    let policy_path = dir.path().join("policy.yaml");
    std::fs::write(
        &policy_path,
        r#"
subjects:
  deployer:
    - prefix: secret
      capabilities: [read, write, rotate]
  auditor:
    - prefix: secret
      capabilities: [read]
"#,
    )
    .expect("write policy");

    let audit_path = dir.path().join("audit.jsonl");
    let config_path = dir.path().join("config.yaml");
    std::fs::write(
        &config_path,
        format!(
            r#"
listen: 127.0.0.1:0
backend:
  kind: memory
policy_file: {policy}
audit:
  kind: file
  path: {audit}
tokens:
  - token: {DEPLOYER_TOKEN}
    subject: deployer
  - token: {AUDITOR_TOKEN}
    subject: auditor
"#,
            policy = policy_path.display(),
            audit = audit_path.display(),
        ),
    )
    .expect("write config");

    let config = ServiceConfig::load(&config_path).expect("load config");
    let state = keyrelay_broker::build_state(&config).await.expect("state");
    TestEnv {
        router: keyrelay_broker::http::router(state),
        audit_path,
        _dir: dir,
    }
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn put(path: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(path)
        .header("content-type", "application/json")
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_needs_no_token() {
    let env = bootstrap().await;
    let response = env
        .router
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let env = bootstrap().await;
    let response = env
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/secret/secret/db")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = env
        .router
        .oneshot(get("/v1/secret/secret/db", "tok-bogus"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn put_then_get_round_trip() {
    let env = bootstrap().await;

    let response = env
        .router
        .clone()
        .oneshot(put(
            "/v1/secret/secret/db",
            DEPLOYER_TOKEN,
            json!({ "fields": { "username": "app", "password": "hunter2" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["version"], 1);
    assert_eq!(created["path"], "secret/db");

    let response = env
        .router
        .oneshot(get("/v1/secret/secret/db", AUDITOR_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["version"], 1);
    assert_eq!(fetched["fields"]["password"], "hunter2");
}

#[tokio::test]
async fn read_only_callers_cannot_write() {
    let env = bootstrap().await;
    let response = env
        .router
        .oneshot(put(
            "/v1/secret/secret/db",
            AUDITOR_TOKEN,
            json!({ "fields": { "password": "nope" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn missing_secrets_are_not_found() {
    let env = bootstrap().await;
    let response = env
        .router
        .oneshot(get("/v1/secret/secret/ghost", DEPLOYER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_paths_are_bad_requests() {
    let env = bootstrap().await;
    let response = env
        .router
        .oneshot(get("/v1/secret/Secret/db", DEPLOYER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rotation_returns_fresh_material_and_serves_it_afterwards() {
    let env = bootstrap().await;

    env.router
        .clone()
        .oneshot(put(
            "/v1/secret/secret/db",
            DEPLOYER_TOKEN,
            json!({ "fields": { "password": "hunter2" } }),
        ))
        .await
        .unwrap();

    let response = env
        .router
        .clone()
        .oneshot(post("/v1/rotate/secret/db", DEPLOYER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = body_json(response).await;
    assert_eq!(rotated["version"], 2);
    assert_ne!(rotated["fields"]["password"], "hunter2");

    let response = env
        .router
        .oneshot(get("/v1/secret/secret/db", DEPLOYER_TOKEN))
        .await
        .unwrap();
    let fetched = body_json(response).await;
    assert_eq!(fetched["fields"]["password"], rotated["fields"]["password"]);
}

#[tokio::test]
async fn rotation_requires_the_rotate_capability() {
    let env = bootstrap().await;

    env.router
        .clone()
        .oneshot(put(
            "/v1/secret/secret/db",
            DEPLOYER_TOKEN,
            json!({ "fields": { "password": "hunter2" } }),
        ))
        .await
        .unwrap();

    let response = env
        .router
        .oneshot(post("/v1/rotate/secret/db", AUDITOR_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn compare_and_set_conflicts_are_409() {
    let env = bootstrap().await;

    let response = env
        .router
        .clone()
        .oneshot(put(
            "/v1/secret/secret/db",
            DEPLOYER_TOKEN,
            json!({ "fields": { "password": "first" }, "expected_version": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = env
        .router
        .oneshot(put(
            "/v1/secret/secret/db",
            DEPLOYER_TOKEN,
            json!({ "fields": { "password": "second" }, "expected_version": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn responses_echo_the_correlation_id() {
    let env = bootstrap().await;
    let request = Request::builder()
        .method("GET")
        .uri("/v1/secret/secret/ghost")
        .header(AUTHORIZATION, format!("Bearer {DEPLOYER_TOKEN}"))
        .header("x-correlation-id", "corr-1234")
        .body(Body::empty())
        .unwrap();

    let response = env.router.oneshot(request).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok()),
        Some("corr-1234")
    );
}

#[tokio::test]
async fn audit_file_records_every_operation() {
    let env = bootstrap().await;

    env.router
        .clone()
        .oneshot(put(
            "/v1/secret/secret/db",
            DEPLOYER_TOKEN,
            json!({ "fields": { "password": "hunter2" } }),
        ))
        .await
        .unwrap();
    env.router
        .clone()
        .oneshot(get("/v1/secret/secret/db", AUDITOR_TOKEN))
        .await
        .unwrap();
    env.router
        .oneshot(post("/v1/rotate/secret/db", AUDITOR_TOKEN))
        .await
        .unwrap();

    let raw = std::fs::read_to_string(&env.audit_path).expect("audit file");
    let events: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["outcome"], "granted");
    assert_eq!(events[0]["caller"], "deployer");
    assert_eq!(events[1]["outcome"], "granted");
    assert_eq!(events[1]["capability"], "read");
    assert_eq!(events[2]["outcome"], "denied");
    assert_eq!(events[2]["caller"], "auditor");
    assert_eq!(events[2]["capability"], "rotate");
}
