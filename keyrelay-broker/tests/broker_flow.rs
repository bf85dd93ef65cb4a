use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::AUTHORIZATION};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

use keyrelay_broker::AppState;
use keyrelay_broker::auth::TokenRegistry;
use keyrelay_core::audit::{AuditOutcome, MemorySink};
use keyrelay_core::backend::SecretsBackend;
use keyrelay_core::backend::memory::MemoryBackend;
use keyrelay_core::{Broker, Capability, PolicySet, Result, SecretPath, SecretValue};

/// Memory backend that counts fetches and holds each one open briefly so
/// concurrent requests overlap.
#[derive(Default)]
struct CountingBackend {
    inner: MemoryBackend,
    fetches: AtomicUsize,
}

#[async_trait]
impl SecretsBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    async fn fetch(&self, path: &SecretPath) -> Result<Option<SecretValue>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.inner.fetch(path).await
    }

    async fn store(
        &self,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        self.inner.store(path, fields, expected_version).await
    }

    async fn rotate(&self, path: &SecretPath) -> Result<SecretValue> {
        self.inner.rotate(path).await
    }

    async fn delete(&self, path: &SecretPath) -> Result<()> {
        self.inner.delete(path).await
    }
}

struct Fixture {
    router: Router,
    backend: Arc<CountingBackend>,
    sink: Arc<MemorySink>,
}

async fn fixture() -> Fixture {
    let backend = Arc::new(CountingBackend::default());
    let mut fields = BTreeMap::new();
    fields.insert("password".to_string(), "hunter2".to_string());
    backend
        .store(&SecretPath::parse("secret/db").unwrap(), fields, None)
        .await
        .expect("seed secret");

    let policy = PolicySet::new()
        .allow("app", "secret", [
            Capability::Read,
            Capability::Write,
            Capability::Rotate,
        ])
        .unwrap()
        .allow("auditor", "secret", [Capability::Read])
        .unwrap();

    let sink = Arc::new(MemorySink::new());
    let broker = Broker::builder()
        .backend(backend.clone())
        .policy(policy)
        .audit_sink(sink.clone())
        .build()
        .expect("broker");

    let tokens =
        TokenRegistry::from_pairs([("tok-app", "app"), ("tok-auditor", "auditor")]).unwrap();
    let state = AppState::new(Arc::new(broker), Arc::new(tokens));

    Fixture {
        router: keyrelay_broker::http::router(state),
        backend,
        sink,
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

#[tokio::test]
async fn concurrent_cold_requests_share_one_backend_fetch() {
    let fx = fixture().await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let app = fx.router.clone();
        handles.push(tokio::spawn(async move {
            app.oneshot(get("/v1/secret/secret/db", "tok-app")).await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(fx.backend.fetches.load(Ordering::SeqCst), 1);

    // Every served value was individually authorized and audited.
    let events = fx.sink.events();
    assert_eq!(events.len(), 6);
    assert!(
        events
            .iter()
            .all(|e| matches!(e.outcome, AuditOutcome::Granted { .. }))
    );
}

#[tokio::test]
async fn pipeline_audits_hits_misses_and_denials() {
    let fx = fixture().await;

    let response = fx
        .router
        .clone()
        .oneshot(get("/v1/secret/secret/db", "tok-app"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = fx
        .router
        .clone()
        .oneshot(get("/v1/secret/secret/db", "tok-auditor"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let denied = Request::builder()
        .method("PUT")
        .uri("/v1/secret/secret/db")
        .header("content-type", "application/json")
        .header(AUTHORIZATION, "Bearer tok-auditor")
        .body(Body::from(
            json!({ "fields": { "password": "nope" } }).to_string(),
        ))
        .unwrap();
    let response = fx.router.clone().oneshot(denied).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let events = fx.sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].outcome, AuditOutcome::Granted { cache_hit: false });
    assert_eq!(events[1].outcome, AuditOutcome::Granted { cache_hit: true });
    assert!(matches!(events[2].outcome, AuditOutcome::Denied { .. }));
    assert_eq!(events[2].capability, Capability::Write);

    // The denied write never reached the backend.
    assert_eq!(fx.backend.fetches.load(Ordering::SeqCst), 1);
}
