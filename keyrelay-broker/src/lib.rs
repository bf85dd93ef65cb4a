pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod state;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::auth::TokenRegistry;
use crate::config::ServiceConfig;
use keyrelay_core::{Broker, PolicySet};

pub use state::AppState;
pub use telemetry::CorrelationId;

/// Bind the HTTP listener and serve until ctrl-c or SIGTERM.
pub async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    let listen = config.listen;
    let state = build_state(&config).await?;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind http listener on {listen}"))?;
    let http_addr = listener.local_addr()?;
    info!(%http_addr, backend = state.broker.backend_name(), "http server listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(anyhow::Error::from)
}

/// Assemble the broker and token registry from configuration.
pub async fn build_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let backend = config::build_backend(config).await?;
    let policy = PolicySet::from_yaml_file(&config.policy_file)
        .context("failed to load policy rules")?;
    if policy.is_empty() {
        warn!("policy document grants nothing; every request will be denied");
    }
    let audit_sink = config::build_audit_sink(&config.audit)?;

    let broker = Broker::builder()
        .boxed_backend(backend)
        .policy(policy)
        .boxed_audit_sink(audit_sink)
        .default_lease_ttl(config.default_lease_ttl())
        .cache_capacity(config.cache_capacity)
        .backend_timeout(config.backend_timeout())
        .max_read_retries(config.max_read_retries)
        .build()
        .context("failed to build broker")?;

    let tokens = TokenRegistry::from_pairs(
        config
            .tokens
            .iter()
            .map(|entry| (entry.token.clone(), entry.subject.clone())),
    )
    .context("invalid token table")?;
    if tokens.is_empty() {
        warn!("no tokens configured; every request will be unauthorized");
    }

    Ok(AppState::new(Arc::new(broker), Arc::new(tokens)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
