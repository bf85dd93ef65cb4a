use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::{Extension, Json, Router, routing::get, routing::post};
use tracing::Instrument;

use crate::auth;
use crate::error::{AppError, attach_correlation};
use crate::models::{DeleteResponse, PutSecretRequest, PutSecretResponse, SecretResponse};
use crate::state::AppState;
use crate::telemetry::{CorrelationId, correlation_layer, request_span};
use keyrelay_core::{CallerIdentity, SecretPath};

pub fn router(state: AppState) -> Router {
    let api = api_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        auth::http_layer,
    ));

    Router::new()
        .route("/healthz", get(health_check))
        .merge(api)
        .layer(middleware::from_fn(correlation_layer))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/secret/{*path}",
            get(get_secret).put(put_secret).delete(delete_secret),
        )
        .route("/v1/rotate/{*path}", post(rotate_secret))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

fn parse_path(raw: &str) -> Result<SecretPath, AppError> {
    SecretPath::parse(raw).map_err(|err| AppError::bad_request(err.to_string()))
}

async fn get_secret(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Extension(caller): Extension<CallerIdentity>,
    Path(raw_path): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span("http.get", &correlation.0);
    async move {
        let path = parse_path(&raw_path)?;
        let value = state
            .broker
            .get(&caller, &path)
            .await
            .map_err(AppError::from)?;
        Ok((StatusCode::OK, Json(SecretResponse::new(&path, value))))
    }
    .instrument(span)
    .await
    .map_err(|err: AppError| attach_correlation(err, &correlation))
}

async fn put_secret(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Extension(caller): Extension<CallerIdentity>,
    Path(raw_path): Path<String>,
    Json(request): Json<PutSecretRequest>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span("http.put", &correlation.0);
    async move {
        let path = parse_path(&raw_path)?;
        let version = state
            .broker
            .put(&caller, &path, request.fields, request.expected_version)
            .await
            .map_err(AppError::from)?;
        Ok((
            StatusCode::CREATED,
            Json(PutSecretResponse {
                path: path.to_string(),
                version,
            }),
        ))
    }
    .instrument(span)
    .await
    .map_err(|err: AppError| attach_correlation(err, &correlation))
}

async fn delete_secret(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Extension(caller): Extension<CallerIdentity>,
    Path(raw_path): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span("http.delete", &correlation.0);
    async move {
        let path = parse_path(&raw_path)?;
        state
            .broker
            .delete(&caller, &path)
            .await
            .map_err(AppError::from)?;
        Ok((
            StatusCode::OK,
            Json(DeleteResponse {
                path: path.to_string(),
                deleted: true,
            }),
        ))
    }
    .instrument(span)
    .await
    .map_err(|err: AppError| attach_correlation(err, &correlation))
}

async fn rotate_secret(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Extension(caller): Extension<CallerIdentity>,
    Path(raw_path): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span("http.rotate", &correlation.0);
    async move {
        let path = parse_path(&raw_path)?;
        let value = state
            .broker
            .rotate(&caller, &path)
            .await
            .map_err(AppError::from)?;
        Ok((StatusCode::OK, Json(SecretResponse::new(&path, value))))
    }
    .instrument(span)
    .await
    .map_err(|err: AppError| attach_correlation(err, &correlation))
}
