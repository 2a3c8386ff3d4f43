//! Liveness, health and transfer metrics handlers.
//!
//! - GET /status        -> liveness text, never performs I/O
//! - GET /health_check  -> reads the health-check object and renders a test document
//! - GET /metrics       -> bytes moved per backend and direction

use crate::services::storage_service::{StorageResult, StorageService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// `GET /status`
pub async fn status() -> &'static str {
    "filestore is alive"
}

/// `GET /health_check`
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 500 when any check fails.
pub async fn health_check(State(service): State<StorageService>) -> impl IntoResponse {
    let (files, convert) = tokio::join!(
        service.check_can_get_files(),
        service.check_file_convert()
    );

    let mut checks = HashMap::new();
    checks.insert("get_file", CheckStatus::from_result(files));
    checks.insert("convert", CheckStatus::from_result(convert));
    let overall_ok = checks.values().all(|check| check.ok);

    let body = HealthResponse {
        status: if overall_ok { "ok" } else { "error" },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(body))
}

/// `GET /metrics`
pub async fn metrics(State(service): State<StorageService>) -> impl IntoResponse {
    Json(service.metrics().snapshot())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result(result: StorageResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(err) => {
                warn!(error = %err, "health check failed");
                Self {
                    ok: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
