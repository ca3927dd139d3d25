//! Health and stats endpoints
//!
//! Every stage exposes the same two routes: `GET /health` reporting
//! liveness, broker reachability, external-backend reachability, and
//! the last-success timestamp; `GET /stats` reporting the stage
//! counters plus stream and backend detail.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::Broker;
use crate::stats::{StageStats, StatsSnapshot};
use crate::Result;

/// Probe for the stage's external backend (LLM or TTS provider).
#[async_trait]
pub trait BackendProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend currently answers.
    async fn healthy(&self) -> bool;

    /// Backend-specific detail for `/stats`.
    fn detail(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Shared state behind the API routes.
pub struct ApiState {
    pub stage: &'static str,
    pub broker: Arc<dyn Broker>,
    pub backend: Option<Arc<dyn BackendProbe>>,
    pub stats: Arc<StageStats>,
    /// Streams reported by `/stats`
    pub streams: Vec<String>,
}

/// Result of a single health check.
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: "fail",
            message: Some(message.into()),
        }
    }

    fn unavailable() -> Self {
        Self {
            status: "unavailable",
            message: Some("not configured".to_string()),
        }
    }
}

#[derive(Serialize)]
struct HealthChecks {
    broker: CheckResult,
    backend: CheckResult,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    stage: &'static str,
    version: &'static str,
    checks: HealthChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_success: Option<String>,
}

#[derive(Serialize)]
struct StatsResponse {
    stage: &'static str,
    counters: StatsSnapshot,
    streams: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    backend: serde_json::Value,
}

async fn health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthResponse>) {
    let broker_check = match state.broker.ping().await {
        Ok(()) => CheckResult::ok(),
        Err(e) => CheckResult::fail(e.to_string()),
    };

    let backend_check = match &state.backend {
        Some(probe) => {
            if probe.healthy().await {
                CheckResult::ok()
            } else {
                CheckResult::fail(format!("{} unreachable", probe.name()))
            }
        }
        None => CheckResult::unavailable(),
    };

    let all_ok = broker_check.status == "ok"
        && (backend_check.status == "ok" || backend_check.status == "unavailable");

    let (status, http_status) = if all_ok {
        ("healthy", StatusCode::OK)
    } else {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        http_status,
        Json(HealthResponse {
            status,
            stage: state.stage,
            version: env!("CARGO_PKG_VERSION"),
            checks: HealthChecks {
                broker: broker_check,
                backend: backend_check,
            },
            last_success: state.stats.last_success().map(|t| t.to_rfc3339()),
        }),
    )
}

async fn stats(State(state): State<Arc<ApiState>>) -> Json<StatsResponse> {
    let mut streams = serde_json::Map::new();
    for stream in &state.streams {
        let value = match state.broker.stream_info(stream).await {
            Ok(info) => serde_json::to_value(info).unwrap_or(serde_json::Value::Null),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        streams.insert(stream.clone(), value);
    }

    Json(StatsResponse {
        stage: state.stage,
        counters: state.stats.snapshot(),
        streams,
        backend: state
            .backend
            .as_ref()
            .map_or(serde_json::Value::Null, |b| b.detail()),
    })
}

/// Build the stage router.
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve the API until the shutdown signal flips.
///
/// # Errors
///
/// Returns error if the listener cannot bind.
pub async fn serve(
    state: Arc<ApiState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, stage = state.stage, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    struct FlakyProbe(bool);

    #[async_trait]
    impl BackendProbe for FlakyProbe {
        fn name(&self) -> &'static str {
            "probe"
        }

        async fn healthy(&self) -> bool {
            self.0
        }
    }

    fn state(backend: Option<Arc<dyn BackendProbe>>) -> Arc<ApiState> {
        Arc::new(ApiState {
            stage: "test",
            broker: Arc::new(MemoryBroker::new()),
            backend,
            stats: Arc::new(StageStats::new()),
            streams: vec!["transcripts".to_string()],
        })
    }

    #[tokio::test]
    async fn healthy_when_broker_and_backend_answer() {
        let (status, body) = health(State(state(Some(Arc::new(FlakyProbe(true)))))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0.status, "healthy");
        assert_eq!(body.0.checks.backend.status, "ok");
    }

    #[tokio::test]
    async fn unhealthy_when_backend_is_down() {
        let (status, body) = health(State(state(Some(Arc::new(FlakyProbe(false)))))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0.status, "unhealthy");
    }

    #[tokio::test]
    async fn missing_backend_is_not_a_failure() {
        let (status, body) = health(State(state(None))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0.checks.backend.status, "unavailable");
    }

    #[tokio::test]
    async fn stats_reports_streams_and_counters() {
        let s = state(None);
        s.stats.record_consumed();

        let body = stats(State(Arc::clone(&s))).await;
        assert_eq!(body.0.counters.consumed, 1);
        assert!(body.0.streams.contains_key("transcripts"));
    }
}
