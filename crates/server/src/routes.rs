// HTTP trigger surface
//
// Worker invocations are operator-triggered here or driven by the background
// stage consumers; both paths build the same JobWorker.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use conveyor_queue::{
    BatchPhase, DrainOutcome, FanoutTrigger, JobProcessor, JobStore, JobWorker, RetryPolicy,
    WorkerConfig, WorkerRunStats,
};

use crate::config::ServerConfig;
use crate::consumer::phase_retry_policy;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub processor: Arc<dyn JobProcessor>,
    pub fanout: Arc<dyn FanoutTrigger>,
    pub config: ServerConfig,
}

/// Request body for an operator-triggered worker run
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    /// Worker identity; generated when omitted
    pub worker_id: Option<String>,
    /// Restrict the run to one batch
    pub batch_id: Option<String>,
    /// Jobs acquired per cycle
    pub limit: Option<usize>,
    /// Run time budget in milliseconds
    pub timeout_ms: Option<u64>,
    pub shard_id: Option<u32>,
    pub total_shards: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub stats: WorkerRunStats,
    pub drain: Option<DrainReport>,
}

/// Serializable rendering of the batch drain decision
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainReport {
    MoreWork,
    PhaseComplete { next: BatchPhase },
    AlreadyAdvanced,
    PipelineDone,
}

impl From<DrainOutcome> for DrainReport {
    fn from(outcome: DrainOutcome) -> Self {
        match outcome {
            DrainOutcome::MoreWork => Self::MoreWork,
            DrainOutcome::PhaseComplete(next) => Self::PhaseComplete { next },
            DrainOutcome::AlreadyAdvanced => Self::AlreadyAdvanced,
            DrainOutcome::PipelineDone => Self::PipelineDone,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Run one worker invocation synchronously and return its stats
async fn run_worker(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Json<TriggerResponse> {
    // A batch in its publishing phase gets the deferred retry policy, same
    // as the background consumers would give it
    let retry = match request.batch_id.as_deref() {
        Some(batch_id) => match state.store.batch_phase(batch_id).await {
            Ok(phase) => phase_retry_policy(&state.config, phase),
            Err(_) => RetryPolicy::immediate(),
        },
        None => RetryPolicy::immediate(),
    };

    let mut config = WorkerConfig::new()
        .with_per_cycle_limit(request.limit.unwrap_or_else(|| state.config.per_cycle_limit()))
        .with_time_budget(
            request
                .timeout_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| state.config.time_budget()),
        )
        .with_dispatch_timeout(state.config.dispatch_timeout())
        .with_lease(state.config.lease())
        .with_shards(
            request.shard_id,
            request.total_shards.unwrap_or_else(|| state.config.total_shards()),
        )
        .with_retry(retry);
    if let Some(worker_id) = request.worker_id {
        config = config.with_worker_id(worker_id);
    }
    if let Some(batch_id) = request.batch_id {
        config = config.with_batch_id(batch_id);
    }

    info!(worker_id = %config.worker_id, "operator-triggered worker run");
    let worker = JobWorker::new(
        Arc::clone(&state.store),
        Arc::clone(&state.processor),
        Arc::clone(&state.fanout),
        config,
    );
    let report = worker.run().await;

    Json(TriggerResponse {
        success: true,
        stats: report.stats,
        drain: report.drain.map(DrainReport::from),
    })
}

/// Build the router for the trigger surface
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/workers/run", post(run_worker))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use conveyor_queue::{
        InMemoryJobStore, JobPayload, LockedJob, NewJob, ProcessOutcome, StageFanout,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct AlwaysOk;

    #[async_trait::async_trait]
    impl JobProcessor for AlwaysOk {
        async fn process(&self, _job: &LockedJob) -> ProcessOutcome {
            ProcessOutcome::Success
        }
    }

    fn test_state(store: Arc<InMemoryJobStore>) -> AppState {
        AppState {
            store: store.clone(),
            processor: Arc::new(AlwaysOk),
            fanout: Arc::new(StageFanout::new(store, "pipeline")),
            config: ServerConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_healthz() {
        let app = routes(test_state(Arc::new(InMemoryJobStore::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_trigger_runs_batch_to_completion() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .create_batch("b1", BatchPhase::Drafting)
            .await
            .unwrap();
        store
            .enqueue_job(NewJob::new(
                "b1",
                JobPayload::SectionDraft {
                    article_id: Uuid::now_v7(),
                    section_key: "intro".to_string(),
                },
            ))
            .await
            .unwrap();

        let app = routes(test_state(store.clone()));
        let request = Request::builder()
            .method("POST")
            .uri("/v1/workers/run")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"worker_id": "w-http", "batch_id": "b1", "limit": 5, "timeout_ms": 5000}"#,
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["stats"]["worker_id"], "w-http");
        assert_eq!(json["stats"]["succeeded"], 1);
        assert_eq!(json["drain"]["outcome"], "phase_complete");
        assert_eq!(store.pending_count("b1").await.unwrap(), 0);
    }
}
