use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::{
    auth::verify_bearer,
    models::{IngestAcceptedResponse, IngestRequest, JobRecord, JobState},
    AppState,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ingest", post(create_ingest))
        .route(
            "/v1/ingest/{job_id}",
            get(get_ingest).delete(cancel_ingest),
        )
        .route("/v1/index/keys", get(lookup_keys))
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message.into()
            }
        })),
    )
        .into_response()
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn create_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<IngestRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    if payload.text.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_INGEST_REQUEST",
            "Request must include non-empty text.",
        );
    }

    let job_id = Uuid::new_v4().to_string();
    let record = JobRecord::queued(job_id.clone(), payload);
    let response = IngestAcceptedResponse {
        job_id: job_id.clone(),
        status: JobState::Queued,
        message: record.message.clone(),
        created_at: record.created_at,
    };

    {
        let mut jobs = state.jobs.write().await;
        jobs.insert(job_id.clone(), record);
    }

    if state.queue_tx.send(job_id.clone()).await.is_err() {
        let mut jobs = state.jobs.write().await;
        jobs.remove(&job_id);
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "QUEUE_UNAVAILABLE",
            "Ingest queue is unavailable.",
        );
    }

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

pub async fn get_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let jobs = state.jobs.read().await;
    let Some(job) = jobs.get(&job_id) else {
        return error_response(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", "Ingest job not found.");
    };

    (StatusCode::OK, Json(job.to_response())).into_response()
}

/// Only queued jobs can be canceled; a running build is never interrupted
/// halfway through its graph writes.
pub async fn cancel_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let mut jobs = state.jobs.write().await;
    let Some(job) = jobs.get_mut(&job_id) else {
        return error_response(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", "Ingest job not found.");
    };

    match job.status {
        JobState::Queued => {
            job.status = JobState::Canceled;
            job.updated_at = Utc::now();
            job.message = Some("Ingestion canceled".to_string());
            job.error = None;
            job.request = None;
        }
        JobState::Running => {
            return error_response(
                StatusCode::CONFLICT,
                "JOB_RUNNING",
                "Ingest job is already running and cannot be canceled.",
            );
        }
        _ => {}
    }

    (StatusCode::OK, Json(job.to_response())).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    pub table: Option<String>,
    pub column: Option<String>,
}

pub async fn lookup_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let service = state.service.clone();
    let lookup = tokio::task::spawn_blocking(move || {
        service
            .lock()
            .map(|service| service.lookup(query.table.as_deref(), query.column.as_deref()))
            .map_err(|_| "Index service lock poisoned".to_string())
    })
    .await;

    match lookup {
        Ok(Ok(keys)) => (
            StatusCode::OK,
            Json(json!({ "count": keys.len(), "keys": keys })),
        )
            .into_response(),
        Ok(Err(message)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INDEX_UNAVAILABLE", message)
        }
        Err(err) => {
            warn!("Key lookup task join error: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INDEX_UNAVAILABLE",
                "Key lookup failed.",
            )
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        path::Path,
        sync::{Arc, Mutex},
    };

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tokio::sync::{mpsc, RwLock};
    use tower::ServiceExt;

    use super::build_router;
    use crate::{
        config::Config, models::IngestRequest, service::tests::service_in, AppState,
    };

    pub(crate) const TEST_KEY: &str = "test-key";

    pub(crate) fn test_state(dir: &Path) -> (AppState, mpsc::Receiver<String>) {
        let config = Config::from_lookup(|key| {
            (key == "TABLEGRAPH_API_KEY").then(|| TEST_KEY.to_string())
        })
        .expect("config");
        let (queue_tx, queue_rx) = mpsc::channel(8);
        let state = AppState {
            config,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            queue_tx,
            service: Arc::new(Mutex::new(service_in(dir))),
        };
        (state, queue_rx)
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn authed(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {TEST_KEY}"))
            .header("content-type", "application/json")
            .body(body)
            .expect("request")
    }

    #[tokio::test]
    async fn health_is_public_and_everything_else_needs_a_bearer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, _rx) = test_state(dir.path());
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/v1/index/keys")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn queued_jobs_can_be_inspected_and_canceled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, mut rx) = test_state(dir.path());
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/v1/ingest",
                Body::from(r#"{"text":"orders,Customer order table"}"#),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = json_body(response).await;
        let job_id = accepted["jobId"].as_str().expect("job id").to_string();
        assert_eq!(accepted["status"], "queued");
        assert_eq!(rx.recv().await.as_deref(), Some(job_id.as_str()));

        let uri = format!("/v1/ingest/{job_id}");
        let response = app
            .clone()
            .oneshot(authed("DELETE", &uri, Body::empty()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "canceled");

        let response = app
            .clone()
            .oneshot(authed("GET", "/v1/ingest/missing", Body::empty()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(authed("POST", "/v1/ingest", Body::from(r#"{"text":"  "}"#)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn key_lookup_reports_indexed_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, _rx) = test_state(dir.path());
        {
            let mut service = state.service.lock().expect("lock");
            let request = IngestRequest {
                source: Some("tables.txt".into()),
                text: "orders,Customer order table".into(),
                headers: None,
                delimiter: None,
            };
            service.ingest(&request, |_, _| {}).expect("ingest");
        }
        let app = build_router(state);

        let response = app
            .oneshot(authed(
                "GET",
                "/v1/index/keys?table=orders&column=order_id",
                Body::empty(),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["keys"][0]["nodeIds"][0], "tables.txt#1");
    }
}
