// In-process mock of the assistant endpoint, implementing the HTTP
// contract the uploader speaks: chunk upload, analyse, status, download,
// and health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

/// One observed upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAttempt {
    pub session_id: String,
    pub chunk_index: u32,
    pub is_last_chunk: bool,
    pub succeeded: bool,
}

#[derive(Default)]
struct MockState {
    /// Every upload attempt in arrival order, including rejected ones
    attempts: Vec<UploadAttempt>,
    /// Remaining injected failures per (session, chunk index)
    fail_plan: HashMap<(String, u32), u32>,
    /// Sessions that received an analyse call
    analysed: Vec<String>,
    /// Result artifacts available for download
    results: HashMap<(String, String), String>,
}

#[derive(Clone)]
pub struct MockAssistant {
    pub base_url: String,
    state: Arc<Mutex<MockState>>,
}

impl MockAssistant {
    pub async fn spawn() -> Self {
        let state = Arc::new(Mutex::new(MockState::default()));

        let router = Router::new()
            .route("/health", get(health))
            .route("/:session_id/upload-chunk", post(upload_chunk))
            .route("/:session_id/analyse", post(analyse))
            .route("/:session_id/status", get(status))
            .route("/:session_id/download", get(download))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock assistant");
        let addr = listener.local_addr().expect("mock assistant addr");

        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// Reject the next `times` uploads of the given chunk with a 500.
    pub fn fail_uploads(&self, session_id: &str, chunk_index: u32, times: u32) {
        self.state
            .lock()
            .unwrap()
            .fail_plan
            .insert((session_id.to_string(), chunk_index), times);
    }

    pub fn attempts(&self) -> Vec<UploadAttempt> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn successful_uploads(&self) -> Vec<UploadAttempt> {
        self.attempts().into_iter().filter(|a| a.succeeded).collect()
    }

    pub fn analysed_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().analysed.clone()
    }

    pub fn set_result(&self, session_id: &str, result_type: &str, content: &str) {
        self.state.lock().unwrap().results.insert(
            (session_id.to_string(), result_type.to_string()),
            content.to_string(),
        );
    }
}

#[derive(Deserialize)]
struct ChunkQuery {
    chunk_index: u32,
    is_last_chunk: bool,
}

async fn upload_chunk(
    State(state): State<Arc<Mutex<MockState>>>,
    Path(session_id): Path<String>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> impl IntoResponse {
    assert!(!body.is_empty(), "upload must carry a multipart body");

    let mut state = state.lock().unwrap();

    let succeed = match state
        .fail_plan
        .get_mut(&(session_id.clone(), query.chunk_index))
    {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            false
        }
        _ => true,
    };

    state.attempts.push(UploadAttempt {
        session_id: session_id.clone(),
        chunk_index: query.chunk_index,
        is_last_chunk: query.is_last_chunk,
        succeeded: succeed,
    });

    if succeed {
        (
            StatusCode::OK,
            Json(json!({
                "message": "chunk received",
                "session_id": session_id,
                "chunk_index": query.chunk_index,
                "is_last_chunk": query.is_last_chunk,
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "injected failure" })),
        )
            .into_response()
    }
}

async fn analyse(
    State(state): State<Arc<Mutex<MockState>>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    state.lock().unwrap().analysed.push(session_id);
    StatusCode::OK
}

async fn status(
    State(state): State<Arc<Mutex<MockState>>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let state = state.lock().unwrap();
    let ready: HashMap<String, bool> = state
        .results
        .keys()
        .filter(|(sid, _)| sid == &session_id)
        .map(|(_, result_type)| (result_type.clone(), true))
        .collect();
    Json(ready)
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(rename = "type")]
    result_type: String,
}

async fn download(
    State(state): State<Arc<Mutex<MockState>>>,
    Path(session_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> impl IntoResponse {
    let state = state.lock().unwrap();
    match state.results.get(&(session_id, query.result_type)) {
        Some(content) => (StatusCode::OK, content.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "result not ready").into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn eventually<F>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let mut waited = 0u64;
    while waited <= timeout_ms {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        waited += 50;
    }
    false
}
