use crate::metrics;
use crate::s1_index::{Episode, resolve_instruction};
use crate::s1_store::SearchQuery;
use crate::s3_daemon::{DaemonState, RequestError};
use crate::s4_sync::SyncRequest;
use crate::s5_project;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;

type AppState = State<Arc<DaemonState>>;

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/memory/add", post(add_memory))
        .route("/api/memory/search", post(search_memory))
        .route("/api/memory/recent", get(recent_memory))
        .route("/api/memory/{id}", delete(delete_memory))
        .route("/api/sessions", get(sessions))
        .route("/api/sync", post(sync))
        .route("/api/failed", get(failed))
        .route("/api/failed/{id}/retry", post(retry_failed))
        .with_state(state)
}

// --- Envelope ---

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(json!({"status": "ok", "data": data}))).into_response()
}

fn error_status(err: &RequestError) -> StatusCode {
    match err {
        RequestError::BadRequest(_) => StatusCode::BAD_REQUEST,
        RequestError::NotFound(_) => StatusCode::NOT_FOUND,
        RequestError::Store(e) => match e.kind {
            crate::StoreErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            crate::StoreErrorKind::Transient => StatusCode::BAD_GATEWAY,
            crate::StoreErrorKind::Fatal => StatusCode::UNPROCESSABLE_ENTITY,
        },
        RequestError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RequestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fail(err: RequestError) -> Response {
    let status = error_status(&err);
    if status.is_server_error() {
        log::warn!("request failed: {} ({err})", err.kind());
    }
    (
        status,
        Json(json!({"status": "error", "error": {"kind": err.kind(), "message": err.to_string()}})),
    )
        .into_response()
}

fn respond<T: Serialize>(result: Result<T, RequestError>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(e) => fail(e),
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, RequestError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| RequestError::BadRequest(e.body_text()))
}

// --- Handlers ---

async fn health(State(state): AppState) -> Response {
    metrics::count_request("health");
    if state.is_healthy() {
        ok(json!({"health": "ok"}))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "error": {"kind": "store_unavailable", "message": "degraded"},
            })),
        )
            .into_response()
    }
}

async fn status(State(state): AppState) -> Response {
    metrics::count_request("status");
    ok(state.status())
}

#[derive(Debug, Deserialize)]
pub struct AddRequest {
    pub content: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Explicit namespace; otherwise derived from `project`.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub preprocessing_instruction: Option<String>,
}

/// Turn a client add request into an episode. Identical content for the
/// same namespace maps to the same idempotency key.
pub fn episode_from_request(state: &DaemonState, req: AddRequest) -> Result<Episode, RequestError> {
    if req.content.trim().is_empty() {
        return Err(RequestError::BadRequest("content must not be empty".into()));
    }
    let project = match &req.project {
        Some(p) => Some(s5_project::resolve(p)?),
        None => None,
    };
    let group_id = match (&req.group_id, &project) {
        (Some(g), _) if !g.trim().is_empty() => g.clone(),
        (_, Some(p)) => state.config().group_id(Some(p)),
        _ => return Err(RequestError::BadRequest("group_id or project is required".into())),
    };
    let name = req.name.unwrap_or_else(|| {
        let head: String = req.content.chars().take(48).collect();
        format!("note: {}", head.trim())
    });
    let digest = Sha256::digest(format!("{group_id}\0{name}\0{}", req.content).as_bytes());
    let mut metadata = req.metadata.unwrap_or_else(|| json!({}));
    if !metadata.is_object() {
        return Err(RequestError::BadRequest("metadata must be an object".into()));
    }
    if let Some(p) = &project {
        metadata["project"] = json!({"namespace": group_id, "id": p.id, "path": p.canonical, "name": p.name});
    }
    Ok(Episode {
        preprocessing_instruction: resolve_instruction(
            &state.config(),
            project.as_ref(),
            req.preprocessing_instruction.as_deref(),
        ),
        name,
        body: req.content,
        source: req.source.unwrap_or_else(|| "gmem api".into()),
        group_id,
        timestamp: chrono::Utc::now().to_rfc3339(),
        metadata,
        idempotency_key: digest.iter().map(|b| format!("{b:02x}")).collect(),
    })
}

async fn add_memory(State(state): AppState, payload: Result<Json<AddRequest>, JsonRejection>) -> Response {
    metrics::count_request("memory_add");
    let result = async {
        let episode = episode_from_request(&state, body(payload)?)?;
        let key = episode.idempotency_key.clone();
        let id = state.submit_episode(episode).await?;
        Ok::<_, RequestError>(json!({"episode_id": id, "idempotency_key": key}))
    }
    .await;
    respond(result)
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub max_results: Option<usize>,
}

async fn search_memory(State(state): AppState, payload: Result<Json<SearchRequest>, JsonRejection>) -> Response {
    metrics::count_request("memory_search");
    let result = async {
        let req = body(payload)?;
        if req.query.trim().is_empty() {
            return Err(RequestError::BadRequest("query must not be empty".into()));
        }
        let mut group_ids = req.group_ids;
        if let Some(p) = &req.project {
            let project = s5_project::resolve(p)?;
            group_ids.push(state.config().group_id(Some(&project)));
        }
        let query = SearchQuery {
            query: req.query,
            group_ids,
            max_results: req.max_results.unwrap_or(10).clamp(1, 100),
        };
        state.search(query).await
    }
    .await;
    respond(result)
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn recent_memory(State(state): AppState, Query(params): Query<RecentParams>) -> Response {
    metrics::count_request("memory_recent");
    let result = async {
        let group_id = match (params.group_id, params.project) {
            (Some(g), _) => g,
            (None, Some(p)) => state.config().group_id(Some(&s5_project::resolve(&p)?)),
            (None, None) => return Err(RequestError::BadRequest("group_id or project is required".into())),
        };
        state.recent(group_id, params.limit.unwrap_or(10).clamp(1, 100)).await
    }
    .await;
    respond(result)
}

async fn delete_memory(State(state): AppState, Path(id): Path<String>) -> Response {
    metrics::count_request("memory_delete");
    respond(state.delete_episode(id).await.map(|id| json!({"deleted": id})))
}

async fn sessions(State(state): AppState) -> Response {
    metrics::count_request("sessions");
    ok(state.registry.snapshot())
}

async fn sync(State(state): AppState, payload: Result<Json<SyncRequest>, JsonRejection>) -> Response {
    metrics::count_request("sync");
    let result = async {
        let req = body(payload)?;
        state.sync(req).await
    }
    .await;
    respond(result)
}

#[derive(Debug, Deserialize)]
pub struct FailedParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn failed(State(state): AppState, Query(params): Query<FailedParams>) -> Response {
    metrics::count_request("failed");
    respond(state.list_failed(params.limit.unwrap_or(50).clamp(1, 1000)))
}

async fn retry_failed(State(state): AppState, Path(id): Path<i64>) -> Response {
    metrics::count_request("failed_retry");
    respond(state.retry_failed(id).map(|f| json!({"requeued": f.id, "name": f.episode.name})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::s1_store::MemoryStore;
    use crate::s5_config::GmemConfig;

    fn state() -> Arc<DaemonState> {
        DaemonState::new(
            GmemConfig::default(),
            Arc::new(MemoryStore::new()),
            db::open_in_memory().unwrap(),
            None,
        )
        .unwrap()
    }

    async fn json_of(resp: Response) -> (StatusCode, Value) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn add(content: &str) -> AddRequest {
        AddRequest {
            content: content.into(),
            name: None,
            group_id: None,
            project: Some("/work/app".into()),
            source: None,
            metadata: None,
            preprocessing_instruction: None,
        }
    }

    #[test]
    fn add_request_derives_namespace_and_stable_key() {
        let s = state();
        let a = episode_from_request(&s, add("remember the port is 8283")).unwrap();
        let b = episode_from_request(&s, add("remember the port is 8283")).unwrap();
        let project = s5_project::resolve("/work/app").unwrap();
        assert_eq!(a.group_id, project.namespace());
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_eq!(a.metadata["project"]["name"], "app");
        assert!(a.name.starts_with("note: remember"));

        let mut bare = add("x");
        bare.project = None;
        assert!(matches!(episode_from_request(&s, bare), Err(RequestError::BadRequest(_))));
        assert!(matches!(episode_from_request(&s, add("  ")), Err(RequestError::BadRequest(_))));
    }

    #[tokio::test]
    async fn health_reports_degraded_until_verified() {
        let (status, v) = json_of(health(State(state())).await).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"]["kind"], "store_unavailable");
    }

    #[tokio::test]
    async fn add_while_unhealthy_is_503_with_kind() {
        let s = state();
        let resp = add_memory(State(s), Ok(Json(add("note")))).await;
        let (status, v) = json_of(resp).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(v["error"]["kind"], "store_unavailable");
    }

    #[tokio::test]
    async fn status_and_unknown_retry() {
        let s = state();
        let (code, v) = json_of(status(State(s.clone())).await).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(v["data"]["store_healthy"], false);
        assert_eq!(v["data"]["queue_depth"], 0);

        let (code, v) = json_of(retry_failed(State(s), Path(42)).await).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(v["error"]["kind"], "not_found");
    }
}
