//! Health and session REST handlers, backed by an in-memory registry.
//! Durable storage, repositories and worktree management are external
//! collaborators; this layer validates the CLI allow-list and drives the
//! session manager.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::AppState;
use crate::preflight;
use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub cli_type: String,
    pub work_dir: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// In-memory view of sessions this server knows about. Eventually consistent
/// with the shepherd: reconciliation at startup adopts live sessions and
/// marks orphaned records stopped.
pub struct SessionRegistry {
    records: DashMap<String, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn insert(&self, record: SessionRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn mark_running(&self, id: &str, pid: u32) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = SessionStatus::Running;
            record.pid = Some(pid);
        }
    }

    pub fn mark_stopped(&self, id: &str) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = SessionStatus::Stopped;
            record.pid = None;
        }
    }

    pub fn remove(&self, id: &str) {
        self.records.remove(id);
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clis": *state.clis,
        "git": state.git_ok,
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list())
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub cli_type: String,
    pub work_dir: PathBuf,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    if !preflight::is_allowed_cli(&req.cli_type) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("cli_type must be one of {:?}", preflight::ALLOWED_CLIS),
        );
    }
    if !req.work_dir.is_absolute() {
        return error_response(StatusCode::BAD_REQUEST, "work_dir must be absolute".into());
    }

    let id = Uuid::new_v4().simple().to_string()[..12].to_string();
    state.registry.insert(SessionRecord {
        id: id.clone(),
        cli_type: req.cli_type.clone(),
        work_dir: req.work_dir.to_string_lossy().into_owned(),
        status: SessionStatus::Starting,
        pid: None,
        created_at: Utc::now(),
    });

    match state.manager.start(&id, &req.cli_type, &req.work_dir).await {
        Ok((handle, pid)) => {
            state.registry.mark_running(&id, pid);
            info!(session_id = %id, cli = %req.cli_type, pid, "session created");

            // Watch for the child exiting so the record goes stale correctly.
            let registry = Arc::clone(&state.registry);
            let session_id = id.clone();
            tokio::spawn(async move {
                handle.done().await;
                registry.mark_stopped(&session_id);
            });

            let record = state
                .registry
                .list()
                .into_iter()
                .find(|record| record.id == id);
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(err) => {
            state.registry.remove(&id);
            warn!(session_id = %id, error = %err, "session start failed");
            let status = match err {
                SessionError::AlreadyExists(_) => StatusCode::CONFLICT,
                SessionError::SpawnFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(status, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteSessionQuery {
    /// Worktree removal is handled by the embedding layer; the flag is
    /// accepted for interface compatibility.
    #[serde(default)]
    #[allow(dead_code)]
    pub delete_local: bool,
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(_query): Query<DeleteSessionQuery>,
) -> Response {
    if let Err(err) = state.manager.stop(&id).await {
        warn!(session_id = %id, error = %err, "session stop failed");
    }
    state.registry.mark_stopped(&id);
    Json(json!({"status": "stopped", "id": id})).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
