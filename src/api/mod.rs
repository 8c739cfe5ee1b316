//! 管理REST API
//!
//! endpoint登録・削除、設定の参照とリロードの薄い管理面。
//! コアのセマンティクスには関与せず、レジストリとwatcherへの委譲のみを行う。

use crate::common::{CpError, CpResult};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

/// APIルーターを作成
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/eds/registration",
            axum::routing::post(register_endpoint).delete(unregister_endpoint),
        )
        .route("/eds/endpoints", get(list_endpoints))
        .route(
            "/configurations",
            get(get_configurations).put(reload_configurations),
        )
        .route("/configurations/:group", get(get_configuration))
        .route("/streams", get(get_streams))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RegisterQuery {
    cluster: String,
    address: String,
    port: u32,
    #[serde(default)]
    check_alive: bool,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnregisterQuery {
    cluster: String,
    address: String,
    port: u32,
}

fn validate_endpoint(cluster: &str, address: &str, port: u32) -> CpResult<()> {
    if cluster.is_empty() {
        return Err(CpError::Validation("cluster must not be empty".to_string()));
    }
    if address.is_empty() {
        return Err(CpError::Validation("address must not be empty".to_string()));
    }
    if port == 0 {
        return Err(CpError::Validation("port must be non-zero".to_string()));
    }
    Ok(())
}

/// POST /eds/registration
async fn register_endpoint(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
) -> Result<Response, CpError> {
    validate_endpoint(&query.cluster, &query.address, query.port)?;

    state
        .registry
        .add(
            &query.cluster,
            &query.address,
            query.port,
            query.check_alive,
            query.kind.as_deref(),
        )
        .await;

    Ok(Json(json!({ "status": "accepted" })).into_response())
}

/// DELETE /eds/registration
async fn unregister_endpoint(
    State(state): State<AppState>,
    Query(query): Query<UnregisterQuery>,
) -> Result<Response, CpError> {
    validate_endpoint(&query.cluster, &query.address, query.port)?;

    state
        .registry
        .delete(&query.cluster, &query.address, query.port)
        .await;

    Ok(Json(json!({ "status": "removed" })).into_response())
}

/// GET /eds/endpoints
async fn list_endpoints(State(state): State<AppState>) -> Response {
    Json(state.registry.list().await).into_response()
}

/// GET /configurations
///
/// 既知の全グループの現在のスナップショットをダンプする（診断用）。
async fn get_configurations(State(state): State<AppState>) -> Response {
    let mut groups = serde_json::Map::new();
    for group in state.snapshots.known_groups().await {
        if let Some(snapshot) = state.snapshots.get(&group).await {
            groups.insert(
                group,
                serde_json::to_value(snapshot.as_ref()).unwrap_or_default(),
            );
        }
    }
    let last_modified = state.watcher.last_modified().await;
    Json(json!({
        "last_modified": last_modified,
        "groups": groups,
    }))
    .into_response()
}

/// GET /configurations/:group
///
/// グループの現在のスナップショット（バージョン付き）を返す。未知のグループは404。
async fn get_configuration(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<Response, CpError> {
    let snapshot = state
        .snapshots
        .get(&group)
        .await
        .ok_or_else(|| CpError::GroupNotFound(group))?;
    Ok(Json(snapshot.as_ref()).into_response())
}

/// PUT /configurations
///
/// configディレクトリ全体を再読み込みする。失敗時は既存のスナップショットを
/// 維持したまま500を返す。
async fn reload_configurations(State(state): State<AppState>) -> Result<Response, CpError> {
    if let Err(err) = state.watcher.load_all().await {
        error!(error = %err, "Configuration reload failed");
        return Err(err);
    }
    Ok(Json(json!({ "status": "reloaded" })).into_response())
}

/// GET /streams
async fn get_streams(State(state): State<AppState>) -> Response {
    Json(json!({ "active": state.tracker.active_streams().await })).into_response()
}

/// GET /healthz
async fn healthz() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}
