use crate::config::Config;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use cidmark_core::{CidmarkError, ContentId, Identity, Result, SyncController};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub controller: Arc<SyncController>,
    pub identity: Identity,
    pub config: Config,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
struct ApiError {
    message: String,
    step: &'static str,
    retryable: bool,
    orphaned_cid: Option<String>,
}

#[derive(Debug, Serialize)]
struct PointerResponse {
    identity: String,
    cid: Option<String>,
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutFileQuery {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    cid: String,
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/pointer", get(get_pointer))
        .route("/pointer/retry", post(retry_pointer))
        .route("/file", put(put_file))
        .route("/content/:cid", get(get_content))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: Arc<ServerState>) -> Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl+C, shutting down");
        })
        .await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let snapshot = state.controller.snapshot().await;
    let store = state.controller.store().handle().cloned();

    let response = serde_json::json!({
        "identity": state.identity.as_str(),
        "phase": snapshot.phase,
        "store_ready": snapshot.store_ready,
        "store": store,
    });

    (StatusCode::OK, Json(response))
}

async fn get_pointer(State(state): State<Arc<ServerState>>) -> Response {
    let snapshot = state.controller.snapshot().await;
    let pointer = snapshot.current_pointer;

    ok(PointerResponse {
        identity: state.identity.to_string(),
        link: pointer.as_ref().map(|cid| state.config.link_for(cid)),
        cid: pointer.map(String::from),
    })
}

async fn put_file(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PutFileQuery>,
    body: Bytes,
) -> Response {
    let name = query
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "upload".to_string());

    match state.controller.publish(&state.identity, body, &name).await {
        Ok(cid) => ok(pointer_response(&state, cid)),
        Err(error) => failure(error),
    }
}

async fn retry_pointer(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RetryRequest>,
) -> Response {
    let cid = match ContentId::new(request.cid) {
        Ok(cid) => cid,
        Err(error) => return failure(error),
    };

    match state.controller.commit_pointer(&state.identity, cid).await {
        Ok(cid) => ok(pointer_response(&state, cid)),
        Err(error) => failure(error),
    }
}

async fn get_content(State(state): State<Arc<ServerState>>, Path(cid): Path<String>) -> Response {
    let cid = match ContentId::new(cid) {
        Ok(cid) => cid,
        Err(error) => return failure(error),
    };

    match state.controller.store().get(&cid).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(error) => failure(error),
    }
}

fn pointer_response(state: &ServerState, cid: ContentId) -> PointerResponse {
    PointerResponse {
        identity: state.identity.to_string(),
        link: Some(state.config.link_for(&cid)),
        cid: Some(cid.into()),
    }
}

fn ok<T: Serialize>(data: T) -> Response {
    let resp = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    (StatusCode::OK, Json(resp)).into_response()
}

fn failure(error: CidmarkError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!("request failed: {}", error);
    } else {
        tracing::warn!("request rejected: {}", error);
    }

    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(ApiError {
            message: error.to_string(),
            step: error.step(),
            retryable: error.is_retryable(),
            orphaned_cid: error.orphaned_cid().map(|cid| cid.to_string()),
        }),
    };
    (status, Json(resp)).into_response()
}

fn status_for(error: &CidmarkError) -> StatusCode {
    match error {
        CidmarkError::NotReady(_) | CidmarkError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CidmarkError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        CidmarkError::ContentNotFound(_) => StatusCode::NOT_FOUND,
        CidmarkError::InvalidValue(_) => StatusCode::BAD_REQUEST,
        CidmarkError::InvalidIdentity(_) | CidmarkError::WriteRejected(_) => StatusCode::FORBIDDEN,
        CidmarkError::LedgerQueryError(_)
        | CidmarkError::LedgerWriteError(_)
        | CidmarkError::PublishPartiallyFailed { .. } => StatusCode::BAD_GATEWAY,
        CidmarkError::Cancelled { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
