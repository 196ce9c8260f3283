use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;

use crate::catalog::{EntityStore, StoreError};
use crate::context::{collect_status, AppContext, Status};
use crate::index::{Modality, ServingIndexes, SnapshotError};
use crate::search::{AdResult, Query, QueryRouter, SearchError, SearchMode};

/// Upload limit for base64 encoded query images.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

pub(crate) struct SharedState {
    router: QueryRouter,
    store: EntityStore,
    indexes: Arc<ServingIndexes>,
}

impl SharedState {
    pub(crate) fn new(router: QueryRouter, store: EntityStore) -> Self {
        let indexes = router.indexes().clone();
        Self {
            router,
            store,
            indexes,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

pub(crate) fn app(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/search", post(search))
        .route("/api/status", get(status))
        .route("/api/indexes/reload", post(reload))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

pub async fn start_daemon(ctx: AppContext) -> anyhow::Result<()> {
    let listen = ctx.config.server.listen.clone();
    let state = Arc::new(SharedState::new(ctx.router(), ctx.store.clone()));

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    log::info!("listening on {listen}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug)]
struct HttpError(ApiError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            ApiError::BadRequest(_) | ApiError::Search(SearchError::ModeMismatch { .. }) => {
                StatusCode::BAD_REQUEST
            }
            _ => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<ApiError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn bad_request(message: impl Into<String>) -> HttpError {
    HttpError(ApiError::BadRequest(message.into()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub mode: SearchMode,

    /// Query text for text-to-* modes
    pub text: Option<String>,

    /// Base64 encoded image for image-to-* modes
    pub image: Option<String>,

    pub top_k: Option<usize>,
}

/// File extension of a supported image format, judged by its magic bytes.
pub(crate) fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("jpg"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("webp"),
        _ => None,
    }
}

/// Decode an uploaded image into a temp file that lives as long as the handle.
fn write_query_image(encoded: &str) -> Result<tempfile::NamedTempFile, HttpError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|err| bad_request(format!("image is not valid base64: {err}")))?;

    let extension =
        sniff_extension(&bytes).ok_or_else(|| bad_request("unsupported image format"))?;

    let mut file = tempfile::Builder::new()
        .prefix("adsearch-query-")
        .suffix(&format!(".{extension}"))
        .tempfile()?;
    file.write_all(&bytes)?;
    file.flush()?;

    Ok(file)
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<Vec<AdResult>>, HttpError> {
    log::debug!(
        "search: mode={}, top_k={:?}, text={:?}, image={} bytes",
        payload.mode,
        payload.top_k,
        payload.text,
        payload.image.as_ref().map_or(0, |image| image.len())
    );

    let results = match payload.mode.query_modality() {
        Modality::Text => {
            let text = payload
                .text
                .ok_or_else(|| bad_request(format!("{} requires `text`", payload.mode)))?;

            state
                .router
                .search(payload.mode, Query::Text(text), payload.top_k)
                .await?
        }
        Modality::Image => {
            let encoded = payload
                .image
                .ok_or_else(|| bad_request(format!("{} requires `image`", payload.mode)))?;
            let file = write_query_image(&encoded)?;

            state
                .router
                .search(
                    payload.mode,
                    Query::Image(file.path().to_path_buf()),
                    payload.top_k,
                )
                .await?
        }
    };

    Ok(Json(results))
}

async fn status(State(state): State<Arc<SharedState>>) -> Result<Json<Status>, HttpError> {
    Ok(Json(collect_status(&state.store, &state.indexes).await?))
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadResponse {
    pub image_rows: usize,
    pub text_rows: usize,
}

async fn reload(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<ReloadResponse>, HttpError> {
    let indexes = state.indexes.clone();

    tokio::task::spawn_blocking(move || indexes.reload())
        .await
        .map_err(|err| HttpError(ApiError::Internal(format!("reload task failed: {err}"))))??;

    Ok(Json(ReloadResponse {
        image_rows: state.indexes.get(Modality::Image).len(),
        text_rows: state.indexes.get(Modality::Text).len(),
    }))
}
