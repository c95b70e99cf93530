//! HTTP API.
//!
//! Exposes search, index info, source browsing and the source lifecycle as
//! JSON endpoints, plus the two agent tools (`search-docs`,
//! `get-index-info`) under `/tools`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/index/info` | Manifest |
//! | `POST` | `/index/repair` | Recompute the manifest from chunk storage |
//! | `POST` | `/search` | Semantic search |
//! | `GET`  | `/sources/{name}/pages` | Units of a source with their chunks |
//! | `POST` | `/sources/delete` | Remove a source |
//! | `POST` | `/sources/docs` | Index crawled documentation pages |
//! | `POST` | `/sources/repo` | Index a local repository |
//! | `POST` | `/sources/docs/stream` | As `/sources/docs`, streaming progress (SSE) |
//! | `POST` | `/sources/repo/stream` | As `/sources/repo`, streaming progress (SSE) |
//! | `GET`  | `/tools/list` | Tool definitions with parameter schemas |
//! | `POST` | `/tools/{name}` | Call a tool |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `conflict`, `busy`,
//! `cancelled`, `model_mismatch`, `chunking_mismatch` (409), `provider_error` (502),
//! `indexing_failed`, `store_corrupted`, `internal` (500).
//!
//! # Progress streams
//!
//! The `/stream` variants answer with `text/event-stream`. Each event is
//! named after its kind (`start`, `progress`, `complete`, `error`) and
//! carries the JSON-encoded progress event. Closing the stream cancels
//! the add, and the index is left as it was.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use docdex_core::error::classify;
use docdex_core::models::{IndexResult, Manifest, UnitPage};
use docdex_core::search::{SearchRequest, SearchResponse};
use docdex_core::store::ReconcileReport;
use docdex_core::IndexError;

use crate::config::Config;
use crate::crawl::{CrawlOutput, CrawlPage};
use crate::index::DocIndex;
use crate::lifecycle::AddOptions;
use crate::progress::{ChannelProgress, NoProgress, ProgressEvent};
use crate::render::{render_index_info, render_search};

#[derive(Clone)]
struct AppState {
    index: Arc<DocIndex>,
    default_results: i64,
}

/// Open the index and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> Result<()> {
    let index = Arc::new(DocIndex::open(config).await?);
    let bind_addr = config.server.bind.clone();
    let app = router(index.clone(), config.retrieval.default_results);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("docdex server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    index.close().await;
    Ok(())
}

pub fn router(index: Arc<DocIndex>, default_results: i64) -> Router {
    let state = AppState {
        index,
        default_results,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/index/info", get(handle_info))
        .route("/index/repair", post(handle_repair))
        .route("/search", post(handle_search))
        .route("/sources/{name}/pages", get(handle_pages))
        .route("/sources/delete", post(handle_delete))
        .route("/sources/docs", post(handle_add_docs))
        .route("/sources/repo", post(handle_add_repo))
        .route("/sources/docs/stream", post(handle_add_docs_stream))
        .route("/sources/repo/stream", post(handle_add_repo_stream))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn status_for(err: &IndexError) -> StatusCode {
    match err {
        IndexError::Validation(_) => StatusCode::BAD_REQUEST,
        IndexError::NotFound(_) => StatusCode::NOT_FOUND,
        IndexError::Conflict(_)
        | IndexError::Busy(_)
        | IndexError::Cancelled
        | IndexError::ModelMismatch { .. }
        | IndexError::ChunkingMismatch { .. } => StatusCode::CONFLICT,
        IndexError::TransientProvider(_) | IndexError::Provider(_) => StatusCode::BAD_GATEWAY,
        IndexError::Indexing { .. } | IndexError::StoreCorruption(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        match classify(&err) {
            Some(e) => AppError {
                status: status_for(e),
                code: e.code().to_string(),
                message,
            },
            None => {
                warn!(error = %message, "internal error");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal".to_string(),
                    message,
                }
            }
        }
    }
}

/// Unwrap a JSON body, reporting malformed input in the error contract.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| bad_request(e.body_text()))
}

fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|e| bad_request(format!("invalid parameters: {}", e)))
}

// ============ Request bodies ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    query: String,
    #[serde(default, alias = "max_results")]
    max_results: Option<i64>,
    #[serde(default, alias = "source")]
    source_filter: Option<String>,
}

impl SearchBody {
    /// Fill in the configured default and treat a blank filter as none.
    fn into_request(self, default_results: i64) -> SearchRequest {
        SearchRequest {
            query: self.query,
            max_results: self.max_results.unwrap_or(default_results),
            source_filter: self.source_filter.filter(|s| !s.trim().is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    source_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    success: bool,
    chunks_removed: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddDocsBody {
    #[serde(alias = "source")]
    url: String,
    #[serde(default)]
    source_name: Option<String>,
    #[serde(default)]
    max_pages: Option<usize>,
    #[serde(default)]
    replace: bool,
    pages: Vec<CrawlPage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddRepoBody {
    repo_path: PathBuf,
    source_name: String,
    #[serde(default)]
    replace: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PagesResponse {
    source_name: String,
    pages: Vec<UnitPage>,
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_info(State(state): State<AppState>) -> Result<Json<Manifest>, AppError> {
    Ok(Json(state.index.manifest().await?))
}

async fn handle_repair(State(state): State<AppState>) -> Result<Json<ReconcileReport>, AppError> {
    Ok(Json(state.index.manager().repair().await?))
}

async fn handle_search(
    State(state): State<AppState>,
    payload: Result<Json<SearchBody>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let request = body(payload)?.into_request(state.default_results);
    Ok(Json(state.index.search(&request).await?))
}

async fn handle_pages(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PagesResponse>, AppError> {
    let pages = state.index.pages(&name).await?;
    Ok(Json(PagesResponse {
        source_name: name,
        pages,
    }))
}

async fn handle_delete(
    State(state): State<AppState>,
    payload: Result<Json<DeleteBody>, JsonRejection>,
) -> Result<Json<DeleteResponse>, AppError> {
    let req = body(payload)?;
    let chunks_removed = state.index.manager().remove_source(&req.source_name).await?;
    Ok(Json(DeleteResponse {
        success: true,
        chunks_removed,
    }))
}

impl AddDocsBody {
    fn split(self) -> (CrawlOutput, Option<String>, Option<usize>, AddOptions) {
        (
            CrawlOutput {
                source: self.url,
                pages: self.pages,
            },
            self.source_name.filter(|s| !s.trim().is_empty()),
            self.max_pages,
            AddOptions {
                replace: self.replace,
            },
        )
    }
}

async fn handle_add_docs(
    State(state): State<AppState>,
    payload: Result<Json<AddDocsBody>, JsonRejection>,
) -> Result<Json<IndexResult>, AppError> {
    let (crawl, name, max_pages, options) = body(payload)?.split();
    let result = state
        .index
        .manager()
        .add_documentation(
            crawl,
            name.as_deref(),
            max_pages,
            options,
            &NoProgress,
            &CancellationToken::new(),
        )
        .await?;
    Ok(Json(result))
}

async fn handle_add_repo(
    State(state): State<AppState>,
    payload: Result<Json<AddRepoBody>, JsonRejection>,
) -> Result<Json<IndexResult>, AppError> {
    let req = body(payload)?;
    let result = state
        .index
        .manager()
        .add_repository(
            &req.source_name,
            &req.repo_path,
            AddOptions {
                replace: req.replace,
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await?;
    Ok(Json(result))
}

async fn handle_add_docs_stream(
    State(state): State<AppState>,
    payload: Result<Json<AddDocsBody>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let (crawl, name, max_pages, options) = body(payload)?.split();
    let index = state.index.clone();
    Ok(progress_stream(move |progress, cancel| async move {
        index
            .manager()
            .add_documentation(crawl, name.as_deref(), max_pages, options, &progress, &cancel)
            .await
    }))
}

async fn handle_add_repo_stream(
    State(state): State<AppState>,
    payload: Result<Json<AddRepoBody>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let req = body(payload)?;
    let index = state.index.clone();
    Ok(progress_stream(move |progress, cancel| async move {
        index
            .manager()
            .add_repository(
                &req.source_name,
                &req.repo_path,
                AddOptions {
                    replace: req.replace,
                },
                &progress,
                &cancel,
            )
            .await
    }))
}

/// Run an add in the background and stream its progress events.
///
/// The add is cancelled if the client goes away before it finishes.
fn progress_stream<F, Fut>(op: F) -> Sse<impl Stream<Item = Result<Event, axum::Error>>>
where
    F: FnOnce(ChannelProgress, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<IndexResult>> + Send + 'static,
{
    let (rx, _task) = spawn_progress(op);
    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default().event(event.kind.as_str()).json_data(&event);
        Some((sse, rx))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Spawn `op` with a channel reporter. Dropping the returned receiver
/// cancels the add; the handle resolves once it has unwound.
fn spawn_progress<F, Fut>(op: F) -> (mpsc::UnboundedReceiver<ProgressEvent>, JoinHandle<()>)
where
    F: FnOnce(ChannelProgress, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<IndexResult>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let watch = tx.clone();
    let cancel = CancellationToken::new();

    let task = tokio::spawn(async move {
        let add = op(ChannelProgress::new(tx), cancel.clone());
        tokio::pin!(add);
        tokio::select! {
            _ = &mut add => return,
            _ = watch.closed() => {
                info!("progress stream closed by client; cancelling");
                cancel.cancel();
            }
        }
        let _ = add.await;
    });
    (rx, task)
}

// ============ Tools ============

#[derive(Serialize)]
struct ToolInfo {
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

fn tool_definitions(default_results: i64) -> Vec<ToolInfo> {
    vec![
        ToolInfo {
            name: "search-docs",
            description: "Semantic search over the indexed documentation and repositories. \
                          Returns the most relevant chunks with their source and location.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural language search query"
                    },
                    "max_results": {
                        "type": "integer",
                        "minimum": docdex_core::search::MIN_RESULTS,
                        "maximum": docdex_core::search::MAX_RESULTS,
                        "default": default_results
                    },
                    "source": {
                        "type": "string",
                        "description": "Only search this source. Leave empty to search all."
                    }
                },
                "required": ["query"]
            }),
        },
        ToolInfo {
            name: "get-index-info",
            description: "Describe the index: sources, page and chunk counts, embedding model \
                          and last update time.",
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        },
    ]
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: tool_definitions(state.default_results),
    })
}

async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let params = body(payload)?;
    let result = match name.as_str() {
        "search-docs" => {
            let request = from_value::<SearchBody>(params)?.into_request(state.default_results);
            let response = state.index.search(&request).await?;
            serde_json::json!({
                "text": render_search(&response, request.source_filter.as_deref()),
                "response": response,
            })
        }
        "get-index-info" => {
            let manifest = state.index.manifest().await?;
            serde_json::json!({
                "text": render_index_info(&manifest),
                "manifest": manifest,
            })
        }
        _ => return Err(not_found(format!("no tool registered with name: {}", name))),
    };
    Ok(Json(serde_json::json!({ "result": result })))
}
