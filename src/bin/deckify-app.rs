use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, Response};
use axum::routing::{get, post};
use clap::Parser;
use futures::StreamExt as _;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::ReaderStream;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use deckify::app::model::{JobEvent, JobOutcome, StartDeckRequest};
use deckify::app::queue::JobQueue;
use deckify::app::runner::JobRunner;
use deckify::auth::{EnvTokenProvider, RefreshingTokenProvider, TokenProvider};
use deckify::error::PipelineError;
use deckify::gemini::GeminiClient;
use deckify::graph::{GraphNotesSource, NotesSource};
use deckify::pipeline::GenerationPreferences;
use deckify::store::DeckStore;

const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Packaged decks and per-job scratch space live under here.
    #[arg(long, default_value = "workspace-app")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 1)]
    max_concurrency: usize,

    /// Static web assets directory (served when it exists).
    #[arg(long, default_value = "web/dist")]
    web_dir: PathBuf,

    /// Notes API base URL.
    #[arg(long, default_value = deckify::graph::DEFAULT_BASE_URL)]
    graph_base_url: String,
}

#[derive(Clone)]
struct AppState {
    source: Arc<dyn NotesSource>,
    deck_store: DeckStore,
    queue: JobQueue,
    runner: Arc<JobRunner>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    deckify::logging::init("info")?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting deckify-app");

    let http = reqwest::Client::new();
    let tokens = token_provider(http.clone());
    let source: Arc<dyn NotesSource> = Arc::new(GraphNotesSource::new(
        http.clone(),
        &args.graph_base_url,
        tokens,
    ));
    let model = Arc::new(GeminiClient::from_env(http).context("configure content model")?);
    let deck_store = DeckStore::new(args.data_dir.join("decks"));
    let runner = Arc::new(JobRunner::new(
        Arc::clone(&source),
        model,
        deck_store.clone(),
        args.data_dir.clone(),
    ));
    let state = AppState {
        source,
        deck_store,
        queue: JobQueue::new(args.max_concurrency),
        runner,
    };

    let mut app = Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/api/notebooks", get(list_notebooks))
        .route("/api/notebooks/:notebook_id/sections", get(list_sections))
        .route("/api/onenote/scan/:section_id", get(list_pages))
        .route("/api/anki/generate", post(generate_deck))
        .route("/api/anki/generate/stream", get(generate_deck_stream))
        .route("/download/:file_name", get(download_deck))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let web_index = args.web_dir.join("index.html");
    if web_index.is_file() {
        let static_files = ServeDir::new(args.web_dir).not_found_service(ServeFile::new(web_index));
        app = app.fallback_service(static_files);
    } else {
        app = app.fallback(|| async {
            Html(
                "<!doctype html><title>deckify</title>\
                 <h1>deckify</h1>\
                 <p>web assets not found. Build the web app into <code>web/dist</code> or use the JSON API.</p>",
            )
        });
    }

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("bind {}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// A refresh token in the environment takes priority; otherwise a static
/// bearer token is read per request.
fn token_provider(http: reqwest::Client) -> Arc<dyn TokenProvider> {
    let refresh_token = std::env::var("DECKIFY_REFRESH_TOKEN")
        .ok()
        .filter(|v| !v.trim().is_empty());
    let client_id = std::env::var("DECKIFY_CLIENT_ID")
        .ok()
        .filter(|v| !v.trim().is_empty());
    if let (Some(refresh_token), Some(client_id)) = (refresh_token, client_id) {
        tracing::info!("using refreshing token provider");
        return RefreshingTokenProvider::new(http, MICROSOFT_TOKEN_URL, client_id, refresh_token);
    }
    Arc::new(EnvTokenProvider::new(deckify::commands::TOKEN_ENV_VAR))
}

fn source_error(err: PipelineError) -> (StatusCode, String) {
    let status = match err {
        PipelineError::AuthRequired { .. } => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, format!("{err:#}"))
}

async fn list_notebooks(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let notebooks = state
        .source
        .list_notebooks()
        .await
        .map_err(source_error)?;
    let value = notebooks
        .into_iter()
        .map(|n| serde_json::json!({ "id": n.id, "displayName": n.display_name }))
        .collect();
    Ok(Json(serde_json::Value::Array(value)))
}

async fn list_sections(
    State(state): State<AppState>,
    Path(notebook_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let sections = state
        .source
        .list_sections(&notebook_id)
        .await
        .map_err(source_error)?;
    let value = sections
        .into_iter()
        .map(|s| serde_json::json!({ "id": s.id, "displayName": s.display_name }))
        .collect();
    Ok(Json(serde_json::Value::Array(value)))
}

async fn list_pages(
    State(state): State<AppState>,
    Path(section_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let pages = state
        .source
        .list_pages(&section_id)
        .await
        .map_err(source_error)?;
    let value = pages
        .into_iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "title": p.title,
                "lastModifiedDateTime": p.last_modified,
            })
        })
        .collect();
    Ok(Json(serde_json::Value::Array(value)))
}

/// Synchronous generation: responds once with the terminal outcome. The
/// streaming route is the better fit for long sections.
async fn generate_deck(
    State(state): State<AppState>,
    Json(request): Json<StartDeckRequest>,
) -> Json<JobOutcome> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = Arc::clone(&state.runner);
    state.queue.spawn(async move {
        runner.run(request, tx).await;
    });

    let mut outcome = None;
    while let Some(event) = rx.recv().await {
        if let JobEvent::Terminal(terminal) = event {
            outcome = Some(terminal);
        }
    }
    Json(outcome.unwrap_or_else(|| {
        JobOutcome::failure("job ended without a terminal event".to_string())
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamParams {
    section_id: String,
    #[serde(default)]
    section_name: String,
    /// Comma-separated page ids; empty means the whole section.
    #[serde(default)]
    page_ids: String,
    /// JSON-encoded `GenerationPreferences`; EventSource requests cannot
    /// carry a body, so preferences ride along as a query value.
    #[serde(default)]
    preferences: Option<String>,
}

async fn generate_deck_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let preferences = params
        .preferences
        .as_deref()
        .and_then(|raw| serde_json::from_str::<GenerationPreferences>(raw).ok())
        .unwrap_or_default();
    let request = StartDeckRequest {
        section_id: params.section_id,
        section_name: params.section_name,
        page_ids: params
            .page_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        preferences,
    };

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = Arc::clone(&state.runner);
    state.queue.spawn(async move {
        runner.run(request, tx).await;
    });

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let frame = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Ok::<_, Infallible>(frame)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn download_deck(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<Response, StatusCode> {
    let file = state
        .deck_store
        .open(&file_name)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let stream = ReaderStream::new(file);
    let body = axum::body::Body::from_stream(stream);

    let mut resp = Response::new(body);
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    Ok(resp)
}
