use std::{
    net::SocketAddr,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::Parser;
use futures::Stream;
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{fs::File, signal, task};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use grabtube::{
    config::{self, RuntimeConfig},
    engine::{MediaEngine, ProgressEvent, ProgressSink, YtDlp},
    formats::QualityTier,
    retrieve::{Retrieval, Retriever},
    security,
};

/// HTTP front end for quality negotiation and media retrieval.
#[derive(Parser)]
struct Args {
    /// Env-file configuration to read instead of the default location.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen host, overriding the configuration file.
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overriding the configuration file.
    #[arg(long)]
    port: Option<u16>,
}

struct AppState<E: MediaEngine> {
    retriever: Arc<Retriever<E>>,
}

impl<E: MediaEngine> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            retriever: Arc::clone(&self.retriever),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<grabtube::Error> for ApiError {
    fn from(err: grabtube::Error) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct CheckRequest {
    url: Option<String>,
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    quality: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    security::ensure_not_root("backend")?;

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let mut cfg: RuntimeConfig = config::load_runtime_config_from(&config_path)?;
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }

    let engine = YtDlp::new(cfg.engine_bin.clone(), cfg.probe_timeout, cfg.fetch_timeout);
    engine
        .preflight()
        .with_context(|| format!("checking extraction engine '{}'", cfg.engine_bin))?;

    let state = AppState {
        retriever: Arc::new(Retriever::new(engine, cfg.scratch_root.clone())),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("backend listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running backend")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", err);
    }
}

fn build_router<E: MediaEngine + 'static>(state: AppState<E>) -> Router {
    Router::new()
        .route("/check", post(check_formats::<E>))
        .route("/download", post(download_media::<E>))
        .with_state(state)
}

/// `POST /check`: probe the source and answer with the tier menu.
async fn check_formats<E: MediaEngine + 'static>(
    State(state): State<AppState<E>>,
    Json(request): Json<CheckRequest>,
) -> ApiResult<Json<Vec<QualityTier>>> {
    let url = request
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?;

    let retriever = state.retriever.clone();
    let menu = task::spawn_blocking(move || retriever.check(&url))
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))??;

    Ok(Json(menu))
}

/// `POST /download`: retrieve the chosen tier and stream it back. The
/// retrieval's scratch directory rides inside the response body stream so it
/// is deleted whether the transfer completes or the client disconnects.
async fn download_media<E: MediaEngine + 'static>(
    State(state): State<AppState<E>>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Response> {
    let url = request
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?;
    let quality = request
        .quality
        .filter(|quality| !quality.is_empty())
        .ok_or_else(|| ApiError::bad_request("No quality provided"))?;

    let retriever = state.retriever.clone();
    let retrieval = task::spawn_blocking(move || {
        let sink = LogSink;
        retriever.retrieve(&url, &quality, Some(&sink))
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))??;

    stream_retrieval(retrieval).await
}

/// Streams the retrieved file as an attachment with an exact length.
async fn stream_retrieval(retrieval: Retrieval) -> ApiResult<Response> {
    let file = File::open(retrieval.file_path())
        .await
        .map_err(|err| ApiError::internal(format!("opening retrieved file: {err}")))?;

    let mime = MimeGuess::from_path(retrieval.file_path()).first_or_octet_stream();
    let disposition = format!("attachment; filename=\"{}\"", retrieval.file_name());
    let length = retrieval.size_bytes();

    let stream = ScratchStream {
        inner: ReaderStream::new(file),
        _retrieval: retrieval,
    };
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = mime.to_string().parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = disposition.parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::CONTENT_LENGTH, length.into());

    Ok(response)
}

/// File stream that owns the retrieval. Dropping the stream (transfer done,
/// handler error, or client gone) drops the retrieval and with it the
/// scratch directory.
struct ScratchStream {
    inner: ReaderStream<File>,
    _retrieval: Retrieval,
}

impl Stream for ScratchStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Progress sink used by the backend: events only reach the logs.
struct LogSink;

impl ProgressSink for LogSink {
    fn receive(&self, event: ProgressEvent) {
        debug!(
            status = ?event.status,
            downloaded_bytes = event.downloaded_bytes,
            total_bytes = ?event.total_bytes,
            "download progress"
        );
    }
}
