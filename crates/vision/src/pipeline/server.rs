//! Actix Web server exposing results, the annotated preview, uploads, and
//! source switching.
//!
//! The server runs on a dedicated thread to keep the processing loop free from
//! Actix runtime concerns. Handlers only ever talk to the pipeline through the
//! [`ResetCoordinator`] and the published frame buffers, so none of them can
//! block the loop.

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, PoisonError},
    time::Duration,
};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    http::{Method, header},
    web::{self, Bytes},
};
use anyhow::{Context, Result, bail};
use async_stream::stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, to_string};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::pipeline::{
    coordinator::{EngineSnapshot, ResetCoordinator},
    data::{FrameHistory, FramePacket, FrameReport, SharedFrame},
    telemetry,
    watchdog::{PipelineHealth, WatchdogState},
};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Poll ticks without a new frame before a keep-alive comment is sent.
const STREAM_KEEPALIVE_TICKS: u32 = 100;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) coordinator: ResetCoordinator,
    pub(crate) latest: SharedFrame,
    pub(crate) history: FrameHistory,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) watchdog: Arc<WatchdogState>,
    pub(crate) upload_dir: PathBuf,
    pub(crate) allowed_origins: Vec<String>,
    pub(crate) metrics: PrometheusHandle,
}

#[derive(Default)]
/// Handle for the HTTP server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

#[derive(Deserialize)]
struct FrameQuery {
    frame: Option<u64>,
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

#[derive(Deserialize)]
struct SourceRequest {
    source: String,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    engine: EngineSnapshot,
    stalled_stage: Option<&'static str>,
    halted: Option<String>,
}

/// Register every route on `cfg`.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_UPLOAD_BYTES))
        .route("/", web::get().to(index_route))
        .route("/upload", web::post().to(upload_handler))
        .route("/source", web::post().to(source_handler))
        .route("/report", web::get().to(report_handler))
        .route("/stream", web::get().to(stream_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .default_service(web::route().to(fallback_handler));
}

/// Bind the server on `host:port` and run it on its own thread.
pub(crate) fn spawn_preview_server(
    state: ServerState,
    host: &str,
    port: u16,
) -> Result<PreviewServer> {
    let state = web::Data::new(state);
    let addr = (host.to_string(), port);
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = telemetry::spawn_thread("traffic-http", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || {
                App::new().app_data(state.clone()).configure(configure)
            })
            .bind(addr)
            {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return Ok(());
                }
            };
            let _ = ready_tx.send(Ok(()));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("HTTP server listening on http://{host}:{port}");
            Ok(PreviewServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            bail!("Failed to bind HTTP server on {host}:{port}: {err}")
        }
        Err(_) => {
            let _ = handle.join();
            bail!("HTTP server thread exited before binding")
        }
    }
}

/// Attach CORS headers when the request origin is allow-listed.
fn with_cors(req: &HttpRequest, state: &ServerState, mut response: HttpResponse) -> HttpResponse {
    let Some(origin) = req.headers().get(header::ORIGIN) else {
        return response;
    };
    let allowed = origin
        .to_str()
        .is_ok_and(|origin| state.allowed_origins.iter().any(|allowed| allowed == origin));
    if allowed {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            header::HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            header::HeaderValue::from_static("Content-Type"),
        );
        headers.insert(header::VARY, header::HeaderValue::from_static("Origin"));
    }
    response
}

fn error_body(message: &str) -> serde_json::Value {
    json!({ "error": message })
}

/// Reduce a client supplied file name to a safe single path component.
pub(crate) fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']);
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Fetch the latest published packet.
fn latest_frame(shared: &SharedFrame) -> Option<FramePacket> {
    shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn latest_report(shared: &SharedFrame) -> Option<FrameReport> {
    shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|packet| packet.report.clone())
}

/// Retrieve a buffered frame by sequence number.
fn history_frame(history: &FrameHistory, frame_number: u64) -> Option<FramePacket> {
    history
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .find(|packet| packet.report.frame_number == frame_number)
        .cloned()
}

async fn index_route(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    with_cors(
        &req,
        &state,
        HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body("AI Traffic Backend is Running!"),
    )
}

/// Save the request body under the upload directory and switch to it.
async fn upload_handler(
    req: HttpRequest,
    query: web::Query<UploadQuery>,
    body: Bytes,
    state: web::Data<ServerState>,
) -> HttpResponse {
    if body.is_empty() {
        return with_cors(
            &req,
            &state,
            HttpResponse::BadRequest().json(error_body("No file uploaded")),
        );
    }
    let Some(filename) = query.filename.as_deref().and_then(sanitize_filename) else {
        return with_cors(
            &req,
            &state,
            HttpResponse::BadRequest().json(error_body("No file selected")),
        );
    };

    let path = state.upload_dir.join(&filename);
    let size = body.len();
    match save_upload(state.upload_dir.clone(), path.clone(), body).await {
        Ok(()) => {
            let source = path.to_string_lossy().into_owned();
            info!("saved upload {filename} ({size} bytes) to {source}");
            let ticket = state.coordinator.request_switch(source.clone());
            with_cors(
                &req,
                &state,
                HttpResponse::Ok().json(json!({
                    "message": "Upload successful",
                    "generation": ticket.generation,
                    "source": source,
                })),
            )
        }
        Err(err) => {
            error!("failed to store upload {}: {err}", path.display());
            with_cors(
                &req,
                &state,
                HttpResponse::InternalServerError().json(error_body("Failed to store upload")),
            )
        }
    }
}

/// Write the upload next to its destination and rename it into place, so a
/// loop still reading a file of the same name never sees a partial write.
async fn save_upload(dir: PathBuf, path: PathBuf, body: Bytes) -> io::Result<()> {
    web::block(move || -> io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
        staged.write_all(&body)?;
        staged.persist(&path)?;
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

/// Switch to a source that already exists on the server.
async fn source_handler(
    req: HttpRequest,
    payload: web::Json<SourceRequest>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let source = payload.into_inner().source.trim().to_string();
    if source.is_empty() {
        return with_cors(
            &req,
            &state,
            HttpResponse::BadRequest().json(error_body("No source given")),
        );
    }
    let ticket = state.coordinator.request_switch(source.clone());
    with_cors(
        &req,
        &state,
        HttpResponse::Accepted().json(json!({
            "generation": ticket.generation,
            "source": source,
        })),
    )
}

async fn report_handler(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    let response = match latest_report(&state.latest) {
        Some(report) => HttpResponse::Ok().json(report),
        None => HttpResponse::NoContent().finish(),
    };
    with_cors(&req, &state, response)
}

/// Stream result records as Server-Sent Events, one `video_data` event per
/// published frame.
async fn stream_handler(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    let source = state.clone();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        let mut interval = actix_web::rt::time::interval(STREAM_POLL_INTERVAL);
        let mut last_sent: Option<u64> = None;
        let mut idle_ticks: u32 = 0;
        loop {
            interval.tick().await;
            match latest_report(&source.latest) {
                Some(report) if last_sent != Some(report.frame_number) => {
                    idle_ticks = 0;
                    last_sent = Some(report.frame_number);
                    match to_string(&report) {
                        Ok(json) => {
                            let chunk = format!(
                                "id: {}\nevent: video_data\ndata: {json}\n\n",
                                report.frame_number
                            );
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                        }
                        Err(err) => {
                            let chunk = format!("event: error\ndata: {err}\n\n");
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                        }
                    }
                }
                _ => {
                    idle_ticks += 1;
                    if idle_ticks >= STREAM_KEEPALIVE_TICKS {
                        idle_ticks = 0;
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                    }
                }
            }
        }
    };

    let response = HttpResponse::Ok()
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream);
    with_cors(&req, &state, response)
}

/// Return the latest annotated JPEG, or a buffered one by sequence number.
async fn frame_handler(
    req: HttpRequest,
    query: web::Query<FrameQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let jpeg_response = |jpeg: Vec<u8>| HttpResponse::Ok().content_type("image/jpeg").body(jpeg);

    if let Some(requested) = query.frame {
        if let Some(jpeg) = history_frame(&state.history, requested).and_then(|p| p.jpeg) {
            return with_cors(&req, &state, jpeg_response(jpeg));
        }
    }

    let response = match latest_frame(&state.latest) {
        Some(FramePacket {
            report,
            jpeg: Some(jpeg),
        }) => {
            let mut response = jpeg_response(jpeg);
            if let Some(requested) = query.frame {
                let warning = format!(
                    "299 traffic \"frame {requested} not buffered; returning latest {}\"",
                    report.frame_number
                );
                if let Ok(value) = header::HeaderValue::from_str(&warning) {
                    response.headers_mut().insert(header::WARNING, value);
                }
            }
            response
        }
        _ => HttpResponse::NoContent().finish(),
    };
    with_cors(&req, &state, response)
}

async fn status_handler(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    let status = StatusResponse {
        engine: state.coordinator.snapshot(),
        stalled_stage: state.watchdog.stalled().map(|component| component.label()),
        halted: state.health.halted(),
    };
    with_cors(&req, &state, HttpResponse::Ok().json(status))
}

async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.render())
}

/// Answer CORS preflights; everything else is unknown.
async fn fallback_handler(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return with_cors(&req, &state, HttpResponse::NoContent().finish());
    }
    warn!("unknown route {} {}", req.method(), req.path());
    HttpResponse::NotFound().json(error_body("Not found"))
}
