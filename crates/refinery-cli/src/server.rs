use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use refinery_contracts::events::{EventSink, EventWriter, SinkClosed, StreamFrame};
use refinery_engine::{EvidenceSet, IntakeError, Pipeline, RefineError, UploadedFile};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::page;

/// Multipart field carrying the uploaded images.
pub const UPLOAD_FIELD: &str = "files";

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
}

pub fn router(pipeline: Pipeline, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/processar", post(process_form))
        .route("/api/process", post(process_api))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(AppState { pipeline })
}

pub async fn serve(addr: SocketAddr, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server stopped unexpectedly")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

#[derive(Debug, Deserialize)]
struct IndexQuery {
    error: Option<String>,
}

async fn index(Query(query): Query<IndexQuery>) -> Html<String> {
    Html(page::index(query.error.as_deref()))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "provider": state.pipeline.provider(),
        "model": state.pipeline.model(),
    }))
}

async fn process_form(State(state): State<AppState>, multipart: Multipart) -> Response {
    let evidence = match prepare(&state, multipart).await {
        Ok(evidence) => evidence,
        Err(rejection) => return flash_redirect(&rejection.to_string()),
    };
    let (run_id, frames) = spawn_run(state.pipeline, evidence, true);

    let head = stream::once(async move { page::stream_head(&run_id) });
    let frames = frames.map(|frame| page::frame_script(&frame));
    let tail = stream::once(async { page::stream_tail() });
    let body = head.chain(frames).chain(tail).map(Ok::<String, Infallible>);
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

async fn process_api(State(state): State<AppState>, multipart: Multipart) -> Response {
    let evidence = match prepare(&state, multipart).await {
        Ok(evidence) => evidence,
        Err(rejection) => return rejection.into_json_response(),
    };
    let (_run_id, frames) = spawn_run(state.pipeline, evidence, false);

    let body = frames.filter_map(|frame| async move {
        match frame.to_json_line() {
            Ok(line) => Some(Ok::<String, Infallible>(line)),
            Err(err) => {
                warn!(error = %err, "dropping unserializable frame");
                None
            }
        }
    });
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// Why a submission never reached the refinement loop.
#[derive(Debug)]
enum Rejection {
    Intake(IntakeError),
    Upload { status: StatusCode, message: String },
    Internal(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Intake(IntakeError::NoInput) => write!(f, "No image selected."),
            Rejection::Intake(err) => write!(f, "Image processing failed: {err}"),
            Rejection::Upload { message, .. } => write!(f, "Upload failed: {message}"),
            Rejection::Internal(message) => write!(f, "Internal error: {message}"),
        }
    }
}

impl Rejection {
    fn into_json_response(self) -> Response {
        let (status, kind) = match &self {
            Rejection::Intake(IntakeError::NoInput) => (StatusCode::BAD_REQUEST, "no_input"),
            Rejection::Intake(IntakeError::Decode { .. }) => (StatusCode::BAD_REQUEST, "decode"),
            Rejection::Upload { status, .. } => (*status, "upload"),
            Rejection::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        (status, Json(json!({ "error": kind, "message": self.to_string() }))).into_response()
    }
}

async fn prepare(state: &AppState, multipart: Multipart) -> Result<EvidenceSet, Rejection> {
    let files = read_uploads(multipart).await?;
    let count = files.len();
    let pipeline = state.pipeline.clone();
    let evidence = tokio::task::spawn_blocking(move || pipeline.intake(files))
        .await
        .map_err(|err| Rejection::Internal(err.to_string()))?;
    match evidence {
        Ok(evidence) => Ok(evidence),
        Err(err) => {
            info!(parts = count, error = %err, "submission rejected");
            Err(Rejection::Intake(err))
        }
    }
}

async fn read_uploads(mut multipart: Multipart) -> Result<Vec<UploadedFile>, Rejection> {
    let upload_error = |err: axum::extract::multipart::MultipartError| Rejection::Upload {
        status: err.status(),
        message: err.body_text(),
    };
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(upload_error)?;
        files.push(UploadedFile::new(filename, bytes.to_vec()));
    }
    Ok(files)
}

fn flash_redirect(message: &str) -> Response {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("error", message)
        .finish();
    Redirect::to(&format!("/?{query}")).into_response()
}

/// Forwards frames to the response body; a dropped body closes the sink.
struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamFrame>,
}

impl EventSink for ChannelSink {
    fn deliver(&self, frame: StreamFrame) -> Result<(), SinkClosed> {
        self.tx.send(frame).map_err(|_| SinkClosed)
    }
}

fn spawn_run(
    pipeline: Pipeline,
    evidence: EvidenceSet,
    include_thumbnails: bool,
) -> (String, UnboundedReceiverStream<StreamFrame>) {
    let run_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let events = EventWriter::new(Arc::new(ChannelSink { tx }), run_id.clone());
    let span = info_span!("request", request_id = %run_id);

    let run = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        if let Err(RefineError::Disconnected(stage)) =
            pipeline.execute(&evidence, &events, include_thumbnails)
        {
            info!(stage = %stage, "client disconnected; run stopped");
        }
    });
    tokio::spawn(async move {
        if let Err(err) = run.await {
            warn!(error = %err, "processing task panicked");
        }
    });
    (run_id, UnboundedReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use refinery_contracts::events::StreamFrame;
    use refinery_engine::dryrun::DryrunGateway;
    use refinery_engine::pipeline::{Pipeline, PipelineSettings};
    use refinery_engine::prompts::PromptSet;
    use refinery_engine::{GatewayError, InlineImage, ModelGateway, ModelReply};
    use tower::ServiceExt;

    use super::router;

    const BOUNDARY: &str = "refinery-test-boundary";

    struct CountingGateway {
        calls: Arc<AtomicUsize>,
    }

    impl ModelGateway for CountingGateway {
        fn name(&self) -> &str {
            "counting"
        }

        fn model(&self) -> &str {
            "counting-1"
        }

        fn analyze(&self, _prompt: &str, _images: &[InlineImage]) -> Result<ModelReply, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelReply::from_text("SCORE: 100".to_string(), None))
        }
    }

    fn dryrun_pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(DryrunGateway::new("")),
            PromptSet::default(),
            PipelineSettings {
                stream_synthesis: true,
                ..PipelineSettings::default()
            },
        )
    }

    fn png() -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (filename, bytes) in parts {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(uri: &str, parts: &[(&str, &[u8])]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    #[tokio::test]
    async fn empty_form_redirects_without_model_calls() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            Arc::new(CountingGateway {
                calls: calls.clone(),
            }),
            PromptSet::default(),
            PipelineSettings::default(),
        );
        let app = router(pipeline, 1024 * 1024);

        let response = app.oneshot(upload("/processar", &[("", &b""[..])])).await?;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(location.starts_with("/?error="));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_upload_redirects_with_filename() -> anyhow::Result<()> {
        let app = router(dryrun_pipeline(), 1024 * 1024);
        let response = app
            .oneshot(upload("/processar", &[("notes.txt", &b"plain text"[..])]))
            .await?;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert!(location.contains("notes.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn api_streams_ndjson_frames_to_a_report() -> anyhow::Result<()> {
        let app = router(dryrun_pipeline(), 1024 * 1024);
        let image = png();
        let response = app
            .oneshot(upload("/api/process", &[("a.png", image.as_slice()), ("b.png", image.as_slice())]))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-ndjson"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let frames = std::str::from_utf8(&body)?
            .lines()
            .map(serde_json::from_str::<StreamFrame>)
            .collect::<Result<Vec<_>, _>>()?;
        assert!(matches!(frames.first(), Some(StreamFrame::Evidence { items, .. }) if items.len() == 2));
        let seqs: Vec<u64> = frames
            .iter()
            .filter_map(|frame| frame.as_progress().map(|event| event.seq))
            .collect();
        assert!(seqs.windows(2).all(|pair| pair[1] == pair[0] + 1));
        match frames.last() {
            Some(StreamFrame::Report(summary)) => {
                assert_eq!(summary.attempts_used, 3);
                assert_eq!(summary.final_score, 95);
            }
            other => panic!("expected report frame last, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn api_rejects_empty_submission_with_json() -> anyhow::Result<()> {
        let app = router(dryrun_pipeline(), 1024 * 1024);
        let response = app.oneshot(upload("/api/process", &[])).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["error"], "no_input");
        Ok(())
    }

    #[tokio::test]
    async fn html_stream_ends_with_report_script() -> anyhow::Result<()> {
        let app = router(dryrun_pipeline(), 1024 * 1024);
        let image = png();
        let response = app.oneshot(upload("/processar", &[("a.png", image.as_slice())])).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let html = String::from_utf8(body.to_vec())?;
        assert!(html.starts_with("<!doctype html>"));
        assert!(html.contains("\"frame\":\"evidence\""));
        assert!(html.contains("\"frame\":\"report\""));
        assert!(html.trim_end().ends_with("</html>"));
        Ok(())
    }

    #[tokio::test]
    async fn healthz_and_index_flash() -> anyhow::Result<()> {
        let app = router(dryrun_pipeline(), 1024 * 1024);
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
            .await?;
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["provider"], "dryrun");
        assert_eq!(value["model"], "dryrun-vision-1");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/?error=%3Cscript%3Ebad")
                    .body(Body::empty())?,
            )
            .await?;
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let html = String::from_utf8(body.to_vec())?;
        assert!(html.contains("&lt;script&gt;bad"));
        Ok(())
    }
}
