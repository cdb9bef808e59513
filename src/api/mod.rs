//! HTTP surface of `vigild`.
//!
//! - `POST /process-video`: multipart upload (`video`, optional
//!   `contact_phone`), runs a batch session that encodes straight to MP4,
//!   alerts, returns the detections and the processed video URL.
//! - `GET /processed/:filename`: serves a processed video with range support.
//! - `GET /ws`: live control channel (see `ws`).
//! - `GET /test-alert`, `GET /health`.

mod ws;

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeFile;

use crate::alert::{Alert, AlertDispatcher, AlertGateway, Delivery, LogGateway, ThreatKind, TwilioGateway};
use crate::annotate::Annotator;
use crate::config::VigilConfig;
use crate::detect::{DetectionFusion, DetectionRecord, FusionSettings, ModelCapability, ModelSet};
use crate::error::{Stage, VigilError};
use crate::ingest::FileSource;
use crate::media::{MediaLayout, TempFiles, UploadPlan, MAX_UPLOAD_BYTES};
use crate::pipeline::{BatchProcessor, BatchReport, LiveContext};
use crate::sink::FrameSink;
use crate::transcode::Transcoder;

/// Shared by every request and live connection.
pub struct AppState {
    pub layout: MediaLayout,
    pub models: ModelSet,
    pub fusion: FusionSettings,
    pub annotator: Arc<Annotator>,
    pub dispatcher: AlertDispatcher,
    pub transcoder: Transcoder,
    pub live: LiveContext,
    /// Base of `video_url`; the request `Host` when unset.
    pub public_url: Option<String>,
}

impl AppState {
    /// Create directories, load models and pick the alert gateway.
    pub fn from_config(cfg: &VigilConfig) -> Result<Self> {
        let layout = MediaLayout::new(&cfg.upload_dir, &cfg.processed_dir);
        layout.ensure()?;

        let models = ModelSet::load(&cfg.models);
        models.warm_up();

        let gateway: Arc<dyn AlertGateway> = match &cfg.twilio {
            Some(twilio) => Arc::new(TwilioGateway::new(twilio.clone())),
            None => {
                log::warn!("twilio credentials missing; alerts will only be logged");
                Arc::new(LogGateway)
            }
        };
        let dispatcher = AlertDispatcher::new(gateway, cfg.default_alert_phone.clone());
        let annotator = Arc::new(Annotator::from_optional_font(cfg.font_path.as_deref()));
        let live = LiveContext::new(
            models.clone(),
            cfg.fusion.clone(),
            dispatcher.clone(),
            annotator.clone(),
            cfg.camera.clone(),
        )
        .with_settings(cfg.live.clone());

        Ok(Self {
            layout,
            models,
            fusion: cfg.fusion.clone(),
            annotator,
            dispatcher,
            transcoder: Transcoder::new(&cfg.ffmpeg).with_timeout(cfg.transcode_timeout),
            live,
            public_url: cfg.public_url.clone(),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
        .allow_origin(Any);
    Router::new()
        .route("/process-video", post(process_video))
        .route("/processed/:filename", get(serve_processed))
        .route("/ws", get(ws::ws_handler))
        .route("/test-alert", get(test_alert))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES as usize + 1024 * 1024))
        .layer(cors)
        .with_state(state)
}

/// A request that failed at a named stage. Invalid input is a 400, every
/// other stage a 500.
#[derive(Debug)]
pub struct ApiError {
    error: VigilError,
    message: &'static str,
}

impl ApiError {
    pub fn new(error: VigilError, message: &'static str) -> Self {
        Self { error, message }
    }
}

impl From<VigilError> for ApiError {
    fn from(error: VigilError) -> Self {
        Self::new(error, "Video processing failed")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let stage = self.error.stage();
        let status = match stage {
            Stage::Input => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "status": "failed",
            "stage": stage,
            "error": self.error.to_string(),
            "message": self.message,
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    status: &'static str,
    video_url: String,
    processed_file: String,
    detection_results: Vec<DetectionRecord>,
}

async fn process_video(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ProcessResponse>, ApiError> {
    let mut upload = None;
    let mut contact_phone = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| VigilError::InvalidInput(format!("malformed upload: {}", e)))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("video") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| VigilError::InvalidInput(format!("upload interrupted: {}", e)))?;
                upload = Some((name, data));
            }
            Some("contact_phone") => {
                let phone = field
                    .text()
                    .await
                    .map_err(|e| VigilError::InvalidInput(format!("bad contact_phone: {}", e)))?;
                contact_phone = Some(phone).filter(|p| !p.trim().is_empty());
            }
            _ => {}
        }
    }

    let (name, data) = upload.ok_or_else(|| VigilError::InvalidInput("no video file provided".into()))?;
    if name.trim().is_empty() {
        return Err(VigilError::InvalidInput("no file selected".into()).into());
    }
    if data.len() as u64 > MAX_UPLOAD_BYTES {
        return Err(VigilError::InvalidInput(format!(
            "file exceeds {} MB limit",
            MAX_UPLOAD_BYTES / (1024 * 1024)
        ))
        .into());
    }
    let plan = state.layout.plan(&name)?;

    let mut temp = TempFiles::new();
    temp.track(&plan.input_path);
    temp.track(&plan.output_path);

    tokio::fs::write(&plan.input_path, &data)
        .await
        .map_err(|e| VigilError::SinkFault(format!("save upload {}: {}", plan.input_path.display(), e)))?;
    log::info!("saved upload {} ({} bytes)", plan.input_path.display(), data.len());

    let report = run_batch(state.clone(), plan.clone()).await?;

    if let Some(alert) = report.alert() {
        let alert = alert.with_file(plan.display_name.clone());
        let dispatcher = state.dispatcher.clone();
        let sent = tokio::task::spawn_blocking(move || dispatcher.dispatch(&alert, contact_phone.as_deref())).await;
        if let Err(err) = sent {
            log::error!("alert worker failed: {}", err);
        }
    }

    if !plan.output_path.is_file() {
        return Err(VigilError::transport("transcoder", "processed video not created").into());
    }
    temp.keep(&plan.output_path);

    let base = public_base(state.public_url.as_deref(), &headers);
    Ok(Json(ProcessResponse {
        status: "completed",
        video_url: format!("{}/processed/{}", base, plan.output_name),
        processed_file: plan.output_name,
        detection_results: report.records(),
    }))
}

async fn run_batch(state: Arc<AppState>, plan: UploadPlan) -> Result<BatchReport, VigilError> {
    tokio::task::spawn_blocking(move || {
        let input = plan.input_path.to_string_lossy().into_owned();
        let mut source =
            FileSource::new(input.clone()).map_err(|e| VigilError::source_unavailable(input, e))?;
        let fusion = DetectionFusion::new(state.models.clone(), state.fusion.clone())
            .map_err(|e| VigilError::detection(ModelCapability::ViolenceClassifier, e))?;
        let transcoder = &state.transcoder;
        let output = plan.output_path.as_path();
        BatchProcessor::new(fusion, &state.annotator).run(&mut source, |info| {
            Ok(Box::new(transcoder.start(info, output)?) as Box<dyn FrameSink>)
        })
    })
    .await
    .map_err(|e| VigilError::SinkFault(format!("batch worker failed: {}", e)))?
}

fn public_base(configured: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(url) = configured {
        return url.to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:5000");
    format!("http://{}", host)
}

const PROCESSED_MIME: &str = "video/mp4";

async fn serve_processed(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    request: Request,
) -> Response {
    let path = match state.layout.processed_file(&filename) {
        Ok(Some(path)) => path,
        Ok(None) => {
            log::warn!("processed file not found: {}", filename);
            return (StatusCode::NOT_FOUND, Json(json!({ "error": "File not found" }))).into_response();
        }
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response();
        }
    };
    // Every processed file is an MP4, whatever the upload's container was.
    let mime: mime::Mime = PROCESSED_MIME.parse().expect("valid processed MIME type");
    let response = match ServeFile::new_with_mime(path, &mime).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let mut response = response.map(Body::new);
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length"),
    );
    response
}

const TEST_ALERT_FAILED: &str = "Test alert failed";

async fn test_alert(State(state): State<Arc<AppState>>) -> Response {
    let alert = Alert::new(ThreatKind::Violence, 0.95).with_file("test.mp4");
    let dispatcher = state.dispatcher.clone();
    let sent = tokio::task::spawn_blocking(move || dispatcher.dispatch(&alert, None)).await;
    match sent {
        Ok(Ok(Delivery::Sent { receipt })) => Json(json!({
            "status": "success",
            "message": "Test alert sent",
            "receipt": receipt,
        }))
        .into_response(),
        Ok(Ok(Delivery::NoDestination)) => ApiError::new(
            VigilError::InvalidInput("no alert destination configured".into()),
            TEST_ALERT_FAILED,
        )
        .into_response(),
        Ok(Err(err)) => ApiError::new(err, TEST_ALERT_FAILED).into_response(),
        Err(err) => {
            ApiError::new(VigilError::transport("alert worker", err), TEST_ALERT_FAILED).into_response()
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "models": {
            "violence": state.models.is_available(ModelCapability::ViolenceClassifier),
            "weapons": state.models.is_available(ModelCapability::WeaponDetector),
        },
        "alerts": state.dispatcher.gateway_name(),
    }))
}
