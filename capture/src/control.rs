use std::path::PathBuf;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use roi_capture_common::plan::TimingPlan;
use roi_capture_common::roi::Roi;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::layout::OutputTarget;
use crate::scheduler::{CaptureController, CaptureError, CaptureRequest, RunInfo};
use crate::slot::LatestFrameSlot;
use crate::status::SchedulerState;
use crate::storage;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub controller: CaptureController,
    pub slot: LatestFrameSlot,
    pub default_base_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct FrameInfo {
    width: u32,
    height: u32,
    seq: u64,
    captured_at_ms: i64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: SchedulerState,
    status: String,
    frame: Option<FrameInfo>,
    run: Option<RunInfo>,
}

#[derive(Debug, Deserialize)]
struct StartBody {
    roi: Roi,
    timing: TimingPlan,
    target: String,
    titer: String,
    base_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn capture_error_code(err: &CaptureError) -> StatusCode {
    match err {
        CaptureError::AlreadyRunning => StatusCode::CONFLICT,
        CaptureError::NoFrame => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_configuration() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let frame = state.slot.read().map(|f| FrameInfo {
        width: f.width(),
        height: f.height(),
        seq: f.seq,
        captured_at_ms: f.captured_at_ms,
    });
    Json(StatusResponse {
        state: state.controller.state(),
        status: state.controller.status().current().to_string(),
        frame,
        run: state.controller.current_run(),
    })
}

/// POST /capture/start
async fn start_capture(State(state): State<AppState>, Json(body): Json<StartBody>) -> Response {
    let base_path = body.base_path.unwrap_or(state.default_base_path);
    let output = match OutputTarget::new(base_path, &body.target, &body.titer) {
        Ok(o) => o,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let request = CaptureRequest {
        plan: body.timing,
        roi: body.roi,
        output,
    };
    match state.controller.start(request) {
        Ok(run) => (StatusCode::ACCEPTED, Json(run)).into_response(),
        Err(e) => {
            info!(error = %e, "capture start refused");
            error_response(capture_error_code(&e), e.to_string())
        }
    }
}

/// POST /capture/stop
async fn stop_capture(State(state): State<AppState>) -> impl IntoResponse {
    state.controller.stop();
    StatusCode::OK
}

/// GET /preview.jpg
async fn preview(State(state): State<AppState>) -> Response {
    let Some(frame) = state.slot.read() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no frame received yet");
    };
    let result = tokio::task::spawn_blocking(move || storage::encode_preview(&frame)).await;
    match result {
        Ok(Ok(jpeg)) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "preview encoding failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/capture/start", post(start_capture))
        .route("/capture/stop", post(stop_capture))
        .route("/preview.jpg", get(preview))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control API until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "control API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
