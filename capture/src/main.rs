mod control;
mod layout;
mod scheduler;
mod slot;
mod source;
mod status;
mod storage;

use std::path::PathBuf;
use std::time::Duration;

use layout::OutputTarget;
use roi_capture_common::config::Config;
use scheduler::{CaptureController, CaptureRequest};
use slot::LatestFrameSlot;
use status::StatusReporter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera_id = config.camera.id,
        source = ?config.camera.source,
        base_path = %config.output.base_path.display(),
        listen = config.control.listen,
        poll_ms = config.scheduler.poll_interval_ms,
        epsilon = config.scheduler.boundary_epsilon(),
        "starting roi-capture"
    );

    let shutdown = CancellationToken::new();
    let slot = LatestFrameSlot::new();
    let source = source::spawn_source(&config.camera, slot.clone(), shutdown.child_token());

    let status = StatusReporter::new();
    let mut status_rx = status.subscribe();
    tokio::spawn(async move {
        while let Ok(s) = status_rx.recv().await {
            info!(status = %s, "status changed");
        }
    });

    let controller = CaptureController::new(
        slot.clone(),
        config.scheduler.clone(),
        config.camera.id,
        status,
        shutdown.clone(),
    );

    let listener = match tokio::net::TcpListener::bind(&config.control.listen).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {e}", config.control.listen);
            std::process::exit(1);
        }
    };
    let state = control::AppState {
        controller: controller.clone(),
        slot: slot.clone(),
        default_base_path: config.output.base_path.clone(),
    };
    let server = tokio::spawn({
        let cancel = shutdown.clone();
        async move {
            if let Err(e) = control::serve(listener, state, cancel).await {
                error!(error = %e, "control API failed");
            }
        }
    });

    if config.control.autostart {
        tokio::spawn(autostart(config.clone(), controller.clone(), slot));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c, shutting down");
    }
    info!("shutdown requested");

    let timeout = config.scheduler.shutdown_timeout();
    controller.shutdown(timeout).await;
    shutdown.cancel();
    join_with_timeout("frame source", source, timeout).await;
    join_with_timeout("control API", server, timeout).await;
    info!("roi-capture stopped");
}

/// Start one session from the config file once the camera has delivered a frame.
async fn autostart(config: Config, controller: CaptureController, slot: LatestFrameSlot) {
    let wait = Duration::from_secs(config.control.first_frame_timeout_secs);
    if slot.wait_for_frame(wait).await.is_none() {
        error!(
            timeout_secs = config.control.first_frame_timeout_secs,
            "no frame from camera, autostart skipped"
        );
        return;
    }

    let output = match OutputTarget::new(
        config.output.base_path,
        &config.output.target,
        &config.output.titer,
    ) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "invalid [output] section, autostart skipped");
            return;
        }
    };
    let request = CaptureRequest {
        plan: config.timing,
        roi: config.roi,
        output,
    };
    match controller.start(request) {
        Ok(run) => info!(run_index = run.run_index, "autostarted capture session"),
        Err(e) => error!(error = %e, "autostart failed"),
    }
}

async fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
        Err(_) => warn!(
            task = name,
            timeout_ms = timeout.as_millis() as u64,
            "task did not stop in time"
        ),
    }
}
