use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use roi_capture_common::config::SchedulerConfig;
use roi_capture_common::plan::TimingPlan;
use roi_capture_common::roi::Roi;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::session::CaptureSession;
use super::worker::{run_capture_loop, Pacing, RunOutcome};
use super::CaptureError;
use crate::layout::{allocate_run_dir, OutputTarget};
use crate::slot::LatestFrameSlot;
use crate::status::{SchedulerState, Status, StatusReporter};
use crate::storage::{self, RunManifest, StorageError};

/// What the UI hands over when the user presses start.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub plan: TimingPlan,
    pub roi: Roi,
    pub output: OutputTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub run_index: u64,
    pub run_dir: PathBuf,
}

struct ActiveRun {
    info: RunInfo,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    slot: LatestFrameSlot,
    settings: SchedulerConfig,
    camera_id: u32,
    status: StatusReporter,
    state: watch::Sender<SchedulerState>,
    active: Mutex<Option<ActiveRun>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        // The guarded value is replaced wholesale, so a poisoned lock still holds a valid one.
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Start/stop surface for one camera's capture scheduler.
///
/// State goes `Idle -> Running -> Stopping -> Idle`; at most one run exists at a time.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl CaptureController {
    pub fn new(
        slot: LatestFrameSlot,
        settings: SchedulerConfig,
        camera_id: u32,
        status: StatusReporter,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            inner: Arc::new(Inner {
                slot,
                settings,
                camera_id,
                status,
                state,
                active: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    pub fn status(&self) -> &StatusReporter {
        &self.inner.status
    }

    pub fn current_run(&self) -> Option<RunInfo> {
        self.inner.active().as_ref().map(|run| run.info.clone())
    }

    /// Freeze the request into a session and launch the scheduler loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: CaptureRequest) -> Result<RunInfo, CaptureError> {
        let mut active = self.inner.active();
        if active.is_some() || self.state() != SchedulerState::Idle {
            return Err(CaptureError::AlreadyRunning);
        }

        let frame = self.inner.slot.read().ok_or(CaptureError::NoFrame)?;
        request.roi.validate_for(frame.width(), frame.height())?;
        let epsilon = self.inner.settings.boundary_epsilon();
        let plan = request.plan.resolve(epsilon)?;

        let (run_index, run_dir) = allocate_run_dir(&request.output)
            .map_err(|e| StorageError::CreateDir(request.output.series_dir(), e))
            .map_err(|e| self.fatal(e.into()))?;

        let started = Instant::now();
        let manifest = RunManifest {
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            camera_id: self.inner.camera_id,
            run_index,
            roi: request.roi,
            timing: request.plan.clone(),
            file_key: self.inner.settings.file_key,
            boundary_epsilon_secs: epsilon,
            frame_width: frame.width(),
            frame_height: frame.height(),
        };
        storage::write_manifest(&run_dir, &manifest).map_err(|e| self.fatal(e.into()))?;

        let session = CaptureSession::new(
            plan,
            request.roi,
            run_index,
            run_dir.clone(),
            self.inner.settings.file_key,
            started,
        );
        let pacing = Pacing {
            poll: self.inner.settings.poll_interval(),
            frame_wait: self.inner.settings.frame_wait(),
        };
        let cancel = self.inner.shutdown.child_token();
        let info = RunInfo { run_index, run_dir };

        self.inner.state.send_replace(SchedulerState::Running);
        self.inner.status.report(Status::Capturing);
        info!(
            camera_id = self.inner.camera_id,
            run_index,
            run_dir = %info.run_dir.display(),
            target = request.output.target,
            titer = request.output.titer,
            epsilon,
            "capture started"
        );

        let handle = tokio::spawn(settle(
            Arc::clone(&self.inner),
            session,
            self.inner.slot.clone(),
            pacing,
            cancel.clone(),
        ));
        *active = Some(ActiveRun {
            info: info.clone(),
            cancel,
            handle,
        });
        Ok(info)
    }

    /// Ask the running loop to exit. A no-op unless a run is active.
    pub fn stop(&self) {
        let active = self.inner.active();
        let Some(run) = active.as_ref() else {
            return;
        };
        if self.state() == SchedulerState::Running {
            self.inner.state.send_replace(SchedulerState::Stopping);
            info!(run_dir = %run.info.run_dir.display(), "capture stop requested");
        }
        run.cancel.cancel();
    }

    /// Wait until the scheduler is observably idle. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == SchedulerState::Idle))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Stop, wait up to `timeout`, then abandon the loop if it is still running.
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop();
        if self.wait_idle(timeout).await {
            return;
        }
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "capture loop did not exit in time, aborting it"
        );
        let mut active = self.inner.active();
        if let Some(run) = active.take() {
            run.handle.abort();
        }
        self.inner.state.send_replace(SchedulerState::Idle);
    }

    fn fatal(&self, err: CaptureError) -> CaptureError {
        error!(error = %err, "capture could not start");
        self.inner.status.report(Status::Error(err.to_string()));
        err
    }
}

/// Body of the spawned run: drive the loop, then walk the state back to idle.
async fn settle(
    inner: Arc<Inner>,
    session: CaptureSession,
    slot: LatestFrameSlot,
    pacing: Pacing,
    cancel: CancellationToken,
) {
    let run_dir = session.run_dir().to_path_buf();
    let result = run_capture_loop(session, slot, pacing, cancel).await;

    inner.state.send_if_modified(|state| {
        let running = *state == SchedulerState::Running;
        if running {
            *state = SchedulerState::Stopping;
        }
        running
    });

    match result {
        Ok(RunOutcome::Completed { captures }) => {
            info!(run_dir = %run_dir.display(), captures, "capture session completed");
            inner.status.report(Status::Ready);
        }
        Ok(RunOutcome::Cancelled { captures }) => {
            info!(run_dir = %run_dir.display(), captures, "capture session stopped");
            inner.status.report(Status::Ready);
        }
        Err(e) => {
            error!(run_dir = %run_dir.display(), error = %e, "capture session aborted");
            inner.status.report(Status::Error(e.to_string()));
        }
    }

    let mut active = inner.active();
    *active = None;
    inner.state.send_replace(SchedulerState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use roi_capture_common::frame::TimestampedFrame;
    use roi_capture_common::plan::Phase;
    use std::path::Path;

    fn settings(epsilon: f64) -> SchedulerConfig {
        SchedulerConfig {
            boundary_epsilon_secs: Some(epsilon),
            ..SchedulerConfig::default()
        }
    }

    fn controller(epsilon: f64) -> (CaptureController, LatestFrameSlot) {
        let slot = LatestFrameSlot::new();
        let controller = CaptureController::new(
            slot.clone(),
            settings(epsilon),
            1,
            StatusReporter::new(),
            CancellationToken::new(),
        );
        (controller, slot)
    }

    fn publish_frame(slot: &LatestFrameSlot) {
        slot.publish(TimestampedFrame::new(
            RgbImage::from_pixel(64, 48, Rgb([90; 3])),
            0,
            0,
        ));
    }

    fn request(base: &Path, start_delay: f64, end_point: f64) -> CaptureRequest {
        CaptureRequest {
            plan: TimingPlan {
                start_delay,
                phases: vec![Phase {
                    end_point,
                    interval: 0.25,
                }],
            },
            roi: Roi::new(10, 20, 30, 20),
            output: OutputTarget::new(base, "TRP", "Test_5.01").unwrap(),
        }
    }

    fn png_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|x| x == "png"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn refuses_to_start_before_the_first_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, _slot) = controller(0.01);
        let err = controller.start(request(tmp.path(), 0.0, 10.0)).unwrap_err();
        assert!(matches!(err, CaptureError::NoFrame));
        assert_eq!(controller.state(), SchedulerState::Idle);
        // Nothing was allocated.
        assert!(!tmp.path().join("TRP").exists());
    }

    #[tokio::test]
    async fn refuses_roi_outside_the_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, slot) = controller(0.01);
        publish_frame(&slot);
        let mut req = request(tmp.path(), 0.0, 10.0);
        req.roi = Roi::new(50, 0, 30, 10);
        let err = controller.start(req).unwrap_err();
        assert!(matches!(err, CaptureError::Roi(_)));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn refuses_a_second_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, slot) = controller(0.01);
        publish_frame(&slot);
        controller.start(request(tmp.path(), 0.0, 60.0)).unwrap();
        let err = controller.start(request(tmp.path(), 0.0, 60.0)).unwrap_err();
        assert!(matches!(err, CaptureError::AlreadyRunning));
        controller.stop();
        assert!(controller.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn runs_to_completion_and_reports_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, slot) = controller(0.1);
        publish_frame(&slot);
        let mut events = controller.status().subscribe();

        let info = controller.start(request(tmp.path(), 0.0, 0.5)).unwrap();
        assert_eq!(info.run_index, 0);
        assert_eq!(controller.state(), SchedulerState::Running);
        assert!(info.run_dir.join(storage::MANIFEST_FILE).is_file());

        assert!(controller.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(png_count(&info.run_dir), 3); // 0.00, 0.25, 0.50
        assert!(controller.current_run().is_none());
        assert_eq!(events.recv().await.unwrap(), Status::Capturing);
        assert_eq!(events.recv().await.unwrap(), Status::Ready);

        // The next run gets the next index.
        let again = controller.start(request(tmp.path(), 0.0, 0.25)).unwrap();
        assert_eq!(again.run_index, 1);
        assert!(controller.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn stop_is_prompt_and_final() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, slot) = controller(0.01);
        publish_frame(&slot);

        let info = controller.start(request(tmp.path(), 0.0, 3600.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        controller.stop();
        assert_eq!(controller.state(), SchedulerState::Stopping);
        assert!(controller.wait_idle(Duration::from_millis(50)).await);

        let written = png_count(&info.run_dir);
        assert!(written >= 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(png_count(&info.run_dir), written);

        // Stopping again is harmless.
        controller.stop();
        assert_eq!(controller.state(), SchedulerState::Idle);
        assert_eq!(controller.status().current(), Status::Ready);
    }

    #[tokio::test]
    async fn write_failure_surfaces_as_status() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, slot) = controller(0.01);
        publish_frame(&slot);

        let info = controller.start(request(tmp.path(), 0.3, 10.0)).unwrap();
        std::fs::remove_dir_all(&info.run_dir).unwrap();

        assert!(controller.wait_idle(Duration::from_secs(2)).await);
        assert!(matches!(controller.status().current(), Status::Error(_)));
    }

    #[tokio::test]
    async fn shutdown_cancels_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let (controller, slot) = controller(0.01);
        publish_frame(&slot);
        controller.start(request(tmp.path(), 0.0, 3600.0)).unwrap();

        controller.shutdown(Duration::from_secs(1)).await;
        assert_eq!(controller.state(), SchedulerState::Idle);
    }
}
