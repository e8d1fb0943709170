use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{CaptureSession, Tick};
use super::CaptureError;
use crate::slot::LatestFrameSlot;
use crate::storage;

/// Sleep quanta of the polling loop.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Pause after every pass through the loop.
    pub poll: Duration,
    /// Pause while the slot is still empty.
    pub frame_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The last phase ended.
    Completed { captures: u64 },
    /// `stop()` or shutdown cancelled the run.
    Cancelled { captures: u64 },
}

/// Sleep for `period`, waking early if `cancel` fires.
async fn pause(cancel: &CancellationToken, period: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(period) => {}
    }
}

/// Poll the schedule until the session ends, is cancelled, or a write fails.
///
/// Captures already on disk stay there whatever the outcome.
pub async fn run_capture_loop(
    mut session: CaptureSession,
    slot: LatestFrameSlot,
    pacing: Pacing,
    cancel: CancellationToken,
) -> Result<RunOutcome, CaptureError> {
    info!(
        run_index = session.run_index(),
        run_dir = %session.run_dir().display(),
        start_delay = session.plan().start_delay(),
        total_secs = session.plan().total_duration(),
        phases = session.plan().phases().len(),
        "capture loop started"
    );

    loop {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled {
                captures: session.captures(),
            });
        }

        let elapsed = session.elapsed();
        if session.is_finished(elapsed) {
            return Ok(RunOutcome::Completed {
                captures: session.captures(),
            });
        }

        // Waiting for the first frame is not an error, just a longer nap.
        let Some(frame) = slot.read() else {
            pause(&cancel, pacing.frame_wait).await;
            continue;
        };

        if let Tick::Due(capture) = session.tick(elapsed) {
            let roi = session.roi();
            let path = session.image_path(&capture);
            debug!(
                phase = capture.phase,
                scheduled = capture.scheduled,
                elapsed = format!("{:.3}", capture.elapsed),
                seq = frame.seq,
                path = %path.display(),
                "capture due"
            );

            tokio::task::spawn_blocking(move || -> Result<(), CaptureError> {
                let crop = frame.crop(&roi)?;
                storage::write_png(&path, &crop)?;
                Ok(())
            })
            .await
            .map_err(|e| CaptureError::Task(e.to_string()))??;
        }

        pause(&cancel, pacing.poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roi_capture_common::config::FileKey;
    use image::{Rgb, RgbImage};
    use roi_capture_common::frame::TimestampedFrame;
    use roi_capture_common::plan::{Phase, TimingPlan};
    use roi_capture_common::roi::Roi;
    use std::path::Path;
    use std::time::Instant;

    const PACING: Pacing = Pacing {
        poll: Duration::from_millis(5),
        frame_wait: Duration::from_millis(10),
    };

    fn session(run_dir: &Path, end_point: f64, epsilon: f64, roi: Roi) -> CaptureSession {
        let plan = TimingPlan {
            start_delay: 0.0,
            phases: vec![Phase {
                end_point,
                interval: 0.25,
            }],
        };
        CaptureSession::new(
            plan.resolve(epsilon).unwrap(),
            roi,
            0,
            run_dir.to_path_buf(),
            FileKey::Scheduled,
            Instant::now(),
        )
    }

    fn frame(width: u32, height: u32) -> TimestampedFrame {
        TimestampedFrame::new(RgbImage::from_pixel(width, height, Rgb([200; 3])), 0, 0)
    }

    fn png_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".png"))
            .collect();
        names.sort_by(|a, b| {
            let key = |n: &str| n.trim_end_matches(".png").parse::<f64>().unwrap();
            key(a).total_cmp(&key(b))
        });
        names
    }

    #[tokio::test]
    async fn completes_on_schedule() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = LatestFrameSlot::new();
        slot.publish(frame(64, 48));

        let outcome = run_capture_loop(
            session(tmp.path(), 1.0, 0.1, Roi::new(4, 4, 16, 8)),
            slot,
            PACING,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { captures: 5 });
        assert_eq!(
            png_names(tmp.path()),
            vec!["0.00.png", "0.25.png", "0.50.png", "0.75.png", "1.00.png"]
        );
        let img = image::open(tmp.path().join("0.50.png")).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (16, 8));
    }

    #[tokio::test]
    async fn idles_without_frames_until_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_capture_loop(
            session(tmp.path(), 3600.0, 0.01, Roi::new(0, 0, 4, 4)),
            LatestFrameSlot::new(),
            PACING,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());
        cancel.cancel();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled { captures: 0 });
        assert!(png_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn write_failure_aborts_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("removed");
        let slot = LatestFrameSlot::new();
        slot.publish(frame(8, 8));

        let err = run_capture_loop(
            session(&missing, 10.0, 0.01, Roi::new(0, 0, 4, 4)),
            slot,
            PACING,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CaptureError::Storage(_)));
    }

    #[tokio::test]
    async fn frame_smaller_than_roi_aborts_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = LatestFrameSlot::new();
        slot.publish(frame(8, 8));

        let err = run_capture_loop(
            session(tmp.path(), 10.0, 0.01, Roi::new(4, 4, 8, 8)),
            slot,
            PACING,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CaptureError::Frame(_)));
        assert!(png_names(tmp.path()).is_empty());
    }
}
