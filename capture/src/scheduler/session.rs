use std::path::{Path, PathBuf};
use std::time::Instant;

use roi_capture_common::config::FileKey;
use roi_capture_common::plan::ResolvedPlan;
use roi_capture_common::roi::Roi;

use crate::layout::image_file_name;

/// Everything one capture run needs, frozen at start.
///
/// Only the per-phase cursors inside `plan` change while the run is live.
#[derive(Debug)]
pub struct CaptureSession {
    plan: ResolvedPlan,
    roi: Roi,
    run_index: u64,
    run_dir: PathBuf,
    file_key: FileKey,
    started: Instant,
    captures: u64,
    /// Last file label handed out, in hundredths of a second.
    last_label_centis: Option<u64>,
}

/// Outcome of checking the schedule at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    /// Elapsed time is past the last phase.
    Finished,
    /// Before the start delay, or no phase cursor has come due yet.
    Waiting,
    Due(DueCapture),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DueCapture {
    pub phase: usize,
    /// The schedule instant this capture satisfies.
    pub scheduled: f64,
    /// When the schedule was checked.
    pub elapsed: f64,
    /// Seconds used for the file name; unique within the run at 0.01 s resolution.
    pub label: f64,
}

impl CaptureSession {
    pub fn new(
        plan: ResolvedPlan,
        roi: Roi,
        run_index: u64,
        run_dir: PathBuf,
        file_key: FileKey,
        started: Instant,
    ) -> Self {
        Self {
            plan,
            roi,
            run_index,
            run_dir,
            file_key,
            started,
            captures: 0,
            last_label_centis: None,
        }
    }

    pub fn roi(&self) -> Roi {
        self.roi
    }

    pub fn run_index(&self) -> u64 {
        self.run_index
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn plan(&self) -> &ResolvedPlan {
        &self.plan
    }

    pub fn captures(&self) -> u64 {
        self.captures
    }

    /// Seconds since the run started.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn is_finished(&self, elapsed: f64) -> bool {
        self.plan.is_finished(elapsed)
    }

    /// Check the schedule at `elapsed` and consume at most one due instant.
    ///
    /// Only the first phase claiming `elapsed` is considered; phases share
    /// nothing but their boundary point, which the later phase owns.
    pub fn tick(&mut self, elapsed: f64) -> Tick {
        if self.plan.is_finished(elapsed) {
            return Tick::Finished;
        }
        let Some(index) = self.plan.phase_at(elapsed) else {
            return Tick::Waiting;
        };
        let Some(phase) = self.plan.phase_mut(index) else {
            return Tick::Waiting;
        };
        if !phase.is_due(elapsed) {
            return Tick::Waiting;
        }

        let scheduled = phase.advance();
        self.captures += 1;
        let label = self.next_label(scheduled, elapsed);
        Tick::Due(DueCapture {
            phase: index,
            scheduled,
            elapsed,
            label,
        })
    }

    /// Label for the next file, moved forward one 0.01 s step at a time while
    /// it would collide with an earlier one. Only elapsed labels can collide:
    /// catch-up after a stall fires several instants within a few milliseconds.
    fn next_label(&mut self, scheduled: f64, elapsed: f64) -> f64 {
        let raw = match self.file_key {
            FileKey::Scheduled => scheduled,
            FileKey::Elapsed => elapsed,
        };
        let mut centis = (raw * 100.0).round().max(0.0) as u64;
        if let Some(last) = self.last_label_centis {
            centis = centis.max(last + 1);
        }
        self.last_label_centis = Some(centis);
        centis as f64 / 100.0
    }

    /// `{run_dir}/{label:.2}.png` for a due capture.
    pub fn image_path(&self, capture: &DueCapture) -> PathBuf {
        self.run_dir.join(image_file_name(capture.label))
    }
}
