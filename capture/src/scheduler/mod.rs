mod controller;
pub mod session;
pub mod worker;

pub use controller::{CaptureController, CaptureRequest, RunInfo};

use roi_capture_common::frame::FrameError;
use roi_capture_common::plan::PlanError;
use roi_capture_common::roi::RoiError;

use crate::layout::OutputError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("a capture session is already active")]
    AlreadyRunning,
    #[error("no frame received yet, camera preview is not ready")]
    NoFrame,
    #[error("invalid timing plan: {0}")]
    Plan(#[from] PlanError),
    #[error("invalid ROI: {0}")]
    Roi(#[from] RoiError),
    #[error("invalid output path: {0}")]
    Output(#[from] OutputError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("capture task failed: {0}")]
    Task(String),
}

impl CaptureError {
    /// Errors caused by the request itself rather than by the machine.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CaptureError::Plan(_) | CaptureError::Roi(_) | CaptureError::Output(_)
        )
    }
}
