//! Scan pipeline: detection queue worker plus the persisted job supervisor.

pub mod queue;
pub mod supervisor;

pub use queue::{DetectionQueue, QueueStatus};
pub use supervisor::{JobTracker, ScanSupervisor};

/// One unit of ingestion work pulled from the store.
#[derive(Debug, Clone)]
pub struct ScanTask {
    pub photo_id: i64,
    pub photo_uuid: String,
    pub file_path: String,
}

/// Stage of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
    Scanning,
    Detecting,
    Clustering,
    Completed,
    Cancelled,
    Error,
}

/// Progress update pushed to subscribers. Intermediate updates are
/// throttled to one per 500ms; terminal stages always go out.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub current: usize,
    pub total: usize,
    pub current_file: Option<String>,
    pub detected_faces: usize,
    pub message: Option<String>,
}

impl ScanProgress {
    pub fn stage_only(stage: ScanStage) -> Self {
        Self {
            stage,
            current: 0,
            total: 0,
            current_file: None,
            detected_faces: 0,
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.stage, ScanStage::Completed | ScanStage::Cancelled | ScanStage::Error)
    }
}
