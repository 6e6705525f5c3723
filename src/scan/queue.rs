//! Detection queue worker.
//!
//! Drains a FIFO of scan tasks: verify the file exists, detect faces,
//! scale boxes from detector space to the photo's true resolution, embed
//! each face region for the semantic slot, and replace the photo's prior
//! detections in one transaction. A single photo's failure increments a
//! counter and moves on; only a sticky model failure or a store error
//! aborts the run. After a batch that produced detections, clustering runs
//! once over the whole unassigned set as an implicit continuation.

use anyhow::Result;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cluster::ClusteringEngine;
use crate::config::{ClusterConfig, ScanConfig};
use crate::embed::{EmbeddingProvider, ImageSource, DETECTOR_INPUT_SIZE};
use crate::error::CoreError;
use crate::store::{JobStatus, NewDetection, VectorStore};

use super::supervisor::JobTracker;
use super::{ScanProgress, ScanStage, ScanTask};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Counters shared between the worker thread and status queries.
#[derive(Default)]
struct QueueStats {
    total: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    detected_faces: AtomicUsize,
}

/// Snapshot of queue state for collaborators.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub running: bool,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub detected_faces: usize,
}

/// Everything the worker thread needs, bundled at spawn time.
pub struct WorkerContext {
    pub store: Arc<VectorStore>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub scan_config: ScanConfig,
    pub cluster_config: ClusterConfig,
    pub tracker: JobTracker,
    pub progress: Option<Sender<ScanProgress>>,
    /// Resume cursor: only photos with id above this are pulled.
    pub start_after_id: i64,
}

/// The detection queue. Liveness is carried by the worker handle itself:
/// `is_running` asks the handle, so a crashed worker can never leave a
/// stuck "running" flag behind.
pub struct DetectionQueue {
    worker: Option<JoinHandle<()>>,
    cancel_flag: Arc<AtomicBool>,
    stats: Arc<QueueStats>,
}

impl DetectionQueue {
    pub fn new() -> Self {
        Self {
            worker: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(QueueStats::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Reap a finished worker handle. Called before every start so a
    /// previous run (or a crash inside one) cannot block the next.
    pub fn clear_stale_handle(&mut self) {
        if self.worker.as_ref().is_some_and(|handle| handle.is_finished()) {
            if let Some(handle) = self.worker.take() {
                let _ = handle.join();
            }
        }
    }

    /// Request cooperative cancellation. The in-flight task completes and
    /// its detections are kept; the loop stops at the next task boundary.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Hand the worker handle to the caller for joining.
    pub fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.worker.take()
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            running: self.is_running(),
            total: self.stats.total.load(Ordering::SeqCst),
            processed: self.stats.processed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            detected_faces: self.stats.detected_faces.load(Ordering::SeqCst),
        }
    }

    /// Start draining on a background thread.
    pub fn spawn(&mut self, ctx: WorkerContext) -> Result<()> {
        self.clear_stale_handle();
        if self.is_running() {
            anyhow::bail!("detection queue is already running");
        }

        self.cancel_flag.store(false, Ordering::SeqCst);
        self.stats = Arc::new(QueueStats::default());

        let cancel = Arc::clone(&self.cancel_flag);
        let stats = Arc::clone(&self.stats);
        let handle = std::thread::Builder::new()
            .name("fovea-detect".to_string())
            .spawn(move || drain(ctx, cancel, stats))?;

        self.worker = Some(handle);
        Ok(())
    }
}

impl Default for DetectionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Throttled progress fan-out. Terminal stages bypass the throttle.
struct ProgressReporter {
    sender: Option<Sender<ScanProgress>>,
    last_sent: Option<Instant>,
}

impl ProgressReporter {
    fn new(sender: Option<Sender<ScanProgress>>) -> Self {
        Self { sender, last_sent: None }
    }

    fn send(&mut self, progress: ScanProgress) {
        let Some(sender) = &self.sender else { return };

        if !progress.is_terminal() {
            if let Some(last) = self.last_sent {
                if last.elapsed() < PROGRESS_INTERVAL {
                    return;
                }
            }
        }

        self.last_sent = Some(Instant::now());
        let _ = sender.send(progress);
    }
}

enum RunOutcome {
    Drained,
    Cancelled,
    Aborted(String),
}

fn drain(ctx: WorkerContext, cancel: Arc<AtomicBool>, stats: Arc<QueueStats>) {
    stats.total.store(ctx.tracker.total() as usize, Ordering::SeqCst);
    let mut reporter = ProgressReporter::new(ctx.progress.clone());

    let outcome = drain_inner(&ctx, &cancel, &stats, &mut reporter);

    match outcome {
        RunOutcome::Cancelled => {
            if let Err(e) = ctx.tracker.finalize(JobStatus::Cancelled, None) {
                tracing::error!(error = %e, "failed to finalize cancelled job");
            }
            reporter.send(ScanProgress {
                stage: ScanStage::Cancelled,
                current: ctx.tracker.processed() as usize,
                total: stats.total.load(Ordering::SeqCst),
                current_file: None,
                detected_faces: stats.detected_faces.load(Ordering::SeqCst),
                message: None,
            });
            tracing::info!(job_id = ctx.tracker.job_id(), "scan cancelled");
        }
        RunOutcome::Aborted(message) => {
            if let Err(e) = ctx.tracker.finalize(JobStatus::Failed, Some(&message)) {
                tracing::error!(error = %e, "failed to finalize failed job");
            }
            reporter.send(ScanProgress {
                stage: ScanStage::Error,
                current: ctx.tracker.processed() as usize,
                total: stats.total.load(Ordering::SeqCst),
                current_file: None,
                detected_faces: stats.detected_faces.load(Ordering::SeqCst),
                message: Some(message.clone()),
            });
            tracing::error!(job_id = ctx.tracker.job_id(), error = %message, "scan failed");
        }
        RunOutcome::Drained => {
            // Clustering as implicit continuation of ingestion, once over
            // the whole unassigned set
            if stats.detected_faces.load(Ordering::SeqCst) > 0 {
                reporter.send(ScanProgress::stage_only(ScanStage::Clustering));
                let engine =
                    ClusteringEngine::new(Arc::clone(&ctx.store), ctx.cluster_config.clone());
                match engine.auto_match(None) {
                    Ok(outcome) => tracing::info!(
                        matched = outcome.matched,
                        persons_created = outcome.persons_created,
                        "post-scan clustering finished"
                    ),
                    Err(e) => tracing::warn!(error = %e, "post-scan clustering failed"),
                }
            }

            if let Err(e) = ctx.tracker.finalize(JobStatus::Completed, None) {
                tracing::error!(error = %e, "failed to finalize completed job");
            }
            reporter.send(ScanProgress {
                stage: ScanStage::Completed,
                current: ctx.tracker.processed() as usize,
                total: stats.total.load(Ordering::SeqCst),
                current_file: None,
                detected_faces: stats.detected_faces.load(Ordering::SeqCst),
                message: None,
            });
            tracing::info!(
                job_id = ctx.tracker.job_id(),
                processed = ctx.tracker.processed(),
                failed = ctx.tracker.failed(),
                faces = stats.detected_faces.load(Ordering::SeqCst),
                "scan completed"
            );
        }
    }
}

fn drain_inner(
    ctx: &WorkerContext,
    cancel: &AtomicBool,
    stats: &QueueStats,
    reporter: &mut ProgressReporter,
) -> RunOutcome {
    let mut cursor = ctx.start_after_id;

    loop {
        if cancel.load(Ordering::SeqCst) {
            return RunOutcome::Cancelled;
        }

        let page = match ctx.store.unprocessed_photos(ctx.scan_config.fetch_batch, cursor) {
            Ok(page) => page,
            Err(e) => return RunOutcome::Aborted(format!("failed to fetch work: {e}")),
        };
        if page.is_empty() {
            return RunOutcome::Drained;
        }

        cursor = page.last().map(|(id, _, _)| *id).unwrap_or(cursor);

        let tasks: VecDeque<ScanTask> = page
            .into_iter()
            .map(|(photo_id, photo_uuid, file_path)| ScanTask { photo_id, photo_uuid, file_path })
            .collect();

        match drain_page(ctx, cancel, stats, reporter, tasks) {
            RunOutcome::Drained => continue,
            other => return other,
        }
    }
}

/// Process one page of tasks. The concurrency knob defaults to a single
/// worker because the underlying inference call is not reentrant; FIFO
/// claim order is preserved either way.
fn drain_page(
    ctx: &WorkerContext,
    cancel: &AtomicBool,
    stats: &QueueStats,
    reporter: &mut ProgressReporter,
    tasks: VecDeque<ScanTask>,
) -> RunOutcome {
    let workers = ctx.scan_config.max_concurrent_tasks.max(1).min(tasks.len().max(1));
    let queue = Mutex::new(tasks);
    let fatal: Mutex<Option<String>> = Mutex::new(None);
    let reporter = Mutex::new(reporter);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if cancel.load(Ordering::SeqCst) || fatal.lock().unwrap().is_some() {
                        return;
                    }
                    let Some(task) = queue.lock().unwrap().pop_front() else {
                        return;
                    };

                    let result = process_photo(ctx, &task);
                    let success = match result {
                        Ok(face_count) => {
                            stats.processed.fetch_add(1, Ordering::SeqCst);
                            stats.detected_faces.fetch_add(face_count, Ordering::SeqCst);
                            true
                        }
                        Err(e) => {
                            let recoverable = e
                                .downcast_ref::<CoreError>()
                                .is_some_and(CoreError::is_recoverable);
                            if recoverable {
                                tracing::warn!(
                                    photo = %task.file_path,
                                    error = %e,
                                    "photo skipped"
                                );
                                stats.failed.fetch_add(1, Ordering::SeqCst);
                                false
                            } else {
                                // Sticky model failures and store errors
                                // take the whole scan down
                                *fatal.lock().unwrap() = Some(e.to_string());
                                return;
                            }
                        }
                    };

                    if let Err(e) = ctx.tracker.record_item(task.photo_id, success) {
                        *fatal.lock().unwrap() = Some(format!("checkpoint write failed: {e}"));
                        return;
                    }

                    let current = stats.processed.load(Ordering::SeqCst)
                        + stats.failed.load(Ordering::SeqCst);
                    reporter.lock().unwrap().send(ScanProgress {
                        stage: ScanStage::Detecting,
                        current,
                        total: stats.total.load(Ordering::SeqCst),
                        current_file: Some(task.file_path.clone()),
                        detected_faces: stats.detected_faces.load(Ordering::SeqCst),
                        message: None,
                    });
                }
            });
        }
    });

    if let Some(message) = fatal.into_inner().unwrap() {
        return RunOutcome::Aborted(message);
    }
    if cancel.load(Ordering::SeqCst) {
        return RunOutcome::Cancelled;
    }
    RunOutcome::Drained
}

/// Ingest one photo: detect, scale, embed, replace. Returns the number of
/// faces written.
fn process_photo(ctx: &WorkerContext, task: &ScanTask) -> Result<usize> {
    let path = Path::new(&task.file_path);
    if !path.exists() {
        return Err(CoreError::FileNotFound(task.file_path.clone()).into());
    }

    let detections = ctx.provider.detect_faces(path)?;

    let mut rows: Vec<NewDetection> = Vec::with_capacity(detections.len());
    if !detections.is_empty() {
        let (width, height) = photo_dimensions(ctx, task, path)?;

        for detection in detections {
            let face_embedding =
                (!detection.descriptor.is_empty()).then_some(detection.descriptor);

            // Boxes arrive in detector space; scale before cropping
            let semantic_embedding = if face_embedding.is_some() {
                let rect = detection.bbox.scaled(DETECTOR_INPUT_SIZE, width, height);
                match ctx.provider.embed_image(ImageSource::Region { path, rect }) {
                    Ok(vector) => Some(vector),
                    Err(e @ CoreError::ModelLoadFailure(_)) => return Err(e.into()),
                    Err(e) => {
                        tracing::debug!(photo = %task.file_path, error = %e, "semantic embed failed");
                        None
                    }
                }
            } else {
                None
            };

            rows.push(NewDetection {
                bbox: detection.bbox,
                confidence: detection.confidence,
                face_embedding,
                semantic_embedding,
            });
        }
    }

    ctx.store.replace_photo_detections(task.photo_id, &rows)?;
    ctx.store.mark_photo_scanned(task.photo_id, rows.len())?;

    Ok(rows.len())
}

fn photo_dimensions(ctx: &WorkerContext, task: &ScanTask, path: &Path) -> Result<(u32, u32)> {
    if let Some(photo) = ctx.store.photo_by_id(task.photo_id)? {
        if let (Some(w), Some(h)) = (photo.width, photo.height) {
            return Ok((w as u32, h as u32));
        }
    }
    let (w, h) = image::image_dimensions(path)
        .map_err(|e| CoreError::ImageDecode(e.to_string()))?;
    Ok((w, h))
}
