//! Scan job supervisor.
//!
//! Owns the persisted job state machine: `detecting` is the only resumable
//! state, the rest are terminal and one-way. On every `active_job` query a
//! non-terminal job whose heartbeat went quiet for longer than the
//! staleness window is unilaterally marked failed before anything is
//! offered as resumable. The supervisor is the only mutator of scan jobs.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::config::{ClusterConfig, ScanConfig};
use crate::embed::EmbeddingProvider;
use crate::store::{JobStatus, ScanJob, VectorStore};

use super::queue::{DetectionQueue, QueueStatus, WorkerContext};
use super::ScanProgress;

/// Per-job progress bookkeeping handed to the queue worker. The heartbeat
/// is written on every item; the checkpoint cursor advances in batches of
/// `checkpoint_interval` items, so up to interval-1 items may be
/// reprocessed after a crash. Accepted at-least-once tradeoff: detections
/// are replaced wholesale per photo, so reprocessing is idempotent.
pub struct JobTracker {
    store: Arc<VectorStore>,
    job_id: i64,
    total: i64,
    processed: AtomicI64,
    failed: AtomicI64,
    highest_id: AtomicI64,
    unflushed: AtomicU32,
    checkpoint_interval: u32,
}

impl JobTracker {
    pub fn new(store: Arc<VectorStore>, job: &ScanJob, checkpoint_interval: u32) -> Self {
        Self {
            store,
            job_id: job.id,
            total: job.total_photos,
            processed: AtomicI64::new(job.processed_photos),
            failed: AtomicI64::new(job.failed_photos),
            highest_id: AtomicI64::new(job.last_processed_id),
            unflushed: AtomicU32::new(0),
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn processed(&self) -> i64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> i64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Record one consumed task. Heartbeat every item, checkpoint every
    /// `checkpoint_interval` items. A write failure here is fatal to the
    /// scan: losing the checkpoint trail silently is not acceptable.
    pub fn record_item(&self, photo_id: i64, success: bool) -> Result<()> {
        if success {
            self.processed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.highest_id.fetch_max(photo_id, Ordering::SeqCst);

        self.store.heartbeat_scan_job(self.job_id, self.processed(), self.failed())?;

        let pending = self.unflushed.fetch_add(1, Ordering::SeqCst) + 1;
        if pending >= self.checkpoint_interval {
            self.unflushed.store(0, Ordering::SeqCst);
            self.store
                .advance_scan_checkpoint(self.job_id, self.highest_id.load(Ordering::SeqCst))?;
        }
        Ok(())
    }

    /// Flush the cursor and move the job to a terminal status.
    pub fn finalize(&self, status: JobStatus, error_message: Option<&str>) -> Result<()> {
        self.store
            .advance_scan_checkpoint(self.job_id, self.highest_id.load(Ordering::SeqCst))?;
        self.store.heartbeat_scan_job(self.job_id, self.processed(), self.failed())?;
        self.store.finalize_scan_job(self.job_id, status, error_message)?;
        Ok(())
    }
}

pub struct ScanSupervisor {
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    scan_config: ScanConfig,
    cluster_config: ClusterConfig,
    queue: Mutex<DetectionQueue>,
}

impl ScanSupervisor {
    pub fn new(
        store: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        scan_config: ScanConfig,
        cluster_config: ClusterConfig,
    ) -> Self {
        Self {
            store,
            provider,
            scan_config,
            cluster_config,
            queue: Mutex::new(DetectionQueue::new()),
        }
    }

    /// The current non-terminal job, after stale-job reaping. A reaped job
    /// is marked failed and not returned.
    pub fn active_job(&self) -> Result<Option<ScanJob>> {
        let worker_alive = self.queue.lock().unwrap().is_running();
        self.active_job_with(worker_alive)
    }

    fn active_job_with(&self, worker_alive: bool) -> Result<Option<ScanJob>> {
        let Some(job) = self.store.last_nonterminal_job()? else {
            return Ok(None);
        };

        if self.is_stale(&job, worker_alive) {
            let message = format!("stale job: no heartbeat since {}", job.last_heartbeat);
            tracing::warn!(job_id = job.id, last_heartbeat = %job.last_heartbeat, "reaping stale job");
            self.store.finalize_scan_job(job.id, JobStatus::Failed, Some(&message))?;
            return Ok(None);
        }

        Ok(Some(job))
    }

    fn is_stale(&self, job: &ScanJob, worker_alive: bool) -> bool {
        // A worker alive in this process heartbeats every item
        if worker_alive {
            return false;
        }
        match DateTime::parse_from_rfc3339(&job.last_heartbeat) {
            Ok(heartbeat) => {
                let age = Utc::now().signed_duration_since(heartbeat.with_timezone(&Utc));
                age.num_seconds() > self.scan_config.stale_after_secs
            }
            // An unreadable heartbeat cannot prove liveness
            Err(_) => true,
        }
    }

    pub fn job_by_id(&self, job_id: i64) -> Result<Option<ScanJob>> {
        self.store.scan_job(job_id)
    }

    /// Start a fresh scan over all unprocessed photos.
    pub fn start_scan(
        &self,
        total_photos: i64,
        progress: Option<Sender<ScanProgress>>,
    ) -> Result<i64> {
        let mut queue = self.queue.lock().unwrap();
        queue.clear_stale_handle();
        if queue.is_running() {
            bail!("a scan is already running");
        }
        if let Some(job) = self.active_job_with(false)? {
            bail!("job {} is still active; resume or cancel it first", job.id);
        }

        let job = self.store.create_scan_job(total_photos)?;
        let tracker = JobTracker::new(Arc::clone(&self.store), &job, self.scan_config.checkpoint_interval);

        queue.spawn(WorkerContext {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            scan_config: self.scan_config.clone(),
            cluster_config: self.cluster_config.clone(),
            tracker,
            progress,
            start_after_id: 0,
        })?;

        tracing::info!(job_id = job.id, total_photos, "scan started");
        Ok(job.id)
    }

    /// Resume a crashed or restarted scan. Remaining work is re-derived
    /// from the checkpoint cursor, not re-scanned: only unprocessed photos
    /// with id above `last_processed_id` are pulled.
    pub fn resume_scan(&self, job_id: i64, progress: Option<Sender<ScanProgress>>) -> Result<()> {
        let mut queue = self.queue.lock().unwrap();
        queue.clear_stale_handle();
        if queue.is_running() {
            bail!("a scan is already running");
        }

        // Reap first so a stale job cannot be resumed
        self.active_job_with(false)?;

        let Some(job) = self.store.scan_job(job_id)? else {
            bail!("job {job_id} does not exist");
        };
        if job.status != JobStatus::Detecting {
            bail!("job {} is {} and cannot be resumed", job.id, job.status.as_str());
        }

        let start_after_id = job.last_processed_id;
        let tracker = JobTracker::new(Arc::clone(&self.store), &job, self.scan_config.checkpoint_interval);

        queue.spawn(WorkerContext {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            scan_config: self.scan_config.clone(),
            cluster_config: self.cluster_config.clone(),
            tracker,
            progress,
            start_after_id,
        })?;

        tracing::info!(job_id, start_after_id, "scan resumed");
        Ok(())
    }

    /// Cancel the running scan, or finalize an orphaned job when no worker
    /// is alive. Returns whether anything was cancelled.
    pub fn cancel_scan(&self) -> Result<bool> {
        let queue = self.queue.lock().unwrap();
        if queue.is_running() {
            queue.cancel();
            tracing::info!("scan cancellation requested");
            return Ok(true);
        }
        drop(queue);

        if let Some(job) = self.store.last_nonterminal_job()? {
            self.store.finalize_scan_job(job.id, JobStatus::Cancelled, None)?;
            tracing::info!(job_id = job.id, "orphaned job cancelled");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.lock().unwrap().status()
    }

    /// Block until the current worker (if any) exits. The worker never
    /// takes the supervisor's queue lock, so joining outside it is safe.
    pub fn wait(&self) {
        let handle = self.queue.lock().unwrap().take_handle();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::stub::StubProvider;
    use crate::scan::ScanStage;
    use crate::store::NewPhoto;
    use std::sync::mpsc;

    fn add_photo(store: &VectorStore, dir: &tempfile::TempDir, name: &str, on_disk: bool) -> i64 {
        let path = dir.path().join(name);
        if on_disk {
            std::fs::write(&path, b"not really a jpeg").unwrap();
        }
        store
            .insert_photo(&NewPhoto {
                uuid: format!("uuid-{name}"),
                path: path.to_string_lossy().to_string(),
                filename: name.to_string(),
                directory: dir.path().to_string_lossy().to_string(),
                taken_at: None,
                width: Some(4160),
                height: Some(3120),
                exif_json: None,
                location_json: None,
            })
            .unwrap()
    }

    fn provider_with_faces(names: &[&str]) -> StubProvider {
        let mut provider = StubProvider::default();
        provider.image_embedding = vec![0.5; 512];
        for name in names {
            provider
                .detections
                .insert(name.to_string(), vec![StubProvider::detection(vec![1.0; 128])]);
        }
        provider
    }

    fn supervisor(store: Arc<VectorStore>, provider: StubProvider) -> ScanSupervisor {
        ScanSupervisor::new(
            store,
            Arc::new(provider),
            ScanConfig { fetch_batch: 3, ..ScanConfig::default() },
            ClusterConfig::default(),
        )
    }

    #[test]
    fn test_full_scan_writes_detections_and_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let names: Vec<String> = (0..4).map(|i| format!("{i}.jpg")).collect();
        for name in &names {
            add_photo(&store, &dir, name, true);
        }

        let provider = provider_with_faces(&names.iter().map(String::as_str).collect::<Vec<_>>());
        let supervisor = supervisor(Arc::clone(&store), provider);

        let (tx, rx) = mpsc::channel();
        let job_id = supervisor.start_scan(4, Some(tx)).unwrap();
        supervisor.wait();

        let job = supervisor.job_by_id(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_photos, 4);
        assert_eq!(job.failed_photos, 0);
        assert_eq!(job.last_processed_id, 4);
        assert_eq!(store.count_faces().unwrap(), 4);

        // Identical descriptors: the post-scan clustering continuation
        // groups them under one person
        assert_eq!(store.count_persons().unwrap(), 1);
        assert_eq!(store.count_unassigned_faces().unwrap(), 0);

        // Terminal progress always arrives
        let events: Vec<ScanProgress> = rx.try_iter().collect();
        assert!(matches!(events.last().unwrap().stage, ScanStage::Completed));
    }

    #[test]
    fn test_missing_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        add_photo(&store, &dir, "present.jpg", true);
        add_photo(&store, &dir, "gone.jpg", false);

        let provider = provider_with_faces(&["present.jpg"]);
        let supervisor = supervisor(Arc::clone(&store), provider);

        let job_id = supervisor.start_scan(2, None).unwrap();
        supervisor.wait();

        let job = supervisor.job_by_id(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_photos, 1);
        assert_eq!(job.failed_photos, 1);
    }

    #[test]
    fn test_detection_timeout_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        add_photo(&store, &dir, "ok.jpg", true);
        add_photo(&store, &dir, "slow.jpg", true);

        let provider = provider_with_faces(&["ok.jpg"]);
        provider.fail_detection_for.lock().unwrap().push("slow.jpg".to_string());
        let supervisor = supervisor(Arc::clone(&store), provider);

        let job_id = supervisor.start_scan(2, None).unwrap();
        supervisor.wait();

        let job = supervisor.job_by_id(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.failed_photos, 1);
        assert_eq!(job.processed_photos, 1);
    }

    #[test]
    fn test_resume_pulls_only_ids_after_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let names: Vec<String> = (0..8).map(|i| format!("{i}.jpg")).collect();
        let ids: Vec<i64> = names.iter().map(|n| add_photo(&store, &dir, n, true)).collect();

        // Simulate a crashed run that checkpointed through the 5th photo
        let crashed = store.create_scan_job(8).unwrap();
        store.advance_scan_checkpoint(crashed.id, ids[4]).unwrap();
        store.heartbeat_scan_job(crashed.id, 5, 0).unwrap();

        let provider = provider_with_faces(&names.iter().map(String::as_str).collect::<Vec<_>>());
        let supervisor = supervisor(Arc::clone(&store), provider);

        supervisor.resume_scan(crashed.id, None).unwrap();
        supervisor.wait();

        let job = supervisor.job_by_id(crashed.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        // Only the 3 photos beyond the cursor were processed
        let scanned: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !store.faces_for_photo(*id).unwrap().is_empty())
            .collect();
        assert_eq!(scanned, ids[5..].to_vec());
        assert_eq!(job.processed_photos, 8); // 5 from before the crash + 3 now
    }

    #[test]
    fn test_stale_job_is_reaped_by_active_job() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let job = store.create_scan_job(10).unwrap();
        store.set_job_heartbeat(job.id, "2020-01-01T00:00:00+00:00").unwrap();

        let supervisor = supervisor(Arc::clone(&store), StubProvider::default());

        assert!(supervisor.active_job().unwrap().is_none());
        let reaped = supervisor.job_by_id(job.id).unwrap().unwrap();
        assert_eq!(reaped.status, JobStatus::Failed);
        assert!(reaped.error_message.unwrap().contains("stale"));
    }

    #[test]
    fn test_fresh_job_blocks_new_scan() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let job = store.create_scan_job(10).unwrap();

        let supervisor = supervisor(Arc::clone(&store), StubProvider::default());
        let active = supervisor.active_job().unwrap().unwrap();
        assert_eq!(active.id, job.id);

        let err = supervisor.start_scan(10, None).unwrap_err();
        assert!(err.to_string().contains("still active"));
    }

    #[test]
    fn test_stale_job_cannot_be_resumed() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let job = store.create_scan_job(10).unwrap();
        store.set_job_heartbeat(job.id, "2020-01-01T00:00:00+00:00").unwrap();

        let supervisor = supervisor(Arc::clone(&store), StubProvider::default());
        let err = supervisor.resume_scan(job.id, None).unwrap_err();
        assert!(err.to_string().contains("failed"));
    }

    #[test]
    fn test_cancel_stops_after_inflight_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let names: Vec<String> = (0..20).map(|i| format!("{i}.jpg")).collect();
        for name in &names {
            add_photo(&store, &dir, name, true);
        }

        let mut provider = provider_with_faces(&names.iter().map(String::as_str).collect::<Vec<_>>());
        provider.detect_delay_ms = 20;
        let supervisor = supervisor(Arc::clone(&store), provider);

        let job_id = supervisor.start_scan(20, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(supervisor.cancel_scan().unwrap());
        supervisor.wait();

        let job = supervisor.job_by_id(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        // Something ran, but not everything; completed work is kept
        let consumed = job.processed_photos + job.failed_photos;
        assert!(consumed >= 1 && consumed < 20);
        assert_eq!(store.count_faces().unwrap(), job.processed_photos);
    }

    #[test]
    fn test_cancel_finalizes_orphaned_job() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let job = store.create_scan_job(10).unwrap();

        let supervisor = supervisor(Arc::clone(&store), StubProvider::default());
        assert!(supervisor.cancel_scan().unwrap());
        let job = supervisor.job_by_id(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        // Nothing left to cancel
        assert!(!supervisor.cancel_scan().unwrap());
    }

    #[test]
    fn test_checkpoint_advances_in_batches() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let job = store.create_scan_job(100).unwrap();
        let tracker = JobTracker::new(Arc::clone(&store), &job, 50);

        // 49 items: heartbeats flow, checkpoint stays put. A crash here
        // reprocesses up to 49 items; that overlap is the documented
        // at-least-once window.
        for photo_id in 1..=49 {
            tracker.record_item(photo_id, true).unwrap();
        }
        let row = store.scan_job(job.id).unwrap().unwrap();
        assert_eq!(row.last_processed_id, 0);
        assert_eq!(row.processed_photos, 49);

        // Item 50 flushes the cursor
        tracker.record_item(50, true).unwrap();
        let row = store.scan_job(job.id).unwrap().unwrap();
        assert_eq!(row.last_processed_id, 50);

        // Finalize flushes whatever is pending
        tracker.record_item(51, true).unwrap();
        tracker.finalize(JobStatus::Completed, None).unwrap();
        let row = store.scan_job(job.id).unwrap().unwrap();
        assert_eq!(row.last_processed_id, 51);
        assert_eq!(row.status, JobStatus::Completed);
    }

    #[test]
    fn test_queue_status_reflects_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        add_photo(&store, &dir, "a.jpg", true);

        let provider = provider_with_faces(&["a.jpg"]);
        let supervisor = supervisor(Arc::clone(&store), provider);

        supervisor.start_scan(1, None).unwrap();
        supervisor.wait();

        let status = supervisor.queue_status();
        assert!(!status.running);
        assert_eq!(status.processed, 1);
        assert_eq!(status.detected_faces, 1);
    }
}
