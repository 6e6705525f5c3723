//! Persisted scan job records. Mutated only through the supervisor.

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;

use super::VectorStore;

/// Status of a scan job. `Detecting` is the only non-terminal, resumable
/// state; the others are terminal and one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Detecting,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Detecting => "detecting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "detecting" => Some(JobStatus::Detecting),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Detecting)
    }
}

/// One record per ingestion run.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub id: i64,
    pub status: JobStatus,
    pub total_photos: i64,
    pub processed_photos: i64,
    pub failed_photos: i64,
    /// Checkpoint cursor: highest photo id confirmed processed.
    pub last_processed_id: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub last_heartbeat: String,
    pub error_message: Option<String>,
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanJob> {
    let status_str: String = row.get(1)?;
    Ok(ScanJob {
        id: row.get(0)?,
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Failed),
        total_photos: row.get(2)?,
        processed_photos: row.get(3)?,
        failed_photos: row.get(4)?,
        last_processed_id: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        last_heartbeat: row.get(8)?,
        error_message: row.get(9)?,
    })
}

const JOB_COLUMNS: &str = "id, status, total_photos, processed_photos, failed_photos, \
     last_processed_id, started_at, completed_at, last_heartbeat, error_message";

impl VectorStore {
    pub fn create_scan_job(&self, total_photos: i64) -> Result<ScanJob> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scan_jobs (status, total_photos, started_at, last_heartbeat) VALUES ('detecting', ?, ?, ?)",
            params![total_photos, now, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ScanJob {
            id,
            status: JobStatus::Detecting,
            total_photos,
            processed_photos: 0,
            failed_photos: 0,
            last_processed_id: 0,
            started_at: now.clone(),
            completed_at: None,
            last_heartbeat: now,
            error_message: None,
        })
    }

    pub fn scan_job(&self, job_id: i64) -> Result<Option<ScanJob>> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = ?"),
            [job_id],
            row_to_job,
        );
        match result {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The most recent job still in a non-terminal status, if any.
    pub fn last_nonterminal_job(&self) -> Result<Option<ScanJob>> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE status = 'detecting' ORDER BY id DESC LIMIT 1"
            ),
            [],
            row_to_job,
        );
        match result {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Heartbeat, written on every processed item: progress counters plus
    /// liveness timestamp.
    pub fn heartbeat_scan_job(&self, job_id: i64, processed: i64, failed: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "UPDATE scan_jobs SET processed_photos = ?, failed_photos = ?, last_heartbeat = ? WHERE id = ?",
            params![processed, failed, now, job_id],
        )?;
        Ok(())
    }

    /// Advance the checkpoint cursor. Monotonic: a lower id never rewinds it.
    pub fn advance_scan_checkpoint(&self, job_id: i64, last_processed_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE scan_jobs SET last_processed_id = ? WHERE id = ? AND last_processed_id < ?",
            params![last_processed_id, job_id, last_processed_id],
        )?;
        Ok(())
    }

    /// Move a job to a terminal status. Only a `detecting` job can move;
    /// terminal states are one-way.
    pub fn finalize_scan_job(&self, job_id: i64, status: JobStatus, error_message: Option<&str>) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE scan_jobs SET status = ?, completed_at = ?, error_message = ? \
             WHERE id = ? AND status = 'detecting'",
            params![status.as_str(), now, error_message, job_id],
        )?;
        Ok(changed > 0)
    }
    /// Test hook: backdate a job's heartbeat to exercise stale reaping.
    #[cfg(test)]
    pub(crate) fn set_job_heartbeat(&self, job_id: i64, heartbeat: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE scan_jobs SET last_heartbeat = ? WHERE id = ?",
            params![heartbeat, job_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let store = VectorStore::open_in_memory().unwrap();
        let job = store.create_scan_job(10).unwrap();
        assert_eq!(job.status, JobStatus::Detecting);
        assert_eq!(job.total_photos, 10);
        assert_eq!(job.last_processed_id, 0);

        store.heartbeat_scan_job(job.id, 4, 1).unwrap();
        store.advance_scan_checkpoint(job.id, 4).unwrap();

        let job = store.scan_job(job.id).unwrap().unwrap();
        assert_eq!(job.processed_photos, 4);
        assert_eq!(job.failed_photos, 1);
        assert_eq!(job.last_processed_id, 4);

        assert!(store.finalize_scan_job(job.id, JobStatus::Completed, None).unwrap());
        let job = store.scan_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let store = VectorStore::open_in_memory().unwrap();
        let job = store.create_scan_job(10).unwrap();

        store.advance_scan_checkpoint(job.id, 50).unwrap();
        store.advance_scan_checkpoint(job.id, 12).unwrap();

        let job = store.scan_job(job.id).unwrap().unwrap();
        assert_eq!(job.last_processed_id, 50);
    }

    #[test]
    fn test_terminal_status_is_one_way() {
        let store = VectorStore::open_in_memory().unwrap();
        let job = store.create_scan_job(1).unwrap();

        assert!(store.finalize_scan_job(job.id, JobStatus::Cancelled, None).unwrap());
        // Second transition must be refused
        assert!(!store.finalize_scan_job(job.id, JobStatus::Completed, None).unwrap());
        let job = store.scan_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_last_nonterminal_job() {
        let store = VectorStore::open_in_memory().unwrap();
        assert!(store.last_nonterminal_job().unwrap().is_none());

        let first = store.create_scan_job(1).unwrap();
        store.finalize_scan_job(first.id, JobStatus::Failed, Some("boom")).unwrap();
        assert!(store.last_nonterminal_job().unwrap().is_none());

        let second = store.create_scan_job(1).unwrap();
        let active = store.last_nonterminal_job().unwrap().unwrap();
        assert_eq!(active.id, second.id);
        let failed = store.scan_job(first.id).unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }
}
