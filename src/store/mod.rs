//! Persisted vector store backed by SQLite.
//!
//! The store is the single writer-of-record for photos, detections, persons
//! and scan jobs. One connection behind a mutex: the ingestion worker and
//! foreground queries share it, and this process is the only writer by
//! design.

mod schema;
pub mod faces;
pub mod jobs;
pub mod photos;
pub mod vectors;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use faces::{BoundingBox, FaceRecord, NewDetection, Person};
pub use jobs::{JobStatus, ScanJob};
pub use photos::{NewPhoto, PhotoRecord, PhotoText};
pub use schema::{MIGRATIONS, SCHEMA};
pub use vectors::{bytes_to_vector, centroid, cosine_similarity, vector_to_bytes};

pub struct VectorStore {
    conn: Mutex<Connection>,
}

impl VectorStore {
    /// Open (and create if missing) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.initialize()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            // Additive migrations; "duplicate column" on re-run is expected
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
