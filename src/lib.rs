//! fovea - face and semantic indexing engine for photo libraries.
//!
//! Four subsystems around one SQLite-backed vector store: a resumable
//! detection queue that turns photo files into face detections and
//! embedding vectors, a clustering engine that groups detections into
//! person identities, a hybrid keyword+vector retrieval engine, and the
//! persisted job state machine that lets a long scan survive a crash.

pub mod cluster;
pub mod config;
pub mod embed;
pub mod error;
pub mod intent;
pub mod logging;
pub mod scan;
pub mod search;
pub mod store;

pub use cluster::{ClusteringEngine, MatchOutcome};
pub use config::Config;
pub use embed::{EmbeddingProvider, OnnxProvider};
pub use error::CoreError;
pub use intent::{IntentClient, QueryIntent};
pub use scan::{ScanProgress, ScanStage, ScanSupervisor};
pub use search::{RetrievalEngine, SortKey};
pub use store::VectorStore;
