use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub embed: EmbedConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub intent: IntentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedConfig {
    /// Directory where ONNX model files are cached.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Hard per-image timeout for face detection, in seconds.
    #[serde(default = "default_detection_timeout_secs")]
    pub detection_timeout_secs: u64,
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("fovea")
        .join("models")
}

fn default_detection_timeout_secs() -> u64 {
    45
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            detection_timeout_secs: default_detection_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Maximum tasks processed concurrently. Defaults to 1: the inference
    /// call is not safely reentrant.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Checkpoint cursor is advanced every this many processed photos.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// A non-terminal job with no heartbeat for this long is marked failed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,

    /// Page size for pulling unprocessed photos from the store.
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch: usize,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_max_concurrent_tasks() -> usize {
    1
}

fn default_checkpoint_interval() -> u32 {
    50
}

fn default_stale_after_secs() -> i64 {
    300
}

fn default_fetch_batch() -> usize {
    200
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "heic".to_string(),
        "heif".to_string(),
    ]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            checkpoint_interval: default_checkpoint_interval(),
            stale_after_secs: default_stale_after_secs(),
            fetch_batch: default_fetch_batch(),
            image_extensions: default_image_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cosine similarity threshold for anchor matching and cluster growth.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,

    /// Cap on greedy single-link cluster growth.
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,

    /// Similarity floor for find_similar_faces results.
    #[serde(default = "default_similar_floor")]
    pub similar_floor: f32,
}

fn default_match_threshold() -> f32 {
    0.45
}

fn default_max_cluster_size() -> usize {
    100
}

fn default_similar_floor() -> f32 {
    0.3
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            max_cluster_size: default_max_cluster_size(),
            similar_floor: default_similar_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Minimum cosine similarity for vector matches.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,

    /// Minimum fused score for a result to be returned.
    #[serde(default = "default_min_combined_score")]
    pub min_combined_score: f32,

    /// Default keyword weight when no intent overrides it.
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    /// Default vector weight when no intent overrides it.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,

    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
}

fn default_min_similarity() -> f32 {
    0.2
}

fn default_min_combined_score() -> f32 {
    0.05
}

fn default_keyword_weight() -> f32 {
    0.3
}

fn default_vector_weight() -> f32 {
    0.7
}

fn default_result_limit() -> usize {
    50
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_similarity: default_min_similarity(),
            min_combined_score: default_min_combined_score(),
            keyword_weight: default_keyword_weight(),
            vector_weight: default_vector_weight(),
            result_limit: default_result_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Whether to consult the external intent endpoint at all.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_intent_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_intent_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_intent_endpoint() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_intent_model() -> String {
    "gemma-3-4b".to_string()
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_intent_endpoint(),
            model: default_intent_model(),
            api_key: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fovea")
        .join("fovea.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embed: EmbedConfig::default(),
            scan: ScanConfig::default(),
            cluster: ClusterConfig::default(),
            search: SearchConfig::default(),
            intent: IntentConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fovea")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.scan.max_concurrent_tasks, 1);
        assert_eq!(parsed.scan.checkpoint_interval, 50);
        assert_eq!(parsed.embed.detection_timeout_secs, 45);
        assert!((parsed.cluster.match_threshold - 0.45).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let parsed: Config = toml::from_str("").unwrap();
        assert_eq!(parsed.search.result_limit, 50);
        assert!((parsed.search.vector_weight - 0.7).abs() < f32::EPSILON);
    }
}
