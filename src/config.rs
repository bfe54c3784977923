//! Configuration parsing and validation.
//!
//! The engine is configured via a TOML file (default: `config/kg.toml`).
//! The config defines the database path, chunking parameters, provider
//! settings (embedding and extraction), concept-matching thresholds,
//! vocabulary policy, job-queue tuning, algorithm budgets, and the server
//! bind address.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{KgError, KgResult};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub objects: ObjectsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Filesystem object store holding raw image/document bytes.
#[derive(Debug, Deserialize, Clone)]
pub struct ObjectsConfig {
    #[serde(default = "default_objects_root")]
    pub root: PathBuf,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            root: default_objects_root(),
        }
    }
}

fn default_objects_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Approximate words per chunk.
    #[serde(default = "default_target_words")]
    pub target_words: usize,
    /// Tail-head overlap between consecutive chunks, in words.
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: default_target_words(),
            overlap_words: default_overlap_words(),
        }
    }
}

fn default_target_words() -> usize {
    1000
}
fn default_overlap_words() -> usize {
    200
}

/// Concept-matcher tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Cosine similarity above which a candidate reuses an existing concept.
    #[serde(default = "default_match_threshold")]
    pub threshold: f32,
    /// Per-ontology overrides, adjustable at runtime.
    #[serde(default)]
    pub per_ontology: std::collections::HashMap<String, f32>,
    /// Serialize matching per ontology to maximize reuse in parallel mode.
    #[serde(default)]
    pub serialize_per_ontology: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: default_match_threshold(),
            per_ontology: Default::default(),
            serialize_per_ontology: false,
        }
    }
}

fn default_match_threshold() -> f32 {
    0.80
}

impl MatchingConfig {
    /// Effective threshold for an ontology, honoring overrides.
    pub fn threshold_for(&self, ontology: &str) -> f32 {
        self.per_ontology
            .get(ontology)
            .copied()
            .unwrap_or(self.threshold)
    }
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
pub struct EmbeddingConfig {
    /// `"remote"` or `"mock"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Enable the vision endpoint for image ingestion.
    #[serde(default)]
    pub vision: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: None,
            api_key_env: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
            vision: false,
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
pub struct ExtractionConfig {
    /// `"remote"` or `"mock"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_extract_timeout_secs")]
    pub timeout_secs: u64,
    /// Price per 1K input tokens, USD, for pre-flight estimates.
    #[serde(default = "default_price_in")]
    pub price_per_1k_in: f64,
    /// Price per 1K output tokens, USD.
    #[serde(default = "default_price_out")]
    pub price_per_1k_out: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            api_key_env: None,
            max_retries: default_max_retries(),
            timeout_secs: default_extract_timeout_secs(),
            price_per_1k_in: default_price_in(),
            price_per_1k_out: default_price_out(),
        }
    }
}

fn default_extract_timeout_secs() -> u64 {
    120
}
fn default_price_in() -> f64 {
    0.003
}
fn default_price_out() -> f64 {
    0.015
}

#[derive(Debug, Deserialize, Clone)]
pub struct VocabularyConfig {
    /// Cosine similarity at which an unknown type name is routed to an
    /// existing active type instead of creating a new one.
    #[serde(default = "default_fuzzy_similarity")]
    pub fuzzy_similarity: f32,
    /// Edit distance at or below which names are considered the same type.
    #[serde(default = "default_fuzzy_edit_distance")]
    pub fuzzy_edit_distance: usize,
    /// Pair-generation threshold for consolidation.
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: f32,
    /// Pairs evaluated per dry-run.
    #[serde(default = "default_dry_run_pairs")]
    pub dry_run_pairs: usize,
    /// Allow merges that deactivate builtin types. Off by default.
    #[serde(default)]
    pub allow_builtin_deactivation: bool,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            fuzzy_similarity: default_fuzzy_similarity(),
            fuzzy_edit_distance: default_fuzzy_edit_distance(),
            consolidation_threshold: default_consolidation_threshold(),
            dry_run_pairs: default_dry_run_pairs(),
            allow_builtin_deactivation: false,
        }
    }
}

fn default_fuzzy_similarity() -> f32 {
    0.92
}
fn default_fuzzy_edit_distance() -> usize {
    2
}
fn default_consolidation_threshold() -> f32 {
    0.85
}
fn default_dry_run_pairs() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// Worker slots draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Hours before an unapproved job expires.
    #[serde(default = "default_pending_deadline_hours")]
    pub pending_deadline_hours: i64,
    /// Days terminal jobs are retained before the sweep deletes them.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Seconds between scheduler sweep passes.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Process chunks of one job concurrently instead of serially.
    #[serde(default)]
    pub parallel_chunks: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            pending_deadline_hours: default_pending_deadline_hours(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
            parallel_chunks: false,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_pending_deadline_hours() -> i64 {
    24
}
fn default_retention_days() -> i64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    60
}

/// Wall-clock and size budgets for the application-level algorithms.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_frontier_cap")]
    pub frontier_cap: usize,
    #[serde(default = "default_pathfind_timeout_secs")]
    pub pathfind_timeout_secs: u64,
    #[serde(default = "default_polarity_timeout_secs")]
    pub polarity_timeout_secs: u64,
    #[serde(default = "default_neighbor_timeout_secs")]
    pub neighbor_timeout_secs: u64,
    /// Candidate cap for polarity auto-discovery.
    #[serde(default = "default_polarity_candidates")]
    pub polarity_candidate_cap: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            frontier_cap: default_frontier_cap(),
            pathfind_timeout_secs: default_pathfind_timeout_secs(),
            polarity_timeout_secs: default_polarity_timeout_secs(),
            neighbor_timeout_secs: default_neighbor_timeout_secs(),
            polarity_candidate_cap: default_polarity_candidates(),
        }
    }
}

fn default_max_hops() -> usize {
    5
}
fn default_frontier_cap() -> usize {
    5000
}
fn default_pathfind_timeout_secs() -> u64 {
    30
}
fn default_polarity_timeout_secs() -> u64 {
    60
}
fn default_neighbor_timeout_secs() -> u64 {
    10
}
fn default_polarity_candidates() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7430".to_string()
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> KgResult<Config> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        KgError::Validation(format!("cannot read config {}: {}", path.display(), e))
    })?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| KgError::Validation(format!("invalid config {}: {}", path.display(), e)))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> KgResult<()> {
    if config.chunking.target_words == 0 {
        return Err(KgError::Validation("chunking.target_words must be > 0".into()));
    }
    if config.chunking.overlap_words >= config.chunking.target_words {
        return Err(KgError::Validation(
            "chunking.overlap_words must be smaller than target_words".into(),
        ));
    }
    if !(0.0..=1.0).contains(&config.matching.threshold) {
        return Err(KgError::Validation(
            "matching.threshold must be in [0, 1]".into(),
        ));
    }
    if config.jobs.workers == 0 {
        return Err(KgError::Validation("jobs.workers must be > 0".into()));
    }
    if config.limits.max_hops == 0 {
        return Err(KgError::Validation("limits.max_hops must be > 0".into()));
    }
    if config.embedding.provider == "remote" && config.embedding.dims.is_none() {
        return Err(KgError::Validation(
            "embedding.dims required for the remote provider".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kg.toml");
        std::fs::write(&path, contents).unwrap();
        (tmp, path)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let (_tmp, path) = write_config("[db]\npath = \"./data/kg.sqlite\"\n");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.chunking.target_words, 1000);
        assert_eq!(cfg.chunking.overlap_words, 200);
        assert_eq!(cfg.matching.threshold, 0.80);
        assert_eq!(cfg.jobs.workers, 4);
        assert_eq!(cfg.jobs.pending_deadline_hours, 24);
        assert_eq!(cfg.limits.frontier_cap, 5000);
    }

    #[test]
    fn overlap_must_be_smaller_than_target() {
        let (_tmp, path) = write_config(
            "[db]\npath = \"x.sqlite\"\n[chunking]\ntarget_words = 100\noverlap_words = 100\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn per_ontology_threshold_override() {
        let (_tmp, path) = write_config(
            "[db]\npath = \"x.sqlite\"\n[matching]\nthreshold = 0.8\n[matching.per_ontology]\nPhilosophy = 0.9\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.matching.threshold_for("Philosophy"), 0.9);
        assert_eq!(cfg.matching.threshold_for("Science"), 0.8);
    }

    #[test]
    fn remote_embedding_requires_dims() {
        let (_tmp, path) =
            write_config("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"remote\"\n");
        assert!(load_config(&path).is_err());
    }
}
