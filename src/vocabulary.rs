//! Relationship-type vocabulary: the dynamic, auto-expanding set of edge
//! types and its consolidation engine.
//!
//! The vocabulary starts from 30 builtin types in 8 categories. When the
//! extractor emits an unknown type name, [`VocabularyManager::resolve_type`]
//! normalizes it, routes it to an existing type when a fuzzy match exists
//! (edit distance or embedding similarity), and otherwise creates a new
//! active type with an auto-assigned category.
//!
//! Consolidation merges synonymous non-builtin types under LLM adjudication.
//! A merge atomically re-types every edge of the source type, deactivates
//! the source, and records the `merged_into` pointer; directional inverses
//! and genuine semantic distinctions are rejected and remembered for the
//! process lifetime so they are never re-presented.
//!
//! State is process-wide and read-mostly: a reader/writer lock protects the
//! in-memory mirror; per-edge reads take the read lock, additions and
//! consolidation take the write lock. Every mutation is persisted to the
//! vocabulary tables before the lock is released.

use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};

use crate::config::VocabularyConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use crate::error::{KgError, KgResult};
use crate::extractor::{Extractor, MergeVerdict, RejectReason};
use crate::graph::GraphStore;
use crate::models::VocabularyType;

/// The builtin seed: (name, category). Never deleted; deactivation by merge
/// is forbidden under the default policy.
pub const BUILTIN_TYPES: &[(&str, &str)] = &[
    // Logical
    ("IMPLIES", "Logical"),
    ("CONTRADICTS", "Logical"),
    ("PRESUPPOSES", "Logical"),
    ("EQUIVALENT_TO", "Logical"),
    // Causal
    ("CAUSES", "Causal"),
    ("ENABLES", "Causal"),
    ("PREVENTS", "Causal"),
    ("INFLUENCES", "Causal"),
    ("RESULTS_FROM", "Causal"),
    // Structural
    ("PART_OF", "Structural"),
    ("CONTAINS", "Structural"),
    ("COMPOSED_OF", "Structural"),
    ("SUBSET_OF", "Structural"),
    ("INSTANCE_OF", "Structural"),
    // Evidential
    ("SUPPORTS", "Evidential"),
    ("REFUTES", "Evidential"),
    ("EXEMPLIFIES", "Evidential"),
    ("MEASURED_BY", "Evidential"),
    // Similarity
    ("SIMILAR_TO", "Similarity"),
    ("ANALOGOUS_TO", "Similarity"),
    ("CONTRASTS_WITH", "Similarity"),
    ("OPPOSITE_OF", "Similarity"),
    // Temporal
    ("PRECEDES", "Temporal"),
    ("CONCURRENT_WITH", "Temporal"),
    ("EVOLVES_INTO", "Temporal"),
    // Functional
    ("USED_FOR", "Functional"),
    ("REQUIRES", "Functional"),
    ("PRODUCES", "Functional"),
    ("REGULATES", "Functional"),
    // Meta
    ("DEFINED_AS", "Meta"),
    ("CATEGORIZED_AS", "Meta"),
];

/// The 8 category names used for auto-categorization.
pub const CATEGORIES: &[&str] = &[
    "Logical",
    "Causal",
    "Structural",
    "Evidential",
    "Similarity",
    "Temporal",
    "Functional",
    "Meta",
];

/// Runner-up similarity within this fraction of the winner marks the
/// category assignment ambiguous.
const AMBIGUITY_RATIO: f32 = 0.8;

/// Qualitative size band of the active vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Zone {
    Optimal,
    Mixed,
    TooLarge,
    Critical,
}

impl Zone {
    pub fn from_size(n: usize) -> Self {
        match n {
            0..=90 => Self::Optimal,
            91..=120 => Self::Mixed,
            121..=200 => Self::TooLarge,
            _ => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Optimal => "OPTIMAL",
            Self::Mixed => "MIXED",
            Self::TooLarge => "TOO_LARGE",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Result of resolving an extractor-emitted type name.
#[derive(Debug, Clone)]
pub struct ResolvedType {
    /// Active type name the edge should carry.
    pub name: String,
    /// True when resolution created a brand-new type.
    pub created: bool,
}

/// One evaluated pair in a consolidation run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsolidationStep {
    pub source: String,
    pub target: String,
    pub similarity: f32,
    /// `merged`, `rejected_inverse`, or `rejected_distinct`.
    pub outcome: String,
    pub reason: String,
    /// Edges re-typed by this step (0 for rejections and dry runs).
    pub edges_retyped: u64,
}

/// Outcome of a consolidation run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsolidationReport {
    pub dry_run: bool,
    pub active_before: usize,
    pub active_after: usize,
    pub steps: Vec<ConsolidationStep>,
}

/// Snapshot for `/vocabulary/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VocabularyStatus {
    pub active: usize,
    pub total: usize,
    pub zone: Zone,
    pub by_category: HashMap<String, usize>,
}

struct VocabState {
    types: HashMap<String, VocabularyType>,
    /// Pre-embedded category seed vectors for auto-categorization.
    category_seeds: HashMap<String, Vec<f32>>,
}

/// Owner of the relationship-type set.
pub struct VocabularyManager {
    pool: SqlitePool,
    config: VocabularyConfig,
    state: RwLock<VocabState>,
    /// Pairs the adjudicator rejected; never re-presented this process.
    rejected: Mutex<HashSet<(String, String)>>,
}

impl VocabularyManager {
    /// Load the vocabulary from the database.
    pub async fn load(pool: SqlitePool, config: VocabularyConfig) -> KgResult<Self> {
        let rows = sqlx::query(
            "SELECT name, active, builtin, category, ambiguous, embedding, usage_count, merged_into, created_at FROM vocabulary_types",
        )
        .fetch_all(&pool)
        .await?;

        let mut types = HashMap::new();
        for row in rows {
            let name: String = row.get("name");
            types.insert(
                name.clone(),
                VocabularyType {
                    name,
                    active: row.get::<i64, _>("active") != 0,
                    builtin: row.get::<i64, _>("builtin") != 0,
                    category: row.get("category"),
                    ambiguous: row.get::<i64, _>("ambiguous") != 0,
                    embedding: row
                        .get::<Option<Vec<u8>>, _>("embedding")
                        .map(|b| blob_to_vec(&b)),
                    usage_count: row.get("usage_count"),
                    merged_into: row.get("merged_into"),
                    created_at: row.get("created_at"),
                },
            );
        }

        Ok(Self {
            pool,
            config,
            state: RwLock::new(VocabState {
                types,
                category_seeds: HashMap::new(),
            }),
            rejected: Mutex::new(HashSet::new()),
        })
    }

    /// Insert any missing builtin types and embed names + category seeds.
    /// Idempotent; run at `kg init` and server startup.
    pub async fn seed(&self, embedder: &dyn EmbeddingProvider) -> KgResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut state = self.state.write().await;

        // Category seed vectors: category name plus its member names gives
        // the seed some lexical mass.
        let seed_texts: Vec<String> = CATEGORIES
            .iter()
            .map(|cat| {
                let members: Vec<&str> = BUILTIN_TYPES
                    .iter()
                    .filter(|(_, c)| c == cat)
                    .map(|(n, _)| *n)
                    .collect();
                format!("{} {}", cat, members.join(" ").replace('_', " ").to_lowercase())
            })
            .collect();
        let seed_vectors = embedder.embed_batch(&seed_texts).await?;
        state.category_seeds = CATEGORIES
            .iter()
            .map(|c| c.to_string())
            .zip(seed_vectors)
            .collect();

        let missing: Vec<(&str, &str)> = BUILTIN_TYPES
            .iter()
            .filter(|(name, _)| !state.types.contains_key(*name))
            .copied()
            .collect();

        if !missing.is_empty() {
            let texts: Vec<String> = missing
                .iter()
                .map(|(n, _)| n.replace('_', " ").to_lowercase())
                .collect();
            let vectors = embedder.embed_batch(&texts).await?;

            for ((name, category), vector) in missing.iter().zip(vectors) {
                let vt = VocabularyType {
                    name: name.to_string(),
                    active: true,
                    builtin: true,
                    category: category.to_string(),
                    ambiguous: false,
                    embedding: Some(vector),
                    usage_count: 0,
                    merged_into: None,
                    created_at: now,
                };
                self.persist_type(&vt).await?;
                self.append_history(name, "seeded", "builtin").await?;
                state.types.insert(name.to_string(), vt);
            }
        }

        Ok(())
    }

    /// Snapshot of active type names, sorted for stable prompts.
    pub async fn active_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .types
            .values()
            .filter(|t| t.active)
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn zone(&self) -> Zone {
        let state = self.state.read().await;
        Zone::from_size(state.types.values().filter(|t| t.active).count())
    }

    pub async fn status(&self) -> VocabularyStatus {
        let state = self.state.read().await;
        let active: Vec<&VocabularyType> = state.types.values().filter(|t| t.active).collect();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        for t in &active {
            *by_category.entry(t.category.clone()).or_default() += 1;
        }
        VocabularyStatus {
            active: active.len(),
            total: state.types.len(),
            zone: Zone::from_size(active.len()),
            by_category,
        }
    }

    /// All types, active and merged-away, for `/vocabulary/list`.
    pub async fn list(&self) -> Vec<VocabularyType> {
        let state = self.state.read().await;
        let mut all: Vec<VocabularyType> = state.types.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Resolve an extractor-emitted type name to an active type, creating a
    /// new one when nothing matches.
    pub async fn resolve_type(
        &self,
        raw: &str,
        embedder: &dyn EmbeddingProvider,
    ) -> KgResult<ResolvedType> {
        let name = normalize_type_name(raw);
        if name.is_empty() {
            return Err(KgError::Validation(format!(
                "unusable relationship type name: '{}'",
                raw
            )));
        }

        // Fast path under the read lock: exact or edit-distance match.
        {
            let state = self.state.read().await;
            if let Some(resolved) = self.match_existing(&state, &name) {
                return Ok(ResolvedType {
                    name: resolved,
                    created: false,
                });
            }
        }

        // Embedding route: similar name in vector space.
        let vector = embedder
            .embed_text(&name.replace('_', " ").to_lowercase())
            .await?;
        {
            let state = self.state.read().await;
            let mut best: Option<(f32, &str)> = None;
            for t in state.types.values().filter(|t| t.active) {
                if let Some(emb) = &t.embedding {
                    let sim = cosine_similarity(&vector, emb);
                    if sim >= self.config.fuzzy_similarity
                        && best.map_or(true, |(b, _)| sim > b)
                    {
                        best = Some((sim, t.name.as_str()));
                    }
                }
            }
            if let Some((_, existing)) = best {
                return Ok(ResolvedType {
                    name: existing.to_string(),
                    created: false,
                });
            }
        }

        // Nothing matched: create under the write lock, re-checking first
        // (a concurrent chunk may have created the same type).
        let mut state = self.state.write().await;
        if let Some(resolved) = self.match_existing(&state, &name) {
            return Ok(ResolvedType {
                name: resolved,
                created: false,
            });
        }

        let (category, ambiguous) = categorize(&state.category_seeds, &vector);
        let vt = VocabularyType {
            name: name.clone(),
            active: true,
            builtin: false,
            category,
            ambiguous,
            embedding: Some(vector),
            usage_count: 0,
            merged_into: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.persist_type(&vt).await?;
        self.append_history(&name, "created", "auto-expansion").await?;
        state.types.insert(name.clone(), vt);

        Ok(ResolvedType {
            name,
            created: true,
        })
    }

    /// Exact or edit-distance match against known types, following
    /// `merged_into` chains to the surviving active type.
    fn match_existing(&self, state: &VocabState, name: &str) -> Option<String> {
        if let Some(t) = state.types.get(name) {
            return Some(self.follow_merges(state, t));
        }
        let mut best: Option<(usize, &str)> = None;
        for t in state.types.values().filter(|t| t.active) {
            let d = edit_distance(name, &t.name);
            if d <= self.config.fuzzy_edit_distance && best.map_or(true, |(b, _)| d < b) {
                best = Some((d, t.name.as_str()));
            }
        }
        best.map(|(_, n)| n.to_string())
    }

    fn follow_merges(&self, state: &VocabState, start: &VocabularyType) -> String {
        let mut current = start;
        let mut hops = 0;
        while let Some(target) = &current.merged_into {
            match state.types.get(target) {
                Some(t) if hops < 16 => {
                    current = t;
                    hops += 1;
                }
                _ => break,
            }
        }
        current.name.clone()
    }

    /// Bump the usage counter after an edge of this type is written.
    pub async fn record_usage(&self, name: &str) -> KgResult<()> {
        sqlx::query("UPDATE vocabulary_types SET usage_count = usage_count + 1 WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let mut state = self.state.write().await;
        if let Some(t) = state.types.get_mut(name) {
            t.usage_count += 1;
        }
        Ok(())
    }

    /// Regenerate embeddings for types that are missing one (or all of
    /// them, after an embedding-config swap).
    pub async fn generate_embeddings(
        &self,
        embedder: &dyn EmbeddingProvider,
        all: bool,
    ) -> KgResult<usize> {
        let names: Vec<String> = {
            let state = self.state.read().await;
            state
                .types
                .values()
                .filter(|t| all || t.embedding.is_none())
                .map(|t| t.name.clone())
                .collect()
        };
        if names.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = names
            .iter()
            .map(|n| n.replace('_', " ").to_lowercase())
            .collect();
        let vectors = embedder.embed_batch(&texts).await?;

        let mut state = self.state.write().await;
        for (name, vector) in names.iter().zip(vectors) {
            sqlx::query("UPDATE vocabulary_types SET embedding = ? WHERE name = ?")
                .bind(vec_to_blob(&vector))
                .bind(name)
                .execute(&self.pool)
                .await?;
            if let Some(t) = state.types.get_mut(name) {
                t.embedding = Some(vector);
            }
        }
        Ok(names.len())
    }

    /// Merge one type into another by operator request.
    pub async fn merge(
        &self,
        source: &str,
        target: &str,
        reason: &str,
        graph: &GraphStore,
    ) -> KgResult<u64> {
        let mut state = self.state.write().await;
        self.apply_merge(&mut state, source, target, reason, graph)
            .await
    }

    /// Run the consolidation engine toward `target_size` active types.
    pub async fn consolidate(
        &self,
        target_size: usize,
        threshold: Option<f32>,
        dry_run: bool,
        adjudicator: &dyn Extractor,
        graph: &GraphStore,
    ) -> KgResult<ConsolidationReport> {
        let threshold = threshold.unwrap_or(self.config.consolidation_threshold);
        let active_before = {
            let state = self.state.read().await;
            state.types.values().filter(|t| t.active).count()
        };

        // Candidate pairs, most similar first. Both-builtin pairs are
        // excluded: the proposed source must be mergeable away.
        let mut pairs: Vec<(String, String, f32)> = {
            let state = self.state.read().await;
            let active: Vec<&VocabularyType> = state
                .types
                .values()
                .filter(|t| t.active && t.embedding.is_some())
                .collect();
            let mut pairs = Vec::new();
            for i in 0..active.len() {
                for j in (i + 1)..active.len() {
                    let (a, b) = (active[i], active[j]);
                    if a.builtin && b.builtin && !self.config.allow_builtin_deactivation {
                        continue;
                    }
                    let (Some(ea), Some(eb)) = (a.embedding.as_ref(), b.embedding.as_ref())
                    else {
                        continue;
                    };
                    let sim = cosine_similarity(ea, eb);
                    if sim >= threshold {
                        // Source is the less-established side: non-builtin
                        // first, then lower usage.
                        let (src, dst) = pick_direction(a, b);
                        pairs.push((src.to_string(), dst.to_string(), sim));
                    }
                }
            }
            pairs.sort_by(|x, y| y.2.partial_cmp(&x.2).unwrap_or(std::cmp::Ordering::Equal));
            pairs
        };

        if dry_run {
            pairs.truncate(self.config.dry_run_pairs);
        }

        let mut steps = Vec::new();
        let mut deactivated: HashSet<String> = HashSet::new();

        for (source, target, sim) in pairs {
            {
                let state = self.state.read().await;
                let still_active = state.types.values().filter(|t| t.active).count();
                if still_active <= target_size && !dry_run {
                    break;
                }
            }
            if deactivated.contains(&source) || deactivated.contains(&target) {
                continue;
            }
            {
                let rejected = self.rejected.lock().await;
                if rejected.contains(&pair_key(&source, &target)) {
                    continue;
                }
            }

            let (src_desc, dst_desc) = {
                let state = self.state.read().await;
                (
                    state
                        .types
                        .get(&source)
                        .map(|t| format!("{} ({})", t.name.replace('_', " "), t.category))
                        .unwrap_or_default(),
                    state
                        .types
                        .get(&target)
                        .map(|t| format!("{} ({})", t.name.replace('_', " "), t.category))
                        .unwrap_or_default(),
                )
            };

            let verdict = adjudicator
                .adjudicate(&source, &src_desc, &target, &dst_desc)
                .await?;

            match verdict {
                MergeVerdict::Merge { reason } => {
                    let edges_retyped = if dry_run {
                        0
                    } else {
                        let mut state = self.state.write().await;
                        let n = self
                            .apply_merge(&mut state, &source, &target, &reason, graph)
                            .await?;
                        deactivated.insert(source.clone());
                        n
                    };
                    steps.push(ConsolidationStep {
                        source,
                        target,
                        similarity: sim,
                        outcome: "merged".to_string(),
                        reason,
                        edges_retyped,
                    });
                }
                MergeVerdict::Reject { reason } => {
                    self.rejected.lock().await.insert(pair_key(&source, &target));
                    let outcome = match reason {
                        RejectReason::DirectionalInverse => "rejected_inverse",
                        RejectReason::SemanticDistinction => "rejected_distinct",
                    };
                    steps.push(ConsolidationStep {
                        source,
                        target,
                        similarity: sim,
                        outcome: outcome.to_string(),
                        reason: format!("{:?}", reason),
                        edges_retyped: 0,
                    });
                }
            }
        }

        let active_after = {
            let state = self.state.read().await;
            state.types.values().filter(|t| t.active).count()
        };

        Ok(ConsolidationReport {
            dry_run,
            active_before,
            active_after,
            steps,
        })
    }

    /// Apply one merge while holding the write lock. Re-types edges,
    /// deactivates the source, transfers usage, and records history.
    async fn apply_merge(
        &self,
        state: &mut VocabState,
        source: &str,
        target: &str,
        reason: &str,
        graph: &GraphStore,
    ) -> KgResult<u64> {
        let src = state
            .types
            .get(source)
            .ok_or_else(|| KgError::NotFound(format!("vocabulary type {}", source)))?;
        if !src.active {
            return Err(KgError::Conflict(format!("{} is not active", source)));
        }
        if src.builtin && !self.config.allow_builtin_deactivation {
            return Err(KgError::Conflict(format!(
                "builtin type {} may not be deactivated",
                source
            )));
        }
        let dst = state
            .types
            .get(target)
            .ok_or_else(|| KgError::NotFound(format!("vocabulary type {}", target)))?;
        if !dst.active {
            return Err(KgError::Conflict(format!("{} is not active", target)));
        }

        let edges_retyped = graph.retype_edges(source, target).await?;

        sqlx::query(
            "UPDATE vocabulary_types SET active = 0, merged_into = ? WHERE name = ?",
        )
        .bind(target)
        .bind(source)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "UPDATE vocabulary_types SET usage_count = usage_count + ? WHERE name = ?",
        )
        .bind(edges_retyped as i64)
        .bind(target)
        .execute(&self.pool)
        .await?;
        self.append_history(source, "merged", &format!("into {}: {}", target, reason))
            .await?;
        self.append_history(target, "absorbed", &format!("{} ({} edges)", source, edges_retyped))
            .await?;

        let src_usage = state.types.get(source).map(|t| t.usage_count).unwrap_or(0);
        if let Some(t) = state.types.get_mut(source) {
            t.active = false;
            t.merged_into = Some(target.to_string());
        }
        if let Some(t) = state.types.get_mut(target) {
            t.usage_count += src_usage.max(edges_retyped as i64);
        }

        Ok(edges_retyped)
    }

    async fn persist_type(&self, vt: &VocabularyType) -> KgResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vocabulary_types (name, active, builtin, category, ambiguous, embedding, usage_count, merged_into, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                active = excluded.active,
                category = excluded.category,
                ambiguous = excluded.ambiguous,
                embedding = excluded.embedding
            "#,
        )
        .bind(&vt.name)
        .bind(vt.active as i64)
        .bind(vt.builtin as i64)
        .bind(&vt.category)
        .bind(vt.ambiguous as i64)
        .bind(vt.embedding.as_ref().map(|v| vec_to_blob(v)))
        .bind(vt.usage_count)
        .bind(&vt.merged_into)
        .bind(vt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_history(&self, type_name: &str, action: &str, detail: &str) -> KgResult<()> {
        sqlx::query(
            "INSERT INTO vocabulary_history (type_name, action, detail, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(type_name)
        .bind(action)
        .bind(detail)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Uppercase snake-case normalization for type names.
pub fn normalize_type_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = true;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_uppercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Classic Levenshtein distance, adequate for short type names.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Argmax cosine against the category seeds; ambiguous when the runner-up
/// is within `AMBIGUITY_RATIO` of the winner.
fn categorize(seeds: &HashMap<String, Vec<f32>>, vector: &[f32]) -> (String, bool) {
    let mut scored: Vec<(f32, &str)> = seeds
        .iter()
        .map(|(name, seed)| (cosine_similarity(vector, seed), name.as_str()))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    match scored.as_slice() {
        [] => ("Meta".to_string(), true),
        [(_, winner)] => (winner.to_string(), false),
        [(ws, winner), (rs, _), ..] => {
            let ambiguous = *ws <= 0.0 || *rs >= AMBIGUITY_RATIO * *ws;
            (winner.to_string(), ambiguous)
        }
    }
}

/// Merge direction: prefer deactivating the non-builtin, lower-usage side.
fn pick_direction<'a>(a: &'a VocabularyType, b: &'a VocabularyType) -> (&'a str, &'a str) {
    if a.builtin != b.builtin {
        if a.builtin {
            (b.name.as_str(), a.name.as_str())
        } else {
            (a.name.as_str(), b.name.as_str())
        }
    } else if a.usage_count <= b.usage_count {
        (a.name.as_str(), b.name.as_str())
    } else {
        (b.name.as_str(), a.name.as_str())
    }
}

/// Order-independent key for the rejected-pair set.
fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_spacing_and_case() {
        assert_eq!(normalize_type_name("leads to"), "LEADS_TO");
        assert_eq!(normalize_type_name("  is-a  "), "IS_A");
        assert_eq!(normalize_type_name("CAUSES"), "CAUSES");
        assert_eq!(normalize_type_name("causes!!"), "CAUSES");
        assert_eq!(normalize_type_name(""), "");
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("CAUSES", "CAUSES"), 0);
        assert_eq!(edit_distance("CAUSES", "CAUSED"), 1);
        assert_eq!(edit_distance("CAUSES", "CAUSE"), 1);
        assert_eq!(edit_distance("IMPLIES", "REFUTES"), 5);
    }

    #[test]
    fn zone_bands() {
        assert_eq!(Zone::from_size(30), Zone::Optimal);
        assert_eq!(Zone::from_size(90), Zone::Optimal);
        assert_eq!(Zone::from_size(91), Zone::Mixed);
        assert_eq!(Zone::from_size(120), Zone::Mixed);
        assert_eq!(Zone::from_size(121), Zone::TooLarge);
        assert_eq!(Zone::from_size(200), Zone::TooLarge);
        assert_eq!(Zone::from_size(201), Zone::Critical);
    }

    #[test]
    fn builtin_seed_is_complete() {
        assert_eq!(BUILTIN_TYPES.len(), 30);
        let categories: HashSet<&str> = BUILTIN_TYPES.iter().map(|(_, c)| *c).collect();
        assert_eq!(categories.len(), 8);
        for (_, c) in BUILTIN_TYPES {
            assert!(CATEGORIES.contains(c));
        }
    }

    #[test]
    fn pick_direction_protects_builtins() {
        let mk = |name: &str, builtin: bool, usage: i64| VocabularyType {
            name: name.to_string(),
            active: true,
            builtin,
            category: "Causal".into(),
            ambiguous: false,
            embedding: None,
            usage_count: usage,
            merged_into: None,
            created_at: 0,
        };
        let builtin = mk("CAUSES", true, 2);
        let custom = mk("LEADS_TO", false, 100);
        assert_eq!(pick_direction(&builtin, &custom), ("LEADS_TO", "CAUSES"));
        assert_eq!(pick_direction(&custom, &builtin), ("LEADS_TO", "CAUSES"));

        let a = mk("A", false, 1);
        let b = mk("B", false, 5);
        assert_eq!(pick_direction(&a, &b), ("A", "B"));
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key("X", "Y"), pair_key("Y", "X"));
    }
}
