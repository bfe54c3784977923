//! Ingestion pipeline: submission and the per-job worker.
//!
//! Submission validates the request, deduplicates by content hash, stores
//! the raw bytes in the object store, computes a pre-flight cost estimate,
//! and enqueues a job. Nothing touches the graph until a worker picks the
//! approved job up.
//!
//! The worker drives each chunk through the full step sequence: chunk →
//! extract (with the current vocabulary snapshot) → embed candidates in one
//! batch → match-or-create each concept → submit instances → resolve edge
//! types → upsert edges with this chunk's source id appended as evidence.
//! Chunks run serially by default so later chunks can reuse concepts
//! created by earlier ones; parallel mode trades reuse rate for throughput
//! and leans on the matcher's content-hash create for collision safety.
//!
//! Failure model: a chunk that keeps failing after the retry budget is
//! recorded in the job's error list and skipped — the job can still
//! complete. Cancellation is observed between chunks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunker::chunk_text;
use crate::core::Core;
use crate::error::{KgError, KgResult};
use crate::extractor::Extraction;
use crate::matcher;
use crate::models::{CostEstimate, Document, Instance, Job, JobProgress, JobStatus, Relationship, Source};

/// Retry budget for a failing chunk before it is skipped.
const CHUNK_RETRIES: u32 = 3;

/// Chunk fan-out in parallel mode.
const PARALLEL_CHUNK_WIDTH: usize = 4;

/// Rough tokens-per-word ratio for pre-flight estimates.
const TOKENS_PER_WORD: f64 = 1.3;

/// Estimated completion tokens per chunk.
const EST_TOKENS_OUT_PER_CHUNK: u64 = 500;

/// Job parameters persisted with every ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestParams {
    pub filename: String,
    pub content_type: String,
    pub mime: String,
    pub object_key: String,
    pub document_id: String,
    pub force_reingest: bool,
    pub target_words: usize,
    pub overlap_words: usize,
}

/// A text or image ingestion request before submission.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub ontology: String,
    pub filename: String,
    pub content: IngestContent,
    pub force_reingest: bool,
    pub auto_approve: bool,
    pub target_words: Option<usize>,
    pub overlap_words: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum IngestContent {
    Text(String),
    Image { bytes: Vec<u8>, mime: String },
}

/// Validate, deduplicate, estimate, and enqueue an ingestion job.
pub async fn submit(core: &Core, principal: &str, request: IngestRequest) -> KgResult<Job> {
    if request.ontology.trim().is_empty() {
        return Err(KgError::Validation("ontology must not be empty".into()));
    }
    if request.filename.trim().is_empty() {
        return Err(KgError::Validation("filename must not be empty".into()));
    }

    let (bytes, content_type, mime) = match &request.content {
        IngestContent::Text(text) => {
            if text.trim().is_empty() {
                return Err(KgError::Validation("document text is empty".into()));
            }
            (text.as_bytes().to_vec(), "text", "text/plain".to_string())
        }
        IngestContent::Image { bytes, mime } => {
            if bytes.is_empty() {
                return Err(KgError::Validation("image payload is empty".into()));
            }
            (bytes.clone(), "image", mime.clone())
        }
    };

    let document_id = Document::make_id(&bytes);
    if !request.force_reingest {
        if let Some(existing) = core.graph.get_document(&document_id).await? {
            return Err(KgError::Conflict(format!(
                "content already ingested as {} ({}); set force_reingest to reprocess",
                existing.id, existing.filename
            )));
        }
        if let Some(job_id) = core.jobs.find_active_for_document(&document_id).await? {
            return Err(KgError::Conflict(format!(
                "content is already queued as job {}",
                job_id
            )));
        }
    }

    let object_key = core.objects.put(&bytes)?;

    let target_words = request
        .target_words
        .unwrap_or(core.config.chunking.target_words);
    let overlap_words = request
        .overlap_words
        .unwrap_or(core.config.chunking.overlap_words)
        .min(target_words.saturating_sub(1));

    let (job_type, estimate) = match &request.content {
        IngestContent::Text(text) => {
            let chunks = chunk_text(text, target_words, overlap_words);
            let words: Vec<usize> = chunks
                .iter()
                .map(|c| c.text.split_whitespace().count())
                .collect();
            ("ingest_text", estimate_cost(core, &words))
        }
        IngestContent::Image { .. } => (
            "ingest_image",
            CostEstimate {
                chunks: 1,
                est_tokens_in: 0,
                est_tokens_out: 0,
                est_cost_usd: 0.0,
            },
        ),
    };

    let params = IngestParams {
        filename: request.filename,
        content_type: content_type.to_string(),
        mime,
        object_key,
        document_id,
        force_reingest: request.force_reingest,
        target_words,
        overlap_words,
    };

    core.jobs
        .submit(
            job_type,
            principal,
            &request.ontology,
            serde_json::to_value(&params)?,
            Some(estimate),
            request.auto_approve,
            core.config.jobs.pending_deadline_hours,
        )
        .await
}

fn estimate_cost(core: &Core, chunk_words: &[usize]) -> CostEstimate {
    let est_tokens_in: u64 = chunk_words
        .iter()
        .map(|w| (*w as f64 * TOKENS_PER_WORD) as u64)
        .sum();
    let est_tokens_out = EST_TOKENS_OUT_PER_CHUNK * chunk_words.len() as u64;
    let price = &core.config.extraction;
    CostEstimate {
        chunks: chunk_words.len(),
        est_tokens_in,
        est_tokens_out,
        est_cost_usd: est_tokens_in as f64 / 1000.0 * price.price_per_1k_in
            + est_tokens_out as f64 / 1000.0 * price.price_per_1k_out,
    }
}

/// Drive one claimed job to a terminal state. Never returns an error: every
/// failure path lands in the job record.
pub async fn run_job(core: &Arc<Core>, job: &Job) {
    let outcome = match job.job_type.as_str() {
        "ingest_text" => run_text_job(core, job).await,
        "ingest_image" => run_image_job(core, job).await,
        "rebuild_embeddings" => run_rebuild_job(core, job).await,
        other => Err(KgError::Validation(format!("unknown job type '{}'", other))),
    };

    if let Err(e) = outcome {
        let (status, message) = match e {
            KgError::Cancelled => (JobStatus::Cancelled, "cancelled".to_string()),
            other => (JobStatus::Failed, other.to_string()),
        };
        let current = core.jobs.get(&job.id).await;
        let (progress, mut errors) = match current {
            Ok(j) => (j.progress, j.errors),
            Err(_) => (JobProgress::default(), Vec::new()),
        };
        if status == JobStatus::Failed {
            errors.push(message.clone());
            tracing::error!(job_id = %job.id, error = %message, "job failed");
        }
        let _ = core
            .jobs
            .finish(&job.id, status, &progress, &errors, None)
            .await;
    }
}

async fn run_text_job(core: &Arc<Core>, job: &Job) -> KgResult<()> {
    let params: IngestParams = serde_json::from_value(job.params.clone())?;
    let bytes = core.objects.get(&params.object_key)?;
    let text = String::from_utf8(bytes)
        .map_err(|_| KgError::Validation("document is not valid UTF-8".into()))?;

    ensure_document(core, job, &params).await?;

    let chunks = chunk_text(&text, params.target_words, params.overlap_words);
    let mut progress = JobProgress {
        chunks_total: chunks.len(),
        ..Default::default()
    };
    let mut errors: Vec<String> = Vec::new();

    if core.config.jobs.parallel_chunks {
        run_chunks_parallel(core, job, &params, &chunks, &mut progress, &mut errors).await?;
    } else {
        for chunk in &chunks {
            if core.jobs.is_cancel_requested(&job.id).await? {
                core.jobs
                    .finish(&job.id, JobStatus::Cancelled, &progress, &errors, None)
                    .await?;
                return Ok(());
            }
            match process_chunk_with_retries(core, job, &params, chunk).await {
                Ok(stats) => merge_chunk_stats(&mut progress, &stats),
                Err(KgError::Cancelled) => return Err(KgError::Cancelled),
                Err(e) => {
                    errors.push(format!("chunk {}: {}", chunk.chunk_index, e));
                    tracing::warn!(
                        job_id = %job.id,
                        chunk = chunk.chunk_index,
                        error = %e,
                        "chunk skipped after retries"
                    );
                }
            }
            progress.chunks_done += 1;
            progress.cost_usd = actual_cost(core, &progress);
            core.jobs.update_progress(&job.id, &progress, &errors).await?;
        }
    }

    let result = serde_json::json!({
        "document_id": params.document_id,
        "chunks": progress.chunks_total,
        "concepts_created": progress.concepts_created,
        "concepts_reused": progress.concepts_reused,
    });
    core.jobs
        .finish(&job.id, JobStatus::Completed, &progress, &errors, Some(result))
        .await?;
    Ok(())
}

/// Parallel mode: fan chunks out in bounded waves. Concept reuse between
/// co-running chunks is best-effort; the content-hash create keeps the
/// graph consistent when two chunks discover the same concept.
async fn run_chunks_parallel(
    core: &Arc<Core>,
    job: &Job,
    params: &IngestParams,
    chunks: &[crate::chunker::ChunkPiece],
    progress: &mut JobProgress,
    errors: &mut Vec<String>,
) -> KgResult<()> {
    for wave in chunks.chunks(PARALLEL_CHUNK_WIDTH) {
        if core.jobs.is_cancel_requested(&job.id).await? {
            core.jobs.update_progress(&job.id, progress, errors).await?;
            return Err(KgError::Cancelled);
        }

        let mut handles = Vec::with_capacity(wave.len());
        for chunk in wave {
            let core = Arc::clone(core);
            let job = job.clone();
            let params = params.clone();
            let chunk = chunk.clone();
            handles.push(tokio::spawn(async move {
                let index = chunk.chunk_index;
                (index, process_chunk_with_retries(&core, &job, &params, &chunk).await)
            }));
        }

        for handle in handles {
            let (index, outcome) = handle
                .await
                .map_err(|e| KgError::Internal(format!("chunk task panicked: {}", e)))?;
            match outcome {
                Ok(stats) => merge_chunk_stats(progress, &stats),
                Err(e) => errors.push(format!("chunk {}: {}", index, e)),
            }
            progress.chunks_done += 1;
        }
        progress.cost_usd = actual_cost(core, progress);
        core.jobs.update_progress(&job.id, progress, errors).await?;
    }
    Ok(())
}

/// Create the document row, tolerating a force re-ingest of known content.
async fn ensure_document(core: &Core, job: &Job, params: &IngestParams) -> KgResult<()> {
    let doc = Document {
        id: params.document_id.clone(),
        filename: params.filename.clone(),
        ontology: job.ontology.clone(),
        content_type: params.content_type.clone(),
        mime: params.mime.clone(),
        size_bytes: core.objects.get(&params.object_key)?.len() as i64,
        object_key: Some(params.object_key.clone()),
        ingested_at: chrono::Utc::now().timestamp(),
    };
    match core.graph.create_document(&doc).await {
        Ok(()) => Ok(()),
        Err(KgError::Conflict(_)) if params.force_reingest => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default)]
struct ChunkStats {
    concepts_created: usize,
    concepts_reused: usize,
    instances_created: usize,
    edges_created: usize,
    new_types_created: usize,
    tokens_in: u64,
    tokens_out: u64,
}

fn merge_chunk_stats(progress: &mut JobProgress, stats: &ChunkStats) {
    progress.concepts_created += stats.concepts_created;
    progress.concepts_reused += stats.concepts_reused;
    progress.instances_created += stats.instances_created;
    progress.edges_created += stats.edges_created;
    progress.new_types_created += stats.new_types_created;
    progress.tokens_in += stats.tokens_in;
    progress.tokens_out += stats.tokens_out;
}

fn actual_cost(core: &Core, progress: &JobProgress) -> f64 {
    let price = &core.config.extraction;
    progress.tokens_in as f64 / 1000.0 * price.price_per_1k_in
        + progress.tokens_out as f64 / 1000.0 * price.price_per_1k_out
}

async fn process_chunk_with_retries(
    core: &Arc<Core>,
    job: &Job,
    params: &IngestParams,
    chunk: &crate::chunker::ChunkPiece,
) -> KgResult<ChunkStats> {
    let mut last_err: Option<KgError> = None;
    for attempt in 0..CHUNK_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(4))).await;
        }
        match process_chunk(core, job, params, chunk).await {
            Ok(stats) => return Ok(stats),
            Err(e) if e.is_retryable() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| KgError::transient("chunk failed after retries")))
}

/// One chunk through the full pipeline: extract, embed, match, attest, link.
async fn process_chunk(
    core: &Arc<Core>,
    job: &Job,
    params: &IngestParams,
    chunk: &crate::chunker::ChunkPiece,
) -> KgResult<ChunkStats> {
    let mut stats = ChunkStats::default();
    let embedder = core.embedder().await;
    let extractor = core.extractor().await;

    // The source row is idempotent on (document, index); re-ingest with
    // force lands on the same id.
    let source = Source {
        id: Source::make_id(&params.document_id, chunk.chunk_index),
        text: chunk.text.clone(),
        chunk_index: chunk.chunk_index,
        document_id: params.document_id.clone(),
        object_key: None,
        ontology: job.ontology.clone(),
    };
    core.graph.create_source(&source).await?;

    // Extraction against the current vocabulary snapshot.
    let vocabulary = core.vocabulary.active_names().await;
    let extraction: Extraction = extractor.extract(&chunk.text, &vocabulary).await?;
    stats.tokens_in += extraction.tokens_in;
    stats.tokens_out += extraction.tokens_out;

    // One embedding batch for every candidate in the chunk.
    let texts: Vec<String> = extraction
        .concepts
        .iter()
        .map(matcher::candidate_text)
        .collect();
    let vectors = embedder.embed_batch(&texts).await?;

    // Match or create; build the chunk-local label → id map. The optional
    // per-ontology lock serializes the read-create window across chunks.
    let threshold = core.config.matching.threshold_for(&job.ontology);
    let lock = if core.config.matching.serialize_per_ontology {
        Some(core.ontology_lock(&job.ontology).await)
    } else {
        None
    };
    let guard = match &lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let mut label_to_id: HashMap<&str, String> = HashMap::new();
    for (candidate, vector) in extraction.concepts.iter().zip(&vectors) {
        let outcome = matcher::match_or_create_embedded(
            &core.graph,
            candidate,
            vector,
            &job.ontology,
            threshold,
        )
        .await?;
        if outcome.reused {
            stats.concepts_reused += 1;
        } else {
            stats.concepts_created += 1;
        }
        label_to_id.insert(candidate.label.as_str(), outcome.concept_id);
    }
    drop(guard);

    // Instances, deduplicated by (concept, source).
    let instances: Vec<Instance> = extraction
        .instances
        .iter()
        .filter_map(|inst| {
            label_to_id.get(inst.concept_label.as_str()).map(|id| Instance {
                concept_id: id.clone(),
                source_id: source.id.clone(),
                quote: inst.quote.clone(),
            })
        })
        .collect();
    stats.instances_created += core.graph.add_instances(&instances).await? as usize;

    // Relationships: resolve each type through the vocabulary (which may
    // create one), then upsert the edge with this source as evidence.
    let now = chrono::Utc::now().timestamp();
    for rel in &extraction.relationships {
        let (Some(from_id), Some(to_id)) = (
            label_to_id.get(rel.from_label.as_str()),
            label_to_id.get(rel.to_label.as_str()),
        ) else {
            continue;
        };

        let resolved = core
            .vocabulary
            .resolve_type(&rel.type_name, embedder.as_ref())
            .await?;
        if resolved.created {
            stats.new_types_created += 1;
        }

        let edge = Relationship {
            id: Relationship::make_id(from_id, to_id, &resolved.name),
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            type_name: resolved.name.clone(),
            confidence: rel.confidence.unwrap_or(1.0),
            evidence: vec![source.id.clone()],
            created_at: now,
        };
        if core.graph.upsert_edge(&edge).await? {
            stats.edges_created += 1;
        }
        core.vocabulary.record_usage(&resolved.name).await?;
    }

    Ok(stats)
}

async fn run_image_job(core: &Arc<Core>, job: &Job) -> KgResult<()> {
    let params: IngestParams = serde_json::from_value(job.params.clone())?;
    let bytes = core.objects.get(&params.object_key)?;

    ensure_document(core, job, &params).await?;

    // Vision embedding validates the provider can see the image; the
    // source row carries the object key for later retrieval.
    let embedder = core.embedder().await;
    let _vector = embedder.embed_image(&bytes).await?;

    let source = Source {
        id: Source::make_id(&params.document_id, 0),
        text: format!("[image] {}", params.filename),
        chunk_index: 0,
        document_id: params.document_id.clone(),
        object_key: Some(params.object_key.clone()),
        ontology: job.ontology.clone(),
    };
    core.graph.create_source(&source).await?;

    let progress = JobProgress {
        chunks_total: 1,
        chunks_done: 1,
        ..Default::default()
    };
    let result = serde_json::json!({
        "document_id": params.document_id,
        "source_id": source.id,
    });
    core.jobs
        .finish(&job.id, JobStatus::Completed, &progress, &[], Some(result))
        .await?;
    Ok(())
}

/// Maintenance job: re-embed every concept and vocabulary type with the
/// embedding configuration named in the job params, then swap it active.
async fn run_rebuild_job(core: &Arc<Core>, job: &Job) -> KgResult<()> {
    let config: crate::config::EmbeddingConfig = serde_json::from_value(job.params.clone())?;
    let provider: Arc<dyn crate::embedding::EmbeddingProvider> =
        crate::embedding::create_provider(&config)?.into();

    let ids = core.graph.list_concept_ids(None).await?;
    let mut progress = JobProgress {
        chunks_total: ids.len(),
        ..Default::default()
    };

    for batch in ids.chunks(core.config.embedding.batch_size.max(1)) {
        if core.jobs.is_cancel_requested(&job.id).await? {
            return Err(KgError::Cancelled);
        }
        let concepts = core.graph.get_concepts(batch).await?;
        let texts: Vec<String> = concepts
            .iter()
            .map(|c| {
                let candidate = crate::extractor::ExtractedConcept {
                    label: c.label.clone(),
                    description: c.description.clone(),
                    search_terms: c.search_terms.clone(),
                };
                matcher::candidate_text(&candidate)
            })
            .collect();
        let vectors = provider.embed_batch(&texts).await?;
        for (concept, vector) in concepts.iter().zip(&vectors) {
            core.graph.rewrite_embedding(&concept.id, vector).await?;
        }
        progress.chunks_done += batch.len();
        core.jobs.update_progress(&job.id, &progress, &[]).await?;
    }

    core.swap_embedder_rebuilt(provider.clone()).await;
    core.vocabulary
        .generate_embeddings(provider.as_ref(), true)
        .await?;

    core.jobs
        .finish(
            &job.id,
            JobStatus::Completed,
            &progress,
            &[],
            Some(serde_json::json!({ "dims": provider.dims() })),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::test_core;

    fn text_request(ontology: &str, filename: &str, text: &str, auto: bool) -> IngestRequest {
        IngestRequest {
            ontology: ontology.into(),
            filename: filename.into(),
            content: IngestContent::Text(text.into()),
            force_reingest: false,
            auto_approve: auto,
            target_words: None,
            overlap_words: None,
        }
    }

    const LECTURE_ONE: &str = "\
Meditation quiets the restless mind. The Ego is an illusion sustained by \
thought. Meditation dissolves the Ego over time. Buddhism teaches that the \
Ego obstructs insight.";

    const LECTURE_TWO: &str = "\
Meditation opens the door to Nirvana. The Ego resists Nirvana with every \
habit. Buddhism frames Nirvana as the end of craving.";

    #[tokio::test]
    async fn submit_estimates_and_queues() {
        let (_tmp, core) = test_core().await;
        let job = submit(&core, "tester", text_request("Philosophy", "l1.md", LECTURE_ONE, false))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::AwaitingApproval);
        let estimate = job.cost_estimate.unwrap();
        assert_eq!(estimate.chunks, 1);
        assert!(estimate.est_tokens_in > 0);
    }

    #[tokio::test]
    async fn duplicate_content_conflicts_without_force() {
        let (_tmp, core) = test_core().await;
        submit(&core, "tester", text_request("Philosophy", "l1.md", LECTURE_ONE, true))
            .await
            .unwrap();
        let err = submit(&core, "tester", text_request("Philosophy", "copy.md", LECTURE_ONE, true))
            .await
            .unwrap_err();
        assert!(matches!(err, KgError::Conflict(_)));
    }

    async fn run_to_completion(core: &Arc<Core>, request: IngestRequest) -> Job {
        let job = submit(core, "tester", request).await.unwrap();
        let claimed = core.jobs.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        run_job(core, &claimed).await;
        core.jobs.get(&job.id).await.unwrap()
    }

    #[tokio::test]
    async fn text_job_builds_graph() {
        let (_tmp, core) = test_core().await;
        let job = run_to_completion(
            &core,
            text_request("Philosophy", "l1.md", LECTURE_ONE, true),
        )
        .await;

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.progress.concepts_created >= 3);
        assert!(job.progress.instances_created > 0);
        assert!(job.progress.edges_created > 0);
        assert!(job.progress.tokens_in > 0);

        let stats = core.graph.stats(Some("Philosophy")).await.unwrap();
        assert_eq!(stats.documents, 1);
        assert!(stats.concepts >= 3);
        assert!(stats.sources >= 1);
    }

    #[tokio::test]
    async fn second_document_reuses_shared_concepts() {
        let (_tmp, core) = test_core().await;
        let first = run_to_completion(
            &core,
            text_request("Philosophy", "l1.md", LECTURE_ONE, true),
        )
        .await;
        assert_eq!(first.progress.concepts_reused, 0);

        let second = run_to_completion(
            &core,
            text_request("Philosophy", "l2.md", LECTURE_TWO, true),
        )
        .await;

        // Meditation, Ego, Buddhism recur; Nirvana is new.
        assert!(second.progress.concepts_reused >= 2);
        assert!(second.progress.concepts_created >= 1);
    }

    #[tokio::test]
    async fn forced_reingest_is_concept_neutral() {
        let (_tmp, core) = test_core().await;
        let first = run_to_completion(
            &core,
            text_request("Philosophy", "l1.md", LECTURE_ONE, true),
        )
        .await;
        let concepts_before = core.graph.stats(None).await.unwrap().concepts;

        let mut again = text_request("Philosophy", "l1.md", LECTURE_ONE, true);
        again.force_reingest = true;
        let rerun = run_to_completion(&core, again).await;

        assert_eq!(rerun.status, JobStatus::Completed);
        assert_eq!(rerun.progress.concepts_created, 0);
        assert_eq!(
            rerun.progress.concepts_reused,
            first.progress.concepts_created + first.progress.concepts_reused
        );
        assert_eq!(core.graph.stats(None).await.unwrap().concepts, concepts_before);
    }

    #[tokio::test]
    async fn cancel_before_first_chunk_is_honored() {
        let (_tmp, core) = test_core().await;
        let job = submit(&core, "tester", text_request("Philosophy", "l1.md", LECTURE_ONE, true))
            .await
            .unwrap();
        let claimed = core.jobs.claim_next().await.unwrap().unwrap();
        core.jobs.cancel(&claimed.id).await.unwrap();

        run_job(&core, &claimed).await;
        let finished = core.jobs.get(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert_eq!(finished.progress.chunks_done, 0);
    }

    #[tokio::test]
    async fn new_edge_types_expand_the_vocabulary() {
        let (_tmp, core) = test_core().await;
        let before = core.vocabulary.status().await.active;
        let job = run_to_completion(
            &core,
            text_request("Philosophy", "l1.md", LECTURE_ONE, true),
        )
        .await;

        // The mock extractor emits ASSOCIATED_WITH, which is not builtin.
        assert!(job.progress.new_types_created >= 1);
        assert_eq!(
            core.vocabulary.status().await.active,
            before + job.progress.new_types_created
        );
    }

    #[tokio::test]
    async fn image_job_stores_source_with_object_key() {
        let (_tmp, core) = test_core().await;
        let request = IngestRequest {
            ontology: "Scans".into(),
            filename: "page1.png".into(),
            content: IngestContent::Image {
                bytes: vec![0x89, 0x50, 0x4e, 0x47, 1, 2, 3],
                mime: "image/png".into(),
            },
            force_reingest: false,
            auto_approve: true,
            target_words: None,
            overlap_words: None,
        };
        let job = run_to_completion(&core, request).await;
        assert_eq!(job.status, JobStatus::Completed);

        let source_id = job.result.unwrap()["source_id"].as_str().unwrap().to_string();
        let source = core.graph.get_source(&source_id).await.unwrap().unwrap();
        assert!(source.object_key.is_some());
        assert_eq!(
            core.objects.get(source.object_key.as_ref().unwrap()).unwrap(),
            vec![0x89, 0x50, 0x4e, 0x47, 1, 2, 3]
        );
    }
}
