//! Concept matcher: reuse-vs-create decisions for extracted candidates.
//!
//! Given a candidate (label + description + search terms), the matcher
//! embeds it, searches the candidate's ontology for concepts above the
//! match threshold, and reuses the highest-similarity hit. Reuse appends
//! any new search terms but never overwrites the existing description.
//! When nothing matches, a new concept is created under its content-hashed
//! identifier.
//!
//! Determinism under concurrency comes from the idempotent create: two
//! workers racing on the same candidate resolve to the same id because the
//! id is a content hash and the facade's create is insert-or-ignore.

use crate::embedding::EmbeddingProvider;
use crate::error::KgResult;
use crate::extractor::ExtractedConcept;
use crate::graph::GraphStore;
use crate::models::Concept;

/// How many candidates the similarity search considers before picking the
/// best; only the top hit is used, the margin is for tie diagnostics.
const SEARCH_TOP_K: usize = 5;

/// Outcome of a match-or-create call.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub concept_id: String,
    pub reused: bool,
    /// Similarity to the reused concept; `None` for creations.
    pub similarity: Option<f32>,
}

/// Text handed to the embedder for a candidate: label, description, and
/// search terms in one string, so all three contribute to the vector.
pub fn candidate_text(candidate: &ExtractedConcept) -> String {
    let mut text = candidate.label.clone();
    if !candidate.description.is_empty() {
        text.push_str(". ");
        text.push_str(&candidate.description);
    }
    if !candidate.search_terms.is_empty() {
        text.push_str(". ");
        text.push_str(&candidate.search_terms.join(", "));
    }
    text
}

/// Resolve a candidate against the graph: reuse an existing concept above
/// `threshold` or create a new one.
pub async fn match_or_create(
    graph: &GraphStore,
    embedder: &dyn EmbeddingProvider,
    candidate: &ExtractedConcept,
    ontology: &str,
    threshold: f32,
) -> KgResult<MatchOutcome> {
    let embedding = embedder.embed_text(&candidate_text(candidate)).await?;
    match_or_create_embedded(graph, candidate, &embedding, ontology, threshold).await
}

/// Variant taking a pre-computed embedding, used by the ingestion worker
/// which embeds all of a chunk's candidates in one batch.
pub async fn match_or_create_embedded(
    graph: &GraphStore,
    candidate: &ExtractedConcept,
    embedding: &[f32],
    ontology: &str,
    threshold: f32,
) -> KgResult<MatchOutcome> {
    let scope = [ontology.to_string()];
    let hits = graph
        .vector_search(embedding, Some(&scope), SEARCH_TOP_K, threshold)
        .await?;

    if let Some((existing_id, similarity)) = hits.first() {
        if !candidate.search_terms.is_empty() {
            graph
                .append_search_terms(existing_id, &candidate.search_terms)
                .await?;
        }
        return Ok(MatchOutcome {
            concept_id: existing_id.clone(),
            reused: true,
            similarity: Some(*similarity),
        });
    }

    let concept = Concept {
        id: Concept::make_id(&candidate.label, ontology),
        label: candidate.label.clone(),
        description: candidate.description.clone(),
        search_terms: candidate.search_terms.clone(),
        embedding: embedding.to_vec(),
        ontology: ontology.to_string(),
        created_at: chrono::Utc::now().timestamp(),
    };
    let created = graph.create_concept(&concept).await?;

    Ok(MatchOutcome {
        concept_id: concept.id,
        // A lost insert race still resolves to the same content-hashed id.
        reused: !created,
        similarity: None,
    })
}
