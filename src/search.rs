//! Query engine: semantic concept search and concept-centric lookups.
//!
//! Search embeds the query text, runs a bounded vector search scoped to the
//! caller's ontologies, and optionally annotates the surviving top-K hits
//! with grounding scores and evidence quotes — grounding is computed
//! post-filter, never over the whole graph. Concept details, neighborhood
//! listing, and pole-to-pole connection reuse the same building blocks.
//!
//! Empty queries and empty result sets are ordinary outcomes, not errors.

use serde::Serialize;

use crate::core::Core;
use crate::error::{KgError, KgResult};
use crate::grounding::compute_grounding;
use crate::models::Concept;
use crate::pathfind::{shortest_path, PathBudget, PathQuery, PathResult};

/// Client-facing concept shape; embeddings stay server-side.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptSummary {
    pub id: String,
    pub label: String,
    pub description: String,
    pub search_terms: Vec<String>,
    pub ontology: String,
}

impl From<&Concept> for ConceptSummary {
    fn from(c: &Concept) -> Self {
        Self {
            id: c.id.clone(),
            label: c.label.clone(),
            description: c.description.clone(),
            search_terms: c.search_terms.clone(),
            ontology: c.ontology.clone(),
        }
    }
}

/// One evidence quote backing a concept.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceItem {
    pub source_id: String,
    pub document_id: String,
    pub quote: String,
}

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptHit {
    pub concept: ConceptSummary,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<EvidenceItem>>,
}

/// Search parameters, mirroring the `/query/search` request body.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub limit: usize,
    pub min_similarity: f32,
    pub ontologies: Option<Vec<String>>,
    pub include_grounding: bool,
    pub include_evidence: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: 10,
            min_similarity: 0.3,
            ontologies: None,
            include_grounding: false,
            include_evidence: false,
        }
    }
}

const EVIDENCE_LIMIT: i64 = 5;

/// Semantic concept search.
pub async fn search_concepts(core: &Core, params: &SearchParams) -> KgResult<Vec<ConceptHit>> {
    if params.query.trim().is_empty() {
        return Ok(Vec::new());
    }
    if params.limit == 0 {
        return Ok(Vec::new());
    }

    let embedder = core.embedder().await;
    let query_vector = embedder.embed_text(&params.query).await?;

    let hits = core
        .graph
        .vector_search(
            &query_vector,
            params.ontologies.as_deref(),
            params.limit,
            params.min_similarity,
        )
        .await?;
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
    let concepts = core.graph.get_concepts(&ids).await?;

    // Grounding only over the post-filter top K.
    let grounding = if params.include_grounding {
        Some(compute_grounding(&core.graph, &ids).await?)
    } else {
        None
    };

    let mut results = Vec::with_capacity(hits.len());
    for (id, similarity) in &hits {
        let Some(concept) = concepts.iter().find(|c| &c.id == id) else {
            continue;
        };
        let evidence = if params.include_evidence {
            let rows = core.graph.evidence_for_concept(id, EVIDENCE_LIMIT).await?;
            Some(
                rows.into_iter()
                    .map(|(inst, source)| EvidenceItem {
                        source_id: inst.source_id,
                        document_id: source.document_id,
                        quote: inst.quote,
                    })
                    .collect(),
            )
        } else {
            None
        };
        results.push(ConceptHit {
            concept: ConceptSummary::from(concept),
            similarity: *similarity,
            grounding: grounding.as_ref().map(|g| g[id]),
            evidence,
        });
    }
    Ok(results)
}

/// One edge in a concept's neighborhood, labeled for display.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedEdge {
    pub from_id: String,
    pub from_label: String,
    pub to_id: String,
    pub to_label: String,
    pub type_name: String,
    pub confidence: f64,
    pub evidence_count: usize,
}

/// Full detail view for one concept.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptDetails {
    pub concept: ConceptSummary,
    pub grounding: f64,
    pub evidence: Vec<EvidenceItem>,
    pub relationships: Vec<RelatedEdge>,
}

pub async fn concept_details(core: &Core, id: &str) -> KgResult<ConceptDetails> {
    let concept = core
        .graph
        .get_concept(id)
        .await?
        .ok_or_else(|| KgError::NotFound(format!("concept {}", id)))?;

    let ids = vec![id.to_string()];
    let grounding = compute_grounding(&core.graph, &ids).await?[id];

    let evidence = core
        .graph
        .evidence_for_concept(id, EVIDENCE_LIMIT)
        .await?
        .into_iter()
        .map(|(inst, source)| EvidenceItem {
            source_id: inst.source_id,
            document_id: source.document_id,
            quote: inst.quote,
        })
        .collect();

    let relationships = labeled_relationships(core, &ids).await?;

    Ok(ConceptDetails {
        concept: ConceptSummary::from(&concept),
        grounding,
        evidence,
        relationships,
    })
}

/// One-hop neighborhood of a concept, labeled.
pub async fn related_concepts(core: &Core, id: &str) -> KgResult<Vec<RelatedEdge>> {
    if core.graph.get_concept(id).await?.is_none() {
        return Err(KgError::NotFound(format!("concept {}", id)));
    }
    labeled_relationships(core, &[id.to_string()]).await
}

async fn labeled_relationships(core: &Core, ids: &[String]) -> KgResult<Vec<RelatedEdge>> {
    let rels = core.graph.relationships_for(ids).await?;
    let mut endpoint_ids: Vec<String> = Vec::new();
    for r in &rels {
        endpoint_ids.push(r.from_id.clone());
        endpoint_ids.push(r.to_id.clone());
    }
    endpoint_ids.sort();
    endpoint_ids.dedup();
    let concepts = core.graph.get_concepts(&endpoint_ids).await?;
    let label_of = |id: &str| {
        concepts
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.label.clone())
            .unwrap_or_default()
    };

    Ok(rels
        .into_iter()
        .map(|r| RelatedEdge {
            from_label: label_of(&r.from_id),
            to_label: label_of(&r.to_id),
            from_id: r.from_id,
            to_id: r.to_id,
            type_name: r.type_name,
            confidence: r.confidence,
            evidence_count: r.evidence.len(),
        })
        .collect())
}

/// A path with display labels attached.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionResult {
    pub path: Option<Vec<ConceptSummary>>,
    pub hops: usize,
    pub budget_exceeded: bool,
}

/// Shortest connection between two known concepts.
pub async fn connect(
    core: &Core,
    from_id: &str,
    to_id: &str,
    max_hops: Option<usize>,
) -> KgResult<ConnectionResult> {
    for id in [from_id, to_id] {
        if core.graph.get_concept(id).await?.is_none() {
            return Err(KgError::NotFound(format!("concept {}", id)));
        }
    }

    let query = PathQuery {
        from: from_id.to_string(),
        to: to_id.to_string(),
        max_hops: max_hops.unwrap_or(core.config.limits.max_hops),
        directed: false,
        type_filter: None,
    };
    let budget = PathBudget {
        frontier_cap: core.config.limits.frontier_cap,
        timeout: std::time::Duration::from_secs(core.config.limits.pathfind_timeout_secs),
        neighbor_timeout: std::time::Duration::from_secs(core.config.limits.neighbor_timeout_secs),
    };
    let result = shortest_path(&core.graph, &query, &budget).await?;
    label_path(core, result).await
}

async fn label_path(core: &Core, result: PathResult) -> KgResult<ConnectionResult> {
    let path = match result.path {
        Some(ids) => {
            let concepts = core.graph.get_concepts(&ids).await?;
            Some(
                ids.iter()
                    .filter_map(|id| concepts.iter().find(|c| &c.id == id))
                    .map(ConceptSummary::from)
                    .collect(),
            )
        }
        None => None,
    };
    Ok(ConnectionResult {
        path,
        hops: result.hops,
        budget_exceeded: result.budget_exceeded,
    })
}

/// Search both endpoint queries, then connect the best pole pair.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectBySearchResult {
    pub from: ConceptSummary,
    pub to: ConceptSummary,
    pub connection: ConnectionResult,
}

pub async fn connect_by_search(
    core: &Core,
    from_query: &str,
    to_query: &str,
    max_hops: Option<usize>,
    min_similarity: f32,
    ontologies: Option<Vec<String>>,
) -> KgResult<Option<ConnectBySearchResult>> {
    let params = |q: &str| SearchParams {
        query: q.to_string(),
        limit: 1,
        min_similarity,
        ontologies: ontologies.clone(),
        include_grounding: false,
        include_evidence: false,
    };

    let from_hits = search_concepts(core, &params(from_query)).await?;
    let to_hits = search_concepts(core, &params(to_query)).await?;
    let (Some(from), Some(to)) = (from_hits.first(), to_hits.first()) else {
        return Ok(None);
    };

    let connection = connect(core, &from.concept.id, &to.concept.id, max_hops).await?;
    Ok(Some(ConnectBySearchResult {
        from: from.concept.clone(),
        to: to.concept.clone(),
        connection,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::test_core;
    use crate::ingest::{self, IngestContent, IngestRequest};

    async fn ingest_text(core: &std::sync::Arc<Core>, filename: &str, text: &str) {
        let job = ingest::submit(
            core,
            "tester",
            IngestRequest {
                ontology: "Philosophy".into(),
                filename: filename.into(),
                content: IngestContent::Text(text.into()),
                force_reingest: false,
                auto_approve: true,
                target_words: None,
                overlap_words: None,
            },
        )
        .await
        .unwrap();
        let claimed = core.jobs.claim_next().await.unwrap().unwrap();
        ingest::run_job(core, &claimed).await;
        assert_eq!(
            core.jobs.get(&job.id).await.unwrap().status,
            crate::models::JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn empty_query_returns_empty() {
        let (_tmp, core) = test_core().await;
        let hits = search_concepts(
            &core,
            &SearchParams {
                query: "   ".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_finds_ingested_concepts() {
        let (_tmp, core) = test_core().await;
        ingest_text(
            &core,
            "l1.md",
            "Meditation quiets the mind. Meditation dissolves the Ego.",
        )
        .await;

        let hits = search_concepts(
            &core,
            &SearchParams {
                query: "Meditation".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].concept.label, "Meditation");
        assert!(hits[0].grounding.is_none());
    }

    #[tokio::test]
    async fn grounding_and_evidence_are_optional_annotations() {
        let (_tmp, core) = test_core().await;
        ingest_text(
            &core,
            "l1.md",
            "Meditation quiets the mind. Meditation dissolves the Ego.",
        )
        .await;

        let hits = search_concepts(
            &core,
            &SearchParams {
                query: "Meditation".into(),
                include_grounding: true,
                include_evidence: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let top = &hits[0];
        assert!(top.grounding.is_some());
        let evidence = top.evidence.as_ref().unwrap();
        assert!(!evidence.is_empty());
        assert!(evidence[0].quote.contains("Meditation"));
    }

    #[tokio::test]
    async fn details_round_trip() {
        let (_tmp, core) = test_core().await;
        ingest_text(&core, "l1.md", "Meditation dissolves the Ego.").await;

        let hits = search_concepts(
            &core,
            &SearchParams {
                query: "Meditation".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let id = &hits[0].concept.id;

        let details = concept_details(&core, id).await.unwrap();
        assert_eq!(details.concept.label, "Meditation");
        assert!(!details.evidence.is_empty());
        assert!(!details.relationships.is_empty());
        assert!(details
            .relationships
            .iter()
            .all(|r| !r.from_label.is_empty() && !r.to_label.is_empty()));
    }

    #[tokio::test]
    async fn details_of_missing_concept_is_not_found() {
        let (_tmp, core) = test_core().await;
        assert!(matches!(
            concept_details(&core, "c_missing").await.unwrap_err(),
            KgError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn connect_by_search_links_two_queries() {
        let (_tmp, core) = test_core().await;
        ingest_text(
            &core,
            "l1.md",
            "Meditation dissolves the Ego. The Ego resists Nirvana.",
        )
        .await;

        let result = connect_by_search(&core, "Meditation", "Nirvana", Some(4), 0.2, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.from.label, "Meditation");
        assert_eq!(result.to.label, "Nirvana");
        let path = result.connection.path.unwrap();
        assert!(path.len() >= 2);
        assert_eq!(path.first().unwrap().label, "Meditation");
        assert_eq!(path.last().unwrap().label, "Nirvana");
    }

    #[tokio::test]
    async fn connect_by_search_with_no_match_is_none() {
        let (_tmp, core) = test_core().await;
        let result = connect_by_search(&core, "anything", "nothing", None, 0.5, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
