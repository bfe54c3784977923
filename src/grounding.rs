//! Grounding calculator: evidence balance for a concept.
//!
//! Grounding strength is a scalar in roughly [-1, +1] derived on demand
//! from a concept's edges. Edges of supportive types add their evidence
//! counts to the affirmative side, refutative types to the contradictory
//! side, and the score is the smoothed normalized difference. Both
//! directions count: being supported and supporting both indicate the
//! concept is evidentially grounded.
//!
//! Scores are computed per request over a batch of concept ids; the
//! returned map doubles as the per-query cache. Nothing is persisted.

use std::collections::HashMap;

use crate::error::KgResult;
use crate::graph::GraphStore;

/// Edge types whose evidence counts toward the affirmative side.
pub const SUPPORTIVE_TYPES: &[&str] = &[
    "SUPPORTS",
    "IMPLIES",
    "EXEMPLIFIES",
    "ENABLES",
    "CAUSES",
];

/// Edge types whose evidence counts toward the contradictory side.
pub const REFUTATIVE_TYPES: &[&str] = &[
    "REFUTES",
    "CONTRADICTS",
    "PREVENTS",
    "OPPOSITE_OF",
];

/// Keeps a freshly-created concept with one supporting edge off the
/// extremes.
const SMOOTHING_EPS: f64 = 1.0;

fn is_supportive(type_name: &str) -> bool {
    SUPPORTIVE_TYPES.contains(&type_name) || type_name.starts_with("CONFIRMS")
}

fn is_refutative(type_name: &str) -> bool {
    REFUTATIVE_TYPES.contains(&type_name)
}

/// Compute grounding for a batch of concepts in one neighbor query.
///
/// Every requested id appears in the result; concepts with no supportive or
/// refutative edges score 0.
pub async fn compute_grounding(
    graph: &GraphStore,
    ids: &[String],
) -> KgResult<HashMap<String, f64>> {
    let mut affirmative: HashMap<&str, f64> = HashMap::new();
    let mut contradictory: HashMap<&str, f64> = HashMap::new();

    let edges = graph.edge_evidence_counts(ids).await?;
    for (from_id, to_id, type_name, evidence_count) in &edges {
        let weight = *evidence_count as f64;
        let bucket: Option<&mut HashMap<&str, f64>> = if is_supportive(type_name) {
            Some(&mut affirmative)
        } else if is_refutative(type_name) {
            Some(&mut contradictory)
        } else {
            None
        };
        if let Some(bucket) = bucket {
            for id in ids {
                if id == from_id || id == to_id {
                    *bucket.entry(id.as_str()).or_default() += weight;
                }
            }
        }
    }

    let mut out = HashMap::with_capacity(ids.len());
    for id in ids {
        let aff = affirmative.get(id.as_str()).copied().unwrap_or(0.0);
        let con = contradictory.get(id.as_str()).copied().unwrap_or(0.0);
        let score = if aff == 0.0 && con == 0.0 {
            0.0
        } else {
            (aff - con) / (aff + con + SMOOTHING_EPS)
        };
        out.insert(id.clone(), score);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::models::{Concept, Relationship};

    async fn test_graph() -> (tempfile::TempDir, GraphStore) {
        let tmp = tempfile::tempdir().unwrap();
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(tmp.path().join("g.sqlite"))
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, GraphStore::new(pool, 2))
    }

    async fn add_concept(graph: &GraphStore, label: &str, e: Vec<f32>) -> String {
        let c = Concept {
            id: Concept::make_id(label, "T"),
            label: label.into(),
            description: String::new(),
            search_terms: vec![],
            embedding: e,
            ontology: "T".into(),
            created_at: 0,
        };
        graph.create_concept(&c).await.unwrap();
        c.id
    }

    async fn add_edge(
        graph: &GraphStore,
        from: &str,
        to: &str,
        type_name: &str,
        evidence: &[&str],
    ) {
        graph
            .upsert_edge(&Relationship {
                id: Relationship::make_id(from, to, type_name),
                from_id: from.into(),
                to_id: to.into(),
                type_name: type_name.into(),
                confidence: 1.0,
                evidence: evidence.iter().map(|s| s.to_string()).collect(),
                created_at: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn supported_concept_scores_positive() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A", vec![1.0, 0.0]).await;
        let b = add_concept(&graph, "B", vec![0.0, 1.0]).await;
        add_edge(&graph, &b, &a, "SUPPORTS", &["s1", "s2", "s3"]).await;

        let scores = compute_grounding(&graph, &[a.clone()]).await.unwrap();
        let g = scores[&a];
        assert!(g > 0.5, "expected strongly positive, got {}", g);
        assert!(g < 1.0);
    }

    #[tokio::test]
    async fn contradicted_concept_scores_negative() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A", vec![1.0, 0.0]).await;
        let b = add_concept(&graph, "B", vec![0.0, 1.0]).await;
        add_edge(&graph, &b, &a, "REFUTES", &["s1", "s2"]).await;

        let scores = compute_grounding(&graph, &[a.clone()]).await.unwrap();
        assert!(scores[&a] < -0.3);
    }

    #[tokio::test]
    async fn mixed_evidence_balances() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A", vec![1.0, 0.0]).await;
        let b = add_concept(&graph, "B", vec![0.0, 1.0]).await;
        let c = add_concept(&graph, "C", vec![1.0, 1.0]).await;
        add_edge(&graph, &b, &a, "SUPPORTS", &["s1", "s2"]).await;
        add_edge(&graph, &c, &a, "CONTRADICTS", &["s3", "s4"]).await;

        let scores = compute_grounding(&graph, &[a.clone()]).await.unwrap();
        assert!(scores[&a].abs() < 0.1);
    }

    #[tokio::test]
    async fn unrelated_types_do_not_count() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A", vec![1.0, 0.0]).await;
        let b = add_concept(&graph, "B", vec![0.0, 1.0]).await;
        add_edge(&graph, &a, &b, "PART_OF", &["s1"]).await;

        let scores = compute_grounding(&graph, &[a.clone()]).await.unwrap();
        assert_eq!(scores[&a], 0.0);
    }

    #[tokio::test]
    async fn every_requested_id_is_present() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A", vec![1.0, 0.0]).await;
        let scores = compute_grounding(&graph, &[a.clone(), "c_missing".into()])
            .await
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores["c_missing"], 0.0);
    }
}
