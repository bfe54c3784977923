//! Polarity-axis projection: placing concepts on a bidirectional semantic
//! dimension.
//!
//! The axis between two pole concepts is the difference of their
//! embeddings. Candidates (given explicitly or discovered by bounded
//! neighbor expansion from the poles) are projected onto that axis: the
//! scalar position is normalized so the poles themselves land at ±1, the
//! orthogonal residual is reported as `axis_distance`, and a coarse
//! direction label is assigned at the ±0.3 heuristic boundary.
//!
//! When grounding is requested, the Pearson correlation between positions
//! and grounding scores is reported with a significance estimate, banded
//! into strong / moderate / weak. Optional path analysis runs the
//! shortest-path search between the poles and scores each path's step-size
//! coherence and mean curvature.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::embedding::cosine_similarity;
use crate::error::{KgError, KgResult};
use crate::graph::{Direction, GraphStore};
use crate::grounding::compute_grounding;
use crate::pathfind::{shortest_path, PathBudget, PathQuery};

/// Axis magnitudes below this signal poles too close together to define a
/// meaningful dimension.
const WEAK_AXIS_MAGNITUDE: f32 = 0.1;

/// Heuristic boundary for the direction label; not semantically precise.
const DIRECTION_THRESHOLD: f64 = 0.3;

const COHERENCE_EPS: f64 = 1e-6;

/// Parameters for one polarity analysis.
#[derive(Debug, Clone)]
pub struct PolarityRequest {
    pub positive_pole_id: String,
    pub negative_pole_id: String,
    /// Explicit candidate set; when `None`, candidates are discovered
    /// within `discovery_hops` of either pole.
    pub candidate_ids: Option<Vec<String>>,
    pub discovery_hops: usize,
    pub include_grounding: bool,
    pub include_paths: bool,
}

impl PolarityRequest {
    pub fn new(positive_pole_id: impl Into<String>, negative_pole_id: impl Into<String>) -> Self {
        Self {
            positive_pole_id: positive_pole_id.into(),
            negative_pole_id: negative_pole_id.into(),
            candidate_ids: None,
            discovery_hops: 2,
            include_grounding: false,
            include_paths: false,
        }
    }
}

/// Axis metadata reported with every analysis.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AxisInfo {
    pub positive_pole_id: String,
    pub negative_pole_id: String,
    pub magnitude: f32,
    /// True when the poles are too close to span a useful axis.
    pub weak_axis: bool,
}

/// One projected candidate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Projection {
    pub concept_id: String,
    pub label: String,
    /// Scalar position in [-1, +1]; the poles project to ±1.
    pub position: f64,
    /// Norm of the component orthogonal to the axis.
    pub axis_distance: f64,
    /// `positive`, `negative`, or `neutral`.
    pub direction: &'static str,
    pub grounding: Option<f64>,
}

/// Pearson correlation between position and grounding.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Correlation {
    pub r: f64,
    pub p: f64,
    /// `strong`, `moderate`, or `weak`.
    pub strength: &'static str,
    pub n: usize,
}

/// Scored pole-to-pole path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PathAnalysis {
    pub path: Vec<String>,
    /// `1 - var(step_sizes) / (mean(step_sizes) + ε)`: even step sizes
    /// score near 1.
    pub coherence: f64,
    /// Average angular change between consecutive steps, radians.
    pub mean_curvature: f64,
}

/// Full result of a polarity analysis.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PolarityResult {
    pub axis: AxisInfo,
    pub projections: Vec<Projection>,
    pub correlation: Option<Correlation>,
    pub paths: Vec<PathAnalysis>,
    /// True when candidate discovery hit its cap or the wall clock ran out.
    pub budget_exceeded: bool,
}

/// A candidate axis from [`discover_axes`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredAxis {
    pub positive_pole_id: String,
    pub negative_pole_id: String,
    pub type_name: String,
    pub magnitude: f32,
}

/// Budgets applied to a polarity run.
#[derive(Debug, Clone, Copy)]
pub struct PolarityBudget {
    pub candidate_cap: usize,
    pub timeout: Duration,
    pub path_budget: PathBudget,
    pub max_hops: usize,
}

/// Project candidates onto the axis between two poles.
pub async fn analyze(
    graph: &GraphStore,
    request: &PolarityRequest,
    budget: &PolarityBudget,
) -> KgResult<PolarityResult> {
    let started = Instant::now();

    let poles = graph
        .get_concepts(&[
            request.positive_pole_id.clone(),
            request.negative_pole_id.clone(),
        ])
        .await?;
    let positive = poles
        .iter()
        .find(|c| c.id == request.positive_pole_id)
        .ok_or_else(|| KgError::NotFound(format!("concept {}", request.positive_pole_id)))?
        .clone();
    let negative = poles
        .iter()
        .find(|c| c.id == request.negative_pole_id)
        .ok_or_else(|| KgError::NotFound(format!("concept {}", request.negative_pole_id)))?
        .clone();

    if positive.embedding.len() != negative.embedding.len() {
        return Err(KgError::Consistency(
            "pole embeddings have different dimensions".into(),
        ));
    }

    // Axis vector and midpoint.
    let axis: Vec<f32> = positive
        .embedding
        .iter()
        .zip(&negative.embedding)
        .map(|(p, n)| p - n)
        .collect();
    let midpoint: Vec<f32> = positive
        .embedding
        .iter()
        .zip(&negative.embedding)
        .map(|(p, n)| (p + n) / 2.0)
        .collect();
    let magnitude = norm(&axis);
    let axis_norm_sq = (magnitude * magnitude) as f64;

    let axis_info = AxisInfo {
        positive_pole_id: positive.id.clone(),
        negative_pole_id: negative.id.clone(),
        magnitude,
        weak_axis: magnitude < WEAK_AXIS_MAGNITUDE,
    };

    // Candidate set: explicit, or bounded expansion from both poles.
    let mut budget_exceeded = false;
    let candidate_ids = match &request.candidate_ids {
        Some(ids) => ids.clone(),
        None => {
            let (ids, capped) = discover_candidates(
                graph,
                &[positive.id.clone(), negative.id.clone()],
                request.discovery_hops,
                budget.candidate_cap,
            )
            .await?;
            budget_exceeded |= capped;
            ids
        }
    };

    let candidates = graph.get_concepts(&candidate_ids).await?;

    // Grounding is computed once for the whole candidate batch.
    let grounding = if request.include_grounding {
        Some(compute_grounding(graph, &candidate_ids).await?)
    } else {
        None
    };

    let mut projections = Vec::with_capacity(candidates.len());
    for concept in &candidates {
        if concept.embedding.len() != axis.len() {
            continue;
        }
        if started.elapsed() > budget.timeout {
            budget_exceeded = true;
            break;
        }

        let relative: Vec<f32> = concept
            .embedding
            .iter()
            .zip(&midpoint)
            .map(|(c, m)| c - m)
            .collect();

        // True projection coefficient onto the axis; the reported position
        // is rescaled so the poles land at exactly ±1 (a pole's relative
        // vector is half the axis).
        let proj = if axis_norm_sq < f64::EPSILON {
            0.0
        } else {
            dot(&relative, &axis) / axis_norm_sq
        };
        let position = (2.0 * proj).clamp(-1.0, 1.0);

        let residual: Vec<f32> = relative
            .iter()
            .zip(&axis)
            .map(|(r, a)| r - (proj as f32) * a)
            .collect();

        let direction = if position > DIRECTION_THRESHOLD {
            "positive"
        } else if position < -DIRECTION_THRESHOLD {
            "negative"
        } else {
            "neutral"
        };

        projections.push(Projection {
            concept_id: concept.id.clone(),
            label: concept.label.clone(),
            position,
            axis_distance: norm(&residual) as f64,
            direction,
            grounding: grounding.as_ref().map(|g| g[&concept.id]),
        });
    }

    projections.sort_by(|a, b| {
        b.position
            .partial_cmp(&a.position)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let correlation = grounding.as_ref().and_then(|_| {
        let xs: Vec<f64> = projections.iter().map(|p| p.position).collect();
        let ys: Vec<f64> = projections.iter().filter_map(|p| p.grounding).collect();
        pearson(&xs, &ys).map(|(r, p)| Correlation {
            r,
            p,
            strength: if r.abs() >= 0.7 {
                "strong"
            } else if r.abs() >= 0.4 {
                "moderate"
            } else {
                "weak"
            },
            n: xs.len(),
        })
    });

    let mut paths = Vec::new();
    if request.include_paths && started.elapsed() <= budget.timeout {
        let query = PathQuery {
            from: positive.id.clone(),
            to: negative.id.clone(),
            max_hops: budget.max_hops,
            directed: false,
            type_filter: None,
        };
        let result = shortest_path(graph, &query, &budget.path_budget).await?;
        budget_exceeded |= result.budget_exceeded;
        if let Some(path) = result.path {
            let concepts = graph.get_concepts(&path).await?;
            let ordered: Vec<Vec<f32>> = path
                .iter()
                .filter_map(|id| {
                    concepts
                        .iter()
                        .find(|c| &c.id == id)
                        .map(|c| c.embedding.clone())
                })
                .collect();
            paths.push(score_path(path, &ordered));
        }
    }

    Ok(PolarityResult {
        axis: axis_info,
        projections,
        correlation,
        paths,
        budget_exceeded,
    })
}

/// Batched 1..n hop expansion from the poles. Returns candidate ids
/// (including the poles) and whether the cap cut discovery short.
async fn discover_candidates(
    graph: &GraphStore,
    roots: &[String],
    hops: usize,
    cap: usize,
) -> KgResult<(Vec<String>, bool)> {
    let mut seen: HashSet<String> = roots.iter().cloned().collect();
    let mut frontier: Vec<String> = roots.to_vec();

    for _ in 0..hops {
        if frontier.is_empty() {
            break;
        }
        let edges = graph.neighbors(&frontier, None, Direction::Either).await?;
        let mut next = Vec::new();
        for edge in edges {
            for id in [edge.from_id, edge.to_id] {
                if seen.insert(id.clone()) {
                    next.push(id);
                    if seen.len() >= cap {
                        let mut out: Vec<String> = seen.into_iter().collect();
                        out.sort();
                        return Ok((out, true));
                    }
                }
            }
        }
        frontier = next;
    }

    let mut out: Vec<String> = seen.into_iter().collect();
    out.sort();
    Ok((out, false))
}

/// Find candidate axes: pairs connected by opposition-flavored edge types
/// whose embedding distance spans at least `min_magnitude`.
pub async fn discover_axes(
    graph: &GraphStore,
    relationship_types: &[String],
    min_magnitude: f32,
    max_results: usize,
    ontology: Option<&str>,
) -> KgResult<Vec<DiscoveredAxis>> {
    let edges = graph
        .edges_of_types(relationship_types, 2000)
        .await?;
    if edges.is_empty() {
        return Ok(Vec::new());
    }

    let mut ids: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for e in &edges {
        for id in [&e.from_id, &e.to_id] {
            if seen.insert(id.clone()) {
                ids.push(id.clone());
            }
        }
    }
    let concepts = graph.get_concepts(&ids).await?;
    let by_id: std::collections::HashMap<&str, &crate::models::Concept> =
        concepts.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut axes = Vec::new();
    for e in &edges {
        let (Some(a), Some(b)) = (by_id.get(e.from_id.as_str()), by_id.get(e.to_id.as_str()))
        else {
            continue;
        };
        if let Some(o) = ontology {
            if a.ontology != o || b.ontology != o {
                continue;
            }
        }
        if a.embedding.len() != b.embedding.len() {
            continue;
        }
        let diff: Vec<f32> = a
            .embedding
            .iter()
            .zip(&b.embedding)
            .map(|(x, y)| x - y)
            .collect();
        let magnitude = norm(&diff);
        if magnitude >= min_magnitude {
            axes.push(DiscoveredAxis {
                positive_pole_id: e.from_id.clone(),
                negative_pole_id: e.to_id.clone(),
                type_name: e.type_name.clone(),
                magnitude,
            });
        }
    }

    axes.sort_by(|a, b| {
        b.magnitude
            .partial_cmp(&a.magnitude)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    axes.truncate(max_results);
    Ok(axes)
}

/// Score one pole-to-pole path: step-size coherence plus mean angular
/// change between consecutive steps.
fn score_path(path: Vec<String>, embeddings: &[Vec<f32>]) -> PathAnalysis {
    let steps: Vec<Vec<f32>> = embeddings
        .windows(2)
        .map(|w| w[1].iter().zip(&w[0]).map(|(b, a)| b - a).collect())
        .collect();

    let sizes: Vec<f64> = steps.iter().map(|s| norm(s) as f64).collect();
    let coherence = if sizes.is_empty() {
        1.0
    } else {
        let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
        let var = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / sizes.len() as f64;
        1.0 - var / (mean + COHERENCE_EPS)
    };

    let mut angles = Vec::new();
    for w in steps.windows(2) {
        let cos = cosine_similarity(&w[0], &w[1]).clamp(-1.0, 1.0);
        angles.push((cos as f64).acos());
    }
    let mean_curvature = if angles.is_empty() {
        0.0
    } else {
        angles.iter().sum::<f64>() / angles.len() as f64
    };

    PathAnalysis {
        path,
        coherence,
        mean_curvature,
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Pearson correlation with a two-tailed significance estimate from the
/// normal approximation of the t statistic. Returns `None` below n = 3 or
/// for degenerate variance.
fn pearson(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len();
    if n < 3 || n != ys.len() {
        return None;
    }
    let nf = n as f64;
    let mean_x = xs.iter().sum::<f64>() / nf;
    let mean_y = ys.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x < f64::EPSILON || var_y < f64::EPSILON {
        return None;
    }

    let r = (cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0);
    if r.abs() >= 1.0 {
        return Some((r, 0.0));
    }

    let t = r * ((nf - 2.0) / (1.0 - r * r)).sqrt();
    let p = erfc(t.abs() / std::f64::consts::SQRT_2);
    Some((r, p.clamp(0.0, 1.0)))
}

/// Complementary error function, Abramowitz & Stegun 7.1.26.
fn erfc(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    poly * (-x * x).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Concept, Relationship};

    async fn test_graph(dims: usize) -> (tempfile::TempDir, GraphStore) {
        let tmp = tempfile::tempdir().unwrap();
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(tmp.path().join("pol.sqlite"))
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, GraphStore::new(pool, dims))
    }

    async fn add(graph: &GraphStore, label: &str, e: Vec<f32>) -> String {
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

    fn test_budget() -> PolarityBudget {
        PolarityBudget {
            candidate_cap: 500,
            timeout: Duration::from_secs(60),
            path_budget: PathBudget::default(),
            max_hops: 5,
        }
    }

    #[tokio::test]
    async fn poles_project_to_plus_minus_one() {
        let (_tmp, graph) = test_graph(2).await;
        let pos = add(&graph, "Modern", vec![1.0, 0.0]).await;
        let neg = add(&graph, "Traditional", vec![-1.0, 0.0]).await;

        let mut request = PolarityRequest::new(pos.clone(), neg.clone());
        request.candidate_ids = Some(vec![pos.clone(), neg.clone()]);

        let result = analyze(&graph, &request, &test_budget()).await.unwrap();
        let by_id: std::collections::HashMap<&str, f64> = result
            .projections
            .iter()
            .map(|p| (p.concept_id.as_str(), p.position))
            .collect();

        assert!((by_id[pos.as_str()] - 1.0).abs() < 0.02);
        assert!((by_id[neg.as_str()] + 1.0).abs() < 0.02);
        assert!(!result.axis.weak_axis);
    }

    #[tokio::test]
    async fn midpoint_concept_is_neutral() {
        let (_tmp, graph) = test_graph(2).await;
        let pos = add(&graph, "Modern", vec![1.0, 0.0]).await;
        let neg = add(&graph, "Traditional", vec![-1.0, 0.0]).await;
        let mid = add(&graph, "Hybrid", vec![0.0, 1.0]).await;

        let mut request = PolarityRequest::new(pos, neg);
        request.candidate_ids = Some(vec![mid.clone()]);

        let result = analyze(&graph, &request, &test_budget()).await.unwrap();
        let p = &result.projections[0];
        assert!(p.position.abs() < 0.05);
        assert_eq!(p.direction, "neutral");
        // The midpoint concept sits fully off-axis.
        assert!(p.axis_distance > 0.9);
    }

    #[tokio::test]
    async fn leaning_candidates_get_signed_positions() {
        let (_tmp, graph) = test_graph(2).await;
        let pos = add(&graph, "Modern", vec![1.0, 0.0]).await;
        let neg = add(&graph, "Traditional", vec![-1.0, 0.0]).await;
        let agile = add(&graph, "Agile", vec![0.5, 0.5]).await;
        let legacy = add(&graph, "Legacy", vec![-0.4, 0.5]).await;

        let mut request = PolarityRequest::new(pos, neg);
        request.candidate_ids = Some(vec![agile.clone(), legacy.clone()]);

        let result = analyze(&graph, &request, &test_budget()).await.unwrap();
        let by_id: std::collections::HashMap<&str, f64> = result
            .projections
            .iter()
            .map(|p| (p.concept_id.as_str(), p.position))
            .collect();

        assert!(by_id[agile.as_str()] > 0.3);
        assert!(by_id[legacy.as_str()] < -0.3);
    }

    #[tokio::test]
    async fn weak_axis_is_flagged() {
        let (_tmp, graph) = test_graph(2).await;
        let pos = add(&graph, "A", vec![1.0, 0.0]).await;
        let neg = add(&graph, "B", vec![0.99, 0.0]).await;

        let mut request = PolarityRequest::new(pos, neg);
        request.candidate_ids = Some(vec![]);
        let result = analyze(&graph, &request, &test_budget()).await.unwrap();
        assert!(result.axis.weak_axis);
    }

    #[tokio::test]
    async fn discovery_walks_out_from_poles() {
        let (_tmp, graph) = test_graph(2).await;
        let pos = add(&graph, "A", vec![1.0, 0.0]).await;
        let neg = add(&graph, "B", vec![-1.0, 0.0]).await;
        let near = add(&graph, "C", vec![0.5, 0.1]).await;
        let far = add(&graph, "D", vec![0.2, 0.9]).await;
        let lonely = add(&graph, "E", vec![0.0, 0.3]).await;

        for (f, t) in [(&pos, &near), (&near, &far)] {
            graph
                .upsert_edge(&Relationship {
                    id: Relationship::make_id(f, t, "SIMILAR_TO"),
                    from_id: f.to_string(),
                    to_id: t.to_string(),
                    type_name: "SIMILAR_TO".into(),
                    confidence: 1.0,
                    evidence: vec![],
                    created_at: 0,
                })
                .await
                .unwrap();
        }

        let request = PolarityRequest::new(pos.clone(), neg.clone());
        let result = analyze(&graph, &request, &test_budget()).await.unwrap();
        let ids: HashSet<String> = result
            .projections
            .iter()
            .map(|p| p.concept_id.clone())
            .collect();

        // Both hops from the positive pole are in; the unlinked concept
        // is not.
        assert!(ids.contains(&near));
        assert!(ids.contains(&far));
        assert!(!ids.contains(&lonely));
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn missing_pole_is_not_found() {
        let (_tmp, graph) = test_graph(2).await;
        let pos = add(&graph, "A", vec![1.0, 0.0]).await;
        let request = PolarityRequest::new(pos, "c_missing".to_string());
        let err = analyze(&graph, &request, &test_budget()).await.unwrap_err();
        assert!(matches!(err, KgError::NotFound(_)));
    }

    #[test]
    fn pearson_detects_perfect_correlation() {
        let xs = vec![-1.0, -0.5, 0.0, 0.5, 1.0];
        let ys = vec![-0.9, -0.4, 0.05, 0.55, 0.95];
        let (r, p) = pearson(&xs, &ys).unwrap();
        assert!(r > 0.99);
        assert!(p < 0.05);
    }

    #[test]
    fn pearson_needs_three_points() {
        assert!(pearson(&[1.0, 2.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn pearson_degenerate_variance_is_none() {
        assert!(pearson(&[1.0, 1.0, 1.0], &[0.1, 0.2, 0.3]).is_none());
    }

    #[test]
    fn coherent_path_scores_high() {
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        // Two steps of identical size and direction.
        let embeddings = vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![2.0, 0.0],
        ];
        let scored = score_path(path, &embeddings);
        assert!(scored.coherence > 0.99);
        assert!(scored.mean_curvature < 1e-3);
    }

    #[test]
    fn right_angle_turn_has_curvature() {
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let embeddings = vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
        ];
        let scored = score_path(path, &embeddings);
        assert!((scored.mean_curvature - std::f64::consts::FRAC_PI_2).abs() < 1e-3);
    }
}
