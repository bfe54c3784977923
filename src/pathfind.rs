//! Shortest-path search between two concepts.
//!
//! Bidirectional BFS in application code: two frontiers grow from the
//! endpoints, the smaller one is expanded each round with a single batched
//! neighbor query, and the search stops at the first meet. Variable-length
//! graph queries are deliberately not used — enumerating paths in the
//! backend degrades exponentially with depth, while this approach does
//! O(b^(d/2)) work and issues at most `max_hops` graph queries total.
//!
//! The search is bounded three ways: the hop budget, a wall-clock timeout,
//! and a per-frontier size cap. Hitting the timeout or the cap returns a
//! partial result flagged `budget_exceeded` instead of an error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::KgResult;
use crate::graph::{Direction, GraphStore};

/// Parameters for one path search.
#[derive(Debug, Clone)]
pub struct PathQuery {
    pub from: String,
    pub to: String,
    /// Maximum number of edges in the returned path.
    pub max_hops: usize,
    /// Restrict traversal to edge direction (from → to). Default is
    /// undirected.
    pub directed: bool,
    /// Restrict traversal to these edge types.
    pub type_filter: Option<Vec<String>>,
}

/// Budgets applied to every search.
#[derive(Debug, Clone, Copy)]
pub struct PathBudget {
    pub frontier_cap: usize,
    /// Wall clock for the whole search.
    pub timeout: Duration,
    /// Wall clock for each batched neighbor query.
    pub neighbor_timeout: Duration,
}

impl Default for PathBudget {
    fn default() -> Self {
        Self {
            frontier_cap: 5000,
            timeout: Duration::from_secs(30),
            neighbor_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a path search.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PathResult {
    /// Concept ids from `from` to `to` inclusive; `None` when no path was
    /// found within budget.
    pub path: Option<Vec<String>>,
    /// Number of edges in the path (0 for the trivial self-path).
    pub hops: usize,
    /// True when the frontier cap or timeout cut the search short.
    pub budget_exceeded: bool,
    /// Graph queries issued; at most `max_hops`.
    pub queries_issued: usize,
}

impl PathResult {
    fn not_found(queries_issued: usize, budget_exceeded: bool) -> Self {
        Self {
            path: None,
            hops: 0,
            budget_exceeded,
            queries_issued,
        }
    }
}

/// One side of the bidirectional search.
struct Side {
    /// Nodes discovered this side, mapped to the node they were reached
    /// from (`None` for the root).
    parents: HashMap<String, Option<String>>,
    frontier: Vec<String>,
    /// True for the side rooted at `from`.
    forward: bool,
}

impl Side {
    fn new(root: &str, forward: bool) -> Self {
        let mut parents = HashMap::new();
        parents.insert(root.to_string(), None);
        Self {
            parents,
            frontier: vec![root.to_string()],
            forward,
        }
    }

    /// Walk the parent chain from `node` back to the root (inclusive).
    fn chain_to_root(&self, node: &str) -> Vec<String> {
        let mut out = vec![node.to_string()];
        let mut current = node;
        while let Some(Some(parent)) = self.parents.get(current) {
            out.push(parent.clone());
            current = parent;
        }
        out
    }
}

/// Find a shortest path of length ≤ `max_hops` between two concepts.
pub async fn shortest_path(
    graph: &GraphStore,
    query: &PathQuery,
    budget: &PathBudget,
) -> KgResult<PathResult> {
    if query.from == query.to {
        return Ok(PathResult {
            path: Some(vec![query.from.clone()]),
            hops: 0,
            budget_exceeded: false,
            queries_issued: 0,
        });
    }

    let started = Instant::now();
    let mut a = Side::new(&query.from, true);
    let mut b = Side::new(&query.to, false);
    let mut queries_issued = 0usize;

    for _ in 0..query.max_hops {
        if started.elapsed() > budget.timeout {
            return Ok(PathResult::not_found(queries_issued, true));
        }

        // Always expand the smaller frontier.
        if a.frontier.len() > b.frontier.len() {
            std::mem::swap(&mut a, &mut b);
        }
        if a.frontier.is_empty() {
            return Ok(PathResult::not_found(queries_issued, false));
        }

        let direction = if query.directed {
            if a.forward {
                Direction::Outgoing
            } else {
                Direction::Incoming
            }
        } else {
            Direction::Either
        };

        // A timed-out neighbor query ends the search with a partial
        // result, like any other exhausted budget.
        let edges = match tokio::time::timeout(
            budget.neighbor_timeout,
            graph.neighbors(&a.frontier, query.type_filter.as_deref(), direction),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Ok(PathResult::not_found(queries_issued, true)),
        };
        queries_issued += 1;

        let mut next_frontier: Vec<String> = Vec::new();
        for edge in &edges {
            // The seed endpoint is the parent, the other is the child.
            let (parent, child) = if a.parents.contains_key(&edge.from_id) {
                (&edge.from_id, &edge.to_id)
            } else {
                (&edge.to_id, &edge.from_id)
            };
            if a.parents.contains_key(child) {
                continue;
            }

            if b.parents.contains_key(child) {
                return Ok(stitch(&a, &b, parent, child, queries_issued));
            }

            a.parents.insert(child.clone(), Some(parent.clone()));
            next_frontier.push(child.clone());

            if next_frontier.len() > budget.frontier_cap {
                return Ok(PathResult::not_found(queries_issued, true));
            }
        }

        if next_frontier.is_empty() {
            // One side exhausted: the components are disconnected.
            return Ok(PathResult::not_found(queries_issued, false));
        }
        a.frontier = next_frontier;

        // Cancellation point between hop iterations.
        tokio::task::yield_now().await;
    }

    Ok(PathResult::not_found(queries_issued, false))
}

/// Join the two parent chains at the meet node. `parent` is the node on
/// the expanding side that reached `meet`; `meet` is already known to the
/// other side.
fn stitch(
    expand: &Side,
    other: &Side,
    parent: &str,
    meet: &str,
    queries_issued: usize,
) -> PathResult {
    // Chain from the expanding side's root to the meet.
    let mut left = expand.chain_to_root(parent);
    left.reverse();
    left.push(meet.to_string());

    // Chain from the meet to the other side's root, skipping the
    // duplicated meet node.
    let right = other.chain_to_root(meet);
    left.extend(right.into_iter().skip(1));

    // `left` now runs expand-root → other-root; flip when the expanding
    // side was rooted at the destination.
    if !expand.forward {
        left.reverse();
    }

    let hops = left.len() - 1;
    PathResult {
        path: Some(left),
        hops,
        budget_exceeded: false,
        queries_issued,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Concept, Relationship};

    async fn test_graph() -> (tempfile::TempDir, GraphStore) {
        let tmp = tempfile::tempdir().unwrap();
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(tmp.path().join("p.sqlite"))
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, GraphStore::new(pool, 2))
    }

    async fn add_concept(graph: &GraphStore, label: &str) -> String {
        let c = Concept {
            id: Concept::make_id(label, "T"),
            label: label.into(),
            description: String::new(),
            search_terms: vec![],
            embedding: vec![1.0, 0.0],
            ontology: "T".into(),
            created_at: 0,
        };
        graph.create_concept(&c).await.unwrap();
        c.id
    }

    async fn link(graph: &GraphStore, from: &str, to: &str, type_name: &str) {
        graph
            .upsert_edge(&Relationship {
                id: Relationship::make_id(from, to, type_name),
                from_id: from.into(),
                to_id: to.into(),
                type_name: type_name.into(),
                confidence: 1.0,
                evidence: vec![],
                created_at: 0,
            })
            .await
            .unwrap();
    }

    fn budget() -> PathBudget {
        PathBudget::default()
    }

    fn query(from: &str, to: &str, max_hops: usize) -> PathQuery {
        PathQuery {
            from: from.into(),
            to: to.into(),
            max_hops,
            directed: false,
            type_filter: None,
        }
    }

    #[tokio::test]
    async fn self_path_issues_zero_queries() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A").await;
        let result = shortest_path(&graph, &query(&a, &a, 5), &budget())
            .await
            .unwrap();
        assert_eq!(result.path, Some(vec![a]));
        assert_eq!(result.hops, 0);
        assert_eq!(result.queries_issued, 0);
    }

    #[tokio::test]
    async fn two_hop_chain() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "Meditation in Buddhism").await;
        let b = add_concept(&graph, "Zen Buddhism").await;
        let c = add_concept(&graph, "Nirvana").await;
        link(&graph, &a, &b, "USED_FOR").await;
        link(&graph, &b, &c, "RESULTS_FROM").await;

        let result = shortest_path(&graph, &query(&a, &c, 3), &budget())
            .await
            .unwrap();
        let path = result.path.unwrap();
        assert_eq!(path, vec![a, b, c]);
        assert_eq!(result.hops, 2);
        assert!(result.queries_issued <= 3);
        assert!(!result.budget_exceeded);
    }

    #[tokio::test]
    async fn shortest_is_preferred_over_longer() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A").await;
        let b = add_concept(&graph, "B").await;
        let c = add_concept(&graph, "C").await;
        let d = add_concept(&graph, "D").await;
        // Long way: a-b-c-d. Short way: a-d.
        link(&graph, &a, &b, "IMPLIES").await;
        link(&graph, &b, &c, "IMPLIES").await;
        link(&graph, &c, &d, "IMPLIES").await;
        link(&graph, &a, &d, "SIMILAR_TO").await;

        let result = shortest_path(&graph, &query(&a, &d, 5), &budget())
            .await
            .unwrap();
        assert_eq!(result.hops, 1);
        assert_eq!(result.path.unwrap(), vec![a, d]);
    }

    #[tokio::test]
    async fn undirected_traverses_reverse_edges() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A").await;
        let b = add_concept(&graph, "B").await;
        link(&graph, &b, &a, "CAUSES").await;

        let result = shortest_path(&graph, &query(&a, &b, 2), &budget())
            .await
            .unwrap();
        assert_eq!(result.hops, 1);
    }

    #[tokio::test]
    async fn directed_respects_edge_direction() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A").await;
        let b = add_concept(&graph, "B").await;
        link(&graph, &b, &a, "CAUSES").await;

        let mut q = query(&a, &b, 3);
        q.directed = true;
        let result = shortest_path(&graph, &q, &budget()).await.unwrap();
        assert!(result.path.is_none());
        assert!(!result.budget_exceeded);
    }

    #[tokio::test]
    async fn disconnected_components_stop_early() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A").await;
        let b = add_concept(&graph, "B").await;
        let c = add_concept(&graph, "C").await;
        let d = add_concept(&graph, "D").await;
        link(&graph, &a, &b, "IMPLIES").await;
        link(&graph, &c, &d, "IMPLIES").await;

        let result = shortest_path(&graph, &query(&a, &c, 5), &budget())
            .await
            .unwrap();
        assert!(result.path.is_none());
        assert!(!result.budget_exceeded);
        // One frontier empties after its component is fully explored;
        // nowhere near the hop budget.
        assert!(result.queries_issued <= 3);
    }

    #[tokio::test]
    async fn hop_budget_limits_depth() {
        let (_tmp, graph) = test_graph().await;
        let ids: Vec<String> = {
            let mut v = Vec::new();
            for i in 0..6 {
                v.push(add_concept(&graph, &format!("N{}", i)).await);
            }
            v
        };
        for pair in ids.windows(2) {
            link(&graph, &pair[0], &pair[1], "PRECEDES").await;
        }

        // 5 edges between the endpoints, budget of 2.
        let result = shortest_path(&graph, &query(&ids[0], &ids[5], 2), &budget())
            .await
            .unwrap();
        assert!(result.path.is_none());

        let result = shortest_path(&graph, &query(&ids[0], &ids[5], 5), &budget())
            .await
            .unwrap();
        assert_eq!(result.hops, 5);
    }

    #[tokio::test]
    async fn frontier_cap_flags_budget() {
        let (_tmp, graph) = test_graph().await;
        let hub = add_concept(&graph, "Hub").await;
        let goal = add_concept(&graph, "Goal").await;
        for i in 0..8 {
            let spoke = add_concept(&graph, &format!("Spoke{}", i)).await;
            link(&graph, &hub, &spoke, "CONTAINS").await;
        }

        let result = shortest_path(
            &graph,
            &query(&hub, &goal, 4),
            &PathBudget {
                frontier_cap: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(result.path.is_none());
        assert!(result.budget_exceeded);
    }

    #[tokio::test]
    async fn type_filter_restricts_traversal() {
        let (_tmp, graph) = test_graph().await;
        let a = add_concept(&graph, "A").await;
        let b = add_concept(&graph, "B").await;
        link(&graph, &a, &b, "CONTRADICTS").await;

        let mut q = query(&a, &b, 2);
        q.type_filter = Some(vec!["SUPPORTS".to_string()]);
        let result = shortest_path(&graph, &q, &budget()).await.unwrap();
        assert!(result.path.is_none());
    }
}
