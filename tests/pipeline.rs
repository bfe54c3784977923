//! End-to-end pipeline tests over the public API: ingest real text through
//! the job queue, then exercise search, pathfinding, polarity, and
//! vocabulary consolidation against the resulting graph.

use std::sync::Arc;

use kg_engine::config::Config;
use kg_engine::core::Core;
use kg_engine::extractor::{MergeVerdict, MockExtractor};
use kg_engine::ingest::{self, IngestContent, IngestRequest};
use kg_engine::models::{Job, JobStatus};
use kg_engine::polarity::{self, PolarityBudget, PolarityRequest};
use kg_engine::scheduler;
use kg_engine::search::{self, SearchParams};

async fn test_core() -> (tempfile::TempDir, Arc<Core>) {
    let tmp = tempfile::tempdir().unwrap();
    let config_text = format!(
        r#"
[db]
path = "{root}/kg.sqlite"

[objects]
root = "{root}/objects"

[chunking]
target_words = 120
overlap_words = 20
"#,
        root = tmp.path().display()
    );
    let config_path = tmp.path().join("kg.toml");
    std::fs::write(&config_path, config_text).unwrap();
    let config: Config = kg_engine::config::load_config(&config_path).unwrap();
    let core = Core::init(config).await.unwrap();
    (tmp, core)
}

async fn ingest_and_run(core: &Arc<Core>, filename: &str, text: &str, force: bool) -> Job {
    let job = ingest::submit(
        core,
        "tests",
        IngestRequest {
            ontology: "Philosophy".into(),
            filename: filename.into(),
            content: IngestContent::Text(text.into()),
            force_reingest: force,
            auto_approve: true,
            target_words: None,
            overlap_words: None,
        },
    )
    .await
    .unwrap();
    let claimed = core.jobs.claim_next().await.unwrap().unwrap();
    ingest::run_job(core, &claimed).await;
    core.jobs.get(&job.id).await.unwrap()
}

const LECTURE_ONE: &str = "\
Meditation quiets the restless mind and loosens attachment. The Ego is a \
story the mind tells itself. Meditation dissolves the Ego gradually. \
Buddhism treats the Ego as the root of suffering. Awareness grows as \
Meditation deepens.";

const LECTURE_TWO: &str = "\
Meditation opens the door to Nirvana. The Ego resists Nirvana with every \
habit it owns. Buddhism describes Nirvana as the end of craving. Awareness \
of the Ego is the first step toward Nirvana.";

#[tokio::test]
async fn deduplication_across_related_documents() {
    let (_tmp, core) = test_core().await;

    let first = ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;
    assert_eq!(first.status, JobStatus::Completed);
    assert!(first.progress.concepts_created >= 4);
    assert_eq!(first.progress.concepts_reused, 0);

    let second = ingest_and_run(&core, "lecture2.md", LECTURE_TWO, false).await;
    assert_eq!(second.status, JobStatus::Completed);
    // Meditation, Ego, Buddhism, Awareness recur; Nirvana is new.
    assert!(
        second.progress.concepts_reused >= 3,
        "expected reuse, got {:?}",
        second.progress
    );
    assert!(second.progress.concepts_created >= 1);
}

#[tokio::test]
async fn forced_reingest_matches_existing_concepts() {
    let (_tmp, core) = test_core().await;

    let first = ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;
    let total = first.progress.concepts_created + first.progress.concepts_reused;
    let concepts_before = core.graph.stats(None).await.unwrap().concepts;

    let rerun = ingest_and_run(&core, "lecture1.md", LECTURE_ONE, true).await;
    assert_eq!(rerun.status, JobStatus::Completed);

    // The temporal re-ingestion property: a high hit rate and essentially
    // no new concepts.
    let hit_rate = rerun.progress.concepts_reused as f64 / total as f64;
    assert!(hit_rate >= 0.70, "hit rate {} too low", hit_rate);
    assert_eq!(rerun.progress.concepts_created, 0);
    assert_eq!(core.graph.stats(None).await.unwrap().concepts, concepts_before);
}

#[tokio::test]
async fn unforced_reingest_is_rejected_as_duplicate() {
    let (_tmp, core) = test_core().await;
    ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;

    let err = ingest::submit(
        &core,
        "tests",
        IngestRequest {
            ontology: "Philosophy".into(),
            filename: "same-content.md".into(),
            content: IngestContent::Text(LECTURE_ONE.into()),
            force_reingest: false,
            auto_approve: true,
            target_words: None,
            overlap_words: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, kg_engine::error::KgError::Conflict(_)));
}

#[tokio::test]
async fn search_then_connect_through_the_graph() {
    let (_tmp, core) = test_core().await;
    ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;
    ingest_and_run(&core, "lecture2.md", LECTURE_TWO, false).await;

    let hits = search::search_concepts(
        &core,
        &SearchParams {
            query: "Meditation practice".into(),
            include_grounding: true,
            include_evidence: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].concept.label, "Meditation");
    assert!(hits[0].evidence.as_ref().unwrap().iter().all(|e| {
        e.quote.contains("Meditation") || e.quote.contains("meditation")
    }));

    let connection = search::connect_by_search(&core, "Meditation", "Nirvana", Some(4), 0.3, None)
        .await
        .unwrap()
        .expect("both poles should resolve");
    let path = connection.connection.path.expect("path should exist");
    assert!(path.len() >= 2);
    assert!(path.len() <= 5);
    assert_eq!(path.first().unwrap().label, "Meditation");
    assert_eq!(path.last().unwrap().label, "Nirvana");
}

#[tokio::test]
async fn no_path_between_disconnected_ontology_content() {
    let (_tmp, core) = test_core().await;
    ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;
    // A disjoint island: no shared capitalized vocabulary.
    ingest_and_run(
        &core,
        "finance.md",
        "Quarterly Revenue beat Expectations. Revenue growth pleased Shareholders.",
        false,
    )
    .await;

    let hits = |q: &str| {
        let core = Arc::clone(&core);
        let q = q.to_string();
        async move {
            search::search_concepts(
                &core,
                &SearchParams {
                    query: q,
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
        }
    };
    let meditation = hits("Meditation").await[0].concept.id.clone();
    let revenue = hits("Revenue").await[0].concept.id.clone();

    let result = search::connect(&core, &meditation, &revenue, Some(5))
        .await
        .unwrap();
    assert!(result.path.is_none());
    assert!(!result.budget_exceeded);
}

#[tokio::test]
async fn polarity_poles_land_at_plus_minus_one() {
    let (_tmp, core) = test_core().await;
    ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;
    ingest_and_run(&core, "lecture2.md", LECTURE_TWO, false).await;

    let find = |q: &str| {
        let core = Arc::clone(&core);
        let q = q.to_string();
        async move {
            search::search_concepts(
                &core,
                &SearchParams {
                    query: q,
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap()[0]
                .concept
                .id
                .clone()
        }
    };
    let ego = find("Ego").await;
    let nirvana = find("Nirvana").await;

    let mut request = PolarityRequest::new(ego.clone(), nirvana.clone());
    request.candidate_ids = Some(vec![ego.clone(), nirvana.clone()]);
    request.include_grounding = true;

    let budget = PolarityBudget {
        candidate_cap: 100,
        timeout: std::time::Duration::from_secs(60),
        path_budget: kg_engine::pathfind::PathBudget::default(),
        max_hops: 5,
    };
    let result = polarity::analyze(&core.graph, &request, &budget).await.unwrap();

    let position_of = |id: &str| {
        result
            .projections
            .iter()
            .find(|p| p.concept_id == id)
            .unwrap()
            .position
    };
    assert!((position_of(&ego) - 1.0).abs() < 0.05);
    assert!((position_of(&nirvana) + 1.0).abs() < 0.05);
    assert!(!result.axis.weak_axis);
}

#[tokio::test]
async fn vocabulary_consolidation_dry_run_then_apply() {
    let (_tmp, core) = test_core().await;
    ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;

    // The mock extractor introduced ASSOCIATED_WITH; plant a synonym with
    // a matching embedding so the pair generator finds it.
    let embedder = core.embedder().await;
    core.vocabulary
        .resolve_type("ASSOCIATED TO", embedder.as_ref())
        .await
        .unwrap();

    let before = core.vocabulary.status().await.active;
    assert!(before > 30);

    let mut adjudicator = MockExtractor::default();
    adjudicator.merges.insert(
        ("ASSOCIATED_TO".into(), "ASSOCIATED_WITH".into()),
        MergeVerdict::Merge {
            reason: "same relation".into(),
        },
    );

    // Dry run: a plan, no mutation.
    let plan = core
        .vocabulary
        .consolidate(30, Some(0.45), true, &adjudicator, &core.graph)
        .await
        .unwrap();
    assert!(plan.dry_run);
    assert!(plan.steps.len() <= 10);
    assert_eq!(core.vocabulary.status().await.active, before);

    // Real run: size decreases monotonically, builtins survive.
    let report = core
        .vocabulary
        .consolidate(30, Some(0.45), false, &adjudicator, &core.graph)
        .await
        .unwrap();
    let after = core.vocabulary.status().await.active;
    assert!(after <= before);
    assert_eq!(report.active_after, after);

    let builtins_active = core
        .vocabulary
        .list()
        .await
        .into_iter()
        .filter(|t| t.builtin && t.active)
        .count();
    assert_eq!(builtins_active, 30);
}

#[tokio::test]
async fn job_approval_workflow() {
    let (_tmp, core) = test_core().await;

    // Manual approval path.
    let pending = ingest::submit(
        &core,
        "tests",
        IngestRequest {
            ontology: "Philosophy".into(),
            filename: "pending.md".into(),
            content: IngestContent::Text("Patience precedes Approval.".into()),
            force_reingest: false,
            auto_approve: false,
            target_words: None,
            overlap_words: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(pending.status, JobStatus::AwaitingApproval);
    assert!(core.jobs.claim_next().await.unwrap().is_none());

    // Simulate the 24h deadline passing, then sweep.
    sqlx::query("UPDATE jobs SET expires_at = ? WHERE id = ?")
        .bind(chrono::Utc::now().timestamp() - 1)
        .bind(&pending.id)
        .execute(core.graph.pool())
        .await
        .unwrap();
    scheduler::sweep_once(&core).await.unwrap();
    assert_eq!(
        core.jobs.get(&pending.id).await.unwrap().status,
        JobStatus::Expired
    );

    // Auto-approve path goes straight to approved and runs.
    let auto = ingest_and_run(&core, "auto.md", "Momentum carries Approval forward.", false).await;
    assert_eq!(auto.status, JobStatus::Completed);
    assert!(auto.approved_at.is_some());
}

#[tokio::test]
async fn cancelled_job_stops_at_chunk_boundary() {
    let (_tmp, core) = test_core().await;
    let job = ingest::submit(
        &core,
        "tests",
        IngestRequest {
            ontology: "Philosophy".into(),
            filename: "cancel-me.md".into(),
            content: IngestContent::Text(LECTURE_ONE.into()),
            force_reingest: false,
            auto_approve: true,
            target_words: None,
            overlap_words: None,
        },
    )
    .await
    .unwrap();

    let claimed = core.jobs.claim_next().await.unwrap().unwrap();
    core.jobs.cancel(&claimed.id).await.unwrap();
    ingest::run_job(&core, &claimed).await;

    let finished = core.jobs.get(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Cancelled);
    assert_eq!(finished.progress.chunks_done, 0);
}

#[tokio::test]
async fn vector_search_round_trip_law() {
    let (_tmp, core) = test_core().await;
    ingest_and_run(&core, "lecture1.md", LECTURE_ONE, false).await;

    let ids = core.graph.list_concept_ids(None).await.unwrap();
    for id in ids {
        let concept = core.graph.get_concept(&id).await.unwrap().unwrap();
        let hits = core
            .graph
            .vector_search(&concept.embedding, None, 5, 0.99)
            .await
            .unwrap();
        assert_eq!(hits[0].0, id, "own embedding must rank first");
    }
}
