//! `kg` — the knowledge-graph engine CLI.
//!
//! The thinnest conformant client: every subcommand maps 1:1 to an API
//! operation. Exit code 0 on success, non-zero on failure.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use kg_engine::config;
use kg_engine::core::Core;
use kg_engine::ingest::{self, IngestContent, IngestRequest};
use kg_engine::models::JobStatus;
use kg_engine::pathfind::PathBudget;
use kg_engine::polarity::{self, PolarityBudget, PolarityRequest};
use kg_engine::scheduler::Scheduler;
use kg_engine::search;
use kg_engine::server;

#[derive(Parser)]
#[command(
    name = "kg",
    about = "Knowledge-graph engine — ingest documents, query the concept graph",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/kg.toml")]
    config: PathBuf,

    /// Principal recorded on submitted jobs
    #[arg(long, global = true, default_value = "cli")]
    principal: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and seed the builtin vocabulary
    Init,

    /// Start the HTTP server with the job scheduler
    Serve,

    /// Submit content for ingestion
    Ingest {
        #[command(subcommand)]
        what: IngestCmd,
    },

    /// Query the graph
    Search {
        #[command(subcommand)]
        what: SearchCmd,
    },

    /// Inspect and manage jobs
    Job {
        #[command(subcommand)]
        what: JobCmd,
    },

    /// Inspect and manage the relationship vocabulary
    Vocab {
        #[command(subcommand)]
        what: VocabCmd,
    },

    /// Polarity-axis analysis
    Polarity {
        #[command(subcommand)]
        what: PolarityCmd,
    },

    /// Inspect and manage ontologies
    Ontology {
        #[command(subcommand)]
        what: OntologyCmd,
    },
}

#[derive(Subcommand)]
enum IngestCmd {
    /// Ingest a single text file
    File {
        path: PathBuf,
        #[arg(long)]
        ontology: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        auto_approve: bool,
        #[arg(long)]
        target_words: Option<usize>,
        #[arg(long)]
        overlap_words: Option<usize>,
    },
    /// Ingest text passed on the command line
    Text {
        text: String,
        #[arg(long)]
        ontology: String,
        #[arg(long, default_value = "inline.txt")]
        filename: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        auto_approve: bool,
    },
    /// Ingest every matching file under a directory (one job per file)
    Directory {
        path: PathBuf,
        #[arg(long)]
        ontology: String,
        /// Glob for files to include
        #[arg(long, default_value = "**/*.{md,txt}")]
        include: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        auto_approve: bool,
    },
    /// Ingest an image document
    Image {
        path: PathBuf,
        #[arg(long)]
        ontology: String,
        #[arg(long, default_value = "image/png")]
        mime: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        auto_approve: bool,
    },
}

#[derive(Subcommand)]
enum SearchCmd {
    /// Semantic concept search
    Query {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 0.3)]
        min_similarity: f32,
        #[arg(long)]
        ontology: Option<String>,
        #[arg(long)]
        grounding: bool,
        #[arg(long)]
        evidence: bool,
    },
    /// Full details for one concept
    Details { id: String },
    /// One-hop neighborhood of a concept
    Related { id: String },
    /// Shortest path between two concepts (by id or by query)
    Connect {
        from: String,
        to: String,
        #[arg(long)]
        max_hops: Option<usize>,
        /// Treat from/to as search queries instead of concept ids
        #[arg(long)]
        by_query: bool,
    },
}

#[derive(Subcommand)]
enum JobCmd {
    /// List jobs
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        ontology: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one job
    Status { id: String },
    /// Approve a pending job
    Approve { id: String },
    /// Cancel a job
    Cancel { id: String },
    /// Delete a terminal job record
    Delete { id: String },
}

#[derive(Subcommand)]
enum VocabCmd {
    /// Size, zone, and category breakdown
    Status,
    /// Every type, active and merged
    List,
    /// Merge synonymous types down to a target size
    Consolidate {
        #[arg(long)]
        target: usize,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Merge one type into another
    Merge {
        from: String,
        into: String,
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum PolarityCmd {
    /// Full analysis: projections, correlation, optional paths
    Analyze {
        #[arg(long)]
        positive: String,
        #[arg(long)]
        negative: String,
        #[arg(long)]
        paths: bool,
    },
    /// Find candidate axes from opposition-flavored edges
    Discover {
        #[arg(long, value_delimiter = ',', default_value = "OPPOSITE_OF,CONTRASTS_WITH")]
        types: Vec<String>,
        #[arg(long, default_value_t = 0.1)]
        min_magnitude: f32,
        #[arg(long, default_value_t = 10)]
        max_results: usize,
        #[arg(long)]
        ontology: Option<String>,
    },
    /// Project explicit candidates onto an axis
    Project {
        #[arg(long)]
        positive: String,
        #[arg(long)]
        negative: String,
        /// Candidate concept ids
        candidates: Vec<String>,
    },
}

#[derive(Subcommand)]
enum OntologyCmd {
    /// List ontologies with concept counts
    List,
    /// Statistics for one ontology
    Info { name: String },
    /// Documents ingested into an ontology
    Files { name: String },
    /// Rename an ontology
    Rename { name: String, new_name: String },
    /// Delete an ontology and everything in it
    Delete {
        name: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kg_engine=info,kg=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let core = Core::init(cfg).await?;

    match cli.command {
        Commands::Init => {
            // Core::init already migrated and seeded.
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let scheduler = Scheduler::start(Arc::clone(&core)).await?;
            server::run_server(Arc::clone(&core)).await?;
            scheduler.stop().await;
        }
        Commands::Ingest { what } => run_ingest(&core, &cli.principal, what).await?,
        Commands::Search { what } => run_search(&core, what).await?,
        Commands::Job { what } => run_job_cmd(&core, what).await?,
        Commands::Vocab { what } => run_vocab(&core, what).await?,
        Commands::Polarity { what } => run_polarity(&core, what).await?,
        Commands::Ontology { what } => run_ontology(&core, what).await?,
    }

    Ok(())
}

fn print_submitted(job: &kg_engine::models::Job) {
    println!("job {}", job.id);
    println!("  status: {}", job.status.as_str());
    if let Some(estimate) = &job.cost_estimate {
        println!("  chunks: {}", estimate.chunks);
        println!("  est. cost: ${:.4}", estimate.est_cost_usd);
    }
    if job.status == JobStatus::AwaitingApproval {
        println!("  approve with: kg job approve {}", job.id);
    }
}

async fn run_ingest(core: &Arc<Core>, principal: &str, cmd: IngestCmd) -> Result<()> {
    match cmd {
        IngestCmd::File {
            path,
            ontology,
            force,
            auto_approve,
            target_words,
            overlap_words,
        } => {
            let text = std::fs::read_to_string(&path)?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file.txt".to_string());
            let job = ingest::submit(
                core,
                principal,
                IngestRequest {
                    ontology,
                    filename,
                    content: IngestContent::Text(text),
                    force_reingest: force,
                    auto_approve,
                    target_words,
                    overlap_words,
                },
            )
            .await?;
            print_submitted(&job);
        }
        IngestCmd::Text {
            text,
            ontology,
            filename,
            force,
            auto_approve,
        } => {
            let job = ingest::submit(
                core,
                principal,
                IngestRequest {
                    ontology,
                    filename,
                    content: IngestContent::Text(text),
                    force_reingest: force,
                    auto_approve,
                    target_words: None,
                    overlap_words: None,
                },
            )
            .await?;
            print_submitted(&job);
        }
        IngestCmd::Directory {
            path,
            ontology,
            include,
            force,
            auto_approve,
        } => {
            let glob = globset::GlobBuilder::new(&include)
                .literal_separator(false)
                .build()?
                .compile_matcher();

            let mut submitted = 0usize;
            let mut skipped = 0usize;
            for entry in walkdir::WalkDir::new(&path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let rel = entry.path().strip_prefix(&path).unwrap_or(entry.path());
                if !glob.is_match(rel) {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    skipped += 1;
                    continue;
                };
                let filename = rel.to_string_lossy().to_string();
                match ingest::submit(
                    core,
                    principal,
                    IngestRequest {
                        ontology: ontology.clone(),
                        filename: filename.clone(),
                        content: IngestContent::Text(text),
                        force_reingest: force,
                        auto_approve,
                        target_words: None,
                        overlap_words: None,
                    },
                )
                .await
                {
                    Ok(job) => {
                        println!("{}  {}", job.id, filename);
                        submitted += 1;
                    }
                    Err(kg_engine::error::KgError::Conflict(_)) => {
                        println!("skip (already ingested)  {}", filename);
                        skipped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            println!("submitted: {} jobs, skipped: {}", submitted, skipped);
        }
        IngestCmd::Image {
            path,
            ontology,
            mime,
            force,
            auto_approve,
        } => {
            let bytes = std::fs::read(&path)?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "image".to_string());
            let job = ingest::submit(
                core,
                principal,
                IngestRequest {
                    ontology,
                    filename,
                    content: IngestContent::Image { bytes, mime },
                    force_reingest: force,
                    auto_approve,
                    target_words: None,
                    overlap_words: None,
                },
            )
            .await?;
            print_submitted(&job);
        }
    }
    Ok(())
}

async fn run_search(core: &Arc<Core>, cmd: SearchCmd) -> Result<()> {
    match cmd {
        SearchCmd::Query {
            query,
            limit,
            min_similarity,
            ontology,
            grounding,
            evidence,
        } => {
            let hits = search::search_concepts(
                core,
                &search::SearchParams {
                    query,
                    limit,
                    min_similarity,
                    ontologies: ontology.map(|o| vec![o]),
                    include_grounding: grounding,
                    include_evidence: evidence,
                },
            )
            .await?;
            if hits.is_empty() {
                println!("no results");
                return Ok(());
            }
            for hit in &hits {
                let grounding = hit
                    .grounding
                    .map(|g| format!("  grounding {:+.2}", g))
                    .unwrap_or_default();
                println!(
                    "{:.3}  {}  [{}]{}",
                    hit.similarity, hit.concept.label, hit.concept.ontology, grounding
                );
                println!("       {}", hit.concept.id);
                if let Some(evidence) = &hit.evidence {
                    for item in evidence {
                        println!("       \"{}\"", item.quote);
                    }
                }
            }
        }
        SearchCmd::Details { id } => {
            let details = search::concept_details(core, &id).await?;
            println!("{}  [{}]", details.concept.label, details.concept.ontology);
            println!("  id: {}", details.concept.id);
            println!("  grounding: {:+.2}", details.grounding);
            if !details.concept.description.is_empty() {
                println!("  description: {}", details.concept.description);
            }
            if !details.concept.search_terms.is_empty() {
                println!("  terms: {}", details.concept.search_terms.join(", "));
            }
            for e in &details.evidence {
                println!("  evidence: \"{}\"", e.quote);
            }
            for r in &details.relationships {
                println!(
                    "  {} -{}-> {}  ({} sources)",
                    r.from_label, r.type_name, r.to_label, r.evidence_count
                );
            }
        }
        SearchCmd::Related { id } => {
            let edges = search::related_concepts(core, &id).await?;
            if edges.is_empty() {
                println!("no relationships");
            }
            for r in &edges {
                println!(
                    "{} -{}-> {}  (confidence {:.2}, {} sources)",
                    r.from_label, r.type_name, r.to_label, r.confidence, r.evidence_count
                );
            }
        }
        SearchCmd::Connect {
            from,
            to,
            max_hops,
            by_query,
        } => {
            let connection = if by_query {
                match search::connect_by_search(core, &from, &to, max_hops, 0.3, None).await? {
                    Some(result) => {
                        println!(
                            "poles: {} … {}",
                            result.from.label, result.to.label
                        );
                        result.connection
                    }
                    None => {
                        println!("no matching poles");
                        return Ok(());
                    }
                }
            } else {
                search::connect(core, &from, &to, max_hops).await?
            };

            match &connection.path {
                Some(path) => {
                    let labels: Vec<&str> = path.iter().map(|c| c.label.as_str()).collect();
                    println!("path ({} hops): {}", connection.hops, labels.join(" -> "));
                }
                None if connection.budget_exceeded => println!("no path (budget exceeded)"),
                None => println!("no path"),
            }
        }
    }
    Ok(())
}

async fn run_job_cmd(core: &Arc<Core>, cmd: JobCmd) -> Result<()> {
    match cmd {
        JobCmd::List {
            status,
            ontology,
            limit,
        } => {
            let status = match status {
                Some(s) => Some(
                    JobStatus::parse(&s)
                        .ok_or_else(|| anyhow::anyhow!("unknown status '{}'", s))?,
                ),
                None => None,
            };
            let jobs = core.jobs.list(status, ontology.as_deref(), limit).await?;
            if jobs.is_empty() {
                println!("no jobs");
            }
            for job in &jobs {
                println!(
                    "{}  {:18}  {:10}  {}",
                    job.id,
                    job.status.as_str(),
                    job.ontology,
                    job.job_type
                );
            }
        }
        JobCmd::Status { id } => {
            let job = core.jobs.get(&id).await?;
            println!("job {}", job.id);
            println!("  type: {}", job.job_type);
            println!("  status: {}", job.status.as_str());
            println!("  ontology: {}", job.ontology);
            println!("  principal: {}", job.principal);
            println!(
                "  progress: {}/{} chunks",
                job.progress.chunks_done, job.progress.chunks_total
            );
            println!(
                "  concepts: {} created, {} reused",
                job.progress.concepts_created, job.progress.concepts_reused
            );
            println!(
                "  edges: {}, instances: {}, new types: {}",
                job.progress.edges_created,
                job.progress.instances_created,
                job.progress.new_types_created
            );
            println!("  cost: ${:.4}", job.progress.cost_usd);
            for e in &job.errors {
                println!("  error: {}", e);
            }
        }
        JobCmd::Approve { id } => {
            let job = core.jobs.approve(&id).await?;
            println!("job {} approved", job.id);
        }
        JobCmd::Cancel { id } => {
            let job = core.jobs.cancel(&id).await?;
            println!("job {} -> {}", job.id, job.status.as_str());
        }
        JobCmd::Delete { id } => {
            core.jobs.delete(&id).await?;
            println!("job {} deleted", id);
        }
    }
    Ok(())
}

async fn run_vocab(core: &Arc<Core>, cmd: VocabCmd) -> Result<()> {
    match cmd {
        VocabCmd::Status => {
            let status = core.vocabulary.status().await;
            println!("vocabulary");
            println!("  active: {}", status.active);
            println!("  total: {}", status.total);
            println!("  zone: {}", status.zone.as_str());
            let mut categories: Vec<_> = status.by_category.iter().collect();
            categories.sort();
            for (category, count) in categories {
                println!("  {}: {}", category, count);
            }
        }
        VocabCmd::List => {
            for t in core.vocabulary.list().await {
                let flags = match (t.builtin, t.active) {
                    (true, true) => "builtin",
                    (false, true) => "",
                    (_, false) => "inactive",
                };
                let merged = t
                    .merged_into
                    .map(|m| format!(" -> {}", m))
                    .unwrap_or_default();
                println!(
                    "{:24} {:12} uses={:<6} {}{}",
                    t.name, t.category, t.usage_count, flags, merged
                );
            }
        }
        VocabCmd::Consolidate {
            target,
            threshold,
            dry_run,
        } => {
            let extractor = core.extractor().await;
            let report = core
                .vocabulary
                .consolidate(target, threshold, dry_run, extractor.as_ref(), &core.graph)
                .await?;
            println!(
                "consolidation{}: {} -> {} active types",
                if report.dry_run { " (dry-run)" } else { "" },
                report.active_before,
                report.active_after
            );
            for step in &report.steps {
                println!(
                    "  {:.3}  {} -> {}  [{}] {}",
                    step.similarity, step.source, step.target, step.outcome, step.reason
                );
            }
        }
        VocabCmd::Merge { from, into, reason } => {
            let edges = core
                .vocabulary
                .merge(&from, &into, &reason, &core.graph)
                .await?;
            println!("merged {} into {} ({} edges re-typed)", from, into, edges);
        }
    }
    Ok(())
}

fn polarity_budget(core: &Core) -> PolarityBudget {
    PolarityBudget {
        candidate_cap: core.config.limits.polarity_candidate_cap,
        timeout: std::time::Duration::from_secs(core.config.limits.polarity_timeout_secs),
        path_budget: PathBudget {
            frontier_cap: core.config.limits.frontier_cap,
            timeout: std::time::Duration::from_secs(core.config.limits.pathfind_timeout_secs),
            neighbor_timeout: std::time::Duration::from_secs(
                core.config.limits.neighbor_timeout_secs,
            ),
        },
        max_hops: core.config.limits.max_hops,
    }
}

fn print_projections(result: &kg_engine::polarity::PolarityResult) {
    println!(
        "axis magnitude {:.3}{}",
        result.axis.magnitude,
        if result.axis.weak_axis { " (weak)" } else { "" }
    );
    for p in &result.projections {
        let grounding = p
            .grounding
            .map(|g| format!("  grounding {:+.2}", g))
            .unwrap_or_default();
        println!(
            "{:+.3}  {:8}  {}{}",
            p.position, p.direction, p.label, grounding
        );
    }
    if let Some(c) = &result.correlation {
        println!(
            "correlation r={:+.3} p={:.3} ({}, n={})",
            c.r, c.p, c.strength, c.n
        );
    }
    for path in &result.paths {
        println!(
            "path coherence {:.3}, mean curvature {:.3} rad, {} nodes",
            path.coherence,
            path.mean_curvature,
            path.path.len()
        );
    }
}

async fn run_polarity(core: &Arc<Core>, cmd: PolarityCmd) -> Result<()> {
    match cmd {
        PolarityCmd::Analyze {
            positive,
            negative,
            paths,
        } => {
            let mut request = PolarityRequest::new(positive, negative);
            request.include_grounding = true;
            request.include_paths = paths;
            let result = polarity::analyze(&core.graph, &request, &polarity_budget(core)).await?;
            print_projections(&result);
        }
        PolarityCmd::Discover {
            types,
            min_magnitude,
            max_results,
            ontology,
        } => {
            let axes = polarity::discover_axes(
                &core.graph,
                &types,
                min_magnitude,
                max_results,
                ontology.as_deref(),
            )
            .await?;
            if axes.is_empty() {
                println!("no axes found");
            }
            for axis in &axes {
                println!(
                    "{:.3}  {}  {} <-> {}",
                    axis.magnitude, axis.type_name, axis.positive_pole_id, axis.negative_pole_id
                );
            }
        }
        PolarityCmd::Project {
            positive,
            negative,
            candidates,
        } => {
            let mut request = PolarityRequest::new(positive, negative);
            request.candidate_ids = Some(candidates);
            let result = polarity::analyze(&core.graph, &request, &polarity_budget(core)).await?;
            print_projections(&result);
        }
    }
    Ok(())
}

async fn run_ontology(core: &Arc<Core>, cmd: OntologyCmd) -> Result<()> {
    match cmd {
        OntologyCmd::List => {
            let list = core.graph.list_ontologies().await?;
            if list.is_empty() {
                println!("no ontologies");
            }
            for (name, concepts) in list {
                println!("{:20} {} concepts", name, concepts);
            }
        }
        OntologyCmd::Info { name } => {
            let stats = core.graph.stats(Some(&name)).await?;
            println!("{}", name);
            println!("  concepts: {}", stats.concepts);
            println!("  sources: {}", stats.sources);
            println!("  instances: {}", stats.instances);
            println!("  relationships: {}", stats.relationships);
            println!("  documents: {}", stats.documents);
        }
        OntologyCmd::Files { name } => {
            let documents = core.graph.list_documents(&name).await?;
            if documents.is_empty() {
                println!("no documents");
            }
            for doc in documents {
                println!("{}  {}  ({} bytes)", doc.id, doc.filename, doc.size_bytes);
            }
        }
        OntologyCmd::Rename { name, new_name } => {
            core.graph.rename_ontology(&name, &new_name).await?;
            println!("renamed {} -> {}", name, new_name);
        }
        OntologyCmd::Delete { name, yes } => {
            if !yes {
                anyhow::bail!("refusing to delete '{}' without --yes", name);
            }
            let removed = core.graph.delete_ontology(&name).await?;
            println!("deleted ontology {}", name);
            println!("  concepts removed: {}", removed.concepts);
            println!("  sources removed: {}", removed.sources);
            println!("  relationships removed: {}", removed.relationships);
            println!("  documents removed: {}", removed.documents);
        }
    }
    Ok(())
}
