//! HTTP/JSON API over the engine.
//!
//! A thin request/response layer: every handler validates input, calls the
//! corresponding engine module, and serializes the result. No business
//! logic lives here.
//!
//! # Endpoints
//!
//! | Area | Routes |
//! |------|--------|
//! | Ingestion | `POST /ingest/text`, `/ingest/file`, `/ingest/image` |
//! | Jobs | `GET /jobs`, `GET /jobs/{id}`, `POST /jobs/{id}/approve`, `POST /jobs/{id}/cancel`, `DELETE /jobs/{id}` |
//! | Query | `POST /query/search`, `/query/concept`, `/query/connect-by-search`, `/query/polarity-axis`, `/query/discover-polarity-axes` |
//! | Ontology | `GET /ontology`, `GET /ontology/{name}`, `GET /ontology/{name}/files`, `POST /ontology/{name}/rename`, `DELETE /ontology/{name}` |
//! | Documents | `GET /documents/{id}/content`, `DELETE /documents/{id}` |
//! | Vocabulary | `GET /vocabulary/status`, `GET /vocabulary/list`, `POST /vocabulary/consolidate`, `/vocabulary/merge`, `/vocabulary/generate-embeddings` |
//! | Admin | provider-config CRUD with activate-only-one and hot reload |
//! | Misc | `GET /health`, `GET /stats` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "content already ingested" } }
//! ```
//!
//! Validation maps to 400, auth to 401, missing entities to 404, conflicts
//! to 409, provider outages to 503, internal faults to 500. Empty result
//! sets are 200s with empty bodies, never errors.
//!
//! # Auth
//!
//! The out-of-scope auth layer is expected to populate `x-principal` and
//! optionally `x-ontology-scope` (comma-separated ontology names). Mutating
//! routes require a principal; scoped reads intersect with the scope set.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::core::Core;
use crate::error::KgError;
use crate::ingest::{self, IngestContent, IngestRequest};
use crate::models::JobStatus;
use crate::pathfind::PathBudget;
use crate::polarity::{self, PolarityBudget, PolarityRequest};
use crate::search;

#[derive(Clone)]
struct AppState {
    core: Arc<Core>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(core: Arc<Core>) -> anyhow::Result<()> {
    let bind_addr = core.config.server.bind.clone();
    let app = router(core);

    tracing::info!(%bind_addr, "API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(core: Arc<Core>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/ingest/text", post(handle_ingest_text))
        .route("/ingest/file", post(handle_ingest_file))
        .route("/ingest/image", post(handle_ingest_image))
        .route("/jobs", get(handle_jobs_list))
        .route("/jobs/{id}", get(handle_job_get).delete(handle_job_delete))
        .route("/jobs/{id}/approve", post(handle_job_approve))
        .route("/jobs/{id}/cancel", post(handle_job_cancel))
        .route("/query/search", post(handle_search))
        .route("/query/concept", post(handle_concept))
        .route("/query/connect-by-search", post(handle_connect_by_search))
        .route("/query/polarity-axis", post(handle_polarity_axis))
        .route(
            "/query/discover-polarity-axes",
            post(handle_discover_axes),
        )
        .route("/ontology", get(handle_ontology_list))
        .route(
            "/ontology/{name}",
            get(handle_ontology_info).delete(handle_ontology_delete),
        )
        .route("/ontology/{name}/files", get(handle_ontology_files))
        .route("/ontology/{name}/rename", post(handle_ontology_rename))
        .route("/documents/{id}/content", get(handle_document_content))
        .route("/documents/{id}", delete(handle_document_delete))
        .route(
            "/concepts/{id}",
            axum::routing::patch(handle_concept_update).delete(handle_concept_delete),
        )
        .route("/relationships/{id}", delete(handle_edge_delete))
        .route("/vocabulary/status", get(handle_vocab_status))
        .route("/vocabulary/list", get(handle_vocab_list))
        .route("/vocabulary/consolidate", post(handle_vocab_consolidate))
        .route("/vocabulary/merge", post(handle_vocab_merge))
        .route(
            "/vocabulary/generate-embeddings",
            post(handle_vocab_generate_embeddings),
        )
        .route(
            "/admin/configs/{kind}",
            get(handle_config_list).post(handle_config_create),
        )
        .route("/admin/configs/{kind}/{id}", delete(handle_config_delete))
        .route(
            "/admin/configs/{kind}/{id}/activate",
            post(handle_config_activate),
        )
        .route("/admin/configs/{kind}/reload", post(handle_config_reload))
        .route(
            "/admin/rebuild-embeddings",
            post(handle_rebuild_embeddings),
        )
        .layer(cors)
        .with_state(AppState { core })
}

// ============ Error mapping ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError(KgError);

impl From<KgError> for AppError {
    fn from(e: KgError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            KgError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            KgError::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            KgError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            KgError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            KgError::Provider { .. } => (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable"),
            KgError::Cancelled => (StatusCode::CONFLICT, "cancelled"),
            KgError::Consistency(_)
            | KgError::Database(_)
            | KgError::Io(_)
            | KgError::Serialization(_)
            | KgError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ Auth headers ============

fn principal(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("x-principal")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError(KgError::Auth("missing x-principal header".into())))
}

fn scope(headers: &HeaderMap) -> Option<Vec<String>> {
    headers
        .get("x-ontology-scope")
        .and_then(|v| v.to_str().ok())
        .map(|s| {
            s.split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect()
        })
}

/// Intersect requested ontologies with the caller's scope set.
fn scoped_ontologies(
    requested: Option<Vec<String>>,
    scope: Option<Vec<String>>,
) -> Result<Option<Vec<String>>, AppError> {
    match (requested, scope) {
        (None, s) => Ok(s),
        (Some(r), None) => Ok(Some(r)),
        (Some(r), Some(s)) => {
            let allowed: Vec<String> = r.into_iter().filter(|o| s.contains(o)).collect();
            if allowed.is_empty() {
                return Err(AppError(KgError::Auth(
                    "requested ontologies outside access scope".into(),
                )));
            }
            Ok(Some(allowed))
        }
    }
}

fn check_scope(ontology: &str, headers: &HeaderMap) -> Result<(), AppError> {
    if let Some(s) = scope(headers) {
        if !s.iter().any(|o| o == ontology) {
            return Err(AppError(KgError::Auth(format!(
                "ontology {} outside access scope",
                ontology
            ))));
        }
    }
    Ok(())
}

// ============ Health & stats ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct StatsQuery {
    ontology: Option<String>,
}

async fn handle_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.core.graph.stats(query.ontology.as_deref()).await?;
    let vocab = state.core.vocabulary.status().await;
    Ok(Json(serde_json::json!({
        "graph": stats,
        "vocabulary": vocab,
    })))
}

// ============ Ingestion ============

#[derive(Deserialize)]
struct IngestTextBody {
    ontology: String,
    filename: String,
    text: String,
    #[serde(default)]
    force_reingest: bool,
    #[serde(default)]
    auto_approve: bool,
    target_words: Option<usize>,
    overlap_words: Option<usize>,
}

#[derive(Serialize)]
struct IngestResponse {
    job_id: String,
    status: JobStatus,
    cost_estimate: Option<crate::models::CostEstimate>,
}

async fn submit_and_respond(
    state: &AppState,
    headers: &HeaderMap,
    request: IngestRequest,
) -> ApiResult<Json<IngestResponse>> {
    let who = principal(headers)?;
    check_scope(&request.ontology, headers)?;
    let job = ingest::submit(&state.core, &who, request).await?;
    Ok(Json(IngestResponse {
        job_id: job.id,
        status: job.status,
        cost_estimate: job.cost_estimate,
    }))
}

async fn handle_ingest_text(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestTextBody>,
) -> ApiResult<Json<IngestResponse>> {
    let request = IngestRequest {
        ontology: body.ontology,
        filename: body.filename,
        content: IngestContent::Text(body.text),
        force_reingest: body.force_reingest,
        auto_approve: body.auto_approve,
        target_words: body.target_words,
        overlap_words: body.overlap_words,
    };
    submit_and_respond(&state, &headers, request).await
}

#[derive(Deserialize)]
struct IngestFileBody {
    ontology: String,
    filename: String,
    /// Raw file bytes, base64-encoded; must decode to UTF-8 text.
    content_base64: String,
    #[serde(default)]
    force_reingest: bool,
    #[serde(default)]
    auto_approve: bool,
    target_words: Option<usize>,
    overlap_words: Option<usize>,
}

async fn handle_ingest_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestFileBody>,
) -> ApiResult<Json<IngestResponse>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&body.content_base64)
        .map_err(|e| KgError::Validation(format!("invalid base64 content: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| KgError::Validation("file content is not UTF-8 text".into()))?;

    let request = IngestRequest {
        ontology: body.ontology,
        filename: body.filename,
        content: IngestContent::Text(text),
        force_reingest: body.force_reingest,
        auto_approve: body.auto_approve,
        target_words: body.target_words,
        overlap_words: body.overlap_words,
    };
    submit_and_respond(&state, &headers, request).await
}

#[derive(Deserialize)]
struct IngestImageBody {
    ontology: String,
    filename: String,
    image_base64: String,
    #[serde(default = "default_image_mime")]
    mime: String,
    #[serde(default)]
    force_reingest: bool,
    #[serde(default)]
    auto_approve: bool,
}

fn default_image_mime() -> String {
    "image/png".to_string()
}

async fn handle_ingest_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestImageBody>,
) -> ApiResult<Json<IngestResponse>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&body.image_base64)
        .map_err(|e| KgError::Validation(format!("invalid base64 image: {}", e)))?;

    let request = IngestRequest {
        ontology: body.ontology,
        filename: body.filename,
        content: IngestContent::Image {
            bytes,
            mime: body.mime,
        },
        force_reingest: body.force_reingest,
        auto_approve: body.auto_approve,
        target_words: None,
        overlap_words: None,
    };
    submit_and_respond(&state, &headers, request).await
}

// ============ Jobs ============

#[derive(Deserialize)]
struct JobsListQuery {
    status: Option<String>,
    ontology: Option<String>,
    #[serde(default = "default_jobs_limit")]
    limit: i64,
}

fn default_jobs_limit() -> i64 {
    50
}

async fn handle_jobs_list(
    State(state): State<AppState>,
    Query(query): Query<JobsListQuery>,
) -> ApiResult<Json<Vec<crate::models::Job>>> {
    let status = match &query.status {
        Some(s) => Some(
            JobStatus::parse(s)
                .ok_or_else(|| KgError::Validation(format!("unknown job status '{}'", s)))?,
        ),
        None => None,
    };
    let jobs = state
        .core
        .jobs
        .list(status, query.ontology.as_deref(), query.limit)
        .await?;
    Ok(Json(jobs))
}

async fn handle_job_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::models::Job>> {
    Ok(Json(state.core.jobs.get(&id).await?))
}

async fn handle_job_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::models::Job>> {
    principal(&headers)?;
    Ok(Json(state.core.jobs.approve(&id).await?))
}

async fn handle_job_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::models::Job>> {
    principal(&headers)?;
    Ok(Json(state.core.jobs.cancel(&id).await?))
}

async fn handle_job_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    principal(&headers)?;
    state.core.jobs.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Query ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default = "default_min_similarity")]
    min_similarity: f32,
    ontology: Option<String>,
    #[serde(default)]
    include_grounding: bool,
    #[serde(default)]
    include_evidence: bool,
}

fn default_search_limit() -> usize {
    10
}
fn default_min_similarity() -> f32 {
    0.3
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<Vec<search::ConceptHit>>> {
    let ontologies = scoped_ontologies(body.ontology.map(|o| vec![o]), scope(&headers))?;
    let params = search::SearchParams {
        query: body.query,
        limit: body.limit,
        min_similarity: body.min_similarity,
        ontologies,
        include_grounding: body.include_grounding,
        include_evidence: body.include_evidence,
    };
    Ok(Json(search::search_concepts(&state.core, &params).await?))
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ConceptBody {
    Details { id: String },
    Related { id: String },
    Connect {
        from_id: String,
        to_id: String,
        max_hops: Option<usize>,
    },
}

async fn handle_concept(
    State(state): State<AppState>,
    Json(body): Json<ConceptBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let value = match body {
        ConceptBody::Details { id } => {
            serde_json::to_value(search::concept_details(&state.core, &id).await?)
        }
        ConceptBody::Related { id } => {
            serde_json::to_value(search::related_concepts(&state.core, &id).await?)
        }
        ConceptBody::Connect {
            from_id,
            to_id,
            max_hops,
        } => serde_json::to_value(
            search::connect(&state.core, &from_id, &to_id, max_hops).await?,
        ),
    }
    .map_err(KgError::from)?;
    Ok(Json(value))
}

#[derive(Deserialize)]
struct ConnectBySearchBody {
    from_query: String,
    to_query: String,
    max_hops: Option<usize>,
    #[serde(default = "default_min_similarity")]
    min_similarity: f32,
    ontology: Option<String>,
}

async fn handle_connect_by_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConnectBySearchBody>,
) -> ApiResult<Json<Option<search::ConnectBySearchResult>>> {
    let ontologies = scoped_ontologies(body.ontology.map(|o| vec![o]), scope(&headers))?;
    Ok(Json(
        search::connect_by_search(
            &state.core,
            &body.from_query,
            &body.to_query,
            body.max_hops,
            body.min_similarity,
            ontologies,
        )
        .await?,
    ))
}

#[derive(Deserialize)]
struct PolarityBody {
    positive_pole_id: String,
    negative_pole_id: String,
    candidate_ids: Option<Vec<String>>,
    #[serde(default = "default_discovery_hops")]
    candidate_discovery_hops: usize,
    #[serde(default)]
    include_path_analysis: bool,
    #[serde(default)]
    include_source_evidence: bool,
}

fn default_discovery_hops() -> usize {
    2
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

async fn handle_polarity_axis(
    State(state): State<AppState>,
    Json(body): Json<PolarityBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let request = PolarityRequest {
        positive_pole_id: body.positive_pole_id,
        negative_pole_id: body.negative_pole_id,
        candidate_ids: body.candidate_ids,
        discovery_hops: body.candidate_discovery_hops,
        // Grounding feeds the position/grounding correlation.
        include_grounding: true,
        include_paths: body.include_path_analysis,
    };
    let budget = polarity_budget(&state.core);
    let result = polarity::analyze(&state.core.graph, &request, &budget).await?;

    let mut response = serde_json::to_value(&result).map_err(KgError::from)?;
    if body.include_source_evidence {
        let mut evidence = serde_json::Map::new();
        for projection in result.projections.iter().take(20) {
            let rows = state
                .core
                .graph
                .evidence_for_concept(&projection.concept_id, 3)
                .await?;
            let quotes: Vec<String> = rows.into_iter().map(|(inst, _)| inst.quote).collect();
            evidence.insert(projection.concept_id.clone(), serde_json::json!(quotes));
        }
        response["source_evidence"] = serde_json::Value::Object(evidence);
    }
    Ok(Json(response))
}

#[derive(Deserialize)]
struct DiscoverAxesBody {
    relationship_types: Vec<String>,
    #[serde(default = "default_min_magnitude")]
    min_magnitude: f32,
    #[serde(default = "default_max_axes")]
    max_results: usize,
    ontology: Option<String>,
}

fn default_min_magnitude() -> f32 {
    0.1
}
fn default_max_axes() -> usize {
    10
}

async fn handle_discover_axes(
    State(state): State<AppState>,
    Json(body): Json<DiscoverAxesBody>,
) -> ApiResult<Json<Vec<polarity::DiscoveredAxis>>> {
    if body.relationship_types.is_empty() {
        return Err(AppError(KgError::Validation(
            "relationship_types must not be empty".into(),
        )));
    }
    Ok(Json(
        polarity::discover_axes(
            &state.core.graph,
            &body.relationship_types,
            body.min_magnitude,
            body.max_results,
            body.ontology.as_deref(),
        )
        .await?,
    ))
}

// ============ Ontology & documents ============

async fn handle_ontology_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    let all = state.core.graph.list_ontologies().await?;
    let visible = scope(&headers);
    let list = all
        .into_iter()
        .filter(|(name, _)| visible.as_ref().is_none_or(|s| s.contains(name)))
        .map(|(name, concepts)| serde_json::json!({ "name": name, "concepts": concepts }))
        .collect();
    Ok(Json(list))
}

async fn handle_ontology_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    check_scope(&name, &headers)?;
    let stats = state.core.graph.stats(Some(&name)).await?;
    if stats.concepts == 0 && stats.documents == 0 {
        return Err(AppError(KgError::NotFound(format!("ontology {}", name))));
    }
    Ok(Json(serde_json::json!({ "name": name, "stats": stats })))
}

async fn handle_ontology_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<crate::models::Document>>> {
    check_scope(&name, &headers)?;
    Ok(Json(state.core.graph.list_documents(&name).await?))
}

#[derive(Deserialize)]
struct RenameBody {
    new_name: String,
}

async fn handle_ontology_rename(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    check_scope(&name, &headers)?;
    if body.new_name.trim().is_empty() {
        return Err(AppError(KgError::Validation("new_name must not be empty".into())));
    }
    state
        .core
        .graph
        .rename_ontology(&name, &body.new_name)
        .await?;
    Ok(Json(serde_json::json!({ "renamed": name, "to": body.new_name })))
}

async fn handle_ontology_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<crate::graph::GraphStats>> {
    principal(&headers)?;
    check_scope(&name, &headers)?;
    Ok(Json(state.core.graph.delete_ontology(&name).await?))
}

async fn handle_document_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let doc = state
        .core
        .graph
        .get_document(&id)
        .await?
        .ok_or_else(|| KgError::NotFound(format!("document {}", id)))?;
    let key = doc
        .object_key
        .ok_or_else(|| KgError::NotFound(format!("document {} has no stored content", id)))?;
    let bytes = state.core.objects.get(&key)?;
    Ok(([(axum::http::header::CONTENT_TYPE, doc.mime)], bytes).into_response())
}

async fn handle_document_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    let object_key = state
        .core
        .graph
        .get_document(&id)
        .await?
        .and_then(|d| d.object_key);
    let removed_sources = state.core.graph.delete_document(&id).await?;
    if let Some(key) = object_key {
        state.core.objects.delete(&key)?;
    }
    Ok(Json(serde_json::json!({
        "deleted": id,
        "sources_removed": removed_sources.len(),
    })))
}

// ============ Manual graph edits ============

#[derive(Deserialize)]
struct ConceptUpdateBody {
    label: Option<String>,
    description: Option<String>,
}

async fn handle_concept_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ConceptUpdateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    if body.label.is_none() && body.description.is_none() {
        return Err(AppError(KgError::Validation(
            "nothing to update: provide label and/or description".into(),
        )));
    }
    state
        .core
        .graph
        .update_concept(&id, body.label.as_deref(), body.description.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "updated": id })))
}

async fn handle_concept_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    principal(&headers)?;
    state.core.graph.delete_concept(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_edge_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    principal(&headers)?;
    state.core.graph.delete_edge(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Vocabulary ============

async fn handle_vocab_status(
    State(state): State<AppState>,
) -> Json<crate::vocabulary::VocabularyStatus> {
    Json(state.core.vocabulary.status().await)
}

async fn handle_vocab_list(
    State(state): State<AppState>,
) -> Json<Vec<crate::models::VocabularyType>> {
    Json(state.core.vocabulary.list().await)
}

#[derive(Deserialize)]
struct ConsolidateBody {
    target_size: usize,
    threshold: Option<f32>,
    #[serde(default)]
    dry_run: bool,
}

async fn handle_vocab_consolidate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConsolidateBody>,
) -> ApiResult<Json<crate::vocabulary::ConsolidationReport>> {
    principal(&headers)?;
    let extractor = state.core.extractor().await;
    let report = state
        .core
        .vocabulary
        .consolidate(
            body.target_size,
            body.threshold,
            body.dry_run,
            extractor.as_ref(),
            &state.core.graph,
        )
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct MergeBody {
    from: String,
    into: String,
    #[serde(default = "default_merge_reason")]
    reason: String,
}

fn default_merge_reason() -> String {
    "operator request".to_string()
}

async fn handle_vocab_merge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<MergeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    let edges = state
        .core
        .vocabulary
        .merge(&body.from, &body.into, &body.reason, &state.core.graph)
        .await?;
    Ok(Json(serde_json::json!({
        "merged": body.from,
        "into": body.into,
        "edges_retyped": edges,
    })))
}

#[derive(Deserialize)]
struct GenerateEmbeddingsBody {
    #[serde(default)]
    all: bool,
}

async fn handle_vocab_generate_embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GenerateEmbeddingsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    let embedder = state.core.embedder().await;
    let updated = state
        .core
        .vocabulary
        .generate_embeddings(embedder.as_ref(), body.all)
        .await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

// ============ Admin: provider configs ============

#[derive(Deserialize)]
struct ConfigCreateBody {
    name: String,
    provider: String,
    model: Option<String>,
    dims: Option<i64>,
    base_url: Option<String>,
    #[serde(default)]
    delete_protected: bool,
    #[serde(default)]
    change_protected: bool,
}

fn validate_kind(kind: &str) -> Result<(), AppError> {
    match kind {
        "embedding" | "extraction" => Ok(()),
        other => Err(AppError(KgError::Validation(format!(
            "unknown config kind '{}'",
            other
        )))),
    }
}

async fn handle_config_list(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    validate_kind(&kind)?;
    use sqlx::Row;
    let rows = sqlx::query(
        "SELECT id, name, provider, model, dims, base_url, active, delete_protected, change_protected, created_at FROM provider_configs WHERE kind = ? ORDER BY created_at",
    )
    .bind(&kind)
    .fetch_all(state.core.graph.pool())
    .await
    .map_err(KgError::from)?;
    let list = rows
        .into_iter()
        .map(|row| {
            serde_json::json!({
                "id": row.get::<String, _>("id"),
                "name": row.get::<String, _>("name"),
                "provider": row.get::<String, _>("provider"),
                "model": row.get::<Option<String>, _>("model"),
                "dims": row.get::<Option<i64>, _>("dims"),
                "base_url": row.get::<Option<String>, _>("base_url"),
                "active": row.get::<i64, _>("active") != 0,
                "delete_protected": row.get::<i64, _>("delete_protected") != 0,
                "change_protected": row.get::<i64, _>("change_protected") != 0,
            })
        })
        .collect();
    Ok(Json(list))
}

async fn handle_config_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Json(body): Json<ConfigCreateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    validate_kind(&kind)?;
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO provider_configs (id, kind, name, provider, model, dims, base_url, active, delete_protected, change_protected, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&kind)
    .bind(&body.name)
    .bind(&body.provider)
    .bind(&body.model)
    .bind(body.dims)
    .bind(&body.base_url)
    .bind(body.delete_protected as i64)
    .bind(body.change_protected as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(state.core.graph.pool())
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            KgError::Conflict(format!("config '{}' already exists", body.name))
        }
        other => KgError::Database(other),
    })?;
    Ok(Json(serde_json::json!({ "id": id })))
}

async fn handle_config_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    principal(&headers)?;
    validate_kind(&kind)?;
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT delete_protected, active FROM provider_configs WHERE kind = ? AND id = ?",
    )
    .bind(&kind)
    .bind(&id)
    .fetch_optional(state.core.graph.pool())
    .await
    .map_err(KgError::from)?;
    let (delete_protected, active) =
        row.ok_or_else(|| KgError::NotFound(format!("config {}", id)))?;
    if delete_protected != 0 {
        return Err(AppError(KgError::Conflict("config is delete-protected".into())));
    }
    if active != 0 {
        return Err(AppError(KgError::Conflict(
            "config is active; activate another config first".into(),
        )));
    }
    sqlx::query("DELETE FROM provider_configs WHERE kind = ? AND id = ?")
        .bind(&kind)
        .bind(&id)
        .execute(state.core.graph.pool())
        .await
        .map_err(KgError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Activate one config and deactivate all others of the same kind.
async fn handle_config_activate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    validate_kind(&kind)?;
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT change_protected FROM provider_configs WHERE kind = ? AND id = ?",
    )
    .bind(&kind)
    .bind(&id)
    .fetch_optional(state.core.graph.pool())
    .await
    .map_err(KgError::from)?;
    let change_protected = exists.ok_or_else(|| KgError::NotFound(format!("config {}", id)))?;
    if change_protected != 0 {
        return Err(AppError(KgError::Conflict("config is change-protected".into())));
    }

    let mut tx = state.core.graph.pool().begin().await.map_err(KgError::from)?;
    sqlx::query("UPDATE provider_configs SET active = 0 WHERE kind = ?")
        .bind(&kind)
        .execute(&mut *tx)
        .await
        .map_err(KgError::from)?;
    sqlx::query("UPDATE provider_configs SET active = 1 WHERE kind = ? AND id = ?")
        .bind(&kind)
        .bind(&id)
        .execute(&mut *tx)
        .await
        .map_err(KgError::from)?;
    tx.commit().await.map_err(KgError::from)?;

    Ok(Json(serde_json::json!({ "activated": id })))
}

/// Hot-reload: rebuild the in-process provider from the active config row.
async fn handle_config_reload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    principal(&headers)?;
    validate_kind(&kind)?;
    use sqlx::Row;
    let row = sqlx::query(
        "SELECT provider, model, dims, base_url FROM provider_configs WHERE kind = ? AND active = 1",
    )
    .bind(&kind)
    .fetch_optional(state.core.graph.pool())
    .await
    .map_err(KgError::from)?
    .ok_or_else(|| KgError::NotFound(format!("no active {} config", kind)))?;

    match kind.as_str() {
        "embedding" => {
            let config = crate::config::EmbeddingConfig {
                provider: row.get("provider"),
                model: row.get("model"),
                dims: row.get::<Option<i64>, _>("dims").map(|d| d as usize),
                base_url: row.get("base_url"),
                ..state.core.config.embedding.clone()
            };
            state.core.swap_embedder(&config).await?;
        }
        _ => {
            let config = crate::config::ExtractionConfig {
                provider: row.get("provider"),
                model: row.get("model"),
                base_url: row.get("base_url"),
                ..state.core.config.extraction.clone()
            };
            state.core.swap_extractor(&config).await?;
        }
    }
    Ok(Json(serde_json::json!({ "reloaded": kind })))
}

/// Submit an embedding rebuild job: re-embed the whole graph with the given
/// configuration, then swap it active. This is the only path that may
/// change the active embedding dimension.
async fn handle_rebuild_embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<crate::config::EmbeddingConfig>,
) -> ApiResult<Json<IngestResponse>> {
    let who = principal(&headers)?;
    // Fail fast on an unbuildable config instead of queueing a doomed job.
    crate::embedding::create_provider(&config)?;
    let job = state
        .core
        .jobs
        .submit(
            "rebuild_embeddings",
            &who,
            "",
            serde_json::to_value(&config).map_err(KgError::from)?,
            None,
            false,
            state.core.config.jobs.pending_deadline_hours,
        )
        .await?;
    Ok(Json(IngestResponse {
        job_id: job.id,
        status: job.status,
        cost_estimate: job.cost_estimate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ontology-scope", "Philosophy, Science".parse().unwrap());
        assert_eq!(
            scope(&headers),
            Some(vec!["Philosophy".to_string(), "Science".to_string()])
        );
        assert_eq!(scope(&HeaderMap::new()), None);
    }

    #[test]
    fn scoped_ontologies_intersection() {
        let requested = Some(vec!["Philosophy".to_string(), "Secrets".to_string()]);
        let allowed = Some(vec!["Philosophy".to_string()]);
        let result = scoped_ontologies(requested, allowed).unwrap();
        assert_eq!(result, Some(vec!["Philosophy".to_string()]));

        // Entirely outside scope is an auth error.
        let requested = Some(vec!["Secrets".to_string()]);
        let allowed = Some(vec!["Philosophy".to_string()]);
        assert!(scoped_ontologies(requested, allowed).is_err());
    }

    #[test]
    fn principal_is_required() {
        assert!(principal(&HeaderMap::new()).is_err());
        let mut headers = HeaderMap::new();
        headers.insert("x-principal", "alice".parse().unwrap());
        assert_eq!(principal(&headers).unwrap(), "alice");
    }
}
