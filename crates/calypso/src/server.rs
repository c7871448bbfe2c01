//! HTTP surface: query, explore, workspace, context, sync, and health.
//!
//! Handlers are thin: deserialize (strictly — unknown fields such as the
//! legacy single-repo `repo_root`/`file_path`/`file_paths` are rejected with
//! 422), call into the orchestrator or sync engine, serialize. Errors map
//! through [`ApiError`] to a `{code, message}` envelope with a status chosen
//! by the error kind.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Settings;
use crate::context::ContextManager;
use crate::error::{Error, ErrorKind};
use crate::orchestrator::{Orchestrator, QueryInput};
use crate::store::{Store, SummaryQuery};
use crate::sync::{validate_commit_sha, SyncEngine};
use crate::types::{
    AnalysisContextSpec, CallDirection, ContextFileState, QueryScope,
};

/// Shared application state.
pub struct AppState {
    pub store: Arc<Store>,
    pub writer: Arc<crate::writer::SingleWriter>,
    pub orchestrator: Arc<Orchestrator>,
    pub contexts: Arc<ContextManager>,
    pub sync: Arc<SyncEngine>,
    pub settings: Settings,
}

pub type SharedState = Arc<AppState>;

/// Serialized error envelope.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::Validation | ErrorKind::MissingFlags => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Manifest => StatusCode::BAD_REQUEST,
            ErrorKind::OverlayCapExceeded => StatusCode::CONFLICT,
            ErrorKind::ExtractorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                code: kind.as_str().to_string(),
                message: err.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: ErrorBody {
                code: "validation_error".into(),
                message: rejection.body_text(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the service router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/query/references", post(query_references))
        .route("/query/definition", post(query_definition))
        .route("/query/call-graph", post(query_call_graph))
        .route("/query/file-symbols", post(query_file_symbols))
        .route("/explore/list-candidates", post(explore_list_candidates))
        .route("/explore/classify-freshness", post(explore_classify))
        .route("/explore/parse-file", post(explore_parse_file))
        .route("/explore/fetch-symbols", post(explore_fetch_symbols))
        .route("/explore/fetch-references", post(explore_fetch_references))
        .route("/explore/fetch-call-edges", post(explore_fetch_call_edges))
        .route("/explore/read-file", post(explore_read_file))
        .route("/explore/rg-search", post(explore_rg_search))
        .route("/explore/get-compile-command", post(explore_compile_command))
        .route("/explore/get-confidence", post(explore_confidence))
        .route("/cache/invalidate", post(cache_invalidate))
        .route("/workspace/register", post(workspace_register))
        .route("/workspace/:workspace_id", get(workspace_get))
        .route(
            "/workspace/:workspace_id/refresh-manifest",
            post(workspace_refresh),
        )
        .route("/context/create-pr-overlay", post(context_create_overlay))
        .route("/context/:context_id/expire", post(context_expire))
        .route("/workspace/:workspace_id/sync-repo", post(sync_repo))
        .route("/workspace/:workspace_id/sync-batch", post(sync_batch))
        .route("/workspace/:workspace_id/sync-all-repos", post(sync_all))
        .route("/sync-jobs/:job_id", get(sync_job_get))
        .route(
            "/workspace/:workspace_id/repos/:repo_id/sync-status",
            get(sync_status_get),
        )
        .route("/webhooks/gitlab", post(webhook_gitlab))
        .route("/commit-diff-summaries/upsert", post(summary_upsert))
        .route("/commit-diff-summaries/search", post(summary_search))
        .route(
            "/commit-diff-summaries/:workspace_id/:repo_id/:commit_sha",
            get(summary_get),
        )
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ------------------------------------------------------------------
// Query endpoints
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SymbolQueryRequest {
    workspace_id: String,
    symbol: String,
    #[serde(default)]
    analysis_context: AnalysisContextSpec,
    #[serde(default)]
    scope: QueryScope,
    #[serde(default)]
    max_recall_files: Option<usize>,
    #[serde(default)]
    max_parse_budget: Option<usize>,
}

impl SymbolQueryRequest {
    fn into_input(self) -> QueryInput {
        QueryInput {
            workspace_id: self.workspace_id,
            symbol: self.symbol,
            analysis_context: self.analysis_context,
            scope: self.scope,
            max_recall_files: self.max_recall_files,
            max_parse_budget: self.max_parse_budget,
        }
    }
}

async fn query_references(
    State(state): State<SharedState>,
    body: Result<Json<SymbolQueryRequest>, JsonRejection>,
) -> ApiResult<crate::orchestrator::ReferencesResponse> {
    let Json(req) = body?;
    Ok(Json(state.orchestrator.query_references(req.into_input()).await?))
}

async fn query_definition(
    State(state): State<SharedState>,
    body: Result<Json<SymbolQueryRequest>, JsonRejection>,
) -> ApiResult<crate::orchestrator::DefinitionResponse> {
    let Json(req) = body?;
    Ok(Json(state.orchestrator.query_definition(req.into_input()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CallGraphRequest {
    workspace_id: String,
    symbol: String,
    #[serde(default)]
    direction: CallDirection,
    #[serde(default)]
    analysis_context: AnalysisContextSpec,
    #[serde(default)]
    scope: QueryScope,
    #[serde(default)]
    max_recall_files: Option<usize>,
    #[serde(default)]
    max_parse_budget: Option<usize>,
}

async fn query_call_graph(
    State(state): State<SharedState>,
    body: Result<Json<CallGraphRequest>, JsonRejection>,
) -> ApiResult<crate::orchestrator::CallGraphResponse> {
    let Json(req) = body?;
    let direction = req.direction;
    let input = QueryInput {
        workspace_id: req.workspace_id,
        symbol: req.symbol,
        analysis_context: req.analysis_context,
        scope: req.scope,
        max_recall_files: req.max_recall_files,
        max_parse_budget: req.max_parse_budget,
    };
    Ok(Json(state.orchestrator.query_call_graph(input, direction).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSymbolsRequest {
    workspace_id: String,
    file_key: String,
    #[serde(default)]
    analysis_context: AnalysisContextSpec,
}

async fn query_file_symbols(
    State(state): State<SharedState>,
    body: Result<Json<FileSymbolsRequest>, JsonRejection>,
) -> ApiResult<crate::orchestrator::FileSymbolsResponse> {
    let Json(req) = body?;
    Ok(Json(
        state
            .orchestrator
            .query_file_symbols(&req.workspace_id, &req.file_key, &req.analysis_context)
            .await?,
    ))
}

// ------------------------------------------------------------------
// Exploration endpoints
// ------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CandidatesResponse {
    candidates: Vec<String>,
    warnings: Vec<String>,
}

async fn explore_list_candidates(
    State(state): State<SharedState>,
    body: Result<Json<SymbolQueryRequest>, JsonRejection>,
) -> ApiResult<CandidatesResponse> {
    let Json(req) = body?;
    let (candidates, warnings) = state
        .orchestrator
        .explore_list_candidates(&req.into_input())
        .await?;
    Ok(Json(CandidatesResponse {
        candidates,
        warnings,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassifyRequest {
    workspace_id: String,
    file_keys: Vec<String>,
    #[serde(default)]
    analysis_context: AnalysisContextSpec,
}

async fn explore_classify(
    State(state): State<SharedState>,
    body: Result<Json<ClassifyRequest>, JsonRejection>,
) -> ApiResult<std::collections::HashMap<String, crate::types::Freshness>> {
    let Json(req) = body?;
    Ok(Json(state.orchestrator.explore_classify(
        &req.workspace_id,
        &req.analysis_context,
        &req.file_keys,
    )?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParseFileRequest {
    workspace_id: String,
    file_key: String,
    #[serde(default)]
    analysis_context: AnalysisContextSpec,
}

#[derive(Debug, Serialize)]
struct ParseFileResponse {
    parsed: bool,
    warnings: Vec<String>,
}

async fn explore_parse_file(
    State(state): State<SharedState>,
    body: Result<Json<ParseFileRequest>, JsonRejection>,
) -> ApiResult<ParseFileResponse> {
    let Json(req) = body?;
    let (parsed, warnings) = state
        .orchestrator
        .explore_parse_file(&req.workspace_id, &req.analysis_context, &req.file_key)
        .await?;
    Ok(Json(ParseFileResponse { parsed, warnings }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchRequest {
    workspace_id: String,
    symbol: String,
    #[serde(default)]
    direction: CallDirection,
    #[serde(default)]
    analysis_context: AnalysisContextSpec,
}

async fn explore_fetch_symbols(
    State(state): State<SharedState>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> ApiResult<Vec<crate::types::SymbolLocation>> {
    let Json(req) = body?;
    Ok(Json(state.orchestrator.explore_fetch_symbols(
        &req.workspace_id,
        &req.analysis_context,
        &req.symbol,
    )?))
}

async fn explore_fetch_references(
    State(state): State<SharedState>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> ApiResult<Vec<crate::types::ReferenceLocation>> {
    let Json(req) = body?;
    Ok(Json(state.orchestrator.explore_fetch_references(
        &req.workspace_id,
        &req.analysis_context,
        &req.symbol,
    )?))
}

async fn explore_fetch_call_edges(
    State(state): State<SharedState>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> ApiResult<Vec<crate::types::CallEdgeLocation>> {
    let Json(req) = body?;
    Ok(Json(state.orchestrator.explore_fetch_call_edges(
        &req.workspace_id,
        &req.analysis_context,
        &req.symbol,
        req.direction,
    )?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileRequest {
    workspace_id: String,
    file_key: String,
    #[serde(default)]
    start_line: usize,
    #[serde(default)]
    end_line: usize,
}

#[derive(Debug, Serialize)]
struct ReadFileResponse {
    file_key: String,
    content: String,
}

async fn explore_read_file(
    State(state): State<SharedState>,
    body: Result<Json<ReadFileRequest>, JsonRejection>,
) -> ApiResult<ReadFileResponse> {
    let Json(req) = body?;
    let content = state.orchestrator.explore_read_file(
        &req.workspace_id,
        &req.file_key,
        req.start_line,
        req.end_line,
    )?;
    Ok(Json(ReadFileResponse {
        file_key: req.file_key,
        content,
    }))
}

async fn explore_rg_search(
    State(state): State<SharedState>,
    body: Result<Json<SymbolQueryRequest>, JsonRejection>,
) -> ApiResult<CandidatesResponse> {
    let Json(req) = body?;
    let (candidates, warnings) = state
        .orchestrator
        .explore_list_candidates(&req.into_input())
        .await?;
    Ok(Json(CandidatesResponse {
        candidates,
        warnings,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompileCommandRequest {
    workspace_id: String,
    file_key: String,
}

#[derive(Debug, Serialize)]
struct CompileCommandResponse {
    found: bool,
    match_type: Option<crate::compile_db::CompileMatchType>,
    arguments: Vec<String>,
    flags_hash: String,
}

async fn explore_compile_command(
    State(state): State<SharedState>,
    body: Result<Json<CompileCommandRequest>, JsonRejection>,
) -> ApiResult<CompileCommandResponse> {
    let Json(req) = body?;
    let entry = state
        .orchestrator
        .explore_compile_command(&req.workspace_id, &req.file_key)?;
    Ok(Json(match entry {
        Some((arguments, flags_hash, match_type)) => CompileCommandResponse {
            found: true,
            match_type: Some(match_type),
            arguments,
            flags_hash,
        },
        None => CompileCommandResponse {
            found: false,
            match_type: None,
            arguments: Vec::new(),
            flags_hash: String::new(),
        },
    }))
}

async fn explore_confidence(
    State(state): State<SharedState>,
    body: Result<Json<SymbolQueryRequest>, JsonRejection>,
) -> ApiResult<crate::types::ConfidenceEnvelope> {
    let Json(req) = body?;
    Ok(Json(
        state.orchestrator.explore_confidence(&req.into_input()).await?,
    ))
}

// ------------------------------------------------------------------
// Cache / workspace / context endpoints
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheInvalidateRequest {
    workspace_id: String,
    #[serde(default)]
    context_id: String,
    #[serde(default)]
    file_keys: Option<Vec<String>>,
}

async fn cache_invalidate(
    State(state): State<SharedState>,
    body: Result<Json<CacheInvalidateRequest>, JsonRejection>,
) -> ApiResult<crate::orchestrator::InvalidateResponse> {
    let Json(req) = body?;
    Ok(Json(
        state
            .orchestrator
            .invalidate_cache(&req.workspace_id, &req.context_id, req.file_keys)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkspaceRegisterRequest {
    workspace_id: String,
    root_path: String,
    #[serde(default)]
    manifest_path: String,
}

#[derive(Debug, Serialize)]
struct WorkspaceInfoResponse {
    workspace_id: String,
    root_path: String,
    manifest_path: String,
    repos: Vec<String>,
}

async fn workspace_register(
    State(state): State<SharedState>,
    body: Result<Json<WorkspaceRegisterRequest>, JsonRejection>,
) -> ApiResult<WorkspaceInfoResponse> {
    let Json(req) = body?;
    let repos =
        state
            .orchestrator
            .register_workspace(&req.workspace_id, &req.root_path, &req.manifest_path)?;
    let (ws, _) = state.orchestrator.workspace_info(&req.workspace_id)?;
    Ok(Json(WorkspaceInfoResponse {
        workspace_id: ws.workspace_id,
        root_path: ws.root_path,
        manifest_path: ws.manifest_path,
        repos,
    }))
}

async fn workspace_get(
    State(state): State<SharedState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<WorkspaceInfoResponse> {
    let (ws, repos) = state.orchestrator.workspace_info(&workspace_id)?;
    Ok(Json(WorkspaceInfoResponse {
        workspace_id: ws.workspace_id,
        root_path: ws.root_path,
        manifest_path: ws.manifest_path,
        repos,
    }))
}

#[derive(Debug, Serialize)]
struct WorkspaceRefreshResponse {
    workspace_id: String,
    repos_synced: usize,
}

async fn workspace_refresh(
    State(state): State<SharedState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<WorkspaceRefreshResponse> {
    let repos_synced = state.orchestrator.refresh_manifest(&workspace_id)?;
    Ok(Json(WorkspaceRefreshResponse {
        workspace_id,
        repos_synced,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateOverlayRequest {
    workspace_id: String,
    #[serde(default)]
    pr_id: String,
    #[serde(default)]
    context_id: String,
    #[serde(default)]
    changed_files: Vec<ContextFileState>,
}

#[derive(Debug, Serialize)]
struct CreateOverlayResponse {
    context_id: String,
    workspace_id: String,
    base_context_id: String,
    overlay_mode: String,
    overlay_file_count: u64,
    overlay_row_count: u64,
}

async fn context_create_overlay(
    State(state): State<SharedState>,
    body: Result<Json<CreateOverlayRequest>, JsonRejection>,
) -> ApiResult<CreateOverlayResponse> {
    let Json(req) = body?;
    if req.pr_id.is_empty() && req.context_id.is_empty() {
        return Err(Error::Validation("pr_id or context_id is required".into()).into());
    }
    let context_id = state
        .contexts
        .create_pr_overlay(
            &req.workspace_id,
            &req.pr_id,
            &req.context_id,
            req.changed_files,
        )
        .await?;
    let ctx = state
        .store
        .get_analysis_context(&context_id)?
        .ok_or_else(|| Error::Internal("overlay context vanished".into()))?;
    Ok(Json(CreateOverlayResponse {
        context_id: ctx.context_id,
        workspace_id: ctx.workspace_id,
        base_context_id: ctx.base_context_id,
        overlay_mode: ctx.overlay_mode.as_str().to_string(),
        overlay_file_count: ctx.overlay_file_count,
        overlay_row_count: ctx.overlay_row_count,
    }))
}

#[derive(Debug, Serialize)]
struct ContextExpireResponse {
    context_id: String,
    expired: bool,
}

async fn context_expire(
    State(state): State<SharedState>,
    Path(context_id): Path<String>,
) -> ApiResult<ContextExpireResponse> {
    let expired = state.contexts.expire(&context_id).await?;
    Ok(Json(ContextExpireResponse {
        context_id,
        expired,
    }))
}

// ------------------------------------------------------------------
// Sync endpoints
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepoSyncRequest {
    repo_id: String,
    commit_sha: String,
    #[serde(default)]
    branch: String,
    #[serde(default = "default_true")]
    force_clean: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct SyncJobResponse {
    job: crate::types::SyncJob,
}

async fn sync_repo(
    State(state): State<SharedState>,
    Path(workspace_id): Path<String>,
    body: Result<Json<RepoSyncRequest>, JsonRejection>,
) -> ApiResult<SyncJobResponse> {
    let Json(req) = body?;
    let job_id = state.sync.enqueue_sync(
        &workspace_id,
        &req.repo_id,
        &req.commit_sha,
        &req.branch,
        req.force_clean,
    )?;
    Ok(Json(SyncJobResponse {
        job: state.sync.job(&job_id)?,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepoSyncBatchRequest {
    targets: Vec<RepoSyncRequest>,
}

#[derive(Debug, Serialize)]
struct SyncBatchResponse {
    jobs: Vec<crate::types::SyncJob>,
}

async fn sync_batch(
    State(state): State<SharedState>,
    Path(workspace_id): Path<String>,
    body: Result<Json<RepoSyncBatchRequest>, JsonRejection>,
) -> ApiResult<SyncBatchResponse> {
    let Json(req) = body?;
    if req.targets.is_empty() {
        return Err(Error::Validation("targets must not be empty".into()).into());
    }
    let mut jobs = Vec::with_capacity(req.targets.len());
    for target in req.targets {
        let job_id = state.sync.enqueue_sync(
            &workspace_id,
            &target.repo_id,
            &target.commit_sha,
            &target.branch,
            target.force_clean,
        )?;
        jobs.push(state.sync.job(&job_id)?);
    }
    Ok(Json(SyncBatchResponse { jobs }))
}

async fn sync_all(
    State(state): State<SharedState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<SyncBatchResponse> {
    let (_, manifest) = state.orchestrator.manifest_for(&workspace_id)?;
    let mut jobs = Vec::new();
    for repo in &manifest.repos {
        if repo.remote_url.is_empty() {
            continue;
        }
        let sha = validate_commit_sha(&repo.commit_sha)?;
        let job_id =
            state
                .sync
                .enqueue_sync(&workspace_id, &repo.repo_id, &sha, &repo.default_branch, true)?;
        jobs.push(state.sync.job(&job_id)?);
    }
    Ok(Json(SyncBatchResponse { jobs }))
}

async fn sync_job_get(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> ApiResult<SyncJobResponse> {
    Ok(Json(SyncJobResponse {
        job: state.sync.job(&job_id)?,
    }))
}

async fn sync_status_get(
    State(state): State<SharedState>,
    Path((workspace_id, repo_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let status = state
        .store
        .get_repo_sync_state(&workspace_id, &repo_id)?
        .ok_or_else(|| Error::NotFound(format!("sync state for {workspace_id}/{repo_id}")))?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WebhookRequest {
    workspace_id: String,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    accepted: bool,
    index_job_id: String,
    sync_job_id: String,
}

async fn webhook_gitlab(
    State(state): State<SharedState>,
    body: Result<Json<WebhookRequest>, JsonRejection>,
) -> ApiResult<WebhookResponse> {
    let Json(req) = body?;
    let (index_job_id, sync_job_id) = state.sync.ingest_webhook(&req.workspace_id, &req.payload)?;
    Ok(Json(WebhookResponse {
        accepted: true,
        index_job_id,
        sync_job_id: sync_job_id.unwrap_or_default(),
    }))
}

// ------------------------------------------------------------------
// Commit diff summaries
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummaryUpsertRequest {
    workspace_id: String,
    repo_id: String,
    commit_sha: String,
    #[serde(default)]
    branch: String,
    summary_text: String,
    embedding_model: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: serde_json::Value,
}

async fn summary_upsert(
    State(state): State<SharedState>,
    body: Result<Json<SummaryUpsertRequest>, JsonRejection>,
) -> ApiResult<crate::store::CommitDiffSummary> {
    let Json(req) = body?;
    let sha = validate_commit_sha(&req.commit_sha)?;
    let id = Uuid::new_v4().to_string();
    state.store.upsert_commit_diff_summary(
        &id,
        &req.workspace_id,
        &req.repo_id,
        &sha,
        &req.branch,
        &req.summary_text,
        &req.embedding_model,
        &req.embedding,
        &req.metadata,
    )?;
    let record = state
        .store
        .get_commit_diff_summary(&req.workspace_id, &req.repo_id, &sha, false)?
        .ok_or_else(|| Error::Internal("summary vanished after upsert".into()))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummarySearchRequest {
    workspace_id: String,
    query_embedding: Vec<f32>,
    #[serde(default)]
    repo_ids: Vec<String>,
    #[serde(default)]
    branches: Vec<String>,
    #[serde(default)]
    commit_sha_prefix: String,
    #[serde(default)]
    created_after: String,
    #[serde(default)]
    score_threshold: f64,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct SummarySearchResponse {
    hits: Vec<crate::store::CommitDiffSummary>,
}

async fn summary_search(
    State(state): State<SharedState>,
    body: Result<Json<SummarySearchRequest>, JsonRejection>,
) -> ApiResult<SummarySearchResponse> {
    let Json(req) = body?;
    if req.query_embedding.is_empty() {
        return Err(Error::Validation("query_embedding must not be empty".into()).into());
    }
    let hits = state.store.search_commit_diff_summaries(
        &req.query_embedding,
        &SummaryQuery {
            workspace_id: req.workspace_id,
            repo_ids: req.repo_ids,
            branches: req.branches,
            commit_sha_prefix: req.commit_sha_prefix,
            created_after: req.created_after,
            score_threshold: req.score_threshold,
            top_k: req.top_k.clamp(1, 100),
        },
    )?;
    Ok(Json(SummarySearchResponse { hits }))
}

#[derive(Debug, Deserialize)]
struct SummaryGetParams {
    #[serde(default)]
    include_embedding: bool,
}

async fn summary_get(
    State(state): State<SharedState>,
    Path((workspace_id, repo_id, commit_sha)): Path<(String, String, String)>,
    Query(params): Query<SummaryGetParams>,
) -> ApiResult<crate::store::CommitDiffSummary> {
    let record = state
        .store
        .get_commit_diff_summary(&workspace_id, &repo_id, &commit_sha, params.include_embedding)?
        .ok_or_else(|| {
            Error::NotFound(format!("summary {workspace_id}/{repo_id}/{commit_sha}"))
        })?;
    Ok(Json(record))
}

// ------------------------------------------------------------------
// Health
// ------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    writer_queue_depth: usize,
    writer_lag_ms: u64,
    cache_file_count: u64,
    cache_symbol_count: u64,
    active_context_count: u64,
    overlay_disk_usage_bytes: u64,
    index_queue_depth: u64,
    sync_queue_depth: u64,
    active_sync_jobs: u64,
    oldest_pending_job_age_s: f64,
    rg_available: bool,
    extractor_available: bool,
}

fn binary_available(binary: &str) -> bool {
    let path = std::path::Path::new(binary);
    if path.components().count() > 1 {
        return path.exists();
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(binary).exists())
    })
}

async fn health(State(state): State<SharedState>) -> ApiResult<HealthResponse> {
    let (writer_queue_depth, writer_lag_ms) = state.orchestrator.writer_metrics();
    Ok(Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        writer_queue_depth,
        writer_lag_ms,
        cache_file_count: state.store.count_tracked_files(None).unwrap_or(0),
        cache_symbol_count: state.store.count_symbols(None).unwrap_or(0),
        active_context_count: state.store.count_active_contexts().unwrap_or(0),
        overlay_disk_usage_bytes: state.store.disk_usage_bytes(),
        index_queue_depth: state.store.index_queue_depth().unwrap_or(0),
        sync_queue_depth: state.store.sync_queue_depth().unwrap_or(0),
        active_sync_jobs: state.store.active_sync_jobs().unwrap_or(0),
        oldest_pending_job_age_s: state.store.oldest_pending_job_age_s().unwrap_or(0.0),
        rg_available: binary_available(&state.settings.rg_binary),
        extractor_available: binary_available(&state.settings.extractor_binary),
    }))
}
