//! The query orchestrator: recall, freshness, parse fan-out, merge,
//! confidence.
//!
//! Five stages, each a pure transformation over the previous stage's output
//! plus the fact store:
//!
//! 1. **Resolve context** - workspace + analysis context, overlay chain.
//! 2. **Recall** - candidate file keys from the recaller, masked and forced
//!    by overlay file states, scoped by the manifest repo DAG.
//! 3. **Classify freshness** - live composite hash vs stored hash per
//!    candidate.
//! 4. **Parse fan-out** - bounded by `max_parse_budget` and the query
//!    deadline; payloads flow through the single writer.
//! 5. **Read & assemble** - overlay-merged facts plus the confidence
//!    envelope.
//!
//! Per-file failures never abort a query; they surface as `unparsed_files`
//! entries and warnings in the envelope.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::compile_db::{CompilationDatabase, CompileEntry, CompileMatchType};
use crate::config::Settings;
use crate::context::{ContextManager, ResolvedContext};
use crate::error::{Error, Result};
use crate::extractor::{ExtractorDriver, ParseTask};
use crate::hasher;
use crate::manifest::{file_key_to_abs_path, WorkspaceManifest};
use crate::recall::Recaller;
use crate::store::{Store, WorkspaceRow};
use crate::types::{
    split_file_key, AnalysisContextSpec, CallDirection, CallEdgeLocation, ConfidenceEnvelope,
    FileState, Freshness, OverlayMode, QueryScope, ReferenceLocation, SymbolLocation,
};
use crate::writer::{SingleWriter, WriteOp};

/// Common inputs for the symbol-centric query endpoints.
#[derive(Debug, Clone)]
pub struct QueryInput {
    pub workspace_id: String,
    pub symbol: String,
    pub analysis_context: AnalysisContextSpec,
    pub scope: QueryScope,
    pub max_recall_files: Option<usize>,
    pub max_parse_budget: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReferencesResponse {
    pub symbol: String,
    pub definition: Option<SymbolLocation>,
    pub references: Vec<ReferenceLocation>,
    pub confidence: ConfidenceEnvelope,
}

#[derive(Debug, Serialize)]
pub struct DefinitionResponse {
    pub symbol: String,
    pub definitions: Vec<SymbolLocation>,
    pub confidence: ConfidenceEnvelope,
}

#[derive(Debug, Serialize)]
pub struct CallGraphResponse {
    pub symbol: String,
    pub edges: Vec<CallEdgeLocation>,
    pub confidence: ConfidenceEnvelope,
}

#[derive(Debug, Serialize)]
pub struct FileSymbolsResponse {
    pub file_key: String,
    pub symbols: Vec<SymbolLocation>,
    pub confidence: ConfidenceEnvelope,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub invalidated_files: u64,
    pub message: String,
}

/// Stage-3 output: candidates bucketed by freshness, plus the parse tasks
/// for everything that needs the extractor.
#[derive(Debug, Default)]
pub struct Classification {
    pub fresh: Vec<String>,
    pub stale: Vec<String>,
    pub unparsed: Vec<String>,
    pub missing_flags: Vec<String>,
    pub warnings: Vec<String>,
    pub tasks: Vec<(ParseTask, CompileEntry)>,
}

/// Stage-4 output.
#[derive(Debug, Default)]
struct ParseStats {
    parsed: Vec<String>,
    failed: Vec<String>,
    timed_out: Vec<String>,
    over_budget: Vec<String>,
    warnings: Vec<String>,
}

struct WorkspaceEntry {
    root: PathBuf,
    manifest: Arc<WorkspaceManifest>,
}

pub struct Orchestrator {
    store: Arc<Store>,
    writer: Arc<SingleWriter>,
    contexts: Arc<ContextManager>,
    driver: Arc<ExtractorDriver>,
    recaller: Arc<dyn Recaller>,
    settings: Settings,
    manifests: Mutex<HashMap<String, Arc<WorkspaceEntry>>>,
    compile_dbs: Mutex<HashMap<String, Arc<CompilationDatabase>>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        writer: Arc<SingleWriter>,
        contexts: Arc<ContextManager>,
        driver: Arc<ExtractorDriver>,
        recaller: Arc<dyn Recaller>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            writer,
            contexts,
            driver,
            recaller,
            settings,
            manifests: Mutex::new(HashMap::new()),
            compile_dbs: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Workspace lifecycle
    // ------------------------------------------------------------------

    /// Register a workspace: validate its manifest, mirror repos into the
    /// store, and create the baseline context.
    pub fn register_workspace(
        &self,
        workspace_id: &str,
        root_path: &str,
        manifest_path: &str,
    ) -> Result<Vec<String>> {
        let manifest_path = if manifest_path.is_empty() {
            PathBuf::from(root_path).join("workspace.yaml")
        } else {
            PathBuf::from(manifest_path)
        };
        let manifest = WorkspaceManifest::load(&manifest_path)?;
        if manifest.workspace_id != workspace_id {
            return Err(Error::Manifest(format!(
                "manifest declares workspace {} but {} was registered",
                manifest.workspace_id, workspace_id
            )));
        }

        self.store
            .upsert_workspace(workspace_id, root_path, &manifest_path.to_string_lossy())?;
        self.store.replace_workspace_repos(workspace_id, &manifest)?;
        self.contexts.ensure_baseline(workspace_id)?;

        let repo_ids = manifest.repo_ids();
        if let Ok(mut cache) = self.manifests.lock() {
            cache.insert(
                workspace_id.to_string(),
                Arc::new(WorkspaceEntry {
                    root: PathBuf::from(root_path),
                    manifest: Arc::new(manifest),
                }),
            );
        }
        Ok(repo_ids)
    }

    /// Re-read the manifest from disk, refresh mirrored repos, and drop the
    /// workspace's cached compile databases.
    pub fn refresh_manifest(&self, workspace_id: &str) -> Result<usize> {
        let ws = self.require_workspace(workspace_id)?;
        let manifest = WorkspaceManifest::load(std::path::Path::new(&ws.manifest_path))?;
        let synced = self.store.replace_workspace_repos(workspace_id, &manifest)?;

        if let Ok(mut cache) = self.manifests.lock() {
            cache.insert(
                workspace_id.to_string(),
                Arc::new(WorkspaceEntry {
                    root: PathBuf::from(&ws.root_path),
                    manifest: Arc::new(manifest),
                }),
            );
        }
        if let Ok(mut dbs) = self.compile_dbs.lock() {
            dbs.retain(|key, _| !key.starts_with(&format!("{workspace_id}|")));
        }
        Ok(synced)
    }

    fn require_workspace(&self, workspace_id: &str) -> Result<WorkspaceRow> {
        self.store
            .get_workspace(workspace_id)?
            .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id}")))
    }

    fn workspace_entry(&self, workspace_id: &str) -> Result<(WorkspaceRow, Arc<WorkspaceEntry>)> {
        let ws = self.require_workspace(workspace_id)?;
        if let Ok(cache) = self.manifests.lock() {
            if let Some(entry) = cache.get(workspace_id) {
                return Ok((ws, Arc::clone(entry)));
            }
        }
        let manifest = WorkspaceManifest::load(std::path::Path::new(&ws.manifest_path))?;
        let entry = Arc::new(WorkspaceEntry {
            root: PathBuf::from(&ws.root_path),
            manifest: Arc::new(manifest),
        });
        if let Ok(mut cache) = self.manifests.lock() {
            cache.insert(workspace_id.to_string(), Arc::clone(&entry));
        }
        Ok((ws, entry))
    }

    /// Workspace summary for `GET /workspace/{id}`.
    pub fn workspace_info(&self, workspace_id: &str) -> Result<(WorkspaceRow, Vec<String>)> {
        let ws = self.require_workspace(workspace_id)?;
        let repos = self.store.list_workspace_repo_ids(workspace_id)?;
        Ok((ws, repos))
    }

    /// Manifest handle for collaborators (sync engine).
    pub fn manifest_for(&self, workspace_id: &str) -> Result<(PathBuf, Arc<WorkspaceManifest>)> {
        let (_, entry) = self.workspace_entry(workspace_id)?;
        Ok((entry.root.clone(), Arc::clone(&entry.manifest)))
    }

    fn compile_db(
        &self,
        workspace_id: &str,
        entry: &WorkspaceEntry,
        repo_id: &str,
    ) -> Option<Arc<CompilationDatabase>> {
        let repo = entry.manifest.repo(repo_id)?;
        if repo.compile_commands.is_empty() {
            return None;
        }
        let cc_path = entry.root.join(&repo.compile_commands);
        let key = format!("{workspace_id}|{repo_id}|{}", cc_path.display());

        if let Ok(cache) = self.compile_dbs.lock() {
            if let Some(db) = cache.get(&key) {
                return Some(Arc::clone(db));
            }
        }
        match CompilationDatabase::load(&cc_path) {
            Ok(db) => {
                let db = Arc::new(db);
                if let Ok(mut cache) = self.compile_dbs.lock() {
                    cache.insert(key, Arc::clone(&db));
                }
                Some(db)
            }
            Err(e) => {
                warn!(repo = repo_id, error = %e, "compile_commands load failed");
                None
            }
        }
    }

    /// Drop cached compile databases (all, or one workspace's).
    pub fn invalidate_compile_dbs(&self, workspace_id: Option<&str>) {
        if let Ok(mut cache) = self.compile_dbs.lock() {
            match workspace_id {
                Some(ws) => cache.retain(|key, _| !key.starts_with(&format!("{ws}|"))),
                None => cache.clear(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Pipeline stages
    // ------------------------------------------------------------------

    /// Stages 1-2: resolve context and produce the candidate set.
    async fn resolve_and_recall(
        &self,
        input: &QueryInput,
    ) -> Result<(Arc<WorkspaceEntry>, ResolvedContext, Vec<String>, Vec<String>, Vec<String>)> {
        let (_, entry) = self.workspace_entry(&input.workspace_id)?;
        let resolved = self
            .contexts
            .resolve(&input.workspace_id, &input.analysis_context)?;
        let repo_ids = entry
            .manifest
            .scope_repos(&input.scope.entry_repos, input.scope.max_repo_hops);

        let max_files = input
            .max_recall_files
            .unwrap_or(self.settings.max_recall_files);
        let outcome = self
            .recaller
            .recall(
                &resolved.chain.contexts,
                &input.symbol,
                &repo_ids,
                &entry.root,
                &entry.manifest,
                max_files,
            )
            .await;

        let mut warnings = outcome.warnings;
        let mut candidates: Vec<String> = outcome
            .file_keys
            .into_iter()
            .filter(|key| !resolved.chain.excluded.contains(key))
            .filter(|key| {
                split_file_key(key).is_some_and(|(repo, _)| repo_ids.iter().any(|r| r == repo))
            })
            .collect();

        // Changed files in the overlay are always candidates: their facts
        // must be (re)verified even when recall missed them.
        if !resolved.is_baseline() {
            let states = self.store.get_context_file_states(&resolved.context_id)?;
            for state in states {
                if state.state.is_overlay_resident()
                    && split_file_key(&state.file_key)
                        .is_some_and(|(repo, _)| repo_ids.iter().any(|r| r == repo))
                    && !candidates.contains(&state.file_key)
                {
                    candidates.push(state.file_key);
                }
            }
        }
        candidates.truncate(max_files);

        if candidates.is_empty() {
            warnings.push("no_candidates".to_string());
        }
        Ok((entry, resolved, repo_ids, candidates, warnings))
    }

    /// Stage 3: classify each candidate by comparing its live composite hash
    /// with the stored one reachable through the context chain.
    fn classify(
        &self,
        workspace_id: &str,
        entry: &WorkspaceEntry,
        resolved: &ResolvedContext,
        candidates: &[String],
    ) -> Result<Classification> {
        let mut out = Classification::default();

        let overlay_states: HashMap<String, FileState> = if resolved.is_baseline() {
            HashMap::new()
        } else {
            self.store
                .get_context_file_states(&resolved.context_id)?
                .into_iter()
                .map(|s| (s.file_key, s.state))
                .collect()
        };

        for file_key in candidates {
            let Some((repo_id, rel_path, abs_path)) =
                file_key_to_abs_path(&entry.root, &entry.manifest, file_key)
            else {
                out.unparsed.push(file_key.clone());
                out.warnings.push(format!("{file_key}:invalid_file_key"));
                continue;
            };

            let Some(cdb) = self.compile_db(workspace_id, entry, &repo_id) else {
                out.missing_flags.push(file_key.clone());
                out.warnings.push(format!("{file_key}:missing_compile_db"));
                continue;
            };
            let compile_entry = match cdb.get(&abs_path).or_else(|| cdb.fallback_entry(&abs_path)) {
                Some(e) => e.clone(),
                None => {
                    out.missing_flags.push(file_key.clone());
                    out.warnings.push(format!("{file_key}:missing_compile_entry"));
                    continue;
                }
            };

            // Facts for changed files belong to the overlay; everything else
            // parses into the baseline.
            let target_context = if overlay_states
                .get(file_key)
                .is_some_and(|s| s.is_overlay_resident())
            {
                resolved.context_id.clone()
            } else {
                resolved.baseline_id.clone()
            };
            let task = ParseTask {
                context_id: target_context,
                file_key: file_key.clone(),
                repo_id,
                rel_path,
                abs_path: abs_path.clone(),
            };

            let Some(tracked) = self.store.get_tracked_chain(&resolved.chain, file_key)? else {
                out.unparsed.push(file_key.clone());
                out.tasks.push((task, compile_entry));
                continue;
            };

            // Live hash: current bytes, current flags, and current content of
            // every stored transitive include. A header edit anywhere in the
            // workspace flips this.
            let include_pairs: Vec<(String, String)> = self
                .store
                .get_include_deps(&tracked.context_id, file_key)?
                .into_iter()
                .map(|(key, dep_abs)| {
                    (key, hasher::content_hash(std::path::Path::new(&dep_abs)))
                })
                .collect();
            let live = hasher::composite_hash(
                &hasher::content_hash(&abs_path),
                &compile_entry.flags_hash,
                &hasher::includes_hash(&include_pairs),
            );

            if live == tracked.composite_hash {
                out.fresh.push(file_key.clone());
            } else {
                out.stale.push(file_key.clone());
                out.tasks.push((task, compile_entry));
            }
        }

        out.warnings.sort();
        out.warnings.dedup();
        Ok(out)
    }

    /// Stage 4: parse up to `budget` files before `deadline`, persisting
    /// through the single writer. Files beyond the budget or the deadline
    /// stay unverified.
    async fn parse_fanout(
        &self,
        entry: &Arc<WorkspaceEntry>,
        mut tasks: Vec<(ParseTask, CompileEntry)>,
        budget: usize,
        deadline: Instant,
    ) -> ParseStats {
        let mut stats = ParseStats::default();
        if tasks.is_empty() {
            return stats;
        }

        if tasks.len() > budget {
            stats.over_budget = tasks
                .split_off(budget)
                .into_iter()
                .map(|(task, _)| task.file_key)
                .collect();
            stats.warnings.push("budget_exceeded".to_string());
        }

        let mut join_set: JoinSet<(String, std::result::Result<Vec<String>, String>)> =
            JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        for (task, compile_entry) in tasks {
            in_flight.insert(task.file_key.clone());
            let driver = Arc::clone(&self.driver);
            let writer = Arc::clone(&self.writer);
            let entry = Arc::clone(entry);
            join_set.spawn(async move {
                let result = driver
                    .parse_file(&task, &compile_entry, &entry.root, &entry.manifest)
                    .await;
                let audit = WriteOp::RecordParseRun {
                    context_id: task.context_id.clone(),
                    file_key: result.file_key.clone(),
                    abs_path: result.abs_path.clone(),
                    started_at: result.started_at.clone(),
                    success: result.payload.is_some(),
                    error_msg: result.diagnostic.clone(),
                };
                if let Err(e) = writer.submit(audit).await {
                    warn!(file = %result.file_key, error = %e, "parse-run audit write failed");
                }

                match result.payload {
                    Some(payload) => {
                        let warnings = payload.warnings.clone();
                        match writer
                            .submit(WriteOp::UpsertFileFacts {
                                payload: Box::new(payload),
                                bulk: false,
                            })
                            .await
                        {
                            Ok(_) => (result.file_key, Ok(warnings)),
                            Err(e) => (result.file_key, Err(e.to_string())),
                        }
                    }
                    None => (result.file_key, Err(result.diagnostic)),
                }
            });
        }

        loop {
            let joined = match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    // Deadline: cancel outstanding parses; subprocesses die
                    // with their tasks, already-persisted facts remain.
                    join_set.abort_all();
                    stats.warnings.push("budget_exceeded".to_string());
                    for file_key in in_flight.drain() {
                        stats.timed_out.push(file_key);
                    }
                    break;
                }
            };
            match joined {
                Ok((file_key, outcome)) => {
                    in_flight.remove(&file_key);
                    match outcome {
                        Ok(warnings) => {
                            stats.parsed.push(file_key);
                            stats.warnings.extend(warnings);
                        }
                        Err(diag) => {
                            debug!(file = %file_key, diagnostic = %diag, "parse failed");
                            stats.warnings.push(format!("{file_key}:{diag}"));
                            stats.failed.push(file_key);
                        }
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    warn!(error = %e, "parse task panicked");
                }
            }
        }

        stats
    }

    /// Run stages 1-4 and assemble the confidence envelope.
    async fn run_pipeline(
        &self,
        input: &QueryInput,
    ) -> Result<(ResolvedContext, Vec<String>, ConfidenceEnvelope)> {
        let deadline = Instant::now() + Duration::from_millis(self.settings.query_deadline_ms);
        let (entry, resolved, _repo_ids, candidates, mut warnings) =
            self.resolve_and_recall(input).await?;

        let classification =
            self.classify(&input.workspace_id, &entry, &resolved, &candidates)?;
        warnings.extend(classification.warnings.clone());

        let budget = input
            .max_parse_budget
            .unwrap_or(self.settings.max_parse_budget);
        let stats = self
            .parse_fanout(&entry, classification.tasks, budget, deadline)
            .await;
        warnings.extend(stats.warnings.clone());

        let mut verified = classification.fresh;
        verified.extend(stats.parsed.iter().cloned());

        // Everything that needed a parse but did not get one stays
        // unverified. Deadline-cancelled files are known-stale; budget
        // overflow, parse failures, and missing flags report as unparsed.
        let timed_out: HashSet<&String> = stats.timed_out.iter().collect();
        let stale: Vec<String> = classification
            .stale
            .iter()
            .filter(|key| timed_out.contains(key))
            .cloned()
            .collect();
        let completed: HashSet<&String> = stats.parsed.iter().collect();
        let mut unparsed: Vec<String> = classification
            .unparsed
            .into_iter()
            .filter(|key| !completed.contains(key))
            .collect();
        unparsed.extend(stats.failed.iter().cloned());
        unparsed.extend(stats.over_budget);
        unparsed.extend(classification.missing_flags);
        unparsed.sort();
        unparsed.dedup();

        let envelope = build_confidence(verified, stale, unparsed, warnings, resolved.overlay_mode);
        Ok((resolved, candidates, envelope))
    }

    // ------------------------------------------------------------------
    // Query entry points
    // ------------------------------------------------------------------

    pub async fn query_references(&self, input: QueryInput) -> Result<ReferencesResponse> {
        validate_symbol(&input.symbol)?;
        let (resolved, candidates, confidence) = self.run_pipeline(&input).await?;
        let chain = self
            .contexts
            .build_chain(&resolved.context_id, &resolved.baseline_id)?;

        let definition = self
            .store
            .symbols_by_name(&chain, &input.symbol, None)?
            .into_iter()
            .next()
            .map(symbol_location);
        let references = self
            .store
            .references_by_symbol(&chain, &input.symbol, Some(&candidates))?
            .into_iter()
            .map(reference_location)
            .collect();

        Ok(ReferencesResponse {
            symbol: input.symbol,
            definition,
            references,
            confidence,
        })
    }

    pub async fn query_definition(&self, input: QueryInput) -> Result<DefinitionResponse> {
        validate_symbol(&input.symbol)?;
        let (resolved, _candidates, confidence) = self.run_pipeline(&input).await?;
        let chain = self
            .contexts
            .build_chain(&resolved.context_id, &resolved.baseline_id)?;

        let definitions = self
            .store
            .symbols_by_name(&chain, &input.symbol, None)?
            .into_iter()
            .map(symbol_location)
            .collect();

        Ok(DefinitionResponse {
            symbol: input.symbol,
            definitions,
            confidence,
        })
    }

    pub async fn query_call_graph(
        &self,
        input: QueryInput,
        direction: CallDirection,
    ) -> Result<CallGraphResponse> {
        validate_symbol(&input.symbol)?;
        let (resolved, _candidates, confidence) = self.run_pipeline(&input).await?;
        let chain = self
            .contexts
            .build_chain(&resolved.context_id, &resolved.baseline_id)?;

        let mut edges = Vec::new();
        if matches!(direction, CallDirection::Outgoing | CallDirection::Both) {
            edges.extend(
                self.store
                    .call_edges(&chain, Some(&input.symbol), None, None)?
                    .into_iter()
                    .map(call_edge_location),
            );
        }
        if matches!(direction, CallDirection::Incoming | CallDirection::Both) {
            edges.extend(
                self.store
                    .call_edges(&chain, None, Some(&input.symbol), None)?
                    .into_iter()
                    .map(call_edge_location),
            );
        }

        Ok(CallGraphResponse {
            symbol: input.symbol,
            edges,
            confidence,
        })
    }

    pub async fn query_file_symbols(
        &self,
        workspace_id: &str,
        file_key: &str,
        spec: &AnalysisContextSpec,
    ) -> Result<FileSymbolsResponse> {
        if split_file_key(file_key).is_none() {
            return Err(Error::Validation(format!(
                "file_key must be canonical repo_id:rel/path, got {file_key}"
            )));
        }

        let deadline = Instant::now() + Duration::from_millis(self.settings.query_deadline_ms);
        let (_, entry) = self.workspace_entry(workspace_id)?;
        let resolved = self.contexts.resolve(workspace_id, spec)?;

        let candidates = vec![file_key.to_string()];
        let classification = self.classify(workspace_id, &entry, &resolved, &candidates)?;
        let mut warnings = classification.warnings.clone();
        let stats = self
            .parse_fanout(&entry, classification.tasks, 1, deadline)
            .await;
        warnings.extend(stats.warnings.clone());

        let mut verified = classification.fresh;
        verified.extend(stats.parsed.iter().cloned());
        let completed: HashSet<&String> = stats.parsed.iter().collect();
        let mut unverified: Vec<String> = classification
            .stale
            .iter()
            .chain(classification.unparsed.iter())
            .filter(|k| !completed.contains(*k))
            .cloned()
            .collect();
        unverified.extend(classification.missing_flags.clone());

        let chain = self
            .contexts
            .build_chain(&resolved.context_id, &resolved.baseline_id)?;
        let symbols = self
            .store
            .symbols_by_file(&chain, file_key)?
            .into_iter()
            .map(symbol_location)
            .collect();

        let confidence = build_confidence(
            verified,
            Vec::new(),
            unverified,
            warnings,
            resolved.overlay_mode,
        );
        Ok(FileSymbolsResponse {
            file_key: file_key.to_string(),
            symbols,
            confidence,
        })
    }

    /// `POST /cache/invalidate`: drop tracked rows for a context (or the
    /// workspace baseline when no context is given).
    pub async fn invalidate_cache(
        &self,
        workspace_id: &str,
        context_id: &str,
        file_keys: Option<Vec<String>>,
    ) -> Result<InvalidateResponse> {
        self.require_workspace(workspace_id)?;
        let context_id = if context_id.is_empty() {
            ContextManager::baseline_id(workspace_id)
        } else {
            context_id.to_string()
        };

        let requested = file_keys.as_ref().map_or(0, Vec::len);
        let invalidated = self
            .writer
            .submit(WriteOp::Invalidate {
                context_id: context_id.clone(),
                file_keys,
            })
            .await?;
        self.invalidate_compile_dbs(Some(workspace_id));

        let message = if requested == 0 {
            format!("invalidated context {context_id} ({invalidated} files)")
        } else {
            format!("invalidated {invalidated} of {requested} requested files")
        };
        Ok(InvalidateResponse {
            invalidated_files: invalidated,
            message,
        })
    }

    // ------------------------------------------------------------------
    // Exploration surface (stage-by-stage access for agents)
    // ------------------------------------------------------------------

    /// Stage 2 alone: the candidate list recall would feed into a query.
    pub async fn explore_list_candidates(
        &self,
        input: &QueryInput,
    ) -> Result<(Vec<String>, Vec<String>)> {
        validate_symbol(&input.symbol)?;
        let (_, _, _, candidates, warnings) = self.resolve_and_recall(input).await?;
        Ok((candidates, warnings))
    }

    /// Stage 3 alone, for explicit file keys.
    pub fn explore_classify(
        &self,
        workspace_id: &str,
        spec: &AnalysisContextSpec,
        file_keys: &[String],
    ) -> Result<HashMap<String, Freshness>> {
        let (_, entry) = self.workspace_entry(workspace_id)?;
        let resolved = self.contexts.resolve(workspace_id, spec)?;
        let classification = self.classify(workspace_id, &entry, &resolved, file_keys)?;

        let mut out = HashMap::new();
        for key in classification.fresh {
            out.insert(key, Freshness::Fresh);
        }
        for key in classification.stale {
            out.insert(key, Freshness::Stale);
        }
        for key in classification.unparsed {
            out.insert(key, Freshness::Unparsed);
        }
        for key in classification.missing_flags {
            out.insert(key, Freshness::MissingFlags);
        }
        Ok(out)
    }

    /// Stage 4 alone: force-parse a single file regardless of freshness.
    pub async fn explore_parse_file(
        &self,
        workspace_id: &str,
        spec: &AnalysisContextSpec,
        file_key: &str,
    ) -> Result<(bool, Vec<String>)> {
        let (_, entry) = self.workspace_entry(workspace_id)?;
        let resolved = self.contexts.resolve(workspace_id, spec)?;
        let classification =
            self.classify(workspace_id, &entry, &resolved, &[file_key.to_string()])?;
        if !classification.missing_flags.is_empty() {
            return Err(Error::MissingFlags(file_key.to_string()));
        }

        let mut tasks = classification.tasks;
        if tasks.is_empty() {
            // Fresh file: rebuild the task so the caller can force a reparse.
            let Some((repo_id, rel_path, abs_path)) =
                file_key_to_abs_path(&entry.root, &entry.manifest, file_key)
            else {
                return Err(Error::Validation(format!("invalid file_key {file_key}")));
            };
            let cdb = self
                .compile_db(workspace_id, &entry, &repo_id)
                .ok_or_else(|| Error::MissingFlags(file_key.to_string()))?;
            let compile_entry = cdb
                .get(&abs_path)
                .or_else(|| cdb.fallback_entry(&abs_path))
                .ok_or_else(|| Error::MissingFlags(file_key.to_string()))?
                .clone();
            tasks.push((
                ParseTask {
                    context_id: resolved.context_id.clone(),
                    file_key: file_key.to_string(),
                    repo_id,
                    rel_path,
                    abs_path,
                },
                compile_entry,
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(self.settings.parse_timeout_s + 5);
        let stats = self.parse_fanout(&entry, tasks, 1, deadline).await;
        Ok((stats.failed.is_empty(), stats.warnings))
    }

    /// Direct overlay-merged reads without triggering any parsing.
    pub fn explore_fetch_symbols(
        &self,
        workspace_id: &str,
        spec: &AnalysisContextSpec,
        symbol: &str,
    ) -> Result<Vec<SymbolLocation>> {
        let resolved = self.contexts.resolve(workspace_id, spec)?;
        Ok(self
            .store
            .symbols_by_name(&resolved.chain, symbol, None)?
            .into_iter()
            .map(symbol_location)
            .collect())
    }

    pub fn explore_fetch_references(
        &self,
        workspace_id: &str,
        spec: &AnalysisContextSpec,
        symbol: &str,
    ) -> Result<Vec<ReferenceLocation>> {
        let resolved = self.contexts.resolve(workspace_id, spec)?;
        Ok(self
            .store
            .references_by_symbol(&resolved.chain, symbol, None)?
            .into_iter()
            .map(reference_location)
            .collect())
    }

    pub fn explore_fetch_call_edges(
        &self,
        workspace_id: &str,
        spec: &AnalysisContextSpec,
        symbol: &str,
        direction: CallDirection,
    ) -> Result<Vec<CallEdgeLocation>> {
        let resolved = self.contexts.resolve(workspace_id, spec)?;
        let mut edges = Vec::new();
        if matches!(direction, CallDirection::Outgoing | CallDirection::Both) {
            edges.extend(self.store.call_edges(&resolved.chain, Some(symbol), None, None)?);
        }
        if matches!(direction, CallDirection::Incoming | CallDirection::Both) {
            edges.extend(self.store.call_edges(&resolved.chain, None, Some(symbol), None)?);
        }
        Ok(edges.into_iter().map(call_edge_location).collect())
    }

    /// Read a slice of a workspace file by canonical key (1-indexed lines).
    pub fn explore_read_file(
        &self,
        workspace_id: &str,
        file_key: &str,
        start_line: usize,
        end_line: usize,
    ) -> Result<String> {
        let (_, entry) = self.workspace_entry(workspace_id)?;
        let Some((_, _, abs_path)) = file_key_to_abs_path(&entry.root, &entry.manifest, file_key)
        else {
            return Err(Error::Validation(format!("invalid file_key {file_key}")));
        };
        let content = std::fs::read_to_string(&abs_path)
            .map_err(|e| Error::NotFound(format!("{file_key}: {e}")))?;
        if start_line == 0 && end_line == 0 {
            return Ok(content);
        }
        let start = start_line.max(1) - 1;
        let end = if end_line == 0 { usize::MAX } else { end_line };
        Ok(content
            .lines()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// The compile entry (and match type) the driver would use for a file.
    pub fn explore_compile_command(
        &self,
        workspace_id: &str,
        file_key: &str,
    ) -> Result<Option<(Vec<String>, String, CompileMatchType)>> {
        let (_, entry) = self.workspace_entry(workspace_id)?;
        let Some((repo_id, _, abs_path)) =
            file_key_to_abs_path(&entry.root, &entry.manifest, file_key)
        else {
            return Err(Error::Validation(format!("invalid file_key {file_key}")));
        };
        let Some(cdb) = self.compile_db(workspace_id, &entry, &repo_id) else {
            return Ok(None);
        };
        if let Some(exact) = cdb.get(&abs_path) {
            return Ok(Some((
                exact.arguments.clone(),
                exact.flags_hash.clone(),
                CompileMatchType::Exact,
            )));
        }
        Ok(cdb.fallback_entry(&abs_path).map(|e| {
            (
                e.arguments.clone(),
                e.flags_hash.clone(),
                CompileMatchType::Fallback,
            )
        }))
    }

    /// Stages 1-3 only: the envelope a query would start from, no parsing.
    pub async fn explore_confidence(&self, input: &QueryInput) -> Result<ConfidenceEnvelope> {
        validate_symbol(&input.symbol)?;
        let (entry, resolved, _, candidates, warnings) = self.resolve_and_recall(input).await?;
        let mut classification =
            self.classify(&input.workspace_id, &entry, &resolved, &candidates)?;
        let mut all_warnings = warnings;
        all_warnings.append(&mut classification.warnings);

        let mut unparsed = classification.unparsed;
        unparsed.extend(classification.missing_flags);
        Ok(build_confidence(
            classification.fresh,
            classification.stale,
            unparsed,
            all_warnings,
            resolved.overlay_mode,
        ))
    }

    /// Writer metrics for the health endpoint.
    #[must_use]
    pub fn writer_metrics(&self) -> (usize, u64) {
        (self.writer.queue_depth(), self.writer.lag_ms())
    }
}

fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.trim().is_empty() {
        return Err(Error::Validation("symbol must not be empty".into()));
    }
    Ok(())
}

fn symbol_location(row: crate::types::SymbolRow) -> SymbolLocation {
    SymbolLocation {
        file_key: row.file_key,
        line: row.line,
        col: row.col,
        kind: row.kind,
        qualified_name: row.qualified_name,
        extent_end_line: row.extent_end_line,
        abs_path: row.abs_path,
        context_id: row.context_id,
    }
}

fn reference_location(row: crate::types::ReferenceRow) -> ReferenceLocation {
    ReferenceLocation {
        file_key: row.file_key,
        line: row.line,
        col: row.col,
        kind: row.ref_kind,
        abs_path: row.abs_path,
        context_id: row.context_id,
    }
}

fn call_edge_location(row: crate::types::CallEdgeRow) -> CallEdgeLocation {
    CallEdgeLocation {
        caller: row.caller_qualified_name,
        callee: row.callee_qualified_name,
        file_key: row.file_key,
        line: row.line,
        abs_path: row.abs_path,
        context_id: row.context_id,
    }
}

/// Stage 5a: fold the classification into the confidence envelope.
#[must_use]
pub fn build_confidence(
    verified: Vec<String>,
    stale: Vec<String>,
    unparsed: Vec<String>,
    warnings: Vec<String>,
    overlay_mode: OverlayMode,
) -> ConfidenceEnvelope {
    let total = verified.len() + stale.len() + unparsed.len();
    let verified_ratio = if total == 0 {
        0.0
    } else {
        (verified.len() as f64 / total as f64 * 10_000.0).round() / 10_000.0
    };

    let mut repo_total: HashMap<String, usize> = HashMap::new();
    let mut repo_verified: HashMap<String, usize> = HashMap::new();
    for key in verified.iter().chain(stale.iter()).chain(unparsed.iter()) {
        let repo = split_file_key(key).map_or("unknown", |(repo, _)| repo);
        *repo_total.entry(repo.to_string()).or_default() += 1;
    }
    for key in &verified {
        let repo = split_file_key(key).map_or("unknown", |(repo, _)| repo);
        *repo_verified.entry(repo.to_string()).or_default() += 1;
    }
    let repo_coverage = repo_total
        .into_iter()
        .map(|(repo, total)| {
            let covered = repo_verified.get(&repo).copied().unwrap_or(0);
            let ratio = (covered as f64 / total as f64 * 10_000.0).round() / 10_000.0;
            (repo, ratio)
        })
        .collect();

    let mut warnings: Vec<String> = warnings;
    warnings.sort();
    warnings.dedup();

    ConfidenceEnvelope {
        verified_files: verified,
        stale_files: stale,
        unparsed_files: unparsed,
        total_candidates: total,
        verified_ratio,
        warnings,
        overlay_mode,
        repo_coverage,
    }
}
