//! # Calypso: workspace-scoped semantic index cache for C++ source trees
//!
//! Calypso answers "where is this symbol defined / referenced / called?" for
//! AI code-review agents without parsing entire repositories. It keeps a
//! content-addressed cache of AST-derived facts (symbols, references, call
//! edges, include deps) in an embedded `SQLite` store, invalidated by a
//! composite hash over content + compile flags + transitive includes, and
//! layers sparse pull-request overlays on top of a long-lived baseline so
//! PR-time queries only touch the files that actually changed.
//!
//! ## Design Philosophy
//!
//! - **Cache, not analyzer** - the native extractor subprocess does the
//!   semantic work; Calypso schedules, stores, and merges its output
//! - **Bounded cold cost** - every query parses at most `max_parse_budget`
//!   files and reports the rest in an explicit confidence envelope
//! - **One writer** - all store mutations funnel through a single thread;
//!   `database is locked` reaching a caller is a bug, not weather
//! - **Best effort** - a file that fails to parse degrades the confidence
//!   envelope, never the query

mod compile_db;
mod config;
mod context;
mod error;
mod extractor;
mod hasher;
mod manifest;
mod orchestrator;
mod recall;
mod server;
mod store;
mod sync;
mod types;
mod writer;

pub use compile_db::{CompilationDatabase, CompileEntry, CompileMatchType};
pub use config::Settings;
pub use context::{ContextManager, ResolvedContext};
pub use error::{Error, ErrorKind, Result};
pub use extractor::{ExtractorDriver, ParseResult, ParseTask};
pub use hasher::{composite_hash, content_hash, flags_hash, includes_hash, sanitize_flags};
pub use manifest::{
    file_key_to_abs_path, normalize_path, resolve_file_key, resolve_include_dep, PathRemap,
    RepoManifest, WorkspaceManifest,
};
pub use orchestrator::{
    build_confidence, CallGraphResponse, DefinitionResponse, FileSymbolsResponse,
    InvalidateResponse, Orchestrator, QueryInput, ReferencesResponse,
};
pub use recall::{build_symbol_pattern, DefaultRecaller, RecallOutcome, Recaller};
pub use server::{router, AppState, SharedState};
pub use store::{
    CommitDiffSummary, ContextChain, IndexJobSpec, LeasedSyncJob, Store, SummaryQuery,
    WorkspaceRow,
};
pub use sync::{
    normalize_gitlab_event, validate_commit_sha, CheckoutResult, GitSync, NormalizedEvent,
    SyncEngine,
};
pub use types::{
    split_file_key, AnalysisContext, AnalysisContextSpec, AnalysisMode, CallDirection,
    CallEdgeLocation, CallEdgeRow, ConfidenceEnvelope, ContextFileState, ExtractedCallEdge,
    ExtractedIncludeDep, ExtractedReference, ExtractedSymbol, ExtractorOutput, FileState,
    Freshness, JobStatus, OverlayMode, ParsePayload, QueryScope, RefKind, ReferenceLocation,
    ReferenceRow, ResolvedIncludeDep, SymbolKind, SymbolLocation, SymbolRow, SyncJob, TrackedFile,
};
pub use writer::{SingleWriter, WriteOp, WriterConfig};

use std::sync::Arc;

/// Wire the full service graph from settings: store, writer, context
/// manager, extractor driver, recaller, orchestrator, sync engine.
pub fn build_app_state(settings: Settings) -> Result<SharedState> {
    let store = Arc::new(Store::open(std::path::Path::new(&settings.db_path))?);
    let writer = Arc::new(SingleWriter::spawn(
        Arc::clone(&store),
        WriterConfig::from_settings(&settings),
    ));
    let contexts = Arc::new(ContextManager::new(
        Arc::clone(&store),
        Arc::clone(&writer),
        &settings,
    ));
    let driver = Arc::new(ExtractorDriver::new(&settings));
    let recaller: Arc<dyn Recaller> = Arc::new(DefaultRecaller::new(Arc::clone(&store), &settings));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&writer),
        Arc::clone(&contexts),
        driver,
        recaller,
        settings.clone(),
    ));
    let sync = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&orchestrator),
        settings.clone(),
    ));

    Ok(Arc::new(AppState {
        store,
        writer,
        orchestrator,
        contexts,
        sync,
        settings,
    }))
}
