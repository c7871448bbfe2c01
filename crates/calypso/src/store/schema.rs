//! Database schema definition for the Calypso fact store.

/// Database schema definition.
///
/// `(context_id, file_key)` is the universal composite key: every fact table
/// references `tracked_files` with cascade-on-delete so invalidating a file
/// drops its symbols, references, call edges, and include deps in one sweep.
pub(crate) const SCHEMA: &str = r"
-- Registered workspaces
CREATE TABLE IF NOT EXISTS workspaces (
    workspace_id TEXT PRIMARY KEY,
    root_path TEXT NOT NULL,
    manifest_path TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Repos mirrored from each workspace manifest
CREATE TABLE IF NOT EXISTS repos (
    workspace_id TEXT NOT NULL REFERENCES workspaces(workspace_id) ON DELETE CASCADE,
    repo_id TEXT NOT NULL,
    root TEXT NOT NULL DEFAULT '',
    compile_commands TEXT NOT NULL DEFAULT '',
    default_branch TEXT NOT NULL DEFAULT 'main',
    depends_on_json TEXT NOT NULL DEFAULT '[]',
    remote_url TEXT NOT NULL DEFAULT '',
    token_env_var TEXT NOT NULL DEFAULT '',
    commit_sha TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (workspace_id, repo_id)
);

-- Baseline and PR overlay contexts
CREATE TABLE IF NOT EXISTS analysis_contexts (
    context_id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    base_context_id TEXT NOT NULL DEFAULT '',
    overlay_mode TEXT NOT NULL DEFAULT 'sparse',
    overlay_file_count INTEGER NOT NULL DEFAULT 0,
    overlay_row_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    expires_at TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_contexts_workspace ON analysis_contexts(workspace_id, status);

-- Per-file overlay states (tombstones, renames, modifications)
CREATE TABLE IF NOT EXISTS context_file_states (
    context_id TEXT NOT NULL REFERENCES analysis_contexts(context_id) ON DELETE CASCADE,
    file_key TEXT NOT NULL,
    state TEXT NOT NULL,
    replaced_from_file_key TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (context_id, file_key)
);

-- Files with parsed facts; composite_hash is the invalidation key
CREATE TABLE IF NOT EXISTS tracked_files (
    context_id TEXT NOT NULL REFERENCES analysis_contexts(context_id) ON DELETE CASCADE,
    file_key TEXT NOT NULL,
    repo_id TEXT NOT NULL,
    rel_path TEXT NOT NULL,
    abs_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    flags_hash TEXT NOT NULL,
    includes_hash TEXT NOT NULL,
    composite_hash TEXT NOT NULL,
    last_parsed_at TEXT NOT NULL,
    PRIMARY KEY (context_id, file_key)
);

CREATE INDEX IF NOT EXISTS idx_tracked_repo ON tracked_files(context_id, repo_id);

-- Symbol definitions
CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY,
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL,
    name TEXT NOT NULL,
    qualified_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL,
    extent_end_line INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_symbols_qualified ON symbols(context_id, qualified_name);
CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(context_id, name);
CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(context_id, file_key);

-- References (usages of symbols)
CREATE TABLE IF NOT EXISTS references_ (
    id INTEGER PRIMARY KEY,
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL,
    symbol_qualified_name TEXT NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL,
    ref_kind TEXT NOT NULL DEFAULT 'unknown',
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_refs_symbol ON references_(context_id, symbol_qualified_name);
CREATE INDEX IF NOT EXISTS idx_refs_file ON references_(context_id, file_key);

-- Call graph edges
CREATE TABLE IF NOT EXISTS call_edges (
    id INTEGER PRIMARY KEY,
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL,
    caller_qualified_name TEXT NOT NULL,
    callee_qualified_name TEXT NOT NULL,
    line INTEGER NOT NULL,
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_edges_caller ON call_edges(context_id, caller_qualified_name);
CREATE INDEX IF NOT EXISTS idx_edges_callee ON call_edges(context_id, callee_qualified_name);

-- Transitive include dependencies (workspace-canonical keys)
CREATE TABLE IF NOT EXISTS include_deps (
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL,
    included_file_key TEXT NOT NULL DEFAULT '',
    included_abs_path TEXT NOT NULL DEFAULT '',
    raw_path TEXT NOT NULL,
    depth INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_includes_file ON include_deps(context_id, file_key);
CREATE INDEX IF NOT EXISTS idx_includes_included ON include_deps(context_id, included_file_key);

-- Audit record per extractor invocation
CREATE TABLE IF NOT EXISTS parse_runs (
    id INTEGER PRIMARY KEY,
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL,
    abs_path TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL DEFAULT '',
    success INTEGER NOT NULL DEFAULT 0,
    error_msg TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_parse_runs_file ON parse_runs(context_id, file_key);

-- Full-text recall index over tracked file contents
CREATE VIRTUAL TABLE IF NOT EXISTS recall_fts USING fts5(
    context_id UNINDEXED,
    file_key UNINDEXED,
    repo_id UNINDEXED,
    content
);

-- Index jobs fed by webhooks; the unique key makes ingest idempotent
CREATE TABLE IF NOT EXISTS index_jobs (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL,
    context_id TEXT NOT NULL DEFAULT '',
    event_type TEXT NOT NULL,
    git_ref TEXT NOT NULL DEFAULT '',
    event_sha TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    lease_until TEXT NOT NULL DEFAULT '',
    last_error TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (workspace_id, repo_id, git_ref, context_id, event_sha)
);

CREATE INDEX IF NOT EXISTS idx_index_jobs_status ON index_jobs(status, created_at);

-- Durable repo sync jobs with lease/heartbeat claiming
CREATE TABLE IF NOT EXISTS repo_sync_jobs (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL,
    requested_branch TEXT NOT NULL DEFAULT '',
    requested_commit_sha TEXT NOT NULL,
    requested_force_clean INTEGER NOT NULL DEFAULT 1,
    resolved_commit_sha TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    lease_until TEXT NOT NULL DEFAULT '',
    error_code TEXT NOT NULL DEFAULT '',
    error_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT '',
    finished_at TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON repo_sync_jobs(status, created_at);

-- Last-known sync outcome per repo
CREATE TABLE IF NOT EXISTS repo_sync_state (
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL,
    last_synced_commit_sha TEXT NOT NULL DEFAULT '',
    last_synced_branch TEXT NOT NULL DEFAULT '',
    last_success_at TEXT NOT NULL DEFAULT '',
    last_failure_at TEXT NOT NULL DEFAULT '',
    last_error_code TEXT NOT NULL DEFAULT '',
    last_error_message TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (workspace_id, repo_id)
);

-- Commit diff summaries with embeddings for top-k similarity search
CREATE TABLE IF NOT EXISTS commit_diff_summaries (
    id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL,
    commit_sha TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT '',
    summary_text TEXT NOT NULL,
    embedding_model TEXT NOT NULL,
    embedding_dim INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (workspace_id, repo_id, commit_sha, embedding_model)
);

CREATE INDEX IF NOT EXISTS idx_summaries_repo ON commit_diff_summaries(workspace_id, repo_id);
";
