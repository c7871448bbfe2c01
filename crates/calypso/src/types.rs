//! Domain types for the Calypso semantic index.
//!
//! These types represent the core domain model:
//! - **Entities**: `TrackedFile`, `SymbolRow`, `ReferenceRow`, `CallEdgeRow`,
//!   `IncludeDepRow`, `AnalysisContext` (stored in the database)
//! - **Transient**: `ExtractorOutput`, `ParsePayload` (parse results in flight)
//! - **Results**: `ConfidenceEnvelope`, `SymbolLocation`, `ReferenceLocation`
//!   (query responses)
//!
//! ## Design Decisions
//!
//! | Decision | Choice | Rationale |
//! |----------|--------|-----------|
//! | file_key | `"{repo_id}:{rel_path}"` string | One canonical cross-repo identity |
//! | Kinds | Enums not strings | Closed sets; unknown input folds to `Unknown` |
//! | Timestamps | RFC 3339 strings in storage | Matches overlay TTL comparisons |
//! | Hashes | Hex strings | Stable across processes and deployments |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Clang AST cursor kinds tracked by the index. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    CXXMethod,
    Constructor,
    Destructor,
    FunctionTemplate,
    ClassTemplate,
    ClassDecl,
    StructDecl,
    EnumDecl,
    EnumConstant,
    VarDecl,
    FieldDecl,
    Typedef,
    TypeAlias,
    Namespace,
    Macro,
    Unknown,
}

impl SymbolKind {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "Function",
            Self::CXXMethod => "CXXMethod",
            Self::Constructor => "Constructor",
            Self::Destructor => "Destructor",
            Self::FunctionTemplate => "FunctionTemplate",
            Self::ClassTemplate => "ClassTemplate",
            Self::ClassDecl => "ClassDecl",
            Self::StructDecl => "StructDecl",
            Self::EnumDecl => "EnumDecl",
            Self::EnumConstant => "EnumConstant",
            Self::VarDecl => "VarDecl",
            Self::FieldDecl => "FieldDecl",
            Self::Typedef => "Typedef",
            Self::TypeAlias => "TypeAlias",
            Self::Namespace => "Namespace",
            Self::Macro => "Macro",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse the extractor's cursor-kind spelling; anything unrecognised is
    /// `Unknown` rather than an error, so new clang kinds degrade gracefully.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "Function" => Self::Function,
            "CXXMethod" => Self::CXXMethod,
            "Constructor" => Self::Constructor,
            "Destructor" => Self::Destructor,
            "FunctionTemplate" => Self::FunctionTemplate,
            "ClassTemplate" => Self::ClassTemplate,
            "ClassDecl" => Self::ClassDecl,
            "StructDecl" => Self::StructDecl,
            "EnumDecl" => Self::EnumDecl,
            "EnumConstant" => Self::EnumConstant,
            "VarDecl" => Self::VarDecl,
            "FieldDecl" => Self::FieldDecl,
            "Typedef" => Self::Typedef,
            "TypeAlias" => Self::TypeAlias,
            "Namespace" => Self::Namespace,
            "Macro" => Self::Macro,
            _ => Self::Unknown,
        }
    }
}

/// How a symbol is used at a reference site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Call,
    Read,
    Write,
    Addr,
    TypeRef,
    Unknown,
}

impl RefKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Read => "read",
            Self::Write => "write",
            Self::Addr => "addr",
            Self::TypeRef => "type_ref",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "call" => Self::Call,
            "read" => Self::Read,
            "write" => Self::Write,
            "addr" => Self::Addr,
            "type_ref" => Self::TypeRef,
            _ => Self::Unknown,
        }
    }
}

/// Direction for call-graph queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
    #[default]
    Both,
}

/// Analysis context mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    #[default]
    Baseline,
    Pr,
}

impl AnalysisMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Pr => "pr",
        }
    }
}

/// How overlay facts are materialized for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlayMode {
    Full,
    #[default]
    Sparse,
    /// Degraded mode entered when sparse caps are exceeded: bulk persistence
    /// is disabled and queries fall back to lazy per-file parse.
    PartialOverlay,
}

impl OverlayMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Sparse => "sparse",
            Self::PartialOverlay => "partial_overlay",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "full" => Self::Full,
            "partial_overlay" => Self::PartialOverlay,
            _ => Self::Sparse,
        }
    }
}

/// Per-file state inside a context overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Added,
    Modified,
    Deleted,
    Renamed,
    Unchanged,
}

impl FileState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
            Self::Unchanged => "unchanged",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(Self::Added),
            "modified" => Some(Self::Modified),
            "deleted" => Some(Self::Deleted),
            "renamed" => Some(Self::Renamed),
            "unchanged" => Some(Self::Unchanged),
            _ => None,
        }
    }

    /// States whose facts live in the overlay context itself.
    #[must_use]
    pub fn is_overlay_resident(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Renamed)
    }
}

/// Lifecycle state for index and repo-sync jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    DeadLetter,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// Freshness classification for a candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
    Unparsed,
    MissingFlags,
}

// === Extractor output (§6.2 subprocess contract) ===

/// A symbol definition extracted from the AST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSymbol {
    pub name: String,
    pub qualified_name: String,
    pub kind: String,
    pub line: u32,
    pub col: u32,
    #[serde(default)]
    pub extent_end_line: u32,
}

/// A symbol reference extracted from the AST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedReference {
    pub symbol: String,
    pub line: u32,
    pub col: u32,
    #[serde(default = "default_ref_kind")]
    pub kind: String,
}

fn default_ref_kind() -> String {
    "unknown".to_string()
}

/// A call edge extracted from the AST. The extractor canonicalises the callee
/// cursor to the best definition (definition > canonical > referenced).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedCallEdge {
    pub caller: String,
    pub callee: String,
    pub line: u32,
}

/// An include dependency as emitted by the extractor (absolute path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedIncludeDep {
    pub path: String,
    #[serde(default = "default_depth")]
    pub depth: u32,
}

fn default_depth() -> u32 {
    1
}

/// JSON output schema from the extractor for a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorOutput {
    pub file: String,
    #[serde(default)]
    pub symbols: Vec<ExtractedSymbol>,
    #[serde(default)]
    pub references: Vec<ExtractedReference>,
    #[serde(default)]
    pub call_edges: Vec<ExtractedCallEdge>,
    #[serde(default)]
    pub include_deps: Vec<ExtractedIncludeDep>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Include dependency after workspace/path-remap normalization.
///
/// `file_key` stays empty for includes that resolve outside every workspace
/// repo; those are excluded from `includes_hash` and surfaced as
/// `external_unresolved_include` warnings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedIncludeDep {
    pub raw_path: String,
    pub file_key: String,
    pub abs_path: String,
    pub resolved: bool,
    pub depth: u32,
}

/// Output produced by parse workers and consumed by the single writer.
#[derive(Debug, Clone)]
pub struct ParsePayload {
    pub context_id: String,
    pub file_key: String,
    pub repo_id: String,
    pub rel_path: String,
    pub abs_path: String,
    pub output: ExtractorOutput,
    pub include_deps: Vec<ResolvedIncludeDep>,
    pub content_hash: String,
    pub flags_hash: String,
    pub includes_hash: String,
    pub composite_hash: String,
    pub warnings: Vec<String>,
}

impl ParsePayload {
    /// Number of fact rows this payload will persist; drives overlay caps.
    #[must_use]
    pub fn fact_row_count(&self) -> u64 {
        (self.output.symbols.len()
            + self.output.references.len()
            + self.output.call_edges.len()
            + self.include_deps.len()) as u64
    }
}

// === Stored entities ===

/// A file tracked by a context, with the hashes that drive invalidation.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedFile {
    pub context_id: String,
    pub file_key: String,
    pub repo_id: String,
    pub rel_path: String,
    pub abs_path: String,
    pub content_hash: String,
    pub flags_hash: String,
    pub includes_hash: String,
    pub composite_hash: String,
    pub last_parsed_at: String,
}

/// A symbol definition row, joined with its tracked file.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolRow {
    pub context_id: String,
    pub file_key: String,
    pub name: String,
    pub qualified_name: String,
    pub kind: String,
    pub line: u32,
    pub col: u32,
    pub extent_end_line: u32,
    pub abs_path: String,
}

/// A reference row, joined with its tracked file.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceRow {
    pub context_id: String,
    pub file_key: String,
    pub symbol_qualified_name: String,
    pub line: u32,
    pub col: u32,
    pub ref_kind: String,
    pub abs_path: String,
}

/// A call edge row, joined with its tracked file.
#[derive(Debug, Clone, Serialize)]
pub struct CallEdgeRow {
    pub context_id: String,
    pub file_key: String,
    pub caller_qualified_name: String,
    pub callee_qualified_name: String,
    pub line: u32,
    pub abs_path: String,
}

/// An analysis context: either the long-lived baseline for a workspace or a
/// sparse PR overlay chained onto one.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisContext {
    pub context_id: String,
    pub workspace_id: String,
    pub mode: AnalysisMode,
    pub base_context_id: String,
    pub overlay_mode: OverlayMode,
    pub overlay_file_count: u64,
    pub overlay_row_count: u64,
    pub status: String,
    pub created_at: String,
    pub last_accessed_at: String,
    pub expires_at: String,
}

/// State of a file in a context overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFileState {
    pub file_key: String,
    pub state: FileState,
    #[serde(default)]
    pub replaced_from_file_key: String,
}

/// A durable repo sync job row.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: String,
    pub workspace_id: String,
    pub repo_id: String,
    pub requested_commit_sha: String,
    pub requested_branch: String,
    pub requested_force_clean: bool,
    pub resolved_commit_sha: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_until: String,
    pub error_code: String,
    pub error_message: String,
    pub created_at: String,
    pub updated_at: String,
}

// === Query inputs shared between HTTP surface and orchestrator ===

/// Selects baseline/pr context for a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisContextSpec {
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default)]
    pub context_id: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub head_ref: String,
    #[serde(default)]
    pub pr_id: String,
}

/// Controls repo traversal scope for a query. Entry repos are closed over
/// manifest `depends_on` edges up to `max_repo_hops`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryScope {
    #[serde(default)]
    pub entry_repos: Vec<String>,
    #[serde(default = "default_repo_hops")]
    pub max_repo_hops: u32,
}

fn default_repo_hops() -> u32 {
    2
}

impl Default for QueryScope {
    fn default() -> Self {
        Self {
            entry_repos: Vec::new(),
            max_repo_hops: default_repo_hops(),
        }
    }
}

// === Query results ===

/// A symbol definition location in a response.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolLocation {
    pub file_key: String,
    pub line: u32,
    pub col: u32,
    pub kind: String,
    pub qualified_name: String,
    pub extent_end_line: u32,
    pub abs_path: String,
    pub context_id: String,
}

/// A reference location in a response.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceLocation {
    pub file_key: String,
    pub line: u32,
    pub col: u32,
    pub kind: String,
    pub abs_path: String,
    pub context_id: String,
}

/// A single call edge in a call-graph response.
#[derive(Debug, Clone, Serialize)]
pub struct CallEdgeLocation {
    pub caller: String,
    pub callee: String,
    pub file_key: String,
    pub line: u32,
    pub abs_path: String,
    pub context_id: String,
}

/// Communicates exactly how much of the candidate set was semantically
/// verified. Every query answer carries one of these, even when empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfidenceEnvelope {
    pub verified_files: Vec<String>,
    pub stale_files: Vec<String>,
    pub unparsed_files: Vec<String>,
    pub total_candidates: usize,
    pub verified_ratio: f64,
    pub warnings: Vec<String>,
    pub overlay_mode: OverlayMode,
    /// Per-repo `verified / (verified + stale + unparsed)`. Repos with zero
    /// candidates are absent rather than reported as 0/0.
    pub repo_coverage: HashMap<String, f64>,
}

/// Split a canonical file key into `(repo_id, rel_path)`.
#[must_use]
pub fn split_file_key(file_key: &str) -> Option<(&str, &str)> {
    file_key.split_once(':')
}
