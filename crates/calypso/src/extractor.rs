//! Driver for the native AST extractor subprocess.
//!
//! The extractor is an opaque binary invoked per file as
//! `extractor --action extract-all --file <abs_path> -- <compile_args…>`,
//! emitting one JSON document on stdout. This driver resolves compile flags,
//! applies the manifest's virtual-filesystem remap before launch, normalises
//! emitted include paths back to canonical file keys, computes all four
//! hashes, and returns an in-memory [`ParsePayload`]. It never writes to the
//! store; payloads flow to the single writer via the orchestrator.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::compile_db::CompileEntry;
use crate::config::Settings;
use crate::hasher;
use crate::manifest::{resolve_include_dep, WorkspaceManifest};
use crate::store::utc_now;
use crate::types::{ExtractorOutput, ParsePayload, ResolvedIncludeDep};

/// A single parse unit with canonical workspace identity.
#[derive(Debug, Clone)]
pub struct ParseTask {
    pub context_id: String,
    pub file_key: String,
    pub repo_id: String,
    pub rel_path: String,
    pub abs_path: PathBuf,
}

/// Outcome of one extractor invocation, success or not; feeds both the fact
/// store and the parse-run audit trail.
#[derive(Debug)]
pub struct ParseResult {
    pub file_key: String,
    pub abs_path: String,
    pub started_at: String,
    pub payload: Option<ParsePayload>,
    /// Diagnostic for failed parses (`parse_timeout`, extractor stderr, ...).
    pub diagnostic: String,
}

/// Bounded worker pool around the extractor subprocess.
pub struct ExtractorDriver {
    extractor_binary: String,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ExtractorDriver {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            extractor_binary: settings.extractor_binary.clone(),
            timeout: Duration::from_secs(settings.parse_timeout_s),
            permits: Arc::new(Semaphore::new(settings.max_parse_workers.max(1))),
        }
    }

    /// Parse one file. Always returns a [`ParseResult`]; failures carry a
    /// diagnostic instead of an error so per-file problems never abort a
    /// query.
    pub async fn parse_file(
        &self,
        task: &ParseTask,
        entry: &CompileEntry,
        workspace_root: &Path,
        manifest: &WorkspaceManifest,
    ) -> ParseResult {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("extractor semaphore closed");
        let started_at = utc_now();
        let abs_path = task.abs_path.to_string_lossy().into_owned();

        let (payload, diagnostic) = self
            .run_extractor(task, entry, workspace_root, manifest)
            .await;

        ParseResult {
            file_key: task.file_key.clone(),
            abs_path,
            started_at,
            payload,
            diagnostic,
        }
    }

    async fn run_extractor(
        &self,
        task: &ParseTask,
        entry: &CompileEntry,
        workspace_root: &Path,
        manifest: &WorkspaceManifest,
    ) -> (Option<ParsePayload>, String) {
        let overlay_file = build_vfs_overlay_file(workspace_root, manifest);

        let mut cmd = tokio::process::Command::new(&self.extractor_binary);
        cmd.arg("--action")
            .arg("extract-all")
            .arg("--file")
            .arg(&task.abs_path)
            .arg("--");
        if let Some(overlay) = &overlay_file {
            cmd.arg("-ivfsoverlay").arg(overlay.path());
        }
        cmd.args(&entry.arguments);
        if !entry.directory.is_empty() {
            cmd.current_dir(&entry.directory);
        }
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        debug!(file = %task.abs_path.display(), "spawning extractor");
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(binary = %self.extractor_binary, error = %e, "extractor spawn failed");
                return (None, format!("extractor_unavailable: {e}"));
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return (None, format!("extractor wait failed: {e}")),
            Err(_) => {
                // kill_on_drop terminates the subprocess.
                warn!(
                    file = %task.abs_path.display(),
                    timeout_s = self.timeout.as_secs(),
                    "extractor timed out"
                );
                return (None, "parse_timeout".to_string());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(500).collect();
            warn!(
                file = %task.abs_path.display(),
                code = output.status.code().unwrap_or(-1),
                "extractor failed: {stderr}"
            );
            return (
                None,
                format!("extractor exit {}", output.status.code().unwrap_or(-1)),
            );
        }

        let parsed: ExtractorOutput = match serde_json::from_slice(&output.stdout) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(file = %task.abs_path.display(), error = %e, "extractor output is not valid JSON");
                return (None, format!("invalid extractor output: {e}"));
            }
        };

        let payload = assemble_payload(task, entry, workspace_root, manifest, parsed);
        (Some(payload), String::new())
    }
}

/// Resolve include deps, compute the hash triple, and package the payload.
pub(crate) fn assemble_payload(
    task: &ParseTask,
    entry: &CompileEntry,
    workspace_root: &Path,
    manifest: &WorkspaceManifest,
    output: ExtractorOutput,
) -> ParsePayload {
    let mut resolved_deps: Vec<ResolvedIncludeDep> = Vec::with_capacity(output.include_deps.len());
    let mut include_pairs: Vec<(String, String)> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    for dep in &output.include_deps {
        let resolved = resolve_include_dep(workspace_root, manifest, &dep.path, dep.depth);
        if resolved.resolved {
            // Only includes with workspace-canonical keys participate in the
            // includes hash; external headers never invalidate the cache.
            include_pairs.push((
                resolved.file_key.clone(),
                hasher::content_hash(Path::new(&resolved.abs_path)),
            ));
        }
        resolved_deps.push(resolved);
    }
    if resolved_deps.iter().any(|d| !d.resolved) {
        warnings.push("external_unresolved_include".to_string());
    }

    let content_hash = hasher::content_hash(&task.abs_path);
    let includes_hash = hasher::includes_hash(&include_pairs);
    let composite_hash = hasher::composite_hash(&content_hash, &entry.flags_hash, &includes_hash);

    ParsePayload {
        context_id: task.context_id.clone(),
        file_key: task.file_key.clone(),
        repo_id: task.repo_id.clone(),
        rel_path: task.rel_path.clone(),
        abs_path: task.abs_path.to_string_lossy().replace('\\', "/"),
        output,
        include_deps: resolved_deps,
        content_hash,
        flags_hash: entry.flags_hash.clone(),
        includes_hash,
        composite_hash,
        warnings,
    }
}

/// Write a clang VFS overlay file describing the manifest's path remaps.
/// Returns `None` when the manifest has no remaps. The temp file lives until
/// the returned handle drops, i.e. after the subprocess exits.
fn build_vfs_overlay_file(
    workspace_root: &Path,
    manifest: &WorkspaceManifest,
) -> Option<tempfile::NamedTempFile> {
    if manifest.path_remaps.is_empty() {
        return None;
    }

    let roots: Vec<serde_json::Value> = manifest
        .path_remaps
        .iter()
        .map(|remap| {
            let mapped = workspace_root.join(&remap.to_prefix);
            serde_json::json!({
                "name": remap.from_prefix.replace('\\', "/"),
                "type": "directory-remap",
                "external-contents": mapped.to_string_lossy().replace('\\', "/"),
            })
        })
        .collect();

    let payload = serde_json::json!({
        "version": 0,
        "case-sensitive": "false",
        "roots": roots,
    });

    let mut file = match tempfile::Builder::new().suffix(".json").tempfile() {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, "cannot create VFS overlay file, includes will not remap");
            return None;
        }
    };
    if let Err(e) = file.write_all(payload.to_string().as_bytes()) {
        warn!(error = %e, "cannot write VFS overlay file");
        return None;
    }
    Some(file)
}
