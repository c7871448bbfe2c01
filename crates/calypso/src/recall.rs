//! Candidate recall: FTS-first with a ripgrep fallback.
//!
//! Stage 2 of the query pipeline asks a [`Recaller`] for candidate file keys
//! given a symbol and a repo scope. The default implementation merges hits
//! from the store's full-text index with an `rg --json` subprocess sweep for
//! repos that lack FTS coverage, deduplicating by file key.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::manifest::{resolve_file_key, WorkspaceManifest};
use crate::store::Store;

/// C++ file extensions searched during recall.
const CPP_GLOBS: &[&str] = &[
    "*.cpp", "*.cxx", "*.cc", "*.c", "*.h", "*.hpp", "*.hxx", "*.inl",
];

/// Result of one recall pass.
#[derive(Debug, Default)]
pub struct RecallOutcome {
    /// Candidate file keys in discovery order, deduplicated.
    pub file_keys: Vec<String>,
    /// Non-fatal diagnostics (timeouts, missing rg, slow sweeps).
    pub warnings: Vec<String>,
}

/// Produces candidate file keys for `(symbol, repo scope)`.
#[async_trait]
pub trait Recaller: Send + Sync {
    async fn recall(
        &self,
        context_chain: &[String],
        symbol: &str,
        repo_ids: &[String],
        workspace_root: &Path,
        manifest: &WorkspaceManifest,
        max_files: usize,
    ) -> RecallOutcome;
}

/// Convert a qualified C++ symbol into a ripgrep regex with word boundaries.
///
/// `Session::Auth` becomes `\bSession\s*::\s*Auth\b` so whitespace around the
/// scope operator still matches.
#[must_use]
pub fn build_symbol_pattern(symbol: &str) -> String {
    let parts: Vec<String> = symbol
        .split("::")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(regex_escape)
        .collect();
    format!(r"\b{}\b", parts.join(r"\s*::\s*"))
}

fn regex_escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// Default recaller: store FTS hits first, `rg` sweep for uncovered repos.
pub struct DefaultRecaller {
    store: Arc<Store>,
    rg_binary: String,
    timeout: Duration,
}

impl DefaultRecaller {
    #[must_use]
    pub fn new(store: Arc<Store>, settings: &Settings) -> Self {
        Self {
            store,
            rg_binary: settings.rg_binary.clone(),
            timeout: Duration::from_secs(settings.recall_timeout_s),
        }
    }

    async fn rg_repo_sweep(
        &self,
        symbol: &str,
        repo_root: &Path,
        workspace_root: &Path,
        manifest: &WorkspaceManifest,
        max_files: usize,
    ) -> (Vec<String>, Vec<String>) {
        let pattern = build_symbol_pattern(symbol);
        let mut cmd = tokio::process::Command::new(&self.rg_binary);
        cmd.arg("--json").arg("--no-heading").arg("--max-count").arg("5");
        for glob in CPP_GLOBS {
            cmd.arg("--type-add").arg(format!("cxx:{glob}"));
        }
        cmd.arg("--type").arg("cxx");
        cmd.arg("--").arg(&pattern).arg(repo_root);
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return (
                    Vec::new(),
                    vec![format!("recall: rg binary not available: {e}")],
                );
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return (Vec::new(), vec![format!("recall: rg wait failed: {e}")]),
            Err(_) => {
                return (
                    Vec::new(),
                    vec![format!(
                        "recall: rg timed out after {}s",
                        self.timeout.as_secs()
                    )],
                );
            }
        };

        let mut warnings = Vec::new();
        // rg exits 1 on "no matches", which is a normal outcome.
        let code = output.status.code().unwrap_or(-1);
        if code > 1 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warnings.push(format!(
                "recall: rg exited with code {code}: {}",
                stderr.trim().chars().take(300).collect::<String>()
            ));
            return (Vec::new(), warnings);
        }

        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(5) {
            warnings.push(format!("recall: slow sweep ({}ms)", elapsed.as_millis()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for path in parse_rg_json_paths(&stdout) {
            let Some((file_key, _, _, _)) =
                resolve_file_key(workspace_root, manifest, Path::new(&path))
            else {
                continue;
            };
            if seen.insert(file_key.clone()) {
                keys.push(file_key);
                if keys.len() >= max_files {
                    break;
                }
            }
        }
        debug!(pattern = %pattern, files = keys.len(), elapsed_ms = elapsed.as_millis() as u64, "rg recall sweep");
        (keys, warnings)
    }
}

/// Extract matched file paths from `rg --json` line output.
fn parse_rg_json_paths(output: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if msg["type"] != "match" {
            continue;
        }
        if let Some(path) = msg["data"]["path"]["text"].as_str() {
            paths.push(path.replace('\\', "/"));
        }
    }
    paths
}

#[async_trait]
impl Recaller for DefaultRecaller {
    async fn recall(
        &self,
        context_chain: &[String],
        symbol: &str,
        repo_ids: &[String],
        workspace_root: &Path,
        manifest: &WorkspaceManifest,
        max_files: usize,
    ) -> RecallOutcome {
        let mut keys: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut covered: HashSet<String> = HashSet::new();

        // FTS hits across the chain, overlay first.
        for context_id in context_chain {
            match self
                .store
                .search_recall_candidates(context_id, symbol, repo_ids, max_files)
            {
                Ok(hits) => {
                    for key in hits {
                        if seen.insert(key.clone()) {
                            keys.push(key);
                        }
                    }
                }
                Err(e) => warnings.push(format!("recall: fts failed: {e}")),
            }
            match self.store.repos_with_recall_coverage(context_id) {
                Ok(repos) => covered.extend(repos),
                Err(e) => warn!(error = %e, "recall coverage lookup failed"),
            }
        }

        // rg fallback for repos without an FTS snapshot.
        for repo_id in repo_ids {
            if covered.contains(repo_id) || keys.len() >= max_files {
                continue;
            }
            let Some(repo) = manifest.repo(repo_id) else {
                continue;
            };
            let repo_root = workspace_root.join(&repo.root);
            let per_repo = (max_files / repo_ids.len().max(1)).max(20);
            let (rg_keys, rg_warnings) = self
                .rg_repo_sweep(symbol, &repo_root, workspace_root, manifest, per_repo)
                .await;
            warnings.extend(rg_warnings);
            for key in rg_keys {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }

        keys.truncate(max_files);
        RecallOutcome {
            file_keys: keys,
            warnings,
        }
    }
}
