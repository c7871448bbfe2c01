//! Workspace manifest loading and path canonicalization.
//!
//! The manifest (YAML at the workspace root) declares the repos that make up
//! a workspace, their dependency edges, and the `path_remaps` that redirect
//! external absolute include prefixes back into workspace repos. Every file
//! in the system is addressed by its canonical `file_key`
//! (`"{repo_id}:{rel_path}"` with forward slashes); absolute paths are
//! derived from it, never stored as identity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ResolvedIncludeDep;

/// A repository node in the workspace manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoManifest {
    pub repo_id: String,
    /// Repo root relative to the workspace root.
    pub root: String,
    #[serde(default)]
    pub compile_commands: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub remote_url: String,
    #[serde(default)]
    pub token_env_var: String,
    #[serde(default)]
    pub commit_sha: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Maps an external include prefix to a workspace repo prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRemap {
    pub from_prefix: String,
    pub to_repo_id: String,
    pub to_prefix: String,
}

/// Top-level workspace manifest schema (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub workspace_id: String,
    #[serde(default)]
    pub repos: Vec<RepoManifest>,
    #[serde(default)]
    pub path_remaps: Vec<PathRemap>,
}

impl WorkspaceManifest {
    /// Load and validate a manifest from YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Manifest(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        let manifest: Self = serde_yaml::from_str(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate repo ids, sync fields, and the dependency DAG.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for repo in &self.repos {
            if repo.repo_id.is_empty() {
                return Err(Error::Manifest("repo with empty repo_id".into()));
            }
            if seen.insert(repo.repo_id.as_str(), ()).is_some() {
                return Err(Error::Manifest(format!(
                    "duplicate repo_id in manifest: {}",
                    repo.repo_id
                )));
            }
            if !repo.remote_url.is_empty() {
                if !repo.remote_url.to_lowercase().starts_with("https://") {
                    return Err(Error::Manifest(format!(
                        "repo {}: remote_url must be HTTPS",
                        repo.repo_id
                    )));
                }
                if repo.token_env_var.is_empty() {
                    return Err(Error::Manifest(format!(
                        "repo {}: token_env_var is required when remote_url is set",
                        repo.repo_id
                    )));
                }
                if !is_full_sha(&repo.commit_sha) {
                    return Err(Error::Manifest(format!(
                        "repo {}: commit_sha must be a 40-character hex SHA",
                        repo.repo_id
                    )));
                }
            }
        }

        // Roots that differ only in case collide on case-insensitive
        // filesystems and make file_key lookup ambiguous.
        let mut roots: HashMap<String, &str> = HashMap::new();
        for repo in &self.repos {
            let normalized = normalize_path(&repo.root).to_lowercase();
            if let Some(other) = roots.insert(normalized, repo.repo_id.as_str()) {
                if other != repo.repo_id {
                    return Err(Error::Manifest(format!(
                        "repo roots differ only in case: {} vs {}",
                        other, repo.repo_id
                    )));
                }
            }
        }

        self.check_dependency_cycles()
    }

    fn check_dependency_cycles(&self) -> Result<()> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for repo in &self.repos {
            let idx = graph.add_node(repo.repo_id.as_str());
            nodes.insert(repo.repo_id.as_str(), idx);
        }
        for repo in &self.repos {
            let from = nodes[repo.repo_id.as_str()];
            for dep in &repo.depends_on {
                match nodes.get(dep.as_str()) {
                    Some(&to) => {
                        graph.add_edge(from, to, ());
                    }
                    None => {
                        return Err(Error::Manifest(format!(
                            "repo {} depends on unknown repo {dep}",
                            repo.repo_id
                        )));
                    }
                }
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(Error::Manifest(
                "repo dependency graph contains a cycle".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn repo(&self, repo_id: &str) -> Option<&RepoManifest> {
        self.repos.iter().find(|r| r.repo_id == repo_id)
    }

    /// All repo ids in manifest order.
    #[must_use]
    pub fn repo_ids(&self) -> Vec<String> {
        self.repos.iter().map(|r| r.repo_id.clone()).collect()
    }

    /// Close `entry_repos` over `depends_on` edges up to `max_hops`. An empty
    /// entry set means the whole workspace.
    #[must_use]
    pub fn scope_repos(&self, entry_repos: &[String], max_hops: u32) -> Vec<String> {
        if entry_repos.is_empty() {
            let mut all = self.repo_ids();
            all.sort();
            return all;
        }

        let mut result: Vec<String> = Vec::new();
        let mut queue: Vec<(String, u32)> = entry_repos
            .iter()
            .filter(|r| self.repo(r).is_some())
            .map(|r| (r.clone(), 0))
            .collect();

        while let Some((repo_id, depth)) = queue.pop() {
            if result.contains(&repo_id) {
                continue;
            }
            result.push(repo_id.clone());
            if depth >= max_hops {
                continue;
            }
            if let Some(repo) = self.repo(&repo_id) {
                for dep in &repo.depends_on {
                    if self.repo(dep).is_some() && !result.contains(dep) {
                        queue.push((dep.clone(), depth + 1));
                    }
                }
            }
        }
        result.sort();
        result
    }
}

/// Normalize a path string to forward slashes.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn is_full_sha(sha: &str) -> bool {
    sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve an absolute path to `(file_key, repo_id, rel_path, abs_norm)` by
/// locating the repo whose root contains it. Lookup is case-normalised;
/// display paths preserve original case.
#[must_use]
pub fn resolve_file_key(
    workspace_root: &Path,
    manifest: &WorkspaceManifest,
    abs_path: &Path,
) -> Option<(String, String, String, String)> {
    let abs_norm = normalize_path(&abs_path.to_string_lossy());
    let abs_lower = abs_norm.to_lowercase();

    for repo in &manifest.repos {
        let repo_root = normalize_path(&workspace_root.join(&repo.root).to_string_lossy());
        let root_lower = repo_root.to_lowercase();
        let root_lower = root_lower.trim_end_matches('/');
        if abs_lower == root_lower || abs_lower.starts_with(&format!("{root_lower}/")) {
            let rel = abs_norm[repo_root.trim_end_matches('/').len()..]
                .trim_start_matches('/')
                .to_string();
            let file_key = format!("{}:{rel}", repo.repo_id);
            return Some((file_key, repo.repo_id.clone(), rel, abs_norm));
        }
    }
    None
}

/// Resolve a canonical file key into `(repo_id, rel_path, abs_path)`.
#[must_use]
pub fn file_key_to_abs_path(
    workspace_root: &Path,
    manifest: &WorkspaceManifest,
    file_key: &str,
) -> Option<(String, String, PathBuf)> {
    let (repo_id, rel) = file_key.split_once(':')?;
    let repo = manifest.repo(repo_id)?;
    let abs = workspace_root.join(&repo.root).join(rel);
    Some((repo_id.to_string(), rel.to_string(), abs))
}

/// Resolve an include path emitted by the extractor to canonical workspace
/// identity, following `path_remaps` for external absolute prefixes.
///
/// Include-dep hashing depends on this: the workspace-canonical file_key, not
/// the extractor-emitted absolute path, feeds `includes_hash`.
#[must_use]
pub fn resolve_include_dep(
    workspace_root: &Path,
    manifest: &WorkspaceManifest,
    raw_path: &str,
    depth: u32,
) -> ResolvedIncludeDep {
    let raw_norm = normalize_path(raw_path);

    // Directly inside a workspace repo.
    if let Some((file_key, _, _, abs_norm)) =
        resolve_file_key(workspace_root, manifest, Path::new(&raw_norm))
    {
        return ResolvedIncludeDep {
            raw_path: raw_norm,
            file_key,
            abs_path: abs_norm,
            resolved: true,
            depth,
        };
    }

    // External prefix remapped into a workspace repo.
    let raw_lower = raw_norm.to_lowercase();
    for remap in &manifest.path_remaps {
        let from = normalize_path(&remap.from_prefix);
        let from = from.trim_end_matches('/');
        let from_lower = from.to_lowercase();
        if raw_lower == from_lower || raw_lower.starts_with(&format!("{from_lower}/")) {
            if manifest.repo(&remap.to_repo_id).is_none() {
                continue;
            }
            let suffix = raw_norm[from.len()..].trim_start_matches('/');
            let remapped = workspace_root.join(&remap.to_prefix).join(suffix);
            if let Some((file_key, _, _, abs_norm)) =
                resolve_file_key(workspace_root, manifest, &remapped)
            {
                return ResolvedIncludeDep {
                    raw_path: raw_norm,
                    file_key,
                    abs_path: abs_norm,
                    resolved: true,
                    depth,
                };
            }
            return ResolvedIncludeDep {
                raw_path: raw_norm.clone(),
                file_key: String::new(),
                abs_path: normalize_path(&remapped.to_string_lossy()),
                resolved: false,
                depth,
            };
        }
    }

    ResolvedIncludeDep {
        raw_path: raw_norm,
        file_key: String::new(),
        abs_path: String::new(),
        resolved: false,
        depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_repo_manifest() -> WorkspaceManifest {
        WorkspaceManifest {
            workspace_id: "ws".into(),
            repos: vec![
                RepoManifest {
                    repo_id: "repo_a".into(),
                    root: "repo_a".into(),
                    compile_commands: "repo_a/compile_commands.json".into(),
                    default_branch: "main".into(),
                    depends_on: vec!["repo_b".into()],
                    remote_url: String::new(),
                    token_env_var: String::new(),
                    commit_sha: String::new(),
                },
                RepoManifest {
                    repo_id: "repo_b".into(),
                    root: "repo_b".into(),
                    compile_commands: String::new(),
                    default_branch: "main".into(),
                    depends_on: vec![],
                    remote_url: String::new(),
                    token_env_var: String::new(),
                    commit_sha: String::new(),
                },
            ],
            path_remaps: vec![PathRemap {
                from_prefix: "C:/external/libb".into(),
                to_repo_id: "repo_b".into(),
                to_prefix: "repo_b".into(),
            }],
        }
    }

    #[test]
    fn validate_accepts_dag() {
        two_repo_manifest().validate().expect("valid manifest");
    }

    #[test]
    fn validate_rejects_cycles() {
        let mut manifest = two_repo_manifest();
        manifest.repos[1].depends_on = vec!["repo_a".into()];
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_rejects_duplicate_repo_ids() {
        let mut manifest = two_repo_manifest();
        manifest.repos[1].repo_id = "repo_a".into();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn validate_rejects_case_colliding_roots() {
        let mut manifest = two_repo_manifest();
        manifest.repos[1].root = "Repo_A".into();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("case"));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let mut manifest = two_repo_manifest();
        manifest.repos[0].depends_on = vec!["ghost".into()];
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn validate_requires_token_and_sha_with_remote() {
        let mut manifest = two_repo_manifest();
        manifest.repos[0].remote_url = "https://gitlab.example.com/a.git".into();
        assert!(manifest.validate().is_err());

        manifest.repos[0].token_env_var = "GITLAB_TOKEN".into();
        manifest.repos[0].commit_sha = "a".repeat(40);
        manifest.validate().expect("valid with token and sha");
    }

    #[test]
    fn scope_closes_over_depends_on() {
        let manifest = two_repo_manifest();
        let scoped = manifest.scope_repos(&["repo_a".into()], 2);
        assert_eq!(scoped, vec!["repo_a".to_string(), "repo_b".to_string()]);

        let zero_hops = manifest.scope_repos(&["repo_a".into()], 0);
        assert_eq!(zero_hops, vec!["repo_a".to_string()]);

        let all = manifest.scope_repos(&[], 2);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn file_key_resolution_round_trips() {
        let manifest = two_repo_manifest();
        let root = Path::new("/ws");
        let abs = root.join("repo_a/src/x.cpp");

        let (file_key, repo_id, rel, _) =
            resolve_file_key(root, &manifest, &abs).expect("resolves");
        assert_eq!(file_key, "repo_a:src/x.cpp");
        assert_eq!(repo_id, "repo_a");
        assert_eq!(rel, "src/x.cpp");

        let (repo_id, rel, back) =
            file_key_to_abs_path(root, &manifest, &file_key).expect("back");
        assert_eq!(repo_id, "repo_a");
        assert_eq!(rel, "src/x.cpp");
        assert_eq!(back, abs);
    }

    #[test]
    fn file_key_lookup_is_case_insensitive() {
        let manifest = two_repo_manifest();
        let root = Path::new("/ws");
        let resolved = resolve_file_key(root, &manifest, Path::new("/WS/REPO_A/src/X.cpp"));
        assert!(resolved.is_some());
        // Display case is preserved in the rel path.
        assert_eq!(resolved.unwrap().2, "src/X.cpp");
    }

    #[test]
    fn include_remap_resolves_external_prefix() {
        let manifest = two_repo_manifest();
        let dep = resolve_include_dep(
            Path::new("/ws"),
            &manifest,
            "C:/external/libb/include/u.h",
            2,
        );
        assert!(dep.resolved);
        assert_eq!(dep.file_key, "repo_b:include/u.h");
        assert_eq!(dep.depth, 2);
    }

    #[test]
    fn unmapped_external_include_stays_unresolved() {
        let manifest = two_repo_manifest();
        let dep = resolve_include_dep(Path::new("/ws"), &manifest, "/usr/include/vector", 1);
        assert!(!dep.resolved);
        assert!(dep.file_key.is_empty());
    }
}
