//! Sync job engine: webhook ingest, leased workers, deterministic checkouts.
//!
//! Webhooks (push, merge_request) are normalised into index jobs with an
//! idempotency key `(workspace, repo, ref, context, event_sha)` so duplicate
//! deliveries converge on one job. Repo sync jobs check a repository out at
//! an exact commit SHA in detached-HEAD state; auth tokens come from env-var
//! indirection declared in the manifest and never appear in logs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::manifest::RepoManifest;
use crate::orchestrator::Orchestrator;
use crate::store::{IndexJobSpec, Store};
use crate::types::{JobStatus, SyncJob};

/// A webhook payload reduced to the fields the job queue cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub repo_id: String,
    pub git_ref: String,
    pub commit_sha: String,
}

/// Validate a 40-hex commit SHA, lower-cased.
pub fn validate_commit_sha(sha: &str) -> Result<String> {
    let sha = sha.trim();
    if sha.len() != 40 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Validation(
            "commit_sha must be a 40-character hex SHA".into(),
        ));
    }
    Ok(sha.to_lowercase())
}

/// Reduce a GitLab webhook body to a [`NormalizedEvent`]. The repo is matched
/// by project name first, then by `path_with_namespace` against manifest
/// remote URLs.
pub fn normalize_gitlab_event(
    payload: &Value,
    repos: &[RepoManifest],
) -> Result<NormalizedEvent> {
    let object_kind = payload["object_kind"].as_str().unwrap_or_default();

    let project_name = payload["project"]["name"].as_str().unwrap_or_default();
    let namespace_path = payload["project"]["path_with_namespace"]
        .as_str()
        .unwrap_or_default();
    let repo_id = repos
        .iter()
        .find(|r| r.repo_id == project_name)
        .or_else(|| {
            repos.iter().find(|r| {
                !namespace_path.is_empty()
                    && r.remote_url.to_lowercase().contains(&namespace_path.to_lowercase())
            })
        })
        .map(|r| r.repo_id.clone())
        .ok_or_else(|| {
            Error::Validation(format!(
                "webhook project {project_name:?} does not match any workspace repo"
            ))
        })?;

    match object_kind {
        "push" => {
            let git_ref = payload["ref"].as_str().unwrap_or_default().to_string();
            let sha = payload["after"].as_str().unwrap_or_default().to_string();
            if git_ref.is_empty() || sha.is_empty() {
                return Err(Error::Validation("push event missing ref or after".into()));
            }
            Ok(NormalizedEvent {
                event_type: "push".into(),
                repo_id,
                git_ref,
                commit_sha: validate_commit_sha(&sha)?,
            })
        }
        "merge_request" => {
            let attrs = &payload["object_attributes"];
            let source_branch = attrs["source_branch"].as_str().unwrap_or_default();
            let sha = attrs["last_commit"]["id"].as_str().unwrap_or_default();
            if source_branch.is_empty() || sha.is_empty() {
                return Err(Error::Validation(
                    "merge_request event missing source_branch or last_commit".into(),
                ));
            }
            Ok(NormalizedEvent {
                event_type: "merge_request".into(),
                repo_id,
                git_ref: format!("refs/heads/{source_branch}"),
                commit_sha: validate_commit_sha(sha)?,
            })
        }
        other => Err(Error::Validation(format!(
            "unsupported webhook object_kind {other:?}"
        ))),
    }
}

/// Outcome of one repo checkout.
#[derive(Debug)]
pub struct CheckoutResult {
    pub resolved_commit_sha: String,
    pub warnings: Vec<String>,
}

/// Git subprocess wrapper for deterministic detached checkouts.
pub struct GitSync {
    git_binary: String,
    timeout: Duration,
}

impl GitSync {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            git_binary: settings.git_binary.clone(),
            timeout: Duration::from_secs(settings.git_timeout_s),
        }
    }

    async fn run_git(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        extra_header: Option<&str>,
    ) -> Result<(i32, String, String)> {
        let mut cmd = tokio::process::Command::new(&self.git_binary);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        if let Some(header) = extra_header {
            // Token travels only through the subprocess environment.
            cmd.env("GIT_HTTP_EXTRA_HEADER", header);
        }
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::SyncCheckoutFailed(format!("git spawn failed: {e}")))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::SyncCheckoutFailed(format!("git command timed out: git {}", args.join(" ")))
            })?
            .map_err(|e| Error::SyncCheckoutFailed(format!("git wait failed: {e}")))?;

        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    /// Check `repo` out at `commit_sha` (detached) under `workspace_root`.
    pub async fn checkout(
        &self,
        workspace_root: &Path,
        repo: &RepoManifest,
        commit_sha: &str,
        branch: &str,
        force_clean: bool,
    ) -> Result<CheckoutResult> {
        if repo.remote_url.is_empty() {
            return Err(Error::SyncCheckoutFailed(format!(
                "repo {} has no remote_url",
                repo.repo_id
            )));
        }
        if repo.token_env_var.is_empty() {
            return Err(Error::SyncAuthFailed(format!(
                "repo {} declares no token_env_var",
                repo.repo_id
            )));
        }
        let token = std::env::var(&repo.token_env_var).unwrap_or_default();
        if token.is_empty() {
            return Err(Error::SyncAuthFailed(format!(
                "env var {} is not set",
                repo.token_env_var
            )));
        }
        let header = format!("PRIVATE-TOKEN: {token}");
        let repo_root = workspace_root.join(&repo.root);
        let mut warnings = Vec::new();

        // Clone on first contact.
        if !repo_root.join(".git").exists() {
            if let Some(parent) = repo_root.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let (code, _, err) = self
                .run_git(
                    &["clone", &repo.remote_url, &repo_root.to_string_lossy()],
                    None,
                    Some(&header),
                )
                .await?;
            if code != 0 {
                return Err(classify_git_failure("clone", &err));
            }
        }

        if force_clean {
            let (code, _, err) = self
                .run_git(&["reset", "--hard"], Some(&repo_root), Some(&header))
                .await?;
            if code != 0 {
                return Err(Error::SyncCheckoutFailed(format!("git reset --hard: {err}")));
            }
            let (code, _, err) = self
                .run_git(&["clean", "-fd"], Some(&repo_root), Some(&header))
                .await?;
            if code != 0 {
                return Err(Error::SyncCheckoutFailed(format!("git clean -fd: {err}")));
            }
        } else {
            let (code, out, err) = self
                .run_git(&["status", "--porcelain"], Some(&repo_root), Some(&header))
                .await?;
            if code != 0 {
                return Err(Error::SyncCheckoutFailed(format!("git status: {err}")));
            }
            if !out.is_empty() {
                return Err(Error::SyncCheckoutFailed(
                    "repository has local modifications".into(),
                ));
            }
        }

        if !branch.is_empty() {
            let (code, _, err) = self
                .run_git(&["fetch", "origin", branch], Some(&repo_root), Some(&header))
                .await?;
            if code != 0 {
                return Err(classify_git_failure("fetch branch", &err));
            }
        }
        let (code, _, err) = self
            .run_git(&["fetch", "origin", commit_sha], Some(&repo_root), Some(&header))
            .await?;
        if code != 0 {
            return Err(classify_git_failure("fetch commit", &err));
        }

        let probe = format!("{commit_sha}^{{commit}}");
        let (code, _, err) = self
            .run_git(&["cat-file", "-e", &probe], Some(&repo_root), Some(&header))
            .await?;
        if code != 0 {
            return Err(Error::SyncCheckoutFailed(format!(
                "commit {commit_sha} not found: {err}"
            )));
        }

        if !branch.is_empty() {
            let upstream = format!("origin/{branch}");
            let (code, _, _) = self
                .run_git(
                    &["merge-base", "--is-ancestor", commit_sha, &upstream],
                    Some(&repo_root),
                    Some(&header),
                )
                .await?;
            if code != 0 {
                warnings.push("sha_branch_mismatch".to_string());
            }
        }

        let (code, _, err) = self
            .run_git(
                &["checkout", "--detach", commit_sha],
                Some(&repo_root),
                Some(&header),
            )
            .await?;
        if code != 0 {
            return Err(Error::SyncCheckoutFailed(format!(
                "git checkout --detach {commit_sha}: {err}"
            )));
        }

        let (code, out, err) = self
            .run_git(&["rev-parse", "HEAD"], Some(&repo_root), Some(&header))
            .await?;
        if code != 0 {
            return Err(Error::SyncCheckoutFailed(format!("git rev-parse HEAD: {err}")));
        }

        Ok(CheckoutResult {
            resolved_commit_sha: out.to_lowercase(),
            warnings,
        })
    }
}

fn classify_git_failure(step: &str, stderr: &str) -> Error {
    let lowered = stderr.to_lowercase();
    if lowered.contains("authentication") || lowered.contains("403") || lowered.contains("401") {
        Error::SyncAuthFailed(format!("git {step}: {stderr}"))
    } else {
        Error::SyncCheckoutFailed(format!("git {step}: {stderr}"))
    }
}

/// The sync engine: ingest endpoints plus the worker pool.
pub struct SyncEngine {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    git: GitSync,
    settings: Settings,
    repo_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(store: Arc<Store>, orchestrator: Arc<Orchestrator>, settings: Settings) -> Self {
        Self {
            store,
            orchestrator,
            git: GitSync::new(&settings),
            settings,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn repo_lock(&self, workspace_id: &str, repo_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        Arc::clone(
            locks
                .entry((workspace_id.to_string(), repo_id.to_string()))
                .or_default(),
        )
    }

    /// Ingest a GitLab webhook: insert an idempotent index job and, when the
    /// repo is sync-configured, a repo sync job for the exact SHA.
    pub fn ingest_webhook(
        &self,
        workspace_id: &str,
        payload: &Value,
    ) -> Result<(String, Option<String>)> {
        let (_, manifest) = self.orchestrator.manifest_for(workspace_id)?;
        let event = normalize_gitlab_event(payload, &manifest.repos)?;

        let context_id = crate::context::ContextManager::baseline_id(workspace_id);
        let index_job_id = self.store.insert_index_job(
            &Uuid::new_v4().to_string(),
            &IndexJobSpec {
                workspace_id: workspace_id.to_string(),
                repo_id: event.repo_id.clone(),
                context_id,
                event_type: event.event_type.clone(),
                git_ref: event.git_ref.clone(),
                event_sha: event.commit_sha.clone(),
            },
        )?;

        let repo = manifest
            .repo(&event.repo_id)
            .ok_or_else(|| Error::NotFound(format!("repo {}", event.repo_id)))?;
        let sync_job_id = if repo.remote_url.is_empty() {
            None
        } else {
            let job_id = Uuid::new_v4().to_string();
            self.store.insert_repo_sync_job(
                &job_id,
                workspace_id,
                &event.repo_id,
                &event.commit_sha,
                event.git_ref.strip_prefix("refs/heads/").unwrap_or(""),
                true,
                self.settings.sync_max_attempts,
            )?;
            Some(job_id)
        };

        info!(
            workspace = workspace_id,
            repo = %event.repo_id,
            event = %event.event_type,
            sha = %event.commit_sha,
            "webhook ingested"
        );
        Ok((index_job_id, sync_job_id))
    }

    /// Enqueue a sync job for one repo at an exact SHA.
    pub fn enqueue_sync(
        &self,
        workspace_id: &str,
        repo_id: &str,
        commit_sha: &str,
        branch: &str,
        force_clean: bool,
    ) -> Result<String> {
        let (_, manifest) = self.orchestrator.manifest_for(workspace_id)?;
        if manifest.repo(repo_id).is_none() {
            return Err(Error::NotFound(format!("repo {repo_id}")));
        }
        let sha = validate_commit_sha(commit_sha)?;
        let job_id = Uuid::new_v4().to_string();
        self.store.insert_repo_sync_job(
            &job_id,
            workspace_id,
            repo_id,
            &sha,
            branch,
            force_clean,
            self.settings.sync_max_attempts,
        )?;
        Ok(job_id)
    }

    pub fn job(&self, job_id: &str) -> Result<SyncJob> {
        self.store
            .get_repo_sync_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("sync job {job_id}")))
    }

    /// Process one leased job to completion.
    async fn process_job(&self, job: SyncJob) {
        let lock = self.repo_lock(&job.workspace_id, &job.repo_id).await;
        let _guard = lock.lock().await;

        // Refresh the lease before the (potentially long) git work.
        if let Err(e) = self
            .store
            .heartbeat_repo_sync_job(&job.id, self.settings.sync_lease_ttl_s)
        {
            warn!(job = %job.id, error = %e, "sync heartbeat failed");
        }

        let outcome = self.run_checkout(&job).await;
        match outcome {
            Ok(result) => {
                if let Err(e) = self
                    .store
                    .mark_repo_sync_job_done(&job.id, &result.resolved_commit_sha)
                {
                    warn!(job = %job.id, error = %e, "failed to mark sync job done");
                }
                let _ = self.store.upsert_repo_sync_state(
                    &job.workspace_id,
                    &job.repo_id,
                    &result.resolved_commit_sha,
                    &job.requested_branch,
                    true,
                    "",
                    "",
                );
                // The checkout moved the tree; cached flags are now suspect,
                // and the new revision needs indexing.
                self.orchestrator
                    .invalidate_compile_dbs(Some(&job.workspace_id));
                let _ = self.store.insert_index_job(
                    &Uuid::new_v4().to_string(),
                    &IndexJobSpec {
                        workspace_id: job.workspace_id.clone(),
                        repo_id: job.repo_id.clone(),
                        context_id: crate::context::ContextManager::baseline_id(&job.workspace_id),
                        event_type: "repo_sync".into(),
                        git_ref: job.requested_branch.clone(),
                        event_sha: result.resolved_commit_sha.clone(),
                    },
                );
                info!(
                    job = %job.id,
                    repo = %job.repo_id,
                    sha = %result.resolved_commit_sha,
                    "repo sync done"
                );
            }
            Err(e) => {
                let code = e.kind().as_str().to_string();
                let message = e.to_string();
                let status = self
                    .store
                    .mark_repo_sync_job_failed(&job.id, &code, &message)
                    .unwrap_or(JobStatus::Failed);
                let _ = self.store.upsert_repo_sync_state(
                    &job.workspace_id,
                    &job.repo_id,
                    "",
                    "",
                    false,
                    &code,
                    &message,
                );
                warn!(
                    job = %job.id,
                    repo = %job.repo_id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    code = %code,
                    status = status.as_str(),
                    "repo sync failed"
                );
                // Exponential backoff before this worker polls again.
                let backoff = self.settings.sync_backoff_base_ms
                    * 2u64.saturating_pow(job.attempts.saturating_sub(1));
                tokio::time::sleep(Duration::from_millis(backoff.min(30_000))).await;
            }
        }
    }

    async fn run_checkout(&self, job: &SyncJob) -> Result<CheckoutResult> {
        let (root, manifest): (PathBuf, _) = self.orchestrator.manifest_for(&job.workspace_id)?;
        let repo = manifest
            .repo(&job.repo_id)
            .ok_or_else(|| Error::NotFound(format!("repo {} not in manifest", job.repo_id)))?;
        self.git
            .checkout(
                &root,
                repo,
                &job.requested_commit_sha,
                &job.requested_branch,
                job.requested_force_clean,
            )
            .await
    }

    /// One worker loop: poll, lease, process.
    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let poll = Duration::from_millis(self.settings.sync_poll_interval_ms);
        loop {
            match self
                .store
                .lease_next_repo_sync_job(self.settings.sync_lease_ttl_s)
            {
                Ok(Some(leased)) => {
                    if leased.reclaimed {
                        warn!(
                            worker = worker_id,
                            job = %leased.job.id,
                            "reclaimed sync job with lapsed lease"
                        );
                    }
                    self.process_job(leased.job).await;
                }
                Ok(None) => tokio::time::sleep(poll).await,
                Err(e) => {
                    warn!(worker = worker_id, error = %e, "sync poll failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Spawn the fixed worker pool.
    pub fn spawn_workers(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.settings.sync_worker_count.max(1))
            .map(|worker_id| {
                let engine = Arc::clone(&self);
                tokio::spawn(engine.worker_loop(worker_id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repos() -> Vec<RepoManifest> {
        vec![RepoManifest {
            repo_id: "repo_a".into(),
            root: "repo_a".into(),
            compile_commands: String::new(),
            default_branch: "main".into(),
            depends_on: vec![],
            remote_url: "https://gitlab.example.com/group/repo_a.git".into(),
            token_env_var: "GITLAB_TOKEN".into(),
            commit_sha: "a".repeat(40),
        }]
    }

    #[test]
    fn sha_validation() {
        assert!(validate_commit_sha(&"A".repeat(40)).is_ok());
        assert_eq!(validate_commit_sha(&"A".repeat(40)).unwrap(), "a".repeat(40));
        assert!(validate_commit_sha("abc123").is_err());
        assert!(validate_commit_sha(&"g".repeat(40)).is_err());
    }

    #[test]
    fn push_event_normalises() {
        let payload = json!({
            "object_kind": "push",
            "ref": "refs/heads/main",
            "after": "b".repeat(40),
            "project": {"name": "repo_a", "path_with_namespace": "group/repo_a"},
        });
        let event = normalize_gitlab_event(&payload, &repos()).unwrap();
        assert_eq!(event.event_type, "push");
        assert_eq!(event.repo_id, "repo_a");
        assert_eq!(event.git_ref, "refs/heads/main");
        assert_eq!(event.commit_sha, "b".repeat(40));
    }

    #[test]
    fn merge_request_event_normalises() {
        let payload = json!({
            "object_kind": "merge_request",
            "project": {"name": "other", "path_with_namespace": "group/repo_a"},
            "object_attributes": {
                "source_branch": "feature/x",
                "last_commit": {"id": "c".repeat(40)},
            },
        });
        let event = normalize_gitlab_event(&payload, &repos()).unwrap();
        assert_eq!(event.event_type, "merge_request");
        // Matched through remote_url when the project name is unknown.
        assert_eq!(event.repo_id, "repo_a");
        assert_eq!(event.git_ref, "refs/heads/feature/x");
    }

    #[test]
    fn unknown_project_is_rejected() {
        let payload = json!({
            "object_kind": "push",
            "ref": "refs/heads/main",
            "after": "b".repeat(40),
            "project": {"name": "ghost", "path_with_namespace": "group/ghost"},
        });
        let err = normalize_gitlab_event(&payload, &repos()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn unsupported_event_kind_is_rejected() {
        let payload = json!({
            "object_kind": "tag_push",
            "project": {"name": "repo_a"},
        });
        assert!(normalize_gitlab_event(&payload, &repos()).is_err());
    }
}
