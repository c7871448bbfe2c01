//! Context manager: baseline contexts, sparse PR overlays, TTL/LRU GC.
//!
//! Each workspace owns one long-lived baseline context
//! (`"{workspace_id}:baseline"`), never deleted, only rewritten by sync
//! events. PR contexts chain onto the baseline through `base_context_id` and
//! persist facts only for changed files; `unchanged` and `deleted` states are
//! metadata-only. A context expires once both its TTL horizon
//! (`last_accessed + ttl`) and its `expires_at` are in the past; the GC task
//! flips it to `expired` and enqueues a writer op reclaiming its rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::store::{ContextChain, Store};
use crate::types::{
    AnalysisContextSpec, AnalysisMode, ContextFileState, FileState, OverlayMode,
};
use crate::writer::{SingleWriter, WriteOp};

/// A query's resolved read path: the active context, its baseline, and the
/// overlay-aware chain used for store reads.
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub context_id: String,
    pub baseline_id: String,
    pub overlay_mode: OverlayMode,
    pub chain: ContextChain,
}

impl ResolvedContext {
    /// True when the query runs directly against the baseline.
    #[must_use]
    pub fn is_baseline(&self) -> bool {
        self.context_id == self.baseline_id
    }
}

pub struct ContextManager {
    store: Arc<Store>,
    writer: Arc<SingleWriter>,
    ttl_hours: i64,
    gc_interval: Duration,
}

impl ContextManager {
    #[must_use]
    pub fn new(store: Arc<Store>, writer: Arc<SingleWriter>, settings: &Settings) -> Self {
        Self {
            store,
            writer,
            ttl_hours: settings.context_ttl_hours,
            gc_interval: Duration::from_secs(settings.context_gc_interval_s),
        }
    }

    #[must_use]
    pub fn baseline_id(workspace_id: &str) -> String {
        format!("{workspace_id}:baseline")
    }

    /// Create the baseline context for a workspace if it does not exist.
    pub fn ensure_baseline(&self, workspace_id: &str) -> Result<String> {
        let baseline = Self::baseline_id(workspace_id);
        self.store.upsert_analysis_context(
            &baseline,
            workspace_id,
            AnalysisMode::Baseline,
            "",
            OverlayMode::Sparse,
            "",
        )?;
        Ok(baseline)
    }

    fn expires_at_from_now(&self) -> String {
        (Utc::now() + chrono::Duration::hours(self.ttl_hours))
            .to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Resolve the active context for a query and touch its access time.
    /// `mode=pr` without a `context_id` materialises a fresh overlay.
    pub fn resolve(
        &self,
        workspace_id: &str,
        spec: &AnalysisContextSpec,
    ) -> Result<ResolvedContext> {
        let baseline = self.ensure_baseline(workspace_id)?;

        let (context_id, overlay_mode) = match spec.mode {
            AnalysisMode::Baseline => {
                let context_id = if spec.context_id.is_empty() {
                    baseline.clone()
                } else {
                    spec.context_id.clone()
                };
                (context_id, OverlayMode::Sparse)
            }
            AnalysisMode::Pr => {
                let context_id = if spec.context_id.is_empty() {
                    let pr_id = if spec.pr_id.is_empty() {
                        Uuid::new_v4().simple().to_string()[..8].to_string()
                    } else {
                        spec.pr_id.clone()
                    };
                    format!("{workspace_id}:pr:{pr_id}")
                } else {
                    spec.context_id.clone()
                };
                match self.store.get_analysis_context(&context_id)? {
                    Some(ctx) if ctx.status == "expired" => {
                        return Err(Error::NotFound(format!("context {context_id} is expired")));
                    }
                    Some(ctx) => (context_id, ctx.overlay_mode),
                    None => {
                        self.store.upsert_analysis_context(
                            &context_id,
                            workspace_id,
                            AnalysisMode::Pr,
                            &baseline,
                            OverlayMode::Sparse,
                            &self.expires_at_from_now(),
                        )?;
                        (context_id, OverlayMode::Sparse)
                    }
                }
            }
        };

        if let Some(ctx) = self.store.get_analysis_context(&context_id)? {
            if ctx.status == "expired" {
                return Err(Error::NotFound(format!("context {context_id} is expired")));
            }
        } else if context_id != baseline {
            return Err(Error::NotFound(format!("context {context_id}")));
        }

        self.store.touch_context(&context_id)?;
        let chain = self.build_chain(&context_id, &baseline)?;
        Ok(ResolvedContext {
            context_id,
            baseline_id: baseline,
            overlay_mode,
            chain,
        })
    }

    /// Build the overlay-aware read chain: overlay first, baseline second,
    /// with tombstoned and renamed-from keys suppressed.
    pub fn build_chain(&self, context_id: &str, baseline_id: &str) -> Result<ContextChain> {
        if context_id == baseline_id {
            return Ok(ContextChain::single(baseline_id));
        }
        let mut chain = ContextChain {
            contexts: vec![context_id.to_string(), baseline_id.to_string()],
            excluded: std::collections::HashSet::new(),
        };
        for state in self.store.get_context_file_states(context_id)? {
            match state.state {
                FileState::Deleted => {
                    chain.excluded.insert(state.file_key);
                }
                FileState::Renamed if !state.replaced_from_file_key.is_empty() => {
                    chain.excluded.insert(state.replaced_from_file_key);
                }
                _ => {}
            }
        }
        Ok(chain)
    }

    /// Create (or refresh) a PR overlay and record its changed-file states
    /// through the writer. A `renamed` state without `replaced_from_file_key`
    /// is treated as `added`.
    pub async fn create_pr_overlay(
        &self,
        workspace_id: &str,
        pr_id: &str,
        context_id: &str,
        changed_files: Vec<ContextFileState>,
    ) -> Result<String> {
        let baseline = self.ensure_baseline(workspace_id)?;
        let context_id = if context_id.is_empty() {
            format!("{workspace_id}:pr:{pr_id}")
        } else {
            context_id.to_string()
        };
        self.store.upsert_analysis_context(
            &context_id,
            workspace_id,
            AnalysisMode::Pr,
            &baseline,
            OverlayMode::Sparse,
            &self.expires_at_from_now(),
        )?;

        for mut state in changed_files {
            if state.state == FileState::Renamed && state.replaced_from_file_key.is_empty() {
                state.state = FileState::Added;
            }
            self.writer
                .submit(WriteOp::UpsertContextFileState {
                    context_id: context_id.clone(),
                    state,
                })
                .await?;
        }

        info!(context = %context_id, workspace = workspace_id, "created PR overlay context");
        Ok(context_id)
    }

    /// Expire a context now and reclaim its rows through the writer.
    pub async fn expire(&self, context_id: &str) -> Result<bool> {
        let expired = self.store.expire_context(context_id)?;
        if expired {
            self.writer
                .submit(WriteOp::ReclaimContext {
                    context_id: context_id.to_string(),
                })
                .await?;
        }
        Ok(expired)
    }

    /// One GC sweep: expire PR contexts past their TTL horizon and reclaim
    /// their rows. Returns the expired context ids.
    pub async fn gc_once(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let horizon = (now - chrono::Duration::hours(self.ttl_hours))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let now = now.to_rfc3339_opts(SecondsFormat::Micros, true);

        let expired = self.store.expired_pr_contexts(&now, &horizon)?;
        for context_id in &expired {
            debug!(context = %context_id, "context TTL elapsed, expiring");
            self.store.expire_context(context_id)?;
            self.writer
                .submit(WriteOp::ReclaimContext {
                    context_id: context_id.clone(),
                })
                .await?;
        }
        Ok(expired)
    }

    /// Periodic GC loop; runs until the process exits.
    pub fn spawn_gc_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.gc_once().await {
                    Ok(expired) if !expired.is_empty() => {
                        info!(count = expired.len(), "context GC reclaimed overlays");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "context GC sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::WriterConfig;

    fn manager() -> (tempfile::TempDir, Arc<Store>, ContextManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::open(&dir.path().join("calypso.db")).expect("open"));
        let writer = Arc::new(SingleWriter::spawn(
            Arc::clone(&store),
            WriterConfig::from_settings(&Settings::default()),
        ));
        let mgr = ContextManager::new(Arc::clone(&store), writer, &Settings::default());
        (dir, store, mgr)
    }

    #[tokio::test]
    async fn baseline_resolution_is_idempotent() {
        let (_dir, _store, mgr) = manager();
        let spec = AnalysisContextSpec::default();
        let a = mgr.resolve("ws", &spec).unwrap();
        let b = mgr.resolve("ws", &spec).unwrap();
        assert_eq!(a.context_id, "ws:baseline");
        assert_eq!(a.context_id, b.context_id);
        assert!(a.is_baseline());
        assert_eq!(a.chain.contexts, vec!["ws:baseline".to_string()]);
    }

    #[tokio::test]
    async fn pr_resolution_materialises_overlay() {
        let (_dir, store, mgr) = manager();
        let spec = AnalysisContextSpec {
            mode: AnalysisMode::Pr,
            pr_id: "42".into(),
            ..AnalysisContextSpec::default()
        };
        let resolved = mgr.resolve("ws", &spec).unwrap();
        assert_eq!(resolved.context_id, "ws:pr:42");
        assert_eq!(resolved.baseline_id, "ws:baseline");
        assert!(!resolved.is_baseline());

        let ctx = store.get_analysis_context("ws:pr:42").unwrap().unwrap();
        assert_eq!(ctx.base_context_id, "ws:baseline");
        assert!(!ctx.expires_at.is_empty());
    }

    #[tokio::test]
    async fn chain_excludes_tombstones_and_rename_sources() {
        let (_dir, _store, mgr) = manager();
        mgr.create_pr_overlay(
            "ws",
            "7",
            "",
            vec![
                ContextFileState {
                    file_key: "repo_a:src/old.cpp".into(),
                    state: FileState::Deleted,
                    replaced_from_file_key: String::new(),
                },
                ContextFileState {
                    file_key: "repo_a:src/new.cpp".into(),
                    state: FileState::Renamed,
                    replaced_from_file_key: "repo_a:src/prev.cpp".into(),
                },
                ContextFileState {
                    file_key: "repo_a:src/same.cpp".into(),
                    state: FileState::Unchanged,
                    replaced_from_file_key: String::new(),
                },
            ],
        )
        .await
        .unwrap();

        let chain = mgr.build_chain("ws:pr:7", "ws:baseline").unwrap();
        assert!(chain.excluded.contains("repo_a:src/old.cpp"));
        assert!(chain.excluded.contains("repo_a:src/prev.cpp"));
        assert!(!chain.excluded.contains("repo_a:src/same.cpp"));
        assert_eq!(chain.contexts.len(), 2);
    }

    #[tokio::test]
    async fn rename_without_source_degrades_to_added() {
        let (_dir, store, mgr) = manager();
        mgr.create_pr_overlay(
            "ws",
            "8",
            "",
            vec![ContextFileState {
                file_key: "repo_a:src/moved.cpp".into(),
                state: FileState::Renamed,
                replaced_from_file_key: String::new(),
            }],
        )
        .await
        .unwrap();

        let states = store.get_context_file_states("ws:pr:8").unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, FileState::Added);
    }

    #[tokio::test]
    async fn expired_context_is_rejected_on_resolve() {
        let (_dir, _store, mgr) = manager();
        let spec = AnalysisContextSpec {
            mode: AnalysisMode::Pr,
            pr_id: "9".into(),
            ..AnalysisContextSpec::default()
        };
        mgr.resolve("ws", &spec).unwrap();
        assert!(mgr.expire("ws:pr:9").await.unwrap());

        let spec = AnalysisContextSpec {
            mode: AnalysisMode::Pr,
            context_id: "ws:pr:9".into(),
            ..AnalysisContextSpec::default()
        };
        let err = mgr.resolve("ws", &spec).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
