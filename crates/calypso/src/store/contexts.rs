//! Workspace, repo, and analysis-context CRUD.

use rusqlite::{params, OptionalExtension, Row};

use crate::error::Result;
use crate::manifest::WorkspaceManifest;
use crate::types::{AnalysisContext, AnalysisMode, ContextFileState, FileState, OverlayMode};

use super::{utc_now, Store};

/// A registered workspace row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkspaceRow {
    pub workspace_id: String,
    pub root_path: String,
    pub manifest_path: String,
    pub created_at: String,
    pub updated_at: String,
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisContext> {
    let mode: String = row.get("mode")?;
    let overlay_mode: String = row.get("overlay_mode")?;
    Ok(AnalysisContext {
        context_id: row.get("context_id")?,
        workspace_id: row.get("workspace_id")?,
        mode: if mode == "pr" {
            AnalysisMode::Pr
        } else {
            AnalysisMode::Baseline
        },
        base_context_id: row.get("base_context_id")?,
        overlay_mode: OverlayMode::parse(&overlay_mode),
        overlay_file_count: row.get("overlay_file_count")?,
        overlay_row_count: row.get("overlay_row_count")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        last_accessed_at: row.get("last_accessed_at")?,
        expires_at: row.get("expires_at")?,
    })
}

impl Store {
    pub fn upsert_workspace(
        &self,
        workspace_id: &str,
        root_path: &str,
        manifest_path: &str,
    ) -> Result<()> {
        let conn = self.connection()?;
        let now = utc_now();
        conn.execute(
            "INSERT INTO workspaces (workspace_id, root_path, manifest_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(workspace_id) DO UPDATE SET
                 root_path = excluded.root_path,
                 manifest_path = excluded.manifest_path,
                 updated_at = excluded.updated_at",
            params![workspace_id, root_path, manifest_path, now],
        )?;
        Ok(())
    }

    pub fn get_workspace(&self, workspace_id: &str) -> Result<Option<WorkspaceRow>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT workspace_id, root_path, manifest_path, created_at, updated_at
                 FROM workspaces WHERE workspace_id = ?1",
                [workspace_id],
                |row| {
                    Ok(WorkspaceRow {
                        workspace_id: row.get(0)?,
                        root_path: row.get(1)?,
                        manifest_path: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Mirror the manifest's repo list into the `repos` table, replacing any
    /// previous rows for the workspace.
    pub fn replace_workspace_repos(
        &self,
        workspace_id: &str,
        manifest: &WorkspaceManifest,
    ) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM repos WHERE workspace_id = ?1", [workspace_id])?;
        for repo in &manifest.repos {
            tx.execute(
                "INSERT INTO repos (
                     workspace_id, repo_id, root, compile_commands, default_branch,
                     depends_on_json, remote_url, token_env_var, commit_sha
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    workspace_id,
                    repo.repo_id,
                    repo.root,
                    repo.compile_commands,
                    repo.default_branch,
                    serde_json::to_string(&repo.depends_on)?,
                    repo.remote_url,
                    repo.token_env_var,
                    repo.commit_sha,
                ],
            )?;
        }
        tx.commit()?;
        Ok(manifest.repos.len())
    }

    pub fn list_workspace_repo_ids(&self, workspace_id: &str) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT repo_id FROM repos WHERE workspace_id = ?1 ORDER BY repo_id")?;
        let ids = stmt
            .query_map([workspace_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_analysis_context(
        &self,
        context_id: &str,
        workspace_id: &str,
        mode: AnalysisMode,
        base_context_id: &str,
        overlay_mode: OverlayMode,
        expires_at: &str,
    ) -> Result<()> {
        let conn = self.connection()?;
        let now = utc_now();
        conn.execute(
            "INSERT INTO analysis_contexts (
                 context_id, workspace_id, mode, base_context_id, overlay_mode, status,
                 created_at, last_accessed_at, expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6, ?7)
             ON CONFLICT(context_id) DO UPDATE SET
                 status = 'active',
                 last_accessed_at = excluded.last_accessed_at",
            params![
                context_id,
                workspace_id,
                mode.as_str(),
                base_context_id,
                overlay_mode.as_str(),
                now,
                expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_analysis_context(&self, context_id: &str) -> Result<Option<AnalysisContext>> {
        let conn = self.connection()?;
        let ctx = conn
            .query_row(
                "SELECT * FROM analysis_contexts WHERE context_id = ?1",
                [context_id],
                context_from_row,
            )
            .optional()?;
        Ok(ctx)
    }

    /// Refresh `last_accessed_at`; called on every successful query resolve.
    pub fn touch_context(&self, context_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE analysis_contexts SET last_accessed_at = ?1 WHERE context_id = ?2",
            params![utc_now(), context_id],
        )?;
        Ok(())
    }

    pub fn expire_context(&self, context_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE analysis_contexts SET status = 'expired', last_accessed_at = ?1
             WHERE context_id = ?2",
            params![utc_now(), context_id],
        )?;
        Ok(changed > 0)
    }

    pub fn count_active_contexts(&self) -> Result<u64> {
        let conn = self.connection()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM analysis_contexts WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Active PR contexts whose TTL horizon (`max(last_accessed + ttl,
    /// expires_at)`) is already behind `now`. Baseline contexts never expire.
    pub fn expired_pr_contexts(&self, now: &str, ttl_horizon: &str) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT context_id FROM analysis_contexts
             WHERE status = 'active' AND mode = 'pr'
               AND last_accessed_at < ?1
               AND (expires_at = '' OR expires_at < ?2)",
        )?;
        let ids = stmt
            .query_map(params![ttl_horizon, now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Bump overlay counters after a persisted payload and degrade the
    /// overlay to `partial_overlay` once either cap is breached.
    pub fn update_overlay_stats(
        &self,
        context_id: &str,
        file_delta: i64,
        row_delta: i64,
        max_overlay_files: u64,
        max_overlay_rows: u64,
    ) -> Result<OverlayMode> {
        let Some(ctx) = self.get_analysis_context(context_id)? else {
            return Ok(OverlayMode::Sparse);
        };

        let new_files = ctx.overlay_file_count.saturating_add_signed(file_delta);
        let new_rows = ctx.overlay_row_count.saturating_add_signed(row_delta);
        let mode = if ctx.overlay_mode == OverlayMode::PartialOverlay
            || new_files > max_overlay_files
            || new_rows > max_overlay_rows
        {
            OverlayMode::PartialOverlay
        } else {
            ctx.overlay_mode
        };

        let conn = self.connection()?;
        conn.execute(
            "UPDATE analysis_contexts
             SET overlay_file_count = ?1, overlay_row_count = ?2, overlay_mode = ?3,
                 last_accessed_at = ?4
             WHERE context_id = ?5",
            params![new_files, new_rows, mode.as_str(), utc_now(), context_id],
        )?;
        Ok(mode)
    }

    pub fn upsert_context_file_state(
        &self,
        context_id: &str,
        state: &ContextFileState,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO context_file_states (
                 context_id, file_key, state, replaced_from_file_key, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(context_id, file_key) DO UPDATE SET
                 state = excluded.state,
                 replaced_from_file_key = excluded.replaced_from_file_key,
                 updated_at = excluded.updated_at",
            params![
                context_id,
                state.file_key,
                state.state.as_str(),
                state.replaced_from_file_key,
                utc_now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_context_file_states(&self, context_id: &str) -> Result<Vec<ContextFileState>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT file_key, state, replaced_from_file_key
             FROM context_file_states WHERE context_id = ?1",
        )?;
        let states = stmt
            .query_map([context_id], |row| {
                let state: String = row.get(1)?;
                Ok((row.get::<_, String>(0)?, state, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(states
            .into_iter()
            .filter_map(|(file_key, state, replaced)| {
                FileState::parse(&state).map(|state| ContextFileState {
                    file_key,
                    state,
                    replaced_from_file_key: replaced,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn workspace_upsert_and_get() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_workspace("ws", "/ws", "/ws/workspace.yaml").unwrap();
        store.upsert_workspace("ws", "/ws2", "/ws2/workspace.yaml").unwrap();

        let ws = store.get_workspace("ws").unwrap().expect("workspace exists");
        assert_eq!(ws.root_path, "/ws2");
        assert!(store.get_workspace("missing").unwrap().is_none());
    }

    #[test]
    fn context_upsert_touch_and_expire() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_analysis_context(
                "ws:baseline",
                "ws",
                AnalysisMode::Baseline,
                "",
                OverlayMode::Sparse,
                "",
            )
            .unwrap();

        let ctx = store.get_analysis_context("ws:baseline").unwrap().unwrap();
        assert_eq!(ctx.mode, AnalysisMode::Baseline);
        assert_eq!(ctx.status, "active");

        assert!(store.expire_context("ws:baseline").unwrap());
        let ctx = store.get_analysis_context("ws:baseline").unwrap().unwrap();
        assert_eq!(ctx.status, "expired");
        assert!(!store.expire_context("missing").unwrap());
    }

    #[test]
    fn overlay_stats_degrade_to_partial_on_cap_breach() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_analysis_context(
                "ws:pr:1",
                "ws",
                AnalysisMode::Pr,
                "ws:baseline",
                OverlayMode::Sparse,
                "",
            )
            .unwrap();

        let mode = store.update_overlay_stats("ws:pr:1", 10, 100, 5000, 2_000_000).unwrap();
        assert_eq!(mode, OverlayMode::Sparse);

        let mode = store.update_overlay_stats("ws:pr:1", 4999, 0, 5000, 2_000_000).unwrap();
        assert_eq!(mode, OverlayMode::PartialOverlay);

        // Once degraded the mode is sticky.
        let mode = store.update_overlay_stats("ws:pr:1", -5000, 0, 5000, 2_000_000).unwrap();
        assert_eq!(mode, OverlayMode::PartialOverlay);
    }

    #[test]
    fn file_states_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_analysis_context(
                "ws:pr:2",
                "ws",
                AnalysisMode::Pr,
                "ws:baseline",
                OverlayMode::Sparse,
                "",
            )
            .unwrap();

        store
            .upsert_context_file_state(
                "ws:pr:2",
                &ContextFileState {
                    file_key: "repo_a:src/old.cpp".into(),
                    state: FileState::Deleted,
                    replaced_from_file_key: String::new(),
                },
            )
            .unwrap();
        store
            .upsert_context_file_state(
                "ws:pr:2",
                &ContextFileState {
                    file_key: "repo_a:src/new.cpp".into(),
                    state: FileState::Renamed,
                    replaced_from_file_key: "repo_a:src/old_name.cpp".into(),
                },
            )
            .unwrap();

        let states = store.get_context_file_states("ws:pr:2").unwrap();
        assert_eq!(states.len(), 2);
        let renamed = states.iter().find(|s| s.state == FileState::Renamed).unwrap();
        assert_eq!(renamed.replaced_from_file_key, "repo_a:src/old_name.cpp");
    }
}
