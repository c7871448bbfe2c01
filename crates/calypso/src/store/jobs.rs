//! Durable job tables: webhook-fed index jobs and leased repo sync jobs.
//!
//! Sync jobs are claimed with `status='running', lease_until=now+ttl`;
//! heartbeats extend the lease, and a `running` row whose lease has lapsed is
//! reclaimable by any worker. Failures below `max_attempts` return the job to
//! `pending` with the lease cleared; at the cap the job parks in
//! `dead_letter`, which is terminal.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{JobStatus, SyncJob};

use super::{utc_now, Store};

/// Parameters for an idempotent index-job insert.
#[derive(Debug, Clone)]
pub struct IndexJobSpec {
    pub workspace_id: String,
    pub repo_id: String,
    pub context_id: String,
    pub event_type: String,
    pub git_ref: String,
    pub event_sha: String,
}

/// A sync job freshly claimed by a worker.
#[derive(Debug, Clone)]
pub struct LeasedSyncJob {
    pub job: SyncJob,
    /// True when this claim reclaimed a lapsed lease from another worker.
    pub reclaimed: bool,
}

fn sync_job_from_row(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
    let status: String = row.get("status")?;
    Ok(SyncJob {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        repo_id: row.get("repo_id")?,
        requested_commit_sha: row.get("requested_commit_sha")?,
        requested_branch: row.get("requested_branch")?,
        requested_force_clean: row.get::<_, i64>("requested_force_clean")? != 0,
        resolved_commit_sha: row.get("resolved_commit_sha")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        lease_until: row.get("lease_until")?,
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    /// Insert an index job unless one already exists for the same
    /// `(workspace, repo, ref, context, sha)`. Returns the effective job id,
    /// so duplicate webhook deliveries converge on one job.
    pub fn insert_index_job(&self, job_id: &str, spec: &IndexJobSpec) -> Result<String> {
        let conn = self.connection()?;
        let now = utc_now();
        let inserted = conn.execute(
            "INSERT INTO index_jobs (
                 id, workspace_id, repo_id, context_id, event_type, git_ref, event_sha,
                 status, attempts, max_attempts, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, 5, ?8, ?8)
             ON CONFLICT(workspace_id, repo_id, git_ref, context_id, event_sha) DO NOTHING",
            params![
                job_id,
                spec.workspace_id,
                spec.repo_id,
                spec.context_id,
                spec.event_type,
                spec.git_ref,
                spec.event_sha,
                now,
            ],
        )?;
        if inserted > 0 {
            return Ok(job_id.to_string());
        }
        let existing: String = conn.query_row(
            "SELECT id FROM index_jobs
             WHERE workspace_id = ?1 AND repo_id = ?2 AND git_ref = ?3
               AND context_id = ?4 AND event_sha = ?5",
            params![
                spec.workspace_id,
                spec.repo_id,
                spec.git_ref,
                spec.context_id,
                spec.event_sha
            ],
            |row| row.get(0),
        )?;
        Ok(existing)
    }

    pub fn index_queue_depth(&self) -> Result<u64> {
        let conn = self.connection()?;
        let depth = conn.query_row(
            "SELECT COUNT(*) FROM index_jobs WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(depth)
    }

    /// Age in seconds of the oldest pending job across both queues.
    pub fn oldest_pending_job_age_s(&self) -> Result<f64> {
        let conn = self.connection()?;
        let oldest: Option<String> = conn
            .query_row(
                "SELECT MIN(created_at) FROM (
                     SELECT created_at FROM index_jobs WHERE status = 'pending'
                     UNION ALL
                     SELECT created_at FROM repo_sync_jobs WHERE status = 'pending'
                 )",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(oldest) = oldest else {
            return Ok(0.0);
        };
        let Ok(created) = chrono::DateTime::parse_from_rfc3339(&oldest) else {
            return Ok(0.0);
        };
        let age = Utc::now().signed_duration_since(created.with_timezone(&Utc));
        Ok((age.num_milliseconds().max(0) as f64) / 1000.0)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_repo_sync_job(
        &self,
        job_id: &str,
        workspace_id: &str,
        repo_id: &str,
        commit_sha: &str,
        branch: &str,
        force_clean: bool,
        max_attempts: u32,
    ) -> Result<()> {
        let conn = self.connection()?;
        let now = utc_now();
        conn.execute(
            "INSERT INTO repo_sync_jobs (
                 id, workspace_id, repo_id, requested_branch, requested_commit_sha,
                 requested_force_clean, status, attempts, max_attempts, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?8)",
            params![
                job_id,
                workspace_id,
                repo_id,
                branch,
                commit_sha,
                i32::from(force_clean),
                max_attempts.max(1),
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_repo_sync_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let conn = self.connection()?;
        let job = conn
            .query_row(
                "SELECT * FROM repo_sync_jobs WHERE id = ?1",
                [job_id],
                sync_job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Claim the next runnable sync job: the oldest `pending` row, or a
    /// `running` row whose lease has lapsed. Claiming bumps `attempts` and
    /// sets `lease_until = now + lease_ttl`.
    pub fn lease_next_repo_sync_job(&self, lease_ttl_s: i64) -> Result<Option<LeasedSyncJob>> {
        let mut conn = self.connection()?;
        let now = utc_now();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let candidate = tx
            .query_row(
                "SELECT id, status FROM repo_sync_jobs
                 WHERE (status = 'pending')
                    OR (status = 'running' AND lease_until != '' AND lease_until < ?1)
                 ORDER BY created_at ASC
                 LIMIT 1",
                [&now],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((job_id, prev_status)) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let lease_until = (Utc::now() + Duration::seconds(lease_ttl_s))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        tx.execute(
            "UPDATE repo_sync_jobs
             SET status = 'running',
                 attempts = attempts + 1,
                 lease_until = ?1,
                 started_at = CASE WHEN started_at = '' THEN ?2 ELSE started_at END,
                 updated_at = ?2,
                 error_code = '',
                 error_message = ''
             WHERE id = ?3",
            params![lease_until, now, job_id],
        )?;
        tx.commit()?;

        let job = self
            .get_repo_sync_job(&job_id)?
            .ok_or_else(|| crate::error::Error::Internal("leased job vanished".into()))?;
        Ok(Some(LeasedSyncJob {
            job,
            reclaimed: prev_status == "running",
        }))
    }

    /// Extend the lease of a running job.
    pub fn heartbeat_repo_sync_job(&self, job_id: &str, lease_ttl_s: i64) -> Result<()> {
        let conn = self.connection()?;
        let lease_until = (Utc::now() + Duration::seconds(lease_ttl_s))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        conn.execute(
            "UPDATE repo_sync_jobs SET lease_until = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![lease_until, utc_now(), job_id],
        )?;
        Ok(())
    }

    pub fn mark_repo_sync_job_done(&self, job_id: &str, resolved_commit_sha: &str) -> Result<()> {
        let conn = self.connection()?;
        let now = utc_now();
        conn.execute(
            "UPDATE repo_sync_jobs
             SET status = 'done', resolved_commit_sha = ?1, lease_until = '',
                 updated_at = ?2, finished_at = ?2, error_code = '', error_message = ''
             WHERE id = ?3",
            params![resolved_commit_sha, now, job_id],
        )?;
        Ok(())
    }

    /// Record a failure. Below `max_attempts` the job returns to `pending`
    /// with the lease cleared; at the cap it parks in `dead_letter`.
    pub fn mark_repo_sync_job_failed(
        &self,
        job_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<JobStatus> {
        let conn = self.connection()?;
        let now = utc_now();
        let truncated: String = error_message.chars().take(4000).collect();
        conn.execute(
            "UPDATE repo_sync_jobs
             SET status = CASE WHEN attempts >= max_attempts THEN 'dead_letter' ELSE 'pending' END,
                 lease_until = '',
                 updated_at = ?1,
                 finished_at = CASE WHEN attempts >= max_attempts THEN ?1 ELSE finished_at END,
                 error_code = ?2,
                 error_message = ?3
             WHERE id = ?4",
            params![now, error_code, truncated, job_id],
        )?;
        let status: String = conn.query_row(
            "SELECT status FROM repo_sync_jobs WHERE id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(JobStatus::parse(&status).unwrap_or(JobStatus::Failed))
    }

    pub fn sync_queue_depth(&self) -> Result<u64> {
        let conn = self.connection()?;
        let depth = conn.query_row(
            "SELECT COUNT(*) FROM repo_sync_jobs WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(depth)
    }

    pub fn active_sync_jobs(&self) -> Result<u64> {
        let conn = self.connection()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM repo_sync_jobs WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_repo_sync_state(
        &self,
        workspace_id: &str,
        repo_id: &str,
        last_synced_commit_sha: &str,
        last_synced_branch: &str,
        success: bool,
        error_code: &str,
        error_message: &str,
    ) -> Result<()> {
        let conn = self.connection()?;
        let now = utc_now();
        let success_at = if success { now.clone() } else { String::new() };
        let failure_at = if success { String::new() } else { now.clone() };
        let truncated: String = error_message.chars().take(4000).collect();
        conn.execute(
            "INSERT INTO repo_sync_state (
                 workspace_id, repo_id, last_synced_commit_sha, last_synced_branch,
                 last_success_at, last_failure_at, last_error_code, last_error_message, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(workspace_id, repo_id) DO UPDATE SET
                 last_synced_commit_sha = CASE WHEN excluded.last_synced_commit_sha != ''
                     THEN excluded.last_synced_commit_sha ELSE repo_sync_state.last_synced_commit_sha END,
                 last_synced_branch = CASE WHEN excluded.last_synced_branch != ''
                     THEN excluded.last_synced_branch ELSE repo_sync_state.last_synced_branch END,
                 last_success_at = CASE WHEN excluded.last_success_at != ''
                     THEN excluded.last_success_at ELSE repo_sync_state.last_success_at END,
                 last_failure_at = CASE WHEN excluded.last_failure_at != ''
                     THEN excluded.last_failure_at ELSE repo_sync_state.last_failure_at END,
                 last_error_code = excluded.last_error_code,
                 last_error_message = excluded.last_error_message,
                 updated_at = excluded.updated_at",
            params![
                workspace_id,
                repo_id,
                last_synced_commit_sha,
                last_synced_branch,
                success_at,
                failure_at,
                error_code,
                truncated,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_repo_sync_state(
        &self,
        workspace_id: &str,
        repo_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let conn = self.connection()?;
        let state = conn
            .query_row(
                "SELECT last_synced_commit_sha, last_synced_branch, last_success_at,
                        last_failure_at, last_error_code, last_error_message
                 FROM repo_sync_state WHERE workspace_id = ?1 AND repo_id = ?2",
                params![workspace_id, repo_id],
                |row| {
                    Ok(serde_json::json!({
                        "workspace_id": workspace_id,
                        "repo_id": repo_id,
                        "last_synced_commit_sha": row.get::<_, String>(0)?,
                        "last_synced_branch": row.get::<_, String>(1)?,
                        "last_success_at": row.get::<_, String>(2)?,
                        "last_failure_at": row.get::<_, String>(3)?,
                        "last_error_code": row.get::<_, String>(4)?,
                        "last_error_message": row.get::<_, String>(5)?,
                    }))
                },
            )
            .optional()?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(sha: &str) -> IndexJobSpec {
        IndexJobSpec {
            workspace_id: "ws".into(),
            repo_id: "repo_a".into(),
            context_id: "ws:baseline".into(),
            event_type: "push".into(),
            git_ref: "refs/heads/main".into(),
            event_sha: sha.into(),
        }
    }

    #[test]
    fn duplicate_webhook_converges_on_one_index_job() {
        let store = Store::open_in_memory().unwrap();
        let first = store.insert_index_job("job-1", &spec("abc")).unwrap();
        let second = store.insert_index_job("job-2", &spec("abc")).unwrap();
        assert_eq!(first, "job-1");
        assert_eq!(second, "job-1");
        assert_eq!(store.index_queue_depth().unwrap(), 1);

        // A different SHA is a new effective job.
        let third = store.insert_index_job("job-3", &spec("def")).unwrap();
        assert_eq!(third, "job-3");
        assert_eq!(store.index_queue_depth().unwrap(), 2);
    }

    #[test]
    fn lease_claims_oldest_pending() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_repo_sync_job("s1", "ws", "repo_a", &"a".repeat(40), "", true, 5)
            .unwrap();
        store
            .insert_repo_sync_job("s2", "ws", "repo_a", &"b".repeat(40), "", true, 5)
            .unwrap();

        let leased = store.lease_next_repo_sync_job(60).unwrap().expect("job");
        assert_eq!(leased.job.id, "s1");
        assert_eq!(leased.job.status, JobStatus::Running);
        assert_eq!(leased.job.attempts, 1);
        assert!(!leased.reclaimed);
        assert!(!leased.job.lease_until.is_empty());
    }

    #[test]
    fn failure_below_cap_returns_to_pending_with_lease_cleared() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_repo_sync_job("s1", "ws", "repo_a", &"a".repeat(40), "", true, 3)
            .unwrap();

        let _ = store.lease_next_repo_sync_job(60).unwrap().unwrap();
        let status = store
            .mark_repo_sync_job_failed("s1", "sync_checkout_failed", "boom")
            .unwrap();
        assert_eq!(status, JobStatus::Pending);

        let job = store.get_repo_sync_job("s1").unwrap().unwrap();
        assert!(job.lease_until.is_empty());
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn failure_at_cap_parks_in_dead_letter() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_repo_sync_job("s1", "ws", "repo_a", &"a".repeat(40), "", true, 2)
            .unwrap();

        for expected in [JobStatus::Pending, JobStatus::DeadLetter] {
            let _ = store.lease_next_repo_sync_job(60).unwrap().unwrap();
            let status = store
                .mark_repo_sync_job_failed("s1", "sync_checkout_failed", "boom")
                .unwrap();
            assert_eq!(status, expected);
        }

        // Dead-lettered jobs are no longer leasable.
        assert!(store.lease_next_repo_sync_job(60).unwrap().is_none());
    }

    #[test]
    fn stale_lease_is_reclaimable() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_repo_sync_job("s1", "ws", "repo_a", &"a".repeat(40), "", true, 5)
            .unwrap();

        // Claim with an already-lapsed lease, as if the worker died.
        let _ = store.lease_next_repo_sync_job(-10).unwrap().unwrap();
        let reclaimed = store.lease_next_repo_sync_job(60).unwrap().expect("reclaim");
        assert!(reclaimed.reclaimed);
        assert_eq!(reclaimed.job.attempts, 2);
    }

    #[test]
    fn done_clears_lease_and_records_sha() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_repo_sync_job("s1", "ws", "repo_a", &"a".repeat(40), "main", true, 5)
            .unwrap();
        let _ = store.lease_next_repo_sync_job(60).unwrap().unwrap();
        store.mark_repo_sync_job_done("s1", &"a".repeat(40)).unwrap();

        let job = store.get_repo_sync_job("s1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.resolved_commit_sha, "a".repeat(40));
        assert!(job.lease_until.is_empty());
    }

    #[test]
    fn sync_state_keeps_last_success_across_failures() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_repo_sync_state("ws", "repo_a", &"a".repeat(40), "main", true, "", "")
            .unwrap();
        store
            .upsert_repo_sync_state("ws", "repo_a", "", "", false, "sync_auth_failed", "401")
            .unwrap();

        let state = store.get_repo_sync_state("ws", "repo_a").unwrap().unwrap();
        assert_eq!(state["last_synced_commit_sha"], "a".repeat(40));
        assert_eq!(state["last_error_code"], "sync_auth_failed");
        assert!(!state["last_success_at"].as_str().unwrap().is_empty());
        assert!(!state["last_failure_at"].as_str().unwrap().is_empty());
    }
}
