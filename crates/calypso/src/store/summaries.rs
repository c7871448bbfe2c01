//! Commit diff summaries with embedding-based top-k search.
//!
//! Embeddings are stored as little-endian f32 BLOBs keyed on
//! `(workspace, repo, commit_sha, embedding_model)`. Search loads the
//! filtered candidate rows and scores them by cosine similarity in process;
//! there is no native vector extension involved.

use rusqlite::{params, OptionalExtension, Row, ToSql};
use serde::Serialize;

use crate::error::{Error, Result};

use super::{utc_now, Store};

/// A stored commit diff summary record.
#[derive(Debug, Clone, Serialize)]
pub struct CommitDiffSummary {
    pub id: String,
    pub workspace_id: String,
    pub repo_id: String,
    pub commit_sha: String,
    pub branch: String,
    pub summary_text: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
    /// Populated on search hits; 0 otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

/// Filters for a top-k summary search.
#[derive(Debug, Clone, Default)]
pub struct SummaryQuery {
    pub workspace_id: String,
    pub repo_ids: Vec<String>,
    pub branches: Vec<String>,
    pub commit_sha_prefix: String,
    pub created_after: String,
    pub score_threshold: f64,
    pub top_k: usize,
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn embedding_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn summary_from_row(row: &Row<'_>, with_embedding: bool) -> rusqlite::Result<CommitDiffSummary> {
    let metadata_json: String = row.get("metadata_json")?;
    let blob: Vec<u8> = row.get("embedding")?;
    Ok(CommitDiffSummary {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        repo_id: row.get("repo_id")?,
        commit_sha: row.get("commit_sha")?,
        branch: row.get("branch")?,
        summary_text: row.get("summary_text")?,
        embedding_model: row.get("embedding_model")?,
        embedding_dim: row.get::<_, i64>("embedding_dim")? as usize,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        score: None,
        embedding: if with_embedding {
            embedding_from_blob(&blob)
        } else {
            Vec::new()
        },
    })
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_commit_diff_summary(
        &self,
        summary_id: &str,
        workspace_id: &str,
        repo_id: &str,
        commit_sha: &str,
        branch: &str,
        summary_text: &str,
        embedding_model: &str,
        embedding: &[f32],
        metadata: &serde_json::Value,
    ) -> Result<()> {
        if embedding.is_empty() {
            return Err(Error::Validation("embedding must not be empty".into()));
        }
        let conn = self.connection()?;
        let now = utc_now();
        conn.execute(
            "INSERT INTO commit_diff_summaries (
                 id, workspace_id, repo_id, commit_sha, branch, summary_text,
                 embedding_model, embedding_dim, embedding, metadata_json, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(workspace_id, repo_id, commit_sha, embedding_model) DO UPDATE SET
                 id = excluded.id,
                 branch = excluded.branch,
                 summary_text = excluded.summary_text,
                 embedding_dim = excluded.embedding_dim,
                 embedding = excluded.embedding,
                 metadata_json = excluded.metadata_json,
                 updated_at = excluded.updated_at",
            params![
                summary_id,
                workspace_id,
                repo_id,
                commit_sha,
                branch,
                summary_text,
                embedding_model,
                embedding.len() as i64,
                embedding_to_blob(embedding),
                serde_json::to_string(metadata)?,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_commit_diff_summary(
        &self,
        workspace_id: &str,
        repo_id: &str,
        commit_sha: &str,
        include_embedding: bool,
    ) -> Result<Option<CommitDiffSummary>> {
        let conn = self.connection()?;
        let summary = conn
            .query_row(
                "SELECT * FROM commit_diff_summaries
                 WHERE workspace_id = ?1 AND repo_id = ?2 AND commit_sha = ?3
                 ORDER BY updated_at DESC LIMIT 1",
                params![workspace_id, repo_id, commit_sha],
                |row| summary_from_row(row, include_embedding),
            )
            .optional()?;
        Ok(summary)
    }

    /// Top-k summaries by cosine similarity against `query_embedding`, after
    /// applying the relational filters.
    pub fn search_commit_diff_summaries(
        &self,
        query_embedding: &[f32],
        query: &SummaryQuery,
    ) -> Result<Vec<CommitDiffSummary>> {
        let conn = self.connection()?;
        let prefix_pattern = format!("{}%", query.commit_sha_prefix);
        let mut sql = String::from("SELECT * FROM commit_diff_summaries WHERE 1=1");
        let mut query_params: Vec<&dyn ToSql> = Vec::new();

        if !query.workspace_id.is_empty() {
            sql.push_str(" AND workspace_id = ?");
            query_params.push(&query.workspace_id);
        }
        if !query.repo_ids.is_empty() {
            sql.push_str(&format!(
                " AND repo_id IN ({})",
                vec!["?"; query.repo_ids.len()].join(",")
            ));
            for repo_id in &query.repo_ids {
                query_params.push(repo_id);
            }
        }
        if !query.branches.is_empty() {
            sql.push_str(&format!(
                " AND branch IN ({})",
                vec!["?"; query.branches.len()].join(",")
            ));
            for branch in &query.branches {
                query_params.push(branch);
            }
        }
        if !query.commit_sha_prefix.is_empty() {
            sql.push_str(" AND commit_sha LIKE ?");
            query_params.push(&prefix_pattern);
        }
        if !query.created_after.is_empty() {
            sql.push_str(" AND created_at >= ?");
            query_params.push(&query.created_after);
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut candidates = stmt
            .query_map(query_params.as_slice(), |row| summary_from_row(row, true))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for candidate in &mut candidates {
            let score = cosine_similarity(query_embedding, &candidate.embedding);
            candidate.score = Some(score);
            candidate.embedding.clear();
        }
        candidates.retain(|c| c.score.unwrap_or(0.0) >= query.score_threshold);
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(query.top_k.max(1));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(store: &Store, repo: &str, sha: &str, embedding: &[f32]) {
        store
            .upsert_commit_diff_summary(
                &format!("{repo}-{sha}"),
                "ws",
                repo,
                sha,
                "main",
                "changed things",
                "test-model",
                embedding,
                &serde_json::json!({"files": 3}),
            )
            .unwrap();
    }

    #[test]
    fn upsert_is_keyed_on_workspace_repo_sha_model() {
        let store = Store::open_in_memory().unwrap();
        upsert(&store, "repo_a", &"a".repeat(40), &[1.0, 0.0]);
        upsert(&store, "repo_a", &"a".repeat(40), &[0.0, 1.0]);

        let record = store
            .get_commit_diff_summary("ws", "repo_a", &"a".repeat(40), true)
            .unwrap()
            .expect("record");
        assert_eq!(record.embedding, vec![0.0, 1.0]);
        assert_eq!(record.metadata["files"], 3);
    }

    #[test]
    fn search_ranks_by_cosine_similarity() {
        let store = Store::open_in_memory().unwrap();
        upsert(&store, "repo_a", &"a".repeat(40), &[1.0, 0.0]);
        upsert(&store, "repo_b", &"b".repeat(40), &[0.0, 1.0]);

        let hits = store
            .search_commit_diff_summaries(
                &[1.0, 0.1],
                &SummaryQuery {
                    workspace_id: "ws".into(),
                    top_k: 2,
                    ..SummaryQuery::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].repo_id, "repo_a");
        assert!(hits[0].score.unwrap() > hits[1].score.unwrap());
    }

    #[test]
    fn score_threshold_and_filters_apply() {
        let store = Store::open_in_memory().unwrap();
        upsert(&store, "repo_a", &"a".repeat(40), &[1.0, 0.0]);
        upsert(&store, "repo_b", &"b".repeat(40), &[0.0, 1.0]);

        let hits = store
            .search_commit_diff_summaries(
                &[1.0, 0.0],
                &SummaryQuery {
                    workspace_id: "ws".into(),
                    score_threshold: 0.5,
                    top_k: 10,
                    ..SummaryQuery::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].repo_id, "repo_a");

        let hits = store
            .search_commit_diff_summaries(
                &[1.0, 0.0],
                &SummaryQuery {
                    workspace_id: "ws".into(),
                    repo_ids: vec!["repo_b".into()],
                    top_k: 10,
                    ..SummaryQuery::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].repo_id, "repo_b");
    }

    #[test]
    fn empty_embedding_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .upsert_commit_diff_summary(
                "x", "ws", "repo_a", &"a".repeat(40), "", "t", "m", &[], &serde_json::Value::Null,
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
