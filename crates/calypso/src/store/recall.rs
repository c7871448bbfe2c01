//! Full-text recall candidate index.
//!
//! Each tracked file's content is mirrored into an FTS5 table so stage 2 of
//! the query pipeline can find candidate files without touching the
//! filesystem. Repos without FTS coverage fall back to `rg` (see `recall`).

use rusqlite::params;
use tracing::warn;

use crate::error::Result;

use super::Store;

/// Escape a symbol for an FTS5 `MATCH` against the content column. Symbols
/// are quoted as a phrase so `::`-qualified names tokenize predictably.
fn fts_phrase(symbol: &str) -> String {
    format!("content:\"{}\"", symbol.replace('"', "\"\""))
}

impl Store {
    /// Replace the recall content for one file.
    pub fn upsert_recall_content(
        &self,
        context_id: &str,
        file_key: &str,
        repo_id: &str,
        content: &str,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM recall_fts WHERE context_id = ?1 AND file_key = ?2",
            params![context_id, file_key],
        )?;
        conn.execute(
            "INSERT INTO recall_fts (context_id, file_key, repo_id, content)
             VALUES (?1, ?2, ?3, ?4)",
            params![context_id, file_key, repo_id, content],
        )?;
        Ok(())
    }

    /// Candidate file keys whose content matches `symbol`, restricted to
    /// `repo_ids` when given. FTS failures degrade to an empty candidate set
    /// rather than failing the query; the rg fallback still runs.
    pub fn search_recall_candidates(
        &self,
        context_id: &str,
        symbol: &str,
        repo_ids: &[String],
        max_files: usize,
    ) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let phrase = fts_phrase(symbol);
        let limit = max_files as i64;
        let mut sql = String::from(
            "SELECT DISTINCT file_key FROM recall_fts
             WHERE context_id = ?1 AND recall_fts MATCH ?2",
        );
        let mut query_params: Vec<&dyn rusqlite::ToSql> = vec![&context_id, &phrase];
        if !repo_ids.is_empty() {
            sql.push_str(&format!(
                " AND repo_id IN ({})",
                vec!["?"; repo_ids.len()].join(",")
            ));
            for repo_id in repo_ids {
                query_params.push(repo_id);
            }
        }
        sql.push_str(" LIMIT ?");
        query_params.push(&limit);

        let mut stmt = conn.prepare(&sql)?;
        let result = stmt
            .query_map(query_params.as_slice(), |row| row.get(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>());
        match result {
            Ok(keys) => Ok(keys),
            Err(e) => {
                warn!(context = context_id, error = %e, "FTS recall search failed");
                Ok(Vec::new())
            }
        }
    }

    /// Repo ids that have at least one FTS row in the given context.
    pub fn repos_with_recall_coverage(&self, context_id: &str) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT repo_id FROM recall_fts WHERE context_id = ?1")?;
        let repos = stmt
            .query_map([context_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(repos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_finds_symbol_in_content() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_recall_content(
                "ws:baseline",
                "repo_a:src/x.cpp",
                "repo_a",
                "void call() { repoB::util::foo(); }",
            )
            .unwrap();
        store
            .upsert_recall_content("ws:baseline", "repo_a:src/y.cpp", "repo_a", "int unrelated;")
            .unwrap();

        let hits = store
            .search_recall_candidates("ws:baseline", "foo", &[], 10)
            .unwrap();
        assert_eq!(hits, vec!["repo_a:src/x.cpp".to_string()]);
    }

    #[test]
    fn repo_filter_restricts_candidates() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_recall_content("ws:baseline", "repo_a:a.cpp", "repo_a", "foo()")
            .unwrap();
        store
            .upsert_recall_content("ws:baseline", "repo_b:b.cpp", "repo_b", "foo()")
            .unwrap();

        let hits = store
            .search_recall_candidates("ws:baseline", "foo", &["repo_b".to_string()], 10)
            .unwrap();
        assert_eq!(hits, vec!["repo_b:b.cpp".to_string()]);
    }

    #[test]
    fn coverage_lists_repos_with_rows() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_recall_content("ws:baseline", "repo_a:a.cpp", "repo_a", "x")
            .unwrap();
        let covered = store.repos_with_recall_coverage("ws:baseline").unwrap();
        assert_eq!(covered, vec!["repo_a".to_string()]);
        assert!(store.repos_with_recall_coverage("other").unwrap().is_empty());
    }
}
