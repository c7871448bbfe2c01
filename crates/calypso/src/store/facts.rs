//! Tracked files and AST-derived facts, with overlay-aware merge reads.
//!
//! Reads take a [`ContextChain`]: the overlay context first, then its
//! baseline. Tombstoned and renamed-from file keys are suppressed across the
//! whole chain, and duplicate rows are merged in memory (not in SQL): the
//! first context in the chain wins, references and call edges dedupe by full
//! tuple, and duplicate symbols within one context resolve to the row with
//! the highest `extent_end_line`.

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension, ToSql};

use crate::error::Result;
use crate::types::{
    CallEdgeRow, ParsePayload, ReferenceRow, SymbolRow, TrackedFile,
};

use super::{utc_now, Store};

/// Ordered read path for a query: overlay first, baseline last.
#[derive(Debug, Clone, Default)]
pub struct ContextChain {
    /// Contexts to consult, highest precedence first.
    pub contexts: Vec<String>,
    /// File keys suppressed everywhere: tombstones and renamed-from keys.
    pub excluded: HashSet<String>,
}

impl ContextChain {
    /// A chain over a single context with nothing suppressed.
    #[must_use]
    pub fn single(context_id: &str) -> Self {
        Self {
            contexts: vec![context_id.to_string()],
            excluded: HashSet::new(),
        }
    }
}

/// Append `AND <col> IN (...)` for an optional candidate filter.
fn push_in_clause<'a>(
    sql: &mut String,
    params: &mut Vec<&'a dyn ToSql>,
    column: &str,
    keys: Option<&'a [String]>,
) {
    if let Some(keys) = keys {
        sql.push_str(&format!(
            " AND {column} IN ({})",
            vec!["?"; keys.len()].join(",")
        ));
        for key in keys {
            params.push(key);
        }
    }
}

impl Store {
    pub fn get_tracked_file(
        &self,
        context_id: &str,
        file_key: &str,
    ) -> Result<Option<TrackedFile>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT context_id, file_key, repo_id, rel_path, abs_path, content_hash,
                        flags_hash, includes_hash, composite_hash, last_parsed_at
                 FROM tracked_files WHERE context_id = ?1 AND file_key = ?2",
                params![context_id, file_key],
                |row| {
                    Ok(TrackedFile {
                        context_id: row.get(0)?,
                        file_key: row.get(1)?,
                        repo_id: row.get(2)?,
                        rel_path: row.get(3)?,
                        abs_path: row.get(4)?,
                        content_hash: row.get(5)?,
                        flags_hash: row.get(6)?,
                        includes_hash: row.get(7)?,
                        composite_hash: row.get(8)?,
                        last_parsed_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Overlay-aware tracked lookup: first chain context holding the file
    /// wins; suppressed keys return `None` (tombstone).
    pub fn get_tracked_chain(
        &self,
        chain: &ContextChain,
        file_key: &str,
    ) -> Result<Option<TrackedFile>> {
        if chain.excluded.contains(file_key) {
            return Ok(None);
        }
        for context_id in &chain.contexts {
            if let Some(tracked) = self.get_tracked_file(context_id, file_key)? {
                return Ok(Some(tracked));
            }
        }
        Ok(None)
    }

    pub fn get_composite_hash(&self, context_id: &str, file_key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let hash = conn
            .query_row(
                "SELECT composite_hash FROM tracked_files WHERE context_id = ?1 AND file_key = ?2",
                params![context_id, file_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Persist one file's tracked row and all of its facts atomically,
    /// replacing whatever was there. Only ever called from the writer thread.
    pub fn upsert_file_facts(&self, payload: &ParsePayload) -> Result<()> {
        let mut conn = self.connection()?;
        let now = utc_now();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO tracked_files (
                 context_id, file_key, repo_id, rel_path, abs_path, content_hash,
                 flags_hash, includes_hash, composite_hash, last_parsed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(context_id, file_key) DO UPDATE SET
                 repo_id = excluded.repo_id,
                 rel_path = excluded.rel_path,
                 abs_path = excluded.abs_path,
                 content_hash = excluded.content_hash,
                 flags_hash = excluded.flags_hash,
                 includes_hash = excluded.includes_hash,
                 composite_hash = excluded.composite_hash,
                 last_parsed_at = excluded.last_parsed_at",
            params![
                payload.context_id,
                payload.file_key,
                payload.repo_id,
                payload.rel_path,
                payload.abs_path,
                payload.content_hash,
                payload.flags_hash,
                payload.includes_hash,
                payload.composite_hash,
                now,
            ],
        )?;

        for table in ["symbols", "references_", "call_edges", "include_deps"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE context_id = ?1 AND file_key = ?2"),
                params![payload.context_id, payload.file_key],
            )?;
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO symbols (context_id, file_key, name, qualified_name, kind, line, col, extent_end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for s in &payload.output.symbols {
                stmt.execute(params![
                    payload.context_id,
                    payload.file_key,
                    s.name,
                    s.qualified_name,
                    s.kind,
                    s.line,
                    s.col,
                    s.extent_end_line,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO references_ (context_id, file_key, symbol_qualified_name, line, col, ref_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in &payload.output.references {
                stmt.execute(params![
                    payload.context_id,
                    payload.file_key,
                    r.symbol,
                    r.line,
                    r.col,
                    r.kind,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO call_edges (context_id, file_key, caller_qualified_name, callee_qualified_name, line)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for e in &payload.output.call_edges {
                stmt.execute(params![
                    payload.context_id,
                    payload.file_key,
                    e.caller,
                    e.callee,
                    e.line,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO include_deps (context_id, file_key, included_file_key, included_abs_path, raw_path, depth)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for d in &payload.include_deps {
                stmt.execute(params![
                    payload.context_id,
                    payload.file_key,
                    d.file_key,
                    d.abs_path,
                    d.raw_path,
                    d.depth,
                ])?;
            }

            // Refresh the recall index with current file content.
            tx.execute(
                "DELETE FROM recall_fts WHERE context_id = ?1 AND file_key = ?2",
                params![payload.context_id, payload.file_key],
            )?;
            let content = std::fs::read_to_string(&payload.abs_path).unwrap_or_default();
            tx.execute(
                "INSERT INTO recall_fts (context_id, file_key, repo_id, content)
                 VALUES (?1, ?2, ?3, ?4)",
                params![payload.context_id, payload.file_key, payload.repo_id, content],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete tracked rows (facts cascade). With `file_keys = None`, drops
    /// every row the context holds. Returns the number of files invalidated.
    pub fn invalidate(&self, context_id: &str, file_keys: Option<&[String]>) -> Result<u64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut count = 0u64;
        match file_keys {
            Some(keys) => {
                for key in keys {
                    count += tx.execute(
                        "DELETE FROM tracked_files WHERE context_id = ?1 AND file_key = ?2",
                        params![context_id, key],
                    )? as u64;
                    tx.execute(
                        "DELETE FROM recall_fts WHERE context_id = ?1 AND file_key = ?2",
                        params![context_id, key],
                    )?;
                }
            }
            None => {
                count = tx.execute(
                    "DELETE FROM tracked_files WHERE context_id = ?1",
                    params![context_id],
                )? as u64;
                tx.execute("DELETE FROM recall_fts WHERE context_id = ?1", params![context_id])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    fn symbols_in_context(
        &self,
        context_id: &str,
        name_pattern: &str,
        candidates: Option<&[String]>,
    ) -> Result<Vec<SymbolRow>> {
        let conn = self.connection()?;
        let pattern = format!("%{name_pattern}%");
        let mut sql = String::from(
            "SELECT s.context_id, s.file_key, s.name, s.qualified_name, s.kind, s.line, s.col,
                    s.extent_end_line, t.abs_path
             FROM symbols s JOIN tracked_files t
               ON s.context_id = t.context_id AND s.file_key = t.file_key
             WHERE s.context_id = ?1 AND (s.qualified_name LIKE ?2 OR s.name LIKE ?2)",
        );
        let mut query_params: Vec<&dyn ToSql> = vec![&context_id, &pattern];
        push_in_clause(&mut sql, &mut query_params, "s.file_key", candidates);
        sql.push_str(" ORDER BY s.extent_end_line DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(query_params.as_slice(), |row| {
                Ok(SymbolRow {
                    context_id: row.get(0)?,
                    file_key: row.get(1)?,
                    name: row.get(2)?,
                    qualified_name: row.get(3)?,
                    kind: row.get(4)?,
                    line: row.get(5)?,
                    col: row.get(6)?,
                    extent_end_line: row.get(7)?,
                    abs_path: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Symbols matching `name_pattern` across the chain. Within one context,
    /// duplicate `(file_key, qualified_name, kind)` rows resolve to the one
    /// with the highest extent.
    pub fn symbols_by_name(
        &self,
        chain: &ContextChain,
        name_pattern: &str,
        candidates: Option<&[String]>,
    ) -> Result<Vec<SymbolRow>> {
        let mut merged = Vec::new();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        for context_id in &chain.contexts {
            for row in self.symbols_in_context(context_id, name_pattern, candidates)? {
                if chain.excluded.contains(&row.file_key) {
                    continue;
                }
                let key = (row.file_key.clone(), row.qualified_name.clone(), row.kind.clone());
                if seen.insert(key) {
                    merged.push(row);
                }
            }
        }
        Ok(merged)
    }

    fn references_in_context(
        &self,
        context_id: &str,
        symbol_pattern: &str,
        candidates: Option<&[String]>,
    ) -> Result<Vec<ReferenceRow>> {
        let conn = self.connection()?;
        let pattern = format!("%{symbol_pattern}%");
        let mut sql = String::from(
            "SELECT r.context_id, r.file_key, r.symbol_qualified_name, r.line, r.col, r.ref_kind,
                    t.abs_path
             FROM references_ r JOIN tracked_files t
               ON r.context_id = t.context_id AND r.file_key = t.file_key
             WHERE r.context_id = ?1 AND r.symbol_qualified_name LIKE ?2",
        );
        let mut query_params: Vec<&dyn ToSql> = vec![&context_id, &pattern];
        push_in_clause(&mut sql, &mut query_params, "r.file_key", candidates);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(query_params.as_slice(), |row| {
                Ok(ReferenceRow {
                    context_id: row.get(0)?,
                    file_key: row.get(1)?,
                    symbol_qualified_name: row.get(2)?,
                    line: row.get(3)?,
                    col: row.get(4)?,
                    ref_kind: row.get(5)?,
                    abs_path: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// References to `symbol_pattern` across the chain, deduplicated by full
    /// tuple.
    pub fn references_by_symbol(
        &self,
        chain: &ContextChain,
        symbol_pattern: &str,
        candidates: Option<&[String]>,
    ) -> Result<Vec<ReferenceRow>> {
        let mut merged = Vec::new();
        let mut seen: HashSet<(String, String, u32, u32, String)> = HashSet::new();
        for context_id in &chain.contexts {
            for row in self.references_in_context(context_id, symbol_pattern, candidates)? {
                if chain.excluded.contains(&row.file_key) {
                    continue;
                }
                let key = (
                    row.file_key.clone(),
                    row.symbol_qualified_name.clone(),
                    row.line,
                    row.col,
                    row.ref_kind.clone(),
                );
                if seen.insert(key) {
                    merged.push(row);
                }
            }
        }
        Ok(merged)
    }

    fn call_edges_in_context(
        &self,
        context_id: &str,
        caller: Option<&str>,
        callee: Option<&str>,
        candidates: Option<&[String]>,
    ) -> Result<Vec<CallEdgeRow>> {
        let conn = self.connection()?;
        let mut sql = String::from(
            "SELECT c.context_id, c.file_key, c.caller_qualified_name, c.callee_qualified_name,
                    c.line, t.abs_path
             FROM call_edges c JOIN tracked_files t
               ON c.context_id = t.context_id AND c.file_key = t.file_key
             WHERE c.context_id = ?1",
        );
        let mut query_params: Vec<&dyn ToSql> = vec![&context_id];
        if let Some(caller) = &caller {
            sql.push_str(" AND c.caller_qualified_name = ?");
            query_params.push(caller);
        }
        if let Some(callee) = &callee {
            sql.push_str(" AND c.callee_qualified_name = ?");
            query_params.push(callee);
        }
        push_in_clause(&mut sql, &mut query_params, "c.file_key", candidates);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(query_params.as_slice(), |row| {
                Ok(CallEdgeRow {
                    context_id: row.get(0)?,
                    file_key: row.get(1)?,
                    caller_qualified_name: row.get(2)?,
                    callee_qualified_name: row.get(3)?,
                    line: row.get(4)?,
                    abs_path: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Call edges touching a symbol, deduplicated by full tuple.
    pub fn call_edges(
        &self,
        chain: &ContextChain,
        caller: Option<&str>,
        callee: Option<&str>,
        candidates: Option<&[String]>,
    ) -> Result<Vec<CallEdgeRow>> {
        let mut merged = Vec::new();
        let mut seen: HashSet<(String, String, String, u32)> = HashSet::new();
        for context_id in &chain.contexts {
            for row in self.call_edges_in_context(context_id, caller, callee, candidates)? {
                if chain.excluded.contains(&row.file_key) {
                    continue;
                }
                let key = (
                    row.file_key.clone(),
                    row.caller_qualified_name.clone(),
                    row.callee_qualified_name.clone(),
                    row.line,
                );
                if seen.insert(key) {
                    merged.push(row);
                }
            }
        }
        Ok(merged)
    }

    /// All symbols defined in one file, overlay-first.
    pub fn symbols_by_file(&self, chain: &ContextChain, file_key: &str) -> Result<Vec<SymbolRow>> {
        if chain.excluded.contains(file_key) {
            return Ok(Vec::new());
        }
        let candidates = [file_key.to_string()];
        let mut merged = Vec::new();
        let mut seen: HashSet<(String, u32, u32, String)> = HashSet::new();
        for context_id in &chain.contexts {
            for row in self.symbols_in_context(context_id, "", Some(&candidates))? {
                let key = (row.qualified_name.clone(), row.line, row.col, row.kind.clone());
                if seen.insert(key) {
                    merged.push(row);
                }
            }
        }
        Ok(merged)
    }

    /// File keys in the chain that include `included_file_key` (directly or
    /// transitively per the extractor's flattened dep list).
    pub fn dependents_of_include(
        &self,
        chain: &ContextChain,
        included_file_key: &str,
    ) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut merged = Vec::new();
        let mut seen = HashSet::new();
        for context_id in &chain.contexts {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT file_key FROM include_deps
                 WHERE context_id = ?1 AND included_file_key = ?2",
            )?;
            let keys = stmt
                .query_map(params![context_id, included_file_key], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            for key in keys {
                if !chain.excluded.contains(&key) && seen.insert(key.clone()) {
                    merged.push(key);
                }
            }
        }
        Ok(merged)
    }

    /// Include deps stored for one tracked file, as
    /// `(included_file_key, included_abs_path)` pairs. Unresolved includes
    /// (empty key) are omitted; they never participate in freshness.
    pub fn get_include_deps(
        &self,
        context_id: &str,
        file_key: &str,
    ) -> Result<Vec<(String, String)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT included_file_key, included_abs_path FROM include_deps
             WHERE context_id = ?1 AND file_key = ?2 AND included_file_key != ''",
        )?;
        let deps = stmt
            .query_map(params![context_id, file_key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deps)
    }

    /// Record one completed extractor invocation for the audit trail.
    pub fn record_parse_run(
        &self,
        context_id: &str,
        file_key: &str,
        abs_path: &str,
        started_at: &str,
        success: bool,
        error_msg: &str,
    ) -> Result<i64> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO parse_runs (context_id, file_key, abs_path, started_at, finished_at, success, error_msg)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                context_id,
                file_key,
                abs_path,
                started_at,
                utc_now(),
                i32::from(success),
                error_msg
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnalysisMode, ExtractedCallEdge, ExtractedReference, ExtractedSymbol, ExtractorOutput,
        OverlayMode, ResolvedIncludeDep,
    };

    fn payload(context_id: &str, file_key: &str, symbol: &str) -> ParsePayload {
        ParsePayload {
            context_id: context_id.into(),
            file_key: file_key.into(),
            repo_id: file_key.split(':').next().unwrap().into(),
            rel_path: file_key.split(':').nth(1).unwrap().into(),
            abs_path: format!("/ws/{}", file_key.replace(':', "/")),
            output: ExtractorOutput {
                file: String::new(),
                symbols: vec![ExtractedSymbol {
                    name: symbol.rsplit("::").next().unwrap().into(),
                    qualified_name: symbol.into(),
                    kind: "Function".into(),
                    line: 10,
                    col: 5,
                    extent_end_line: 20,
                }],
                references: vec![ExtractedReference {
                    symbol: symbol.into(),
                    line: 42,
                    col: 3,
                    kind: "call".into(),
                }],
                call_edges: vec![ExtractedCallEdge {
                    caller: "main".into(),
                    callee: symbol.into(),
                    line: 42,
                }],
                include_deps: vec![],
                success: true,
                diagnostics: vec![],
            },
            include_deps: vec![ResolvedIncludeDep {
                raw_path: "include/u.h".into(),
                file_key: "repo_b:include/u.h".into(),
                abs_path: "/ws/repo_b/include/u.h".into(),
                resolved: true,
                depth: 1,
            }],
            content_hash: "c".into(),
            flags_hash: "f".into(),
            includes_hash: "i".into(),
            composite_hash: "z".into(),
            warnings: vec![],
        }
    }

    fn store_with_context(contexts: &[&str]) -> Store {
        let store = Store::open_in_memory().unwrap();
        for ctx in contexts {
            let mode = if ctx.contains(":pr:") {
                AnalysisMode::Pr
            } else {
                AnalysisMode::Baseline
            };
            store
                .upsert_analysis_context(ctx, "ws", mode, "", OverlayMode::Sparse, "")
                .unwrap();
        }
        store
    }

    #[test]
    fn upsert_replaces_previous_facts_for_file() {
        let store = store_with_context(&["ws:baseline"]);
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/x.cpp", "ns::foo")).unwrap();
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/x.cpp", "ns::bar")).unwrap();

        let chain = ContextChain::single("ws:baseline");
        let symbols = store.symbols_by_name(&chain, "ns::", None).unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].qualified_name, "ns::bar");
    }

    #[test]
    fn invalidate_cascades_facts() {
        let store = store_with_context(&["ws:baseline"]);
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/x.cpp", "ns::foo")).unwrap();

        let count = store
            .invalidate("ws:baseline", Some(&["repo_a:src/x.cpp".to_string()]))
            .unwrap();
        assert_eq!(count, 1);

        let chain = ContextChain::single("ws:baseline");
        assert!(store.symbols_by_name(&chain, "foo", None).unwrap().is_empty());
        assert!(store.references_by_symbol(&chain, "foo", None).unwrap().is_empty());
        assert!(store.call_edges(&chain, None, Some("ns::foo"), None).unwrap().is_empty());
        assert!(store.get_tracked_file("ws:baseline", "repo_a:src/x.cpp").unwrap().is_none());
    }

    #[test]
    fn invalidate_all_drops_context_rows() {
        let store = store_with_context(&["ws:baseline"]);
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/x.cpp", "ns::foo")).unwrap();
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/y.cpp", "ns::bar")).unwrap();

        assert_eq!(store.invalidate("ws:baseline", None).unwrap(), 2);
        assert_eq!(store.count_tracked_files(Some("ws:baseline")).unwrap(), 0);
    }

    #[test]
    fn overlay_rows_shadow_baseline() {
        let store = store_with_context(&["ws:baseline", "ws:pr:1"]);
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/x.cpp", "ns::foo")).unwrap();
        let mut modified = payload("ws:pr:1", "repo_a:src/x.cpp", "ns::foo");
        modified.output.symbols[0].line = 99;
        store.upsert_file_facts(&modified).unwrap();

        let chain = ContextChain {
            contexts: vec!["ws:pr:1".into(), "ws:baseline".into()],
            excluded: HashSet::new(),
        };
        let symbols = store.symbols_by_name(&chain, "ns::foo", None).unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].line, 99);
        assert_eq!(symbols[0].context_id, "ws:pr:1");
    }

    #[test]
    fn excluded_keys_suppress_baseline_hits() {
        let store = store_with_context(&["ws:baseline", "ws:pr:1"]);
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/old.cpp", "ns::foo")).unwrap();

        let chain = ContextChain {
            contexts: vec!["ws:pr:1".into(), "ws:baseline".into()],
            excluded: ["repo_a:src/old.cpp".to_string()].into_iter().collect(),
        };
        assert!(store.symbols_by_name(&chain, "ns::foo", None).unwrap().is_empty());
        assert!(store.get_tracked_chain(&chain, "repo_a:src/old.cpp").unwrap().is_none());
        assert!(store.symbols_by_file(&chain, "repo_a:src/old.cpp").unwrap().is_empty());
    }

    #[test]
    fn duplicate_symbols_resolve_to_highest_extent() {
        let store = store_with_context(&["ws:baseline"]);
        let mut p = payload("ws:baseline", "repo_a:src/x.cpp", "ns::foo");
        p.output.symbols.push(ExtractedSymbol {
            name: "foo".into(),
            qualified_name: "ns::foo".into(),
            kind: "Function".into(),
            line: 10,
            col: 5,
            extent_end_line: 80,
        });
        store.upsert_file_facts(&p).unwrap();

        let chain = ContextChain::single("ws:baseline");
        let symbols = store.symbols_by_name(&chain, "ns::foo", None).unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].extent_end_line, 80);
    }

    #[test]
    fn candidate_filter_restricts_rows() {
        let store = store_with_context(&["ws:baseline"]);
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/x.cpp", "ns::foo")).unwrap();
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/y.cpp", "ns::foo2")).unwrap();

        let chain = ContextChain::single("ws:baseline");
        let only_x = ["repo_a:src/x.cpp".to_string()];
        let refs = store.references_by_symbol(&chain, "ns::foo", Some(&only_x)).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].file_key, "repo_a:src/x.cpp");
    }

    #[test]
    fn include_dependents_lookup() {
        let store = store_with_context(&["ws:baseline"]);
        store.upsert_file_facts(&payload("ws:baseline", "repo_a:src/x.cpp", "ns::foo")).unwrap();

        let chain = ContextChain::single("ws:baseline");
        let dependents = store.dependents_of_include(&chain, "repo_b:include/u.h").unwrap();
        assert_eq!(dependents, vec!["repo_a:src/x.cpp".to_string()]);
    }

    #[test]
    fn parse_runs_record_outcome() {
        let store = store_with_context(&["ws:baseline"]);
        let run_id = store
            .record_parse_run(
                "ws:baseline",
                "repo_a:src/x.cpp",
                "/ws/repo_a/src/x.cpp",
                &crate::store::utc_now(),
                true,
                "",
            )
            .unwrap();

        let conn = store.connection().unwrap();
        let (success, finished): (i32, String) = conn
            .query_row(
                "SELECT success, finished_at FROM parse_runs WHERE id = ?1",
                [run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(success, 1);
        assert!(!finished.is_empty());
    }
}
