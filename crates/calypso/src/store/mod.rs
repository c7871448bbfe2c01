//! `SQLite` storage layer for Calypso.
//!
//! This module manages the embedded database that stores workspaces,
//! contexts, tracked files, and AST-derived facts. `SQLite` is the source of
//! truth for all persistent data; one file lives in the workspace root.
//!
//! ## Module Structure
//!
//! - `schema` - Database schema (DDL)
//! - `contexts` - Workspace, repo, and analysis-context CRUD
//! - `facts` - Tracked files + symbols/references/call-edges/include-deps,
//!   overlay-aware merge reads
//! - `jobs` - Index jobs and repo sync jobs with lease semantics
//! - `recall` - Full-text recall candidate index
//! - `summaries` - Commit diff summaries with cosine top-k search
//!
//! All mutations are funneled through the single writer (see `writer`); read
//! paths share the connection behind a mutex.

mod contexts;
mod facts;
mod jobs;
mod recall;
mod schema;
mod summaries;

pub use contexts::WorkspaceRow;
pub use facts::ContextChain;
pub use jobs::{IndexJobSpec, LeasedSyncJob};
pub use summaries::{CommitDiffSummary, SummaryQuery};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Error, Result};

pub(crate) use schema::SCHEMA;

/// Current UTC timestamp in the RFC 3339 form used across all tables.
#[must_use]
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `SQLite` database wrapper for the Calypso fact store.
///
/// The connection is wrapped in a `Mutex` so read paths can share it across
/// tasks while the writer thread holds its own handle to the same file.
pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the store database, enabling WAL and foreign keys and
    /// applying the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store. Test-only convenience.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the connection lock.
    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            Error::Internal(format!(
                "store connection mutex poisoned (a thread panicked while holding the lock): {e}"
            ))
        })
    }

    /// Total tracked files, optionally scoped to one context.
    pub fn count_tracked_files(&self, context_id: Option<&str>) -> Result<u64> {
        let conn = self.connection()?;
        let count: u64 = match context_id {
            Some(ctx) => conn.query_row(
                "SELECT COUNT(*) FROM tracked_files WHERE context_id = ?1",
                [ctx],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM tracked_files", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// Total symbol rows, optionally scoped to one context.
    pub fn count_symbols(&self, context_id: Option<&str>) -> Result<u64> {
        let conn = self.connection()?;
        let count: u64 = match context_id {
            Some(ctx) => conn.query_row(
                "SELECT COUNT(*) FROM symbols WHERE context_id = ?1",
                [ctx],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// Size on disk of the backing database file, in bytes.
    #[must_use]
    pub fn disk_usage_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}
