//! Application settings loaded from defaults, a YAML file, and environment.
//!
//! Values resolve in order: defaults < YAML config file < `CALYPSO_`-prefixed
//! environment variables. Every tunable named in the component designs lives
//! here so tests and deployments can pin behavior.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Central configuration for the Calypso service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // -- External tool paths ------------------------------------------------
    pub rg_binary: String,
    pub extractor_binary: String,
    pub git_binary: String,

    // -- Store --------------------------------------------------------------
    pub db_path: String,

    // -- Concurrency & limits ----------------------------------------------
    pub max_parse_workers: usize,
    pub max_parse_budget: usize,
    pub max_recall_files: usize,
    pub recall_timeout_s: u64,
    pub parse_timeout_s: u64,
    pub query_deadline_ms: u64,

    // -- Single writer ------------------------------------------------------
    pub writer_queue_size: usize,
    pub writer_batch_size: usize,
    pub writer_batch_window_ms: u64,
    pub writer_max_retries: u32,
    pub writer_retry_delay_ms: u64,

    // -- Overlay controls ---------------------------------------------------
    pub max_overlay_files: u64,
    pub max_overlay_rows: u64,
    pub context_ttl_hours: i64,
    pub context_gc_interval_s: u64,

    // -- Sync engine --------------------------------------------------------
    pub sync_worker_count: usize,
    pub sync_poll_interval_ms: u64,
    pub sync_lease_ttl_s: i64,
    pub sync_max_attempts: u32,
    pub sync_backoff_base_ms: u64,
    pub git_timeout_s: u64,

    // -- Server -------------------------------------------------------------
    pub host: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rg_binary: "rg".into(),
            extractor_binary: "cpp-extractor".into(),
            git_binary: "git".into(),
            db_path: "./calypso.db".into(),
            max_parse_workers: num_cpus(),
            max_parse_budget: 15,
            max_recall_files: 200,
            recall_timeout_s: 30,
            parse_timeout_s: 120,
            query_deadline_ms: 3000,
            writer_queue_size: 1024,
            writer_batch_size: 64,
            writer_batch_window_ms: 25,
            writer_max_retries: 5,
            writer_retry_delay_ms: 50,
            max_overlay_files: 5000,
            max_overlay_rows: 2_000_000,
            context_ttl_hours: 72,
            context_gc_interval_s: 300,
            sync_worker_count: 2,
            sync_poll_interval_ms: 500,
            sync_lease_ttl_s: 120,
            sync_max_attempts: 5,
            sync_backoff_base_ms: 500,
            git_timeout_s: 120,
            host: "127.0.0.1".into(),
            port: 8600,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

impl Settings {
    /// Load settings, optionally merging values from a YAML file, then apply
    /// `CALYPSO_*` environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&raw)?
            }
            _ => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        fn get(name: &str) -> Option<String> {
            std::env::var(format!("CALYPSO_{name}")).ok()
        }
        fn get_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            get(name).and_then(|v| v.parse().ok())
        }

        if let Some(v) = get("RG_BINARY") {
            self.rg_binary = v;
        }
        if let Some(v) = get("EXTRACTOR_BINARY") {
            self.extractor_binary = v;
        }
        if let Some(v) = get("GIT_BINARY") {
            self.git_binary = v;
        }
        if let Some(v) = get("DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = get_parsed("MAX_PARSE_WORKERS") {
            self.max_parse_workers = v;
        }
        if let Some(v) = get_parsed("MAX_PARSE_BUDGET") {
            self.max_parse_budget = v;
        }
        if let Some(v) = get_parsed("MAX_RECALL_FILES") {
            self.max_recall_files = v;
        }
        if let Some(v) = get_parsed("PARSE_TIMEOUT_S") {
            self.parse_timeout_s = v;
        }
        if let Some(v) = get_parsed("QUERY_DEADLINE_MS") {
            self.query_deadline_ms = v;
        }
        if let Some(v) = get_parsed("WRITER_QUEUE_SIZE") {
            self.writer_queue_size = v;
        }
        if let Some(v) = get_parsed("WRITER_BATCH_SIZE") {
            self.writer_batch_size = v;
        }
        if let Some(v) = get_parsed("MAX_OVERLAY_FILES") {
            self.max_overlay_files = v;
        }
        if let Some(v) = get_parsed("MAX_OVERLAY_ROWS") {
            self.max_overlay_rows = v;
        }
        if let Some(v) = get_parsed("CONTEXT_TTL_HOURS") {
            self.context_ttl_hours = v;
        }
        if let Some(v) = get_parsed("SYNC_WORKER_COUNT") {
            self.sync_worker_count = v;
        }
        if let Some(v) = get("HOST") {
            self.host = v;
        }
        if let Some(v) = get_parsed("PORT") {
            self.port = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_specs() {
        let s = Settings::default();
        assert_eq!(s.max_parse_budget, 15);
        assert_eq!(s.writer_queue_size, 1024);
        assert_eq!(s.writer_batch_size, 64);
        assert_eq!(s.writer_batch_window_ms, 25);
        assert_eq!(s.writer_max_retries, 5);
        assert_eq!(s.max_overlay_files, 5000);
        assert_eq!(s.max_overlay_rows, 2_000_000);
        assert_eq!(s.context_ttl_hours, 72);
        assert_eq!(s.parse_timeout_s, 120);
        assert_eq!(s.sync_max_attempts, 5);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calypso.yaml");
        std::fs::write(&path, "max_parse_budget: 3\nport: 9000\n").unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.max_parse_budget, 3);
        assert_eq!(s.port, 9000);
        // Untouched fields keep defaults.
        assert_eq!(s.writer_batch_size, 64);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let s = Settings::load(Some(Path::new("/nope/calypso.yaml"))).unwrap();
        assert_eq!(s.max_parse_budget, 15);
    }
}
