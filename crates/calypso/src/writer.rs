//! The single writer: all store mutations funnel through one thread.
//!
//! The embedded store permits only one write transaction at a time; funneling
//! every mutation through one consumer serialises writers fairly and enables
//! micro-batching. `database is locked` surfacing to a caller is a bug
//! signal, not a normal state.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  Async tasks                │  Background Writer Thread        │
//! │  ───────────                │  ────────────────────────        │
//! │  extractor workers          │  blocking_recv() from channel    │
//! │  context GC        ── ops ──┼→ coalesce ≤ batch_size ops or    │
//! │  sync engine                │    batch_window elapsed          │
//! │  submit(op).await           │  apply each op, retry on busy    │
//! │  ...                        │  reply through oneshot           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each op is applied in its own transaction (file-level atomicity); the
//! batch only bounds channel overhead and commit frequency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{ContextFileState, OverlayMode, ParsePayload};

/// A mutation to apply through the writer.
#[derive(Debug)]
pub enum WriteOp {
    /// Persist one file's facts atomically. `bulk` marks overlay ingestion;
    /// a `partial_overlay` context refuses bulk persists but still accepts
    /// lazy per-query parses.
    UpsertFileFacts { payload: Box<ParsePayload>, bulk: bool },
    /// Record a context file state (tombstone, rename, modification).
    UpsertContextFileState {
        context_id: String,
        state: ContextFileState,
    },
    /// Delete tracked rows for a context; facts cascade.
    Invalidate {
        context_id: String,
        file_keys: Option<Vec<String>>,
    },
    /// Reclaim all rows of an expired context.
    ReclaimContext { context_id: String },
    /// Audit record for one extractor invocation.
    RecordParseRun {
        context_id: String,
        file_key: String,
        abs_path: String,
        started_at: String,
        success: bool,
        error_msg: String,
    },
}

impl WriteOp {
    fn describe(&self) -> String {
        match self {
            Self::UpsertFileFacts { payload, .. } => {
                format!("upsert_file_facts {}", payload.file_key)
            }
            Self::UpsertContextFileState { state, .. } => {
                format!("upsert_file_state {}", state.file_key)
            }
            Self::Invalidate { context_id, .. } => format!("invalidate {context_id}"),
            Self::ReclaimContext { context_id } => format!("reclaim {context_id}"),
            Self::RecordParseRun { file_key, .. } => format!("parse_run {file_key}"),
        }
    }
}

struct Envelope {
    op: WriteOp,
    reply: oneshot::Sender<Result<u64>>,
}

/// Writer tuning knobs, split out so tests can shrink them.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub queue_size: usize,
    pub batch_size: usize,
    pub batch_window: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_overlay_files: u64,
    pub max_overlay_rows: u64,
}

impl WriterConfig {
    #[must_use]
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            queue_size: settings.writer_queue_size,
            batch_size: settings.writer_batch_size.max(1),
            batch_window: Duration::from_millis(settings.writer_batch_window_ms),
            max_retries: settings.writer_max_retries,
            retry_delay: Duration::from_millis(settings.writer_retry_delay_ms),
            max_overlay_files: settings.max_overlay_files,
            max_overlay_rows: settings.max_overlay_rows,
        }
    }
}

#[derive(Default)]
struct SharedMetrics {
    depth: AtomicUsize,
    oldest_enqueue: Mutex<Option<Instant>>,
}

/// Handle to the single writer. Cloneable across tasks; every clone submits
/// into the same bounded channel.
pub struct SingleWriter {
    tx: mpsc::Sender<Envelope>,
    metrics: Arc<SharedMetrics>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SingleWriter {
    /// Spawn the writer thread against a shared store.
    #[must_use]
    pub fn spawn(store: Arc<Store>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let metrics = Arc::new(SharedMetrics::default());
        let thread_metrics = Arc::clone(&metrics);
        let handle = std::thread::Builder::new()
            .name("calypso-writer".into())
            .spawn(move || writer_thread(&store, rx, &config, &thread_metrics))
            .expect("spawn writer thread");

        Self {
            tx,
            metrics,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Submit an op and await its outcome. Blocks (asynchronously) when the
    /// queue is full; this backpressure is the pipeline's natural throttle.
    pub async fn submit(&self, op: WriteOp) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.note_enqueue();
        if let Err(e) = self.tx.send(Envelope { op, reply }).await {
            self.metrics.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Internal(format!(
                "writer thread is gone: {}",
                e.0.op.describe()
            )));
        }
        rx.await
            .map_err(|_| Error::Internal("writer dropped the reply channel".into()))?
    }

    /// Non-blocking submit: returns `write_contention` immediately when the
    /// queue is full instead of waiting for capacity.
    pub fn try_submit(&self, op: WriteOp) -> Result<oneshot::Receiver<Result<u64>>> {
        let (reply, rx) = oneshot::channel();
        self.note_enqueue();
        self.tx
            .try_send(Envelope { op, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(env) => {
                    self.metrics.depth.fetch_sub(1, Ordering::Relaxed);
                    Error::WriteContention(format!(
                        "writer queue full, would block: {}",
                        env.op.describe()
                    ))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    self.metrics.depth.fetch_sub(1, Ordering::Relaxed);
                    Error::Internal("writer thread is gone".into())
                }
            })?;
        Ok(rx)
    }

    fn note_enqueue(&self) {
        if self.metrics.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            if let Ok(mut oldest) = self.metrics.oldest_enqueue.lock() {
                oldest.get_or_insert_with(Instant::now);
            }
        }
    }

    /// Current number of ops waiting in or being applied by the writer.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.metrics.depth.load(Ordering::Relaxed)
    }

    /// Milliseconds the oldest queued op has been waiting. 0 when idle.
    #[must_use]
    pub fn lag_ms(&self) -> u64 {
        self.metrics
            .oldest_enqueue
            .lock()
            .ok()
            .and_then(|oldest| oldest.map(|t| t.elapsed().as_millis() as u64))
            .unwrap_or(0)
    }

    /// Drop the sender and join the writer thread. Pending ops are applied
    /// before the thread exits.
    pub fn finish(self) -> Result<()> {
        drop(self.tx);
        let handle = self
            .handle
            .lock()
            .map_err(|_| Error::Internal("writer handle mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::Internal("writer thread panicked".into()))?;
        }
        Ok(())
    }
}

fn writer_thread(
    store: &Store,
    mut rx: mpsc::Receiver<Envelope>,
    config: &WriterConfig,
    metrics: &SharedMetrics,
) {
    let mut batch: Vec<Envelope> = Vec::with_capacity(config.batch_size);
    let mut applied: u64 = 0;
    let mut batches: u64 = 0;

    while let Some(first) = rx.blocking_recv() {
        batch.push(first);

        // Coalesce up to batch_size ops or until the window elapses.
        let deadline = Instant::now() + config.batch_window;
        while batch.len() < config.batch_size {
            match rx.try_recv() {
                Ok(envelope) => batch.push(envelope),
                Err(mpsc::error::TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        for envelope in batch.drain(..) {
            let outcome = apply_with_retry(store, &envelope.op, config);
            applied += 1;
            metrics.depth.fetch_sub(1, Ordering::Relaxed);
            // Callers may have given up on the reply; that is not an error.
            let _ = envelope.reply.send(outcome);
        }
        batches += 1;

        if metrics.depth.load(Ordering::Relaxed) == 0 {
            if let Ok(mut oldest) = metrics.oldest_enqueue.lock() {
                *oldest = None;
            }
        }
    }

    debug!(ops = applied, batches, "writer thread finished");
}

fn apply_with_retry(store: &Store, op: &WriteOp, config: &WriterConfig) -> Result<u64> {
    let mut attempt = 0u32;
    loop {
        match apply_op(store, op, config) {
            Ok(rows) => return Ok(rows),
            Err(e) if e.is_retryable_contention() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.retry_delay * 2u32.saturating_pow(attempt - 1);
                warn!(
                    op = %op.describe(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "store busy, retrying write op"
                );
                std::thread::sleep(delay);
            }
            Err(e) if e.is_retryable_contention() => {
                // Exhausted retries on busy/locked: a reliability bug, since
                // this thread is supposed to be the only writer.
                error!(op = %op.describe(), retries = attempt, "database is locked after retries");
                return Err(Error::WriteContention(format!(
                    "{} failed after {attempt} retries",
                    op.describe()
                )));
            }
            Err(e) => {
                warn!(op = %op.describe(), error = %e, "write op failed");
                return Err(e);
            }
        }
    }
}

fn apply_op(store: &Store, op: &WriteOp, config: &WriterConfig) -> Result<u64> {
    match op {
        WriteOp::UpsertFileFacts { payload, bulk } => {
            if let Some(ctx) = store.get_analysis_context(&payload.context_id)? {
                if *bulk && ctx.overlay_mode == OverlayMode::PartialOverlay {
                    return Err(Error::OverlayCapExceeded(payload.context_id.clone()));
                }
            }
            let is_new = store
                .get_tracked_file(&payload.context_id, &payload.file_key)?
                .is_none();
            store.upsert_file_facts(payload)?;
            store.update_overlay_stats(
                &payload.context_id,
                i64::from(is_new),
                payload.fact_row_count() as i64,
                config.max_overlay_files,
                config.max_overlay_rows,
            )?;
            Ok(1)
        }
        WriteOp::UpsertContextFileState { context_id, state } => {
            store.upsert_context_file_state(context_id, state)?;
            Ok(1)
        }
        WriteOp::Invalidate {
            context_id,
            file_keys,
        } => store.invalidate(context_id, file_keys.as_deref()),
        WriteOp::ReclaimContext { context_id } => store.invalidate(context_id, None),
        WriteOp::RecordParseRun {
            context_id,
            file_key,
            abs_path,
            started_at,
            success,
            error_msg,
        } => {
            store.record_parse_run(context_id, file_key, abs_path, started_at, *success, error_msg)?;
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisMode, ExtractorOutput};

    fn test_config() -> WriterConfig {
        WriterConfig {
            queue_size: 64,
            batch_size: 8,
            batch_window: Duration::from_millis(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
            max_overlay_files: 5000,
            max_overlay_rows: 2_000_000,
        }
    }

    fn payload(context_id: &str, file_key: &str) -> ParsePayload {
        ParsePayload {
            context_id: context_id.into(),
            file_key: file_key.into(),
            repo_id: "repo_a".into(),
            rel_path: "src/x.cpp".into(),
            abs_path: "/nonexistent/x.cpp".into(),
            output: ExtractorOutput {
                file: String::new(),
                symbols: vec![],
                references: vec![],
                call_edges: vec![],
                include_deps: vec![],
                success: true,
                diagnostics: vec![],
            },
            include_deps: vec![],
            content_hash: "c".into(),
            flags_hash: "f".into(),
            includes_hash: "i".into(),
            composite_hash: "z".into(),
            warnings: vec![],
        }
    }

    fn store_with_baseline() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("calypso.db")).expect("open");
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
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn submit_returns_per_op_outcome() {
        let (_dir, store) = store_with_baseline();
        let writer = SingleWriter::spawn(Arc::clone(&store), test_config());

        let rows = writer
            .submit(WriteOp::UpsertFileFacts {
                payload: Box::new(payload("ws:baseline", "repo_a:src/x.cpp")),
                bulk: false,
            })
            .await
            .expect("op succeeds");
        assert_eq!(rows, 1);
        assert!(store
            .get_tracked_file("ws:baseline", "repo_a:src/x.cpp")
            .unwrap()
            .is_some());

        writer.finish().expect("finish");
    }

    #[tokio::test]
    async fn many_concurrent_submitters_all_resolve() {
        let (_dir, store) = store_with_baseline();
        let writer = Arc::new(SingleWriter::spawn(Arc::clone(&store), test_config()));

        let mut tasks = Vec::new();
        for i in 0..50 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                writer
                    .submit(WriteOp::UpsertFileFacts {
                        payload: Box::new(payload("ws:baseline", &format!("repo_a:src/f{i}.cpp"))),
                        bulk: false,
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("no locked errors surface");
        }

        assert_eq!(store.count_tracked_files(Some("ws:baseline")).unwrap(), 50);
        assert_eq!(writer.queue_depth(), 0);
    }

    #[tokio::test]
    async fn bulk_persist_refused_in_partial_overlay() {
        let (_dir, store) = store_with_baseline();
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
        // Force the overlay into partial mode.
        store.update_overlay_stats("ws:pr:1", 10, 0, 1, 2_000_000).unwrap();

        let writer = SingleWriter::spawn(Arc::clone(&store), test_config());
        let err = writer
            .submit(WriteOp::UpsertFileFacts {
                payload: Box::new(payload("ws:pr:1", "repo_a:src/x.cpp")),
                bulk: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OverlayCapExceeded);

        // Lazy per-query parse is still allowed.
        writer
            .submit(WriteOp::UpsertFileFacts {
                payload: Box::new(payload("ws:pr:1", "repo_a:src/x.cpp")),
                bulk: false,
            })
            .await
            .expect("lazy parse persists");

        writer.finish().expect("finish");
    }

    #[tokio::test]
    async fn invalidate_through_writer() {
        let (_dir, store) = store_with_baseline();
        let writer = SingleWriter::spawn(Arc::clone(&store), test_config());

        writer
            .submit(WriteOp::UpsertFileFacts {
                payload: Box::new(payload("ws:baseline", "repo_a:src/x.cpp")),
                bulk: false,
            })
            .await
            .unwrap();
        let removed = writer
            .submit(WriteOp::Invalidate {
                context_id: "ws:baseline".into(),
                file_keys: None,
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);

        writer.finish().expect("finish");
    }
}
