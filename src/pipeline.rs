//! The indexing run: scan the corpus, extract changed files in parallel and
//! commit them one at a time.
//!
//! Extraction runs on a rayon pool in batches; results travel through a
//! bounded channel to a single committer on the calling thread, so the store
//! only ever sees one writer and memory stays bounded however large the
//! corpus. Pages are committed in work-list (sorted path) order, so a help id
//! claimed by several files in one run resolves the same way every time.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    extract::{self, ExtractionError},
    incremental::{self, ChangeKind, ChangeSet, WorkItem},
    page::Page,
    store::IndexStore,
    walker,
};

/// Full-text changes are committed after this many indexed files.
pub const FULLTEXT_COMMIT_INTERVAL: usize = 500;

/// This many commit failures in a row fail the run.
pub const MAX_CONSECUTIVE_COMMIT_FAILURES: usize = 5;

/// Files extracted per batch, per worker thread.
const EXTRACTION_BATCH_PER_WORKER: usize = 16;

pub const RUN_RECORD_FILE: &str = "last_run.json";

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Scanning,
    Dispatching,
    Committing,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }

    /// Allowed transitions. A run with nothing to do goes straight from
    /// scanning to done; any live phase may fail.
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Scanning, Dispatching) | (Dispatching, Committing) => true,
            (Scanning | Committing, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct PhaseTracker {
    phase: RunPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        tracing::info!(phase = ?RunPhase::Scanning, "index run started");
        Self {
            phase: RunPhase::Scanning,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        if !self.phase.can_advance_to(next) {
            tracing::error!(from = ?self.phase, to = ?next, "invalid phase transition");
        }
        tracing::debug!(from = ?self.phase, to = ?next, "phase change");
        self.phase = next;
    }
}

/// Cooperative cancellation shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub force: bool,
    pub extraction_timeout: Duration,
    /// Where to write the run record; `None` disables it.
    pub metadata_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: crate::config::default_workers(),
            force: false,
            extraction_timeout: extract::DEFAULT_EXTRACTION_TIMEOUT,
            metadata_dir: None,
        }
    }
}

/// A file that was not indexed in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub kind: String,
    pub reason: String,
}

impl SkippedFile {
    fn extraction(err: &ExtractionError) -> Self {
        Self {
            path: err.path().to_string(),
            kind: err.kind().to_string(),
            reason: err.to_string(),
        }
    }

    fn commit(path: &str, err: &Error) -> Self {
        Self {
            path: path.to_string(),
            kind: "commit".to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub forced: bool,
    pub indexed: usize,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped: Vec<SkippedFile>,
    pub commit_failures: usize,
    pub cancelled: bool,
    pub phase: RunPhase,
    /// Why the run failed, when `phase` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub commit_seq: u64,
    pub started_at: u64,
    pub duration_ms: u64,
}

impl RunSummary {
    fn new(forced: bool) -> Self {
        Self {
            forced,
            indexed: 0,
            added: 0,
            modified: 0,
            removed: 0,
            unchanged: 0,
            skipped: Vec::new(),
            commit_failures: 0,
            cancelled: false,
            phase: RunPhase::Scanning,
            error: None,
            commit_seq: 0,
            started_at: unix_now(),
            duration_ms: 0,
        }
    }

    /// Whether the run changed the store.
    pub fn changed(&self) -> bool {
        self.indexed > 0 || self.removed > 0
    }

    pub fn failed(&self) -> bool {
        self.phase == RunPhase::Failed
    }
}

/// Read the last run record from `dir`, if one was written.
pub fn read_run_record(dir: &Path) -> Result<Option<RunSummary>> {
    let path = dir.join(RUN_RECORD_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_run_record(dir: &Path, summary: &RunSummary) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{RUN_RECORD_FILE}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec_pretty(summary)?)?;
    std::fs::rename(&tmp, dir.join(RUN_RECORD_FILE))?;
    Ok(())
}

type Extracted = (WorkItem, std::result::Result<Page, ExtractionError>);

struct Run<'a> {
    store: &'a IndexStore,
    options: &'a PipelineOptions,
    cancel: &'a CancelToken,
    phase: PhaseTracker,
    summary: RunSummary,
    started: Instant,
}

impl<'a> Run<'a> {
    fn fail(mut self, err: impl std::fmt::Display) -> RunSummary {
        tracing::error!(error = %err, "index run failed");
        self.summary.error = Some(err.to_string());
        self.phase.advance(RunPhase::Failed);
        self.finish()
    }

    fn finish(mut self) -> RunSummary {
        if !self.phase.phase.is_terminal() {
            self.phase.advance(RunPhase::Done);
        }
        let summary = &mut self.summary;
        summary.phase = self.phase.phase;
        summary.commit_seq = self.store.commit_seq();
        summary.duration_ms =
            u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if summary.changed() {
            let now = unix_now();
            if let Err(e) = self.store.record_run(now) {
                tracing::warn!(error = %e, "could not record run time");
            }
            if let Some(dir) = &self.options.metadata_dir
                && let Err(e) = write_run_record(dir, summary)
            {
                tracing::warn!(error = %e, dir = %dir.display(), "could not write run record");
            }
        }

        tracing::info!(
            phase = ?summary.phase,
            indexed = summary.indexed,
            added = summary.added,
            modified = summary.modified,
            removed = summary.removed,
            unchanged = summary.unchanged,
            skipped = summary.skipped.len(),
            cancelled = summary.cancelled,
            duration_ms = summary.duration_ms,
            "index run finished",
        );
        self.summary
    }

    /// Record a failed commit of `path`. Returns the failure reason once
    /// `streak` reaches [`MAX_CONSECUTIVE_COMMIT_FAILURES`].
    fn record_commit_failure(
        &mut self,
        path: &str,
        err: &Error,
        streak: &mut FailureStreak,
    ) -> Option<String> {
        tracing::warn!(path, error = %err, "commit failed");
        self.summary.commit_failures += 1;
        self.summary.skipped.push(SkippedFile::commit(path, err));
        streak.record().then(|| {
            format!(
                "store unreachable after {} consecutive commit failures: {err}",
                streak.0
            )
        })
    }
}

/// Commit failures in a row; any successful commit resets it.
#[derive(Debug, Default)]
struct FailureStreak(usize);

impl FailureStreak {
    fn reset(&mut self) {
        self.0 = 0;
    }

    /// Count one failure. `true` once the run has to stop.
    fn record(&mut self) -> bool {
        self.0 += 1;
        self.0 >= MAX_CONSECUTIVE_COMMIT_FAILURES
    }
}

/// Bring the store in line with the corpus under `corpus_root`.
///
/// Never returns an error: per-file problems land in
/// [`RunSummary::skipped`], systemic ones end the run in
/// [`RunPhase::Failed`] with [`RunSummary::error`] set.
pub fn run(
    store: &IndexStore,
    corpus_root: &Path,
    options: &PipelineOptions,
    cancel: &CancelToken,
) -> RunSummary {
    let mut run = Run {
        store,
        options,
        cancel,
        phase: PhaseTracker::new(),
        summary: RunSummary::new(options.force),
        started: Instant::now(),
    };

    let files = match walker::discover_files(corpus_root) {
        Ok(files) => files,
        Err(e) => {
            return run.fail(format!(
                "cannot read corpus root {}: {e}",
                corpus_root.display()
            ));
        }
    };
    let manifest = match store.load_manifest() {
        Ok(manifest) => manifest,
        Err(e) => return run.fail(e),
    };

    let changes = incremental::diff(incremental::scan(files), &manifest, options.force);
    run.summary.unchanged = changes.unchanged;
    tracing::info!(
        to_index = changes.to_index.len(),
        to_remove = changes.to_remove.len(),
        unchanged = changes.unchanged,
        "scan complete",
    );

    if cancel.is_cancelled() {
        run.summary.cancelled = true;
        return run.finish();
    }
    if changes.is_empty() {
        return run.finish();
    }

    run.phase.advance(RunPhase::Dispatching);
    dispatch(run, changes)
}

fn dispatch(mut run: Run<'_>, changes: ChangeSet) -> RunSummary {
    let ChangeSet {
        to_index,
        to_remove,
        ..
    } = changes;

    let workers = run.options.workers.max(1);
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("helpdex-extract-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => return run.fail(format!("cannot start extraction pool: {e}")),
    };

    let timeout = run.options.extraction_timeout;
    let cancel = run.cancel;
    let batch_size = workers * EXTRACTION_BATCH_PER_WORKER;
    let abort = AtomicBool::new(false);
    let (tx, rx) = mpsc::sync_channel::<Extracted>(workers * 2);

    let fatal: Option<String> = std::thread::scope(|scope| {
        let abort = &abort;
        scope.spawn(move || {
            let mut pending = to_index.into_iter();
            loop {
                if cancel.is_cancelled() || abort.load(Ordering::Acquire) {
                    return;
                }
                let batch: Vec<WorkItem> = pending.by_ref().take(batch_size).collect();
                if batch.is_empty() {
                    return;
                }

                // `collect` keeps work-list order however the pool schedules.
                let extracted: Vec<Extracted> = pool.install(|| {
                    batch
                        .into_par_iter()
                        .filter_map(|item| {
                            if cancel.is_cancelled() || abort.load(Ordering::Acquire) {
                                return None;
                            }
                            let deadline = Instant::now() + timeout;
                            let result = extract::extract_file(
                                &item.relative_path,
                                &item.absolute_path,
                                deadline,
                            );
                            Some((item, result))
                        })
                        .collect()
                });
                for result in extracted {
                    // A closed channel means the committer stopped.
                    if tx.send(result).is_err() {
                        return;
                    }
                }
            }
        });

        run.phase.advance(RunPhase::Committing);
        let fatal = commit_stream(&mut run, &to_remove, &rx, abort);
        abort.store(true, Ordering::Release);
        drop(rx);
        fatal
    });

    let fatal = match fatal {
        Some(reason) => {
            // Pages already committed to the records are still published.
            if let Err(e) = run.store.commit_fulltext() {
                tracing::warn!(error = %e, "full-text commit failed after run failure");
                run.store.discard_fulltext();
            }
            Some(reason)
        }
        None => match run.store.commit_fulltext() {
            Ok(_) => None,
            Err(e) => {
                run.store.discard_fulltext();
                Some(format!("full-text commit failed: {e}"))
            }
        },
    };

    match fatal {
        Some(reason) => run.fail(reason),
        None => run.finish(),
    }
}

/// Remove the pages of vanished files in one transaction. When that fails,
/// retry path by path so one bad record does not keep the rest around.
fn commit_removals(
    run: &mut Run<'_>,
    to_remove: &[String],
    streak: &mut FailureStreak,
    mut delete: impl FnMut(&[String]) -> Result<usize>,
) -> Option<String> {
    match delete(to_remove) {
        Ok(removed) => {
            tracing::debug!(removed, "removed vanished pages");
            run.summary.removed = removed;
            return None;
        }
        Err(e) if to_remove.len() > 1 => {
            tracing::warn!(error = %e, "batch removal failed, removing one by one");
        }
        Err(e) => return run.record_commit_failure(&to_remove.join(", "), &e, streak),
    }

    for path in to_remove {
        match delete(std::slice::from_ref(path)) {
            Ok(removed) => {
                streak.reset();
                run.summary.removed += removed;
            }
            Err(e) => {
                if let Some(reason) = run.record_commit_failure(path, &e, streak) {
                    return Some(reason);
                }
            }
        }
    }
    None
}

/// The committer: removals first, then every extracted page in work-list
/// order. Returns the reason when the run has to stop as failed.
fn commit_stream(
    run: &mut Run<'_>,
    to_remove: &[String],
    rx: &mpsc::Receiver<Extracted>,
    abort: &AtomicBool,
) -> Option<String> {
    let mut streak = FailureStreak::default();

    if !to_remove.is_empty() {
        let store = run.store;
        if let Some(reason) =
            commit_removals(run, to_remove, &mut streak, |paths| store.delete_pages(paths))
        {
            abort.store(true, Ordering::Release);
            return Some(reason);
        }
    }

    let mut since_fulltext_commit = 0usize;
    for (item, result) in rx.iter() {
        if run.cancel.is_cancelled() {
            run.summary.cancelled = true;
            abort.store(true, Ordering::Release);
            break;
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(path = %item.relative_path, error = %e, "skipping file");
                run.summary.skipped.push(SkippedFile::extraction(&e));
                continue;
            }
        };

        match run.store.upsert_page(page, unix_now()) {
            Ok(committed) => {
                streak.reset();
                run.summary.indexed += 1;
                match item.change {
                    ChangeKind::Added => run.summary.added += 1,
                    ChangeKind::Modified => run.summary.modified += 1,
                }
                tracing::debug!(
                    path = %item.relative_path,
                    page_id = %committed.page_id,
                    seq = committed.indexed_seq,
                    "committed page",
                );
            }
            Err(e) => {
                if let Some(reason) =
                    run.record_commit_failure(&item.relative_path, &e, &mut streak)
                {
                    abort.store(true, Ordering::Release);
                    return Some(reason);
                }
                continue;
            }
        }

        since_fulltext_commit += 1;
        if since_fulltext_commit >= FULLTEXT_COMMIT_INTERVAL {
            since_fulltext_commit = 0;
            if let Err(e) = run.store.commit_fulltext() {
                abort.store(true, Ordering::Release);
                return Some(format!("full-text commit failed: {e}"));
            }
        }
    }

    if run.cancel.is_cancelled() {
        run.summary.cancelled = true;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions() {
        use RunPhase::*;
        assert!(Scanning.can_advance_to(Dispatching));
        assert!(Dispatching.can_advance_to(Committing));
        assert!(Committing.can_advance_to(Done));
        assert!(Scanning.can_advance_to(Done));
        assert!(Dispatching.can_advance_to(Failed));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Done));
        assert!(!Committing.can_advance_to(Scanning));
        assert!(!Scanning.can_advance_to(Committing));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    fn test_run<'a>(
        store: &'a IndexStore,
        options: &'a PipelineOptions,
        cancel: &'a CancelToken,
    ) -> Run<'a> {
        Run {
            store,
            options,
            cancel,
            phase: PhaseTracker::new(),
            summary: RunSummary::new(false),
            started: Instant::now(),
        }
    }

    fn test_store() -> (tempfile::TempDir, IndexStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::open(
            &tmp.path().join("index.redb"),
            &tmp.path().join("fulltext"),
        )
        .unwrap();
        (tmp, store)
    }

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn disk_full() -> Error {
        Error::Io(std::io::Error::other("disk full"))
    }

    #[test]
    fn failure_streak_trips_at_threshold() {
        let mut streak = FailureStreak::default();
        for _ in 1..MAX_CONSECUTIVE_COMMIT_FAILURES {
            assert!(!streak.record());
        }
        streak.reset();
        assert!(!streak.record());
        for _ in 1..MAX_CONSECUTIVE_COMMIT_FAILURES {
            streak.record();
        }
        assert!(streak.0 >= MAX_CONSECUTIVE_COMMIT_FAILURES);
    }

    #[test]
    fn failed_batch_removal_retries_each_path() {
        let (_tmp, store) = test_store();
        let (options, cancel) = (PipelineOptions::default(), CancelToken::new());
        let mut run = test_run(&store, &options, &cancel);
        let mut streak = FailureStreak::default();

        let to_remove = paths(&["a.xml", "b.xml", "c.xml"]);
        let fatal = commit_removals(&mut run, &to_remove, &mut streak, |batch| {
            if batch.len() > 1 || batch[0] == "b.xml" {
                Err(disk_full())
            } else {
                Ok(1)
            }
        });

        assert!(fatal.is_none());
        assert_eq!(run.summary.removed, 2);
        assert_eq!(run.summary.commit_failures, 1);
        let skipped: Vec<_> = run.summary.skipped.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(skipped, vec!["b.xml"]);
        assert_eq!(run.summary.skipped[0].kind, "commit");
    }

    #[test]
    fn unreachable_store_fails_removal() {
        let (_tmp, store) = test_store();
        let (options, cancel) = (PipelineOptions::default(), CancelToken::new());
        let mut run = test_run(&store, &options, &cancel);
        let mut streak = FailureStreak::default();

        let to_remove: Vec<String> = (0..8).map(|i| format!("gone{i}.xml")).collect();
        let fatal =
            commit_removals(&mut run, &to_remove, &mut streak, |_| Err(disk_full()));

        let reason = fatal.expect("removal should fail the run");
        assert!(reason.contains("consecutive commit failures"));
        assert_eq!(run.summary.removed, 0);
        let skipped: Vec<_> = run.summary.skipped.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(skipped, to_remove[..MAX_CONSECUTIVE_COMMIT_FAILURES].to_vec());
    }

    #[test]
    fn single_removal_failure_is_recorded_once() {
        let (_tmp, store) = test_store();
        let (options, cancel) = (PipelineOptions::default(), CancelToken::new());
        let mut run = test_run(&store, &options, &cancel);
        let mut streak = FailureStreak::default();

        let fatal = commit_removals(&mut run, &paths(&["only.xml"]), &mut streak, |_| {
            Err(disk_full())
        });
        assert!(fatal.is_none());
        assert_eq!(run.summary.skipped.len(), 1);
        assert_eq!(run.summary.skipped[0].path, "only.xml");
        assert_eq!(streak.0, 1);
    }

    #[test]
    fn run_record_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_run_record(tmp.path()).unwrap().is_none());

        let mut summary = RunSummary::new(true);
        summary.indexed = 3;
        summary.skipped.push(SkippedFile {
            path: "bad.xml".into(),
            kind: "malformed".into(),
            reason: "broken".into(),
        });
        write_run_record(tmp.path(), &summary).unwrap();

        let restored = read_run_record(tmp.path()).unwrap().unwrap();
        assert_eq!(restored, summary);
        assert!(restored.changed());
    }
}
