//! The capture cycle: fetch, merge, persist, advance.
//!
//! A [`Capturer`] owns the cursor and runs one cycle at a time. The same
//! cycle is driven three ways: [`run_poll_loop`] long-polls the source,
//! [`run_push_worker`] drains webhook deliveries from a queue, and the `sync`
//! / `import` commands run a single cycle by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveRepo;
use crate::bridges::telegram::{decode_updates, DecodedBatch};
use crate::bridges::{ChannelFilter, Notifier, UpdateSource};
use crate::cursor::CursorTracker;
use crate::dedup::DedupPolicy;
use crate::error::{CaptureError, CaptureResult};
use crate::merge::{merge, MergeMode};
use crate::store::RemoteStore;
use crate::{backoff_delay, sleep_unless_shutdown, Archive, MessageRecord};

const IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Fetching,
    Merging,
    Persisting,
}

#[derive(Debug, Clone)]
pub(crate) struct CaptureOptions {
    pub(crate) filter: ChannelFilter,
    pub(crate) policy: DedupPolicy,
    pub(crate) trigger_command: String,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) base: Duration,
    pub(crate) max: Duration,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollOptions {
    pub(crate) poll_timeout_secs: u64,
    pub(crate) min_interval: Duration,
    pub(crate) retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct CycleReport {
    pub(crate) fetched: usize,
    pub(crate) added: usize,
    pub(crate) removed: usize,
    pub(crate) skipped: usize,
    pub(crate) total: usize,
    pub(crate) cursor: i64,
    pub(crate) persisted: bool,
    #[serde(skip)]
    pub(crate) triggers: Vec<i64>,
}

impl CycleReport {
    pub(crate) fn summary(&self) -> String {
        let mut line = format!("Saved {} new post(s), {} in archive", self.added, self.total);
        if self.removed > 0 {
            line.push_str(&format!(", {} removed", self.removed));
        }
        line.push('.');
        line
    }
}

pub(crate) struct Capturer<S> {
    repo: ArchiveRepo<S>,
    cursor: CursorTracker,
    options: CaptureOptions,
    phase: Phase,
    cursor_synced: bool,
}

impl<S: RemoteStore> Capturer<S> {
    pub(crate) fn new(repo: ArchiveRepo<S>, options: CaptureOptions) -> Self {
        Self {
            repo,
            cursor: CursorTracker::new(0),
            options,
            phase: Phase::Idle,
            cursor_synced: false,
        }
    }

    pub(crate) fn repo(&self) -> &ArchiveRepo<S> {
        &self.repo
    }

    pub(crate) fn cursor(&self) -> &CursorTracker {
        &self.cursor
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Fetches from `source` starting at the cursor and merges the result.
    pub(crate) fn pull_cycle(&mut self, source: &dyn UpdateSource, timeout_secs: u64) -> CaptureResult<CycleReport> {
        let result = self.pull_cycle_inner(source, timeout_secs);
        self.finish(result)
    }

    /// Merges webhook deliveries that were queued since the last cycle.
    pub(crate) fn push_cycle(&mut self, updates: &[Value]) -> CaptureResult<CycleReport> {
        let result = self.push_cycle_inner(updates);
        self.finish(result)
    }

    /// Merges records that did not come through the update stream. The
    /// cursor is left alone.
    pub(crate) fn import_cycle(&mut self, records: Vec<MessageRecord>, mode: MergeMode) -> CaptureResult<CycleReport> {
        let result = self.import_cycle_inner(records, mode);
        self.finish(result)
    }

    fn pull_cycle_inner(&mut self, source: &dyn UpdateSource, timeout_secs: u64) -> CaptureResult<CycleReport> {
        self.phase = Phase::Fetching;
        if !self.cursor_synced {
            self.load_archive()?;
        }
        let raw = source.get_updates(self.cursor.current(), timeout_secs)?;
        // A long poll can block for a while; read the archive after it returns.
        let archive = self.load_archive()?;
        let batch = decode_updates(&raw, &self.options.filter, &self.options.trigger_command);
        self.merge_and_persist(archive, batch, MergeMode::Incremental)
    }

    fn push_cycle_inner(&mut self, updates: &[Value]) -> CaptureResult<CycleReport> {
        self.phase = Phase::Fetching;
        let archive = self.load_archive()?;
        let batch = decode_updates(updates, &self.options.filter, &self.options.trigger_command);
        self.merge_and_persist(archive, batch, MergeMode::Incremental)
    }

    fn import_cycle_inner(&mut self, records: Vec<MessageRecord>, mode: MergeMode) -> CaptureResult<CycleReport> {
        self.phase = Phase::Fetching;
        let archive = self.load_archive()?;
        let batch = DecodedBatch {
            fetched: records.len(),
            records,
            ..DecodedBatch::default()
        };
        self.merge_and_persist(archive, batch, mode)
    }

    /// Re-reads the archive so edits made by hand between cycles are kept.
    fn load_archive(&mut self) -> CaptureResult<Archive> {
        let archive = self.repo.load()?;
        self.cursor_synced = true;
        if !self.cursor.sync_stored(archive.cursor) {
            warn!(
                stored = archive.cursor,
                persisted = self.cursor.persisted(),
                "stored cursor is behind this process, keeping ours"
            );
        }
        Ok(archive)
    }

    fn merge_and_persist(&mut self, archive: Archive, batch: DecodedBatch, mode: MergeMode) -> CaptureResult<CycleReport> {
        self.phase = Phase::Merging;
        let outcome = merge(archive.messages, &batch.records, mode, self.options.policy)?;
        if let Some(max_update_id) = batch.max_update_id {
            self.cursor.observe(max_update_id)?;
        }

        self.phase = Phase::Persisting;
        let written = self.repo.persist(
            &outcome.messages,
            self.cursor.current(),
            outcome.changed(),
            self.cursor.is_dirty(),
        )?;
        self.cursor.mark_persisted();

        Ok(CycleReport {
            fetched: batch.fetched,
            added: outcome.added,
            removed: outcome.removed,
            skipped: batch.skipped,
            total: outcome.messages.len(),
            cursor: self.cursor.current(),
            persisted: written.collection || written.cursor,
            triggers: batch.triggers,
        })
    }

    /// Any failure leaves the cursor at its last stored value.
    fn finish(&mut self, result: CaptureResult<CycleReport>) -> CaptureResult<CycleReport> {
        if let Err(err) = &result {
            debug!(phase = ?self.phase, error = %err, "cycle aborted, cursor rolled back");
            self.cursor.rollback();
        }
        self.phase = Phase::Idle;
        result
    }
}

fn log_report(report: &CycleReport) {
    if report.added > 0 || report.removed > 0 {
        info!(
            added = report.added,
            removed = report.removed,
            total = report.total,
            cursor = report.cursor,
            "archive updated"
        );
    } else {
        debug!(
            fetched = report.fetched,
            skipped = report.skipped,
            cursor = report.cursor,
            "nothing new"
        );
    }
}

pub(crate) fn reply_to_triggers(notifier: &dyn Notifier, triggers: &[i64], text: &str) {
    for chat_id in triggers {
        notifier.notify(*chat_id, text);
    }
}

/// Long-running pull mode. Returns `Ok` on shutdown and `Err` on a failure
/// that retrying cannot fix.
pub(crate) fn run_poll_loop<S: RemoteStore>(
    capturer: &mut Capturer<S>,
    source: &dyn UpdateSource,
    notifier: &dyn Notifier,
    options: PollOptions,
    shutdown: &AtomicBool,
) -> CaptureResult<()> {
    let mut failures = 0u32;
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        match capturer.pull_cycle(source, options.poll_timeout_secs) {
            Ok(report) => {
                failures = 0;
                log_report(&report);
                reply_to_triggers(notifier, &report.triggers, &report.summary());
            }
            Err(err) if err.is_retryable() => {
                failures += 1;
                let delay = backoff_delay(failures, options.retry.base, options.retry.max);
                warn!(error = %err, failures, delay_ms = delay.as_millis() as u64, "capture cycle failed");
                sleep_unless_shutdown(delay, shutdown);
                continue;
            }
            Err(err) => {
                error!(error = %err, "capture cycle failed and cannot be retried");
                return Err(err);
            }
        }
        let elapsed = started.elapsed();
        if elapsed < options.min_interval {
            sleep_unless_shutdown(options.min_interval - elapsed, shutdown);
        }
    }
    info!(cursor = capturer.cursor().current(), "capture loop stopped");
    Ok(())
}

pub(crate) enum WorkItem {
    Update(Value),
    /// Run a cycle now, even with nothing queued, and report back.
    Sync(Sender<Result<CycleReport, String>>),
}

/// Single consumer for webhook deliveries. Updates stay queued in memory
/// until a cycle stores them; the webhook already acknowledged them, so
/// dropping them on a failed write would lose posts.
pub(crate) fn run_push_worker<S: RemoteStore>(
    mut capturer: Capturer<S>,
    rx: Receiver<WorkItem>,
    notifier: &dyn Notifier,
    retry: RetryPolicy,
    shutdown: &AtomicBool,
) -> CaptureResult<()> {
    let mut pending: Vec<Value> = Vec::new();
    let mut waiting: Vec<Sender<Result<CycleReport, String>>> = Vec::new();
    let mut failures = 0u32;
    let mut retry_at: Option<Instant> = None;
    let mut disconnected = false;

    loop {
        let wait = retry_at
            .map(|at| at.saturating_duration_since(Instant::now()).min(IDLE_WAIT))
            .unwrap_or(IDLE_WAIT)
            .max(Duration::from_millis(1));
        match rx.recv_timeout(wait) {
            Ok(item) => absorb(item, &mut pending, &mut waiting),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => disconnected = true,
        }
        while let Ok(item) = rx.try_recv() {
            absorb(item, &mut pending, &mut waiting);
        }

        let stopping = disconnected || shutdown.load(Ordering::SeqCst);
        if pending.is_empty() && waiting.is_empty() {
            if stopping {
                break;
            }
            continue;
        }
        let due = retry_at.is_none_or(|at| Instant::now() >= at);
        if !due && waiting.is_empty() && !stopping {
            continue;
        }

        match capturer.push_cycle(&pending) {
            Ok(report) => {
                pending.clear();
                failures = 0;
                retry_at = None;
                log_report(&report);
                reply_to_triggers(notifier, &report.triggers, &report.summary());
                for reply in waiting.drain(..) {
                    let _ = reply.send(Ok(report.clone()));
                }
            }
            Err(err) if err.is_retryable() => {
                failures += 1;
                let delay = backoff_delay(failures, retry.base, retry.max);
                retry_at = Some(Instant::now() + delay);
                warn!(
                    error = %err,
                    failures,
                    pending = pending.len(),
                    delay_ms = delay.as_millis() as u64,
                    "capture cycle failed, keeping updates queued"
                );
                for reply in waiting.drain(..) {
                    let _ = reply.send(Err(err.to_string()));
                }
                if stopping {
                    error!(pending = pending.len(), "stopping with updates that were never stored");
                    break;
                }
            }
            Err(err) => {
                error!(
                    error = %err,
                    pending = pending.len(),
                    "capture cycle failed and cannot be retried, queued updates are lost"
                );
                for reply in waiting.drain(..) {
                    let _ = reply.send(Err(err.to_string()));
                }
                return Err(err);
            }
        }
        if stopping {
            break;
        }
    }
    info!(cursor = capturer.cursor().current(), "capture worker stopped");
    Ok(())
}

fn absorb(
    item: WorkItem,
    pending: &mut Vec<Value>,
    waiting: &mut Vec<Sender<Result<CycleReport, String>>>,
) {
    match item {
        WorkItem::Update(update) => pending.push(update),
        WorkItem::Sync(reply) => waiting.push(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Layout;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::cell::RefCell;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;

    const KEY: &str = "telegram_posts.json";

    fn post(update_id: i64, message_id: i64, text: &str) -> Value {
        json!({
            "update_id": update_id,
            "channel_post": {
                "message_id": message_id,
                "date": 1_700_000_000 + message_id,
                "chat": {"id": -100, "username": "news"},
                "text": text
            }
        })
    }

    fn options() -> CaptureOptions {
        CaptureOptions {
            filter: ChannelFilter::Any,
            policy: DedupPolicy::Id,
            trigger_command: "/safe".to_string(),
        }
    }

    fn capturer(store: &Arc<MemoryStore>, layout: Layout) -> Capturer<Arc<MemoryStore>> {
        Capturer::new(ArchiveRepo::new(Arc::clone(store), KEY, layout), options())
    }

    fn stored(store: &MemoryStore) -> Archive {
        Archive::from_json(&store.get(KEY).expect("archive stored")).unwrap()
    }

    fn ids(archive: &Archive) -> Vec<i64> {
        archive.messages.iter().map(|m| m.id).collect()
    }

    /// Serves updates with `update_id >= offset`, like getUpdates does.
    struct FakeSource {
        updates: Vec<Value>,
        offsets: RefCell<Vec<i64>>,
        fail: RefCell<bool>,
    }

    impl FakeSource {
        fn new(updates: Vec<Value>) -> Self {
            Self {
                updates,
                offsets: RefCell::new(Vec::new()),
                fail: RefCell::new(false),
            }
        }
    }

    impl UpdateSource for FakeSource {
        fn get_updates(&self, offset: i64, _timeout_secs: u64) -> Result<Vec<Value>, crate::bridges::SourceError> {
            self.offsets.borrow_mut().push(offset);
            if *self.fail.borrow() {
                return Err(crate::bridges::SourceError::Transport("connection reset".into()));
            }
            Ok(self
                .updates
                .iter()
                .filter(|u| u["update_id"].as_i64().unwrap_or(0) >= offset)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, chat_id: i64, text: &str) {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
        }
    }

    #[test]
    fn first_post_into_empty_store() {
        let store = Arc::new(MemoryStore::new());
        let mut cap = capturer(&store, Layout::Combined);
        let report = cap.push_cycle(&[post(1, 1, "hi")]).unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.cursor, 2);
        let archive = stored(&store);
        assert_eq!(ids(&archive), vec![1]);
        assert_eq!(archive.cursor, 2);
        assert_eq!(cap.phase(), Phase::Idle);
    }

    #[test]
    fn known_post_is_not_added_twice() {
        let store = Arc::new(MemoryStore::new());
        let seeded = Archive {
            cursor: 0,
            messages: vec![MessageRecord::new(1, "hi", 0)],
        };
        store.insert(KEY, &seeded.to_json().unwrap());
        let mut cap = capturer(&store, Layout::Combined);
        let report = cap.push_cycle(&[post(1, 1, "hi"), post(2, 2, "next")]).unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(ids(&stored(&store)), vec![1, 2]);
    }

    #[test]
    fn missing_archive_starts_from_zero() {
        let store = Arc::new(MemoryStore::new());
        let source = FakeSource::new(Vec::new());
        let mut cap = capturer(&store, Layout::Combined);
        let report = cap.pull_cycle(&source, 0).unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.cursor, 0);
        assert!(!report.persisted);
        assert_eq!(*source.offsets.borrow(), vec![0]);
        assert!(store.get(KEY).is_none());
    }

    #[test]
    fn restart_resumes_from_stored_cursor() {
        let store = Arc::new(MemoryStore::new());
        store.insert(KEY, br#"{"cursor": 7, "messages": [{"id": 1, "text": "old"}]}"#);
        let source = FakeSource::new(vec![post(6, 1, "old"), post(7, 2, "new")]);
        let mut cap = capturer(&store, Layout::Combined);
        let report = cap.pull_cycle(&source, 0).unwrap();
        assert_eq!(*source.offsets.borrow(), vec![7]);
        assert_eq!(report.added, 1);
        assert_eq!(report.cursor, 8);
    }

    /// Edits the stored archive while the long poll is in flight.
    struct EditingSource {
        store: Arc<MemoryStore>,
        updates: Vec<Value>,
    }

    impl UpdateSource for EditingSource {
        fn get_updates(&self, _offset: i64, _timeout_secs: u64) -> Result<Vec<Value>, crate::bridges::SourceError> {
            self.store.insert(KEY, br#"{"cursor": 0, "messages": [{"id": 50, "text": "added by hand"}]}"#);
            Ok(self.updates.clone())
        }
    }

    #[test]
    fn archive_is_read_after_the_long_poll() {
        let store = Arc::new(MemoryStore::new());
        let mut cap = capturer(&store, Layout::Combined);
        cap.push_cycle(&[]).unwrap();
        let source = EditingSource {
            store: Arc::clone(&store),
            updates: vec![post(1, 60, "fresh")],
        };
        let report = cap.pull_cycle(&source, 0).unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(ids(&stored(&store)), vec![50, 60]);
    }

    #[test]
    fn failed_write_refetches_same_range() {
        let store = Arc::new(MemoryStore::new());
        let source = FakeSource::new(vec![post(5, 10, "a"), post(6, 11, "b")]);
        let mut cap = capturer(&store, Layout::Combined);

        store.fail_puts_to(KEY, true);
        let err = cap.pull_cycle(&source, 0).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cap.cursor().current(), 0);

        store.fail_puts_to(KEY, false);
        let report = cap.pull_cycle(&source, 0).unwrap();
        assert_eq!(*source.offsets.borrow(), vec![0, 0]);
        assert_eq!(report.added, 2);
        assert_eq!(ids(&stored(&store)), vec![10, 11]);
        assert_eq!(stored(&store).cursor, 7);
    }

    #[test]
    fn crash_between_collection_and_cursor_write() {
        let store = Arc::new(MemoryStore::new());
        let source = FakeSource::new(vec![post(1, 100, "a"), post(2, 101, "b")]);
        let cursor_key = format!("{KEY}.cursor");

        let mut first = capturer(&store, Layout::Split);
        store.fail_puts_to(&cursor_key, true);
        assert!(first.pull_cycle(&source, 0).is_err());
        let collection_after_crash = store.get(KEY).unwrap();
        assert!(store.get(&cursor_key).is_none());
        drop(first);

        // A fresh process with the old cursor sees the same updates again.
        store.fail_puts_to(&cursor_key, false);
        let mut restarted = capturer(&store, Layout::Split);
        let report = restarted.pull_cycle(&source, 0).unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(report.cursor, 3);
        assert_eq!(store.get(KEY).unwrap(), collection_after_crash);
        assert_eq!(store.get(&cursor_key).unwrap(), b"3");
        let archive = restarted.repo().load().unwrap();
        assert_eq!(ids(&archive), vec![100, 101]);
    }

    #[test]
    fn unchanged_collection_is_not_rewritten() {
        let store = Arc::new(MemoryStore::new());
        let source = FakeSource::new(vec![post(1, 1, "a")]);
        let mut cap = capturer(&store, Layout::Split);
        cap.pull_cycle(&source, 0).unwrap();
        let puts = store.put_count();

        // Only a non-post update arrives; the cursor moves, the collection does not.
        let extra = FakeSource::new(vec![json!({"update_id": 2, "message": {"message_id": 5, "chat": {"id": 1}, "text": "hey"}})]);
        let report = cap.pull_cycle(&extra, 0).unwrap();
        assert_eq!(report.cursor, 3);
        assert_eq!(store.put_count(), puts + 1);
    }

    #[test]
    fn cursor_never_decreases_across_cycles() {
        let store = Arc::new(MemoryStore::new());
        let mut cap = capturer(&store, Layout::Combined);
        let mut last = 0;
        for batch in [vec![post(3, 3, "c")], vec![post(1, 1, "a")], vec![], vec![post(9, 9, "i")]] {
            let report = cap.push_cycle(&batch).unwrap();
            assert!(report.cursor >= last);
            last = report.cursor;
        }
        assert_eq!(last, 10);
        assert_eq!(ids(&stored(&store)), vec![3, 1, 9]);
    }

    #[test]
    fn fetch_failure_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let source = FakeSource::new(vec![post(1, 1, "a")]);
        *source.fail.borrow_mut() = true;
        let mut cap = capturer(&store, Layout::Combined);
        let err = cap.pull_cycle(&source, 0).unwrap_err();
        assert!(matches!(err, CaptureError::SourceUnavailable(_)));
        assert_eq!(store.put_count(), 0);
        assert_eq!(cap.phase(), Phase::Idle);
    }

    #[test]
    fn import_snapshot_reconciles_without_touching_cursor() {
        let store = Arc::new(MemoryStore::new());
        let mut cap = capturer(&store, Layout::Combined);
        cap.push_cycle(&[post(1, 1, "a"), post(2, 2, "b")]).unwrap();
        let report = cap
            .import_cycle(vec![MessageRecord::new(2, "b", 0), MessageRecord::new(3, "c", 0)], MergeMode::Snapshot)
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 1);
        let archive = stored(&store);
        assert_eq!(ids(&archive), vec![2, 3]);
        assert_eq!(archive.cursor, 3);
    }

    #[test]
    fn poll_loop_replies_to_trigger_and_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let source = FakeSource::new(vec![
            post(1, 1, "a"),
            json!({"update_id": 2, "message": {"message_id": 2, "chat": {"id": 55}, "text": "/safe"}}),
        ]);
        let notifier = RecordingNotifier::default();
        let shutdown = AtomicBool::new(false);
        let mut cap = capturer(&store, Layout::Combined);

        // One cycle, then the notifier flips shutdown through the min-interval wait.
        struct StopAfterFirst<'a>(&'a RecordingNotifier, &'a AtomicBool);
        impl Notifier for StopAfterFirst<'_> {
            fn notify(&self, chat_id: i64, text: &str) {
                self.0.notify(chat_id, text);
                self.1.store(true, Ordering::SeqCst);
            }
        }
        let options = PollOptions {
            poll_timeout_secs: 0,
            min_interval: Duration::from_millis(10),
            retry: RetryPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
            },
        };
        run_poll_loop(&mut cap, &source, &StopAfterFirst(&notifier, &shutdown), options, &shutdown).unwrap();

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 55);
        assert!(sent[0].1.contains("1 new post"));
        assert_eq!(stored(&store).cursor, 3);
    }

    #[test]
    fn poll_loop_stops_on_corrupt_archive() {
        let store = Arc::new(MemoryStore::new());
        store.insert(KEY, b"{broken");
        let source = FakeSource::new(vec![post(1, 1, "a")]);
        let shutdown = AtomicBool::new(false);
        let mut cap = capturer(&store, Layout::Combined);
        let options = PollOptions {
            poll_timeout_secs: 0,
            min_interval: Duration::ZERO,
            retry: RetryPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(1),
            },
        };
        let err = run_poll_loop(&mut cap, &source, &NoopNotifierForTest, options, &shutdown).unwrap_err();
        assert!(matches!(err, CaptureError::CorruptArchive { .. }));
        assert_eq!(store.get(KEY).unwrap(), b"{broken");
    }

    struct NoopNotifierForTest;

    impl Notifier for NoopNotifierForTest {
        fn notify(&self, _chat_id: i64, _text: &str) {}
    }

    #[test]
    fn push_worker_keeps_updates_until_stored() {
        let store = Arc::new(MemoryStore::new());
        store.fail_puts_to(KEY, true);
        let cap = capturer(&store, Layout::Combined);
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::clone(&shutdown);
        let retry = RetryPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
        };
        let worker = thread::spawn(move || run_push_worker(cap, rx, &NoopNotifierForTest, retry, &worker_shutdown));

        tx.send(WorkItem::Update(post(1, 1, "first"))).unwrap();
        tx.send(WorkItem::Update(post(2, 2, "second"))).unwrap();

        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(WorkItem::Sync(reply_tx)).unwrap();
        assert!(reply_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_err());

        store.fail_puts_to(KEY, false);
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(WorkItem::Sync(reply_tx)).unwrap();
        let report = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.cursor, 3);

        drop(tx);
        worker.join().unwrap().unwrap();
        assert_eq!(ids(&stored(&store)), vec![1, 2]);
    }

    #[test]
    fn push_worker_stops_on_unreadable_archive() {
        let store = Arc::new(MemoryStore::new());
        let foreign = br#"{"posts": ["a"], "owner": "someone else"}"#;
        store.insert(KEY, foreign);
        let cap = capturer(&store, Layout::Combined);
        let (tx, rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(WorkItem::Update(post(1, 1, "queued"))).unwrap();
        tx.send(WorkItem::Sync(reply_tx)).unwrap();
        let shutdown = AtomicBool::new(false);
        let retry = RetryPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(1),
        };
        let err = run_push_worker(cap, rx, &NoopNotifierForTest, retry, &shutdown).unwrap_err();
        assert!(matches!(err, CaptureError::CorruptArchive { .. }));
        assert!(reply_rx.recv_timeout(Duration::from_secs(1)).unwrap().is_err());
        assert_eq!(store.get(KEY).unwrap(), foreign.to_vec());
    }

    #[test]
    fn push_worker_flushes_on_disconnect() {
        let store = Arc::new(MemoryStore::new());
        let cap = capturer(&store, Layout::Combined);
        let (tx, rx) = mpsc::channel();
        let shutdown = AtomicBool::new(false);
        tx.send(WorkItem::Update(post(4, 4, "late"))).unwrap();
        drop(tx);
        let retry = RetryPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(1),
        };
        run_push_worker(cap, rx, &NoopNotifierForTest, retry, &shutdown).unwrap();
        assert_eq!(ids(&stored(&store)), vec![4]);
    }
}
