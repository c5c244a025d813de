// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable engine state.
//!
//! Readers get a consistent snapshot at any time. Writers go through
//! [`StateStore::commit`], which holds the log lock for the whole step: the
//! step's events are applied to a private draft, appended to the log as one
//! batch, and only then published. A step that fails, or whose batch cannot
//! be persisted, leaves no trace.

use super::audit::{apply_state_transition, replay, Event, EventType};
use super::guard::{GuardRegistry, SharedGuards};
use super::{EngineState, InitArg};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{now_millis, BlockNumber};
use arc_swap::ArcSwap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Largest page served by [`StateStore::history`].
pub const MAX_HISTORY_PAGE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit log entry {index} is malformed: {source}")]
    Malformed {
        index: usize,
        source: serde_json::Error,
    },
    #[error("failed to encode audit event: {0}")]
    Encode(serde_json::Error),
}

/// Append-only storage of audit events.
pub trait EventLog: Send + Sync {
    /// Appends all events or none of them.
    fn append(&mut self, events: &[Event]) -> Result<(), StoreError>;
    fn read_all(&self) -> Result<Vec<Event>, StoreError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn read_range(&self, start: usize, len: usize) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .skip(start)
            .take(len)
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Vec<Event>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&mut self, events: &[Event]) -> Result<(), StoreError> {
        self.events.extend_from_slice(events);
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Event>, StoreError> {
        Ok(self.events.clone())
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn read_range(&self, start: usize, len: usize) -> Result<Vec<Event>, StoreError> {
        Ok(self.events.iter().skip(start).take(len).cloned().collect())
    }
}

/// One JSON-encoded event per line. A batch is written with a single
/// `write_all` and synced before the commit returns. A batch that fails
/// half way is cut off again, and a partial last line left by a crash is
/// dropped on open.
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    file: File,
    len: usize,
}

type NumberedLine = (usize, std::io::Result<String>);

fn parse_entry((index, line): NumberedLine) -> Result<Event, StoreError> {
    serde_json::from_str(&line?).map_err(|source| StoreError::Malformed { index, source })
}

impl FileEventLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let mut log = Self { path, file, len: 0 };
        log.drop_partial_tail()?;
        log.len = log.read_all()?.len();
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cuts the file back to its last complete line.
    fn drop_partial_tail(&mut self) -> Result<(), StoreError> {
        let bytes = std::fs::read(&self.path)?;
        if bytes.last().map_or(true, |last| *last == b'\n') {
            return Ok(());
        }
        let keep = bytes
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |newline| newline + 1);
        warn!(
            "[StateStore] Dropping {} bytes of an incomplete entry at the end of {}",
            bytes.len() - keep,
            self.path.display()
        );
        self.file.set_len(keep as u64)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Runs `write` against the file and truncates whatever it wrote if it
    /// fails.
    fn write_or_truncate<F>(&mut self, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut File) -> std::io::Result<()>,
    {
        let end = self.file.metadata()?.len();
        if let Err(err) = write(&mut self.file) {
            match self.file.set_len(end) {
                Ok(()) => warn!(
                    "[StateStore] Audit log write failed, truncated back to {} bytes: {}",
                    end, err
                ),
                Err(truncate_err) => error!(
                    "[StateStore] Audit log write failed ({}) and truncating to {} bytes failed too: {}",
                    err, end, truncate_err
                ),
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Non-empty lines with their line index.
    fn lines(&self) -> Result<impl Iterator<Item = NumberedLine>, StoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(reader
            .lines()
            .enumerate()
            .filter(|(_, line)| !matches!(line, Ok(text) if text.trim().is_empty())))
    }
}

impl EventLog for FileEventLog {
    fn append(&mut self, events: &[Event]) -> Result<(), StoreError> {
        let mut batch = Vec::new();
        for event in events {
            serde_json::to_writer(&mut batch, event).map_err(StoreError::Encode)?;
            batch.push(b'\n');
        }
        self.write_or_truncate(|file| {
            file.write_all(&batch)?;
            file.sync_data()
        })?;
        self.len += events.len();
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Event>, StoreError> {
        self.lines()?.map(parse_entry).collect()
    }

    fn len(&self) -> usize {
        self.len
    }

    // Lines before `start` are skipped without being decoded.
    fn read_range(&self, start: usize, len: usize) -> Result<Vec<Event>, StoreError> {
        self.lines()?.skip(start).take(len).map(parse_entry).collect()
    }
}

/// Draft of the state under construction by one committing step.
pub struct Transition {
    state: EngineState,
    events: Vec<EventType>,
}

impl Transition {
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Applies `event` to the draft right away, so later decisions in the same
    /// step see its effect.
    pub fn record(&mut self, event: EventType) -> BridgeResult<()> {
        apply_state_transition(&mut self.state, &event)?;
        self.events.push(event);
        Ok(())
    }

    pub fn recorded(&self) -> usize {
        self.events.len()
    }
}

pub struct StateStore {
    state: ArcSwap<EngineState>,
    log: Mutex<Box<dyn EventLog>>,
    guards: SharedGuards,
    last_observed_block: AtomicU64,
}

impl StateStore {
    /// Starts a fresh log with `init` as its first event.
    pub fn initialize(init: InitArg, mut log: Box<dyn EventLog>) -> BridgeResult<Self> {
        if !log.is_empty() {
            return Err(BridgeError::InvalidReplay(format!(
                "cannot initialize a non-empty audit log ({} events)",
                log.len()
            )));
        }
        let state = EngineState::from_init(&init)?;
        log.append(&[Event {
            timestamp: now_millis(),
            payload: EventType::Init(init),
        }])?;
        Ok(Self::with_state(state, log))
    }

    /// Rebuilds the state by replaying an existing log.
    pub fn restore(log: Box<dyn EventLog>) -> BridgeResult<Self> {
        let events = log.read_all()?;
        let state = replay(&events)?;
        info!(
            "[StateStore] Replayed {} audit events, last scraped block {}",
            events.len(),
            state.last_scraped_block
        );
        Ok(Self::with_state(state, log))
    }

    /// Restores from `log` if it has events, otherwise initializes it.
    pub fn open(init: InitArg, log: Box<dyn EventLog>) -> BridgeResult<Self> {
        if log.is_empty() {
            info!("[StateStore] Empty audit log, initializing");
            Self::initialize(init, log)
        } else {
            let store = Self::restore(log)?;
            if store.read().chain_id != init.chain_id {
                warn!(
                    "[StateStore] Configured chain id {} differs from recorded {}, keeping recorded",
                    init.chain_id,
                    store.read().chain_id
                );
            }
            Ok(store)
        }
    }

    fn with_state(state: EngineState, log: Box<dyn EventLog>) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
            log: Mutex::new(log),
            guards: GuardRegistry::shared(),
            last_observed_block: AtomicU64::new(0),
        }
    }

    /// Consistent point-in-time view of the state.
    pub fn snapshot(&self) -> Arc<EngineState> {
        self.state.load_full()
    }

    pub fn read(&self) -> arc_swap::Guard<Arc<EngineState>> {
        self.state.load()
    }

    pub fn guards(&self) -> &SharedGuards {
        &self.guards
    }

    /// Runs one engine step against a draft of the state and commits the
    /// events it recorded as a single batch.
    pub async fn commit<R, F>(&self, step: F) -> BridgeResult<R>
    where
        F: FnOnce(&mut Transition) -> BridgeResult<R>,
    {
        let mut log = self.log.lock().await;
        let mut tx = Transition {
            state: EngineState::clone(&self.state.load()),
            events: Vec::new(),
        };
        let result = step(&mut tx)?;
        if tx.events.is_empty() {
            return Ok(result);
        }
        let timestamp = now_millis();
        let batch: Vec<Event> = tx
            .events
            .into_iter()
            .map(|payload| Event { timestamp, payload })
            .collect();
        log.append(&batch)?;
        self.state.store(Arc::new(tx.state));
        Ok(result)
    }

    /// Convenience for a step that records a single event.
    pub async fn record(&self, event: EventType) -> BridgeResult<()> {
        self.commit(|tx| tx.record(event)).await
    }

    pub fn note_observed_block(&self, block: BlockNumber) {
        self.last_observed_block.fetch_max(block, Ordering::Relaxed);
    }

    pub fn last_observed_block(&self) -> Option<BlockNumber> {
        match self.last_observed_block.load(Ordering::Relaxed) {
            0 => None,
            block => Some(block),
        }
    }

    pub async fn event_count(&self) -> usize {
        self.log.lock().await.len()
    }

    /// A page of the audit log, at most [`MAX_HISTORY_PAGE`] events long.
    pub async fn history(&self, start: usize, len: usize) -> BridgeResult<Vec<Event>> {
        let log = self.log.lock().await;
        Ok(log.read_range(start, len.min(MAX_HISTORY_PAGE))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_arg, native_deposit};

    struct BrokenLog {
        inner: MemoryEventLog,
        fail: bool,
    }

    impl EventLog for BrokenLog {
        fn append(&mut self, events: &[Event]) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.append(events)
        }

        fn read_all(&self) -> Result<Vec<Event>, StoreError> {
            self.inner.read_all()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_and_persists() {
        let store = StateStore::initialize(init_arg(), Box::new(MemoryEventLog::new())).unwrap();
        let before = store.snapshot();
        let deposit = native_deposit(101, 0, 5_000);
        let recorded = store
            .commit(|tx| {
                tx.record(EventType::AcceptedEvent {
                    event: deposit.clone(),
                })?;
                assert!(tx.state().pending.contains_key(&deposit.source()));
                tx.record(EventType::SyncedToBlock { block_number: 150 })?;
                Ok(tx.recorded())
            })
            .await
            .unwrap();
        assert_eq!(recorded, 2);
        assert_eq!(store.event_count().await, 3);
        assert_eq!(store.read().last_scraped_block, 150);
        // Earlier snapshots are unaffected.
        assert!(before.pending.is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_leaves_no_trace() {
        let store = StateStore::initialize(init_arg(), Box::new(MemoryEventLog::new())).unwrap();
        let err = store
            .commit(|tx| {
                tx.record(EventType::SyncedToBlock { block_number: 500 })?;
                tx.record(EventType::SyncedToBlock { block_number: 400 })
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "invalid_state_transition");
        assert_eq!(store.event_count().await, 1);
        assert_eq!(store.read().last_scraped_block, init_arg().last_scraped_block);
    }

    #[tokio::test]
    async fn test_failed_append_publishes_nothing() {
        let mut log = BrokenLog {
            inner: MemoryEventLog::new(),
            fail: false,
        };
        log.append(&[Event {
            timestamp: 0,
            payload: EventType::Init(init_arg()),
        }])
        .unwrap();
        log.fail = true;
        let store = StateStore::restore(Box::new(log)).unwrap();
        let err = store
            .record(EventType::SyncedToBlock { block_number: 500 })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "storage_error");
        assert_eq!(store.read().last_scraped_block, init_arg().last_scraped_block);
    }

    #[tokio::test]
    async fn test_file_log_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let deposit = native_deposit(101, 0, 5_000);
        let live = {
            let store = StateStore::open(init_arg(), Box::new(FileEventLog::open(&path).unwrap()))
                .unwrap();
            store
                .record(EventType::AcceptedEvent {
                    event: deposit.clone(),
                })
                .await
                .unwrap();
            store
                .record(EventType::SyncedToBlock { block_number: 160 })
                .await
                .unwrap();
            store.snapshot()
        };
        let reopened =
            StateStore::open(init_arg(), Box::new(FileEventLog::open(&path).unwrap())).unwrap();
        assert_eq!(*reopened.snapshot(), *live);
        assert_eq!(reopened.event_count().await, 3);
        let page = reopened.history(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(matches!(page[0].payload, EventType::AcceptedEvent { .. }));
    }

    fn init_event() -> Event {
        Event {
            timestamp: 0,
            payload: EventType::Init(init_arg()),
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[tokio::test]
    async fn test_file_log_drops_incomplete_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let store =
                StateStore::open(init_arg(), Box::new(FileEventLog::open(&path).unwrap())).unwrap();
            store
                .record(EventType::SyncedToBlock { block_number: 150 })
                .await
                .unwrap();
        }
        // A crash in the middle of the next batch.
        append_raw(&path, br#"{"timestamp":5,"payload":{"SyncedTo"#);

        let log = FileEventLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        assert!(std::fs::read(&path).unwrap().ends_with(b"\n"));
        let store = StateStore::restore(Box::new(log)).unwrap();
        assert_eq!(store.read().last_scraped_block, 150);
        store
            .record(EventType::SyncedToBlock { block_number: 160 })
            .await
            .unwrap();
        drop(store);

        let reopened = FileEventLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 3);
        let store = StateStore::restore(Box::new(reopened)).unwrap();
        assert_eq!(store.read().last_scraped_block, 160);
    }

    #[test]
    fn test_file_log_keeps_malformed_complete_line_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        FileEventLog::open(&path)
            .unwrap()
            .append(&[init_event()])
            .unwrap();
        append_raw(&path, b"not json\n");
        assert!(matches!(
            FileEventLog::open(&path).unwrap_err(),
            StoreError::Malformed { index: 1, .. }
        ));
    }

    #[test]
    fn test_failed_file_write_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut log = FileEventLog::open(&path).unwrap();
        log.append(&[init_event()]).unwrap();
        let size = std::fs::metadata(&path).unwrap().len();

        let err = log
            .write_or_truncate(|file| {
                file.write_all(br#"{"timestamp":1,"pay"#)?;
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
        assert_eq!(log.len(), 1);

        // Later batches land on a clean line boundary.
        log.append(&[init_event()]).unwrap();
        assert_eq!(FileEventLog::open(&path).unwrap().read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_file_log_range_decodes_only_the_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut log = FileEventLog::open(&path).unwrap();
        log.append(&[init_event()]).unwrap();
        log.append(&[Event {
            timestamp: 1,
            payload: EventType::SyncedToBlock { block_number: 150 },
        }])
        .unwrap();
        append_raw(&path, b"\nnot json\n");

        let page = log.read_range(1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].payload, EventType::SyncedToBlock { block_number: 150 });
        assert!(matches!(
            log.read_range(1, 5).unwrap_err(),
            StoreError::Malformed { index: 3, .. }
        ));
        assert!(log.read_all().is_err());
    }

    #[tokio::test]
    async fn test_initialize_rejects_existing_log() {
        let mut log = MemoryEventLog::new();
        log.append(&[Event {
            timestamp: 0,
            payload: EventType::Init(init_arg()),
        }])
        .unwrap();
        assert!(StateStore::initialize(init_arg(), Box::new(log)).is_err());
    }

    #[tokio::test]
    async fn test_history_page_is_capped() {
        let store = StateStore::initialize(init_arg(), Box::new(MemoryEventLog::new())).unwrap();
        store
            .commit(|tx| {
                for block in 0..150 {
                    tx.record(EventType::SkippedBlock { block_number: block })?;
                }
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.history(0, 1_000).await.unwrap().len(), MAX_HISTORY_PAGE);
        assert_eq!(store.history(140, 100).await.unwrap().len(), 11);
    }

    #[test]
    fn test_observed_block_only_grows() {
        let store = StateStore::initialize(init_arg(), Box::new(MemoryEventLog::new())).unwrap();
        assert_eq!(store.last_observed_block(), None);
        store.note_observed_block(20);
        store.note_observed_block(10);
        assert_eq!(store.last_observed_block(), Some(20));
    }
}
