// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Write-ahead recovery log for two-phase commit.
//!
//! Every phase transition of a transaction is appended here before the node
//! acts on it, so a restarted coordinator or participant can tell which
//! transactions were left without a decision.
//!
//! ## Critical Invariants
//!
//! 1. An entry is durable once `append` returns `Ok`
//! 2. A transaction has at most one terminal record (COMMIT or ABORT)
//! 3. Replay tolerates a torn tail: a partial or corrupt last record ends the scan,
//!    and reopening a file log truncates it back to the last valid record
//! 4. END follows a terminal record once every participant acknowledged it
//!
//! The log is owned by a single node and role. Coordinator and participant
//! records live in separate logs so their recovery sweeps never mix.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transaction::{Operation, TxOutcome};
use crate::tx_id::TxId;
use crate::{now_epoch_millis, EpochMillis, NodeId};

/// Phase tag of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogPhase {
    Start,
    Prepare,
    Commit,
    Abort,
    /// Every participant acknowledged the decision.
    End,
}

impl LogPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LogPhase::Commit | LogPhase::Abort)
    }

    pub fn outcome(self) -> Option<TxOutcome> {
        match self {
            LogPhase::Commit => Some(TxOutcome::Committed),
            LogPhase::Abort => Some(TxOutcome::Aborted),
            LogPhase::Start | LogPhase::Prepare | LogPhase::End => None,
        }
    }
}

impl From<TxOutcome> for LogPhase {
    fn from(outcome: TxOutcome) -> Self {
        match outcome {
            TxOutcome::Committed => LogPhase::Commit,
            TxOutcome::Aborted => LogPhase::Abort,
        }
    }
}

/// One durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryLogEntry {
    pub tx_id: TxId,
    pub phase: LogPhase,
    /// Node that wrote the record.
    pub node_id: NodeId,
    pub timestamp: EpochMillis,
    /// Participants on coordinator records, the coordinator on participant records.
    pub peers: Vec<NodeId>,
    /// Operations a participant prepared; empty elsewhere.
    pub operations: Vec<Operation>,
}

impl RecoveryLogEntry {
    pub fn new(tx_id: TxId, phase: LogPhase, node_id: impl Into<NodeId>) -> Self {
        Self {
            tx_id,
            phase,
            node_id: node_id.into(),
            timestamp: now_epoch_millis(),
            peers: Vec::new(),
            operations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_peers(mut self, peers: Vec<NodeId>) -> Self {
        self.peers = peers;
        self
    }

    #[must_use]
    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }
}

/// Durable append-only storage behind a [`RecoveryLog`].
pub trait DurableLog: Send {
    /// Persist `entry`. Must not return until the record survives a crash.
    fn append(&mut self, entry: &RecoveryLogEntry) -> Result<()>;

    /// All records in append order.
    fn scan(&self) -> Result<Vec<RecoveryLogEntry>>;
}

/// Volatile backend for tests and nodes without local disk.
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    entries: Vec<RecoveryLogEntry>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableLog for MemoryLog {
    fn append(&mut self, entry: &RecoveryLogEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn scan(&self) -> Result<Vec<RecoveryLogEntry>> {
        Ok(self.entries.clone())
    }
}

/// Records above this size are treated as a corrupt tail.
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// File backend: `u32` little-endian length prefix, bincode body, fsync per
/// record.
pub struct FileLog {
    file: BufWriter<File>,
    path: PathBuf,
    entry_count: u64,
}

impl FileLog {
    /// Open or create a log file, cutting off any torn tail so new records
    /// land directly after the last valid one.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (entries, valid_len) = read_records(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                file_len,
                valid_len,
                "Truncating torn recovery log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;
        let entry_count = entries.len() as u64;

        Ok(Self {
            file: BufWriter::new(file),
            path,
            entry_count,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableLog for FileLog {
    fn append(&mut self, entry: &RecoveryLogEntry) -> Result<()> {
        let bytes = bincode::serialize(entry)?;

        self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        self.entry_count += 1;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<RecoveryLogEntry>> {
        Ok(read_records(&self.path)?.0)
    }
}

/// Decode records up to the first torn or corrupt one. Also returns the byte
/// offset just past the last valid record.
fn read_records(path: &Path) -> io::Result<(Vec<RecoveryLogEntry>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }

    let mut reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_BYTES {
            tracing::warn!(path = %path.display(), len, "Oversized recovery log record, stopping replay");
            break;
        }
        let mut data = vec![0u8; len];
        match reader.read_exact(&mut data) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        match bincode::deserialize::<RecoveryLogEntry>(&data) {
            Ok(entry) => {
                entries.push(entry);
                valid_len += 4 + len as u64;
            },
            Err(_) => {
                tracing::warn!(path = %path.display(), "Corrupt recovery log record, stopping replay");
                break;
            },
        }
    }

    Ok((entries, valid_len))
}

/// Index over a [`DurableLog`] answering recovery questions.
pub struct RecoveryLog {
    inner: Mutex<LogInner>,
}

struct LogInner {
    backend: Box<dyn DurableLog>,
    by_tx: HashMap<TxId, Vec<RecoveryLogEntry>>,
    /// First-seen order of transaction ids.
    order: Vec<TxId>,
    len: usize,
}

/// What a recovery sweep has to do, derived from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryState {
    /// Logged START only.
    pub started: Vec<TxId>,
    /// Logged PREPARE with no decision.
    pub in_doubt: Vec<TxId>,
    pub committed: Vec<TxId>,
    pub aborted: Vec<TxId>,
    /// Decided after PREPARE but never logged END.
    pub unacknowledged: Vec<TxId>,
}

impl RecoveryLog {
    /// Wrap `backend`, indexing whatever it already holds.
    pub fn open(backend: impl DurableLog + 'static) -> Result<Self> {
        let existing = backend.scan()?;
        let mut inner = LogInner {
            backend: Box::new(backend),
            by_tx: HashMap::new(),
            order: Vec::new(),
            len: 0,
        };
        for entry in existing {
            inner.index(entry);
        }
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                backend: Box::new(MemoryLog::new()),
                by_tx: HashMap::new(),
                order: Vec::new(),
                len: 0,
            }),
        }
    }

    /// Durably append `entry`. A second terminal record for the same
    /// transaction is dropped if it agrees with the first and rejected if it
    /// contradicts it.
    pub fn append(&self, entry: RecoveryLogEntry) -> Result<()> {
        let mut inner = self.inner.lock();

        if entry.phase.is_terminal() {
            if let Some(existing) = inner.terminal_phase(&entry.tx_id) {
                if existing == entry.phase {
                    return Ok(());
                }
                return Err(crate::error::ProtocolError::AlreadyDecided(entry.tx_id).into());
            }
        }
        if entry.phase == LogPhase::End && inner.has_phase(&entry.tx_id, LogPhase::End) {
            return Ok(());
        }

        inner.backend.append(&entry)?;
        tracing::debug!(tx_id = %entry.tx_id, phase = ?entry.phase, "Recovery log append");
        inner.index(entry);
        Ok(())
    }

    pub fn entries_for(&self, tx_id: &TxId) -> Vec<RecoveryLogEntry> {
        self.inner
            .lock()
            .by_tx
            .get(tx_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn terminal_phase(&self, tx_id: &TxId) -> Option<LogPhase> {
        self.inner.lock().terminal_phase(tx_id)
    }

    /// Ids with any record but no COMMIT or ABORT, in first-seen order.
    pub fn ids_without_terminal_record(&self) -> Vec<TxId> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter(|id| inner.terminal_phase(id).is_none())
            .cloned()
            .collect()
    }

    /// Ids with a PREPARE record and no decision.
    pub fn in_doubt(&self) -> Vec<TxId> {
        self.recovery_state().in_doubt
    }

    pub fn recovery_state(&self) -> RecoveryState {
        let inner = self.inner.lock();
        let mut state = RecoveryState::default();
        for id in &inner.order {
            let prepared = inner.has_phase(id, LogPhase::Prepare);
            match inner.terminal_phase(id) {
                Some(phase) => {
                    if phase == LogPhase::Commit {
                        state.committed.push(id.clone());
                    } else {
                        state.aborted.push(id.clone());
                    }
                    if prepared && !inner.has_phase(id, LogPhase::End) {
                        state.unacknowledged.push(id.clone());
                    }
                },
                None if prepared => state.in_doubt.push(id.clone()),
                None => state.started.push(id.clone()),
            }
        }
        state
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogInner {
    fn index(&mut self, entry: RecoveryLogEntry) {
        if !self.by_tx.contains_key(&entry.tx_id) {
            self.order.push(entry.tx_id.clone());
        }
        self.by_tx.entry(entry.tx_id.clone()).or_default().push(entry);
        self.len += 1;
    }

    fn terminal_phase(&self, tx_id: &TxId) -> Option<LogPhase> {
        self.by_tx
            .get(tx_id)?
            .iter()
            .map(|e| e.phase)
            .find(|p| p.is_terminal())
    }

    fn has_phase(&self, tx_id: &TxId, phase: LogPhase) -> bool {
        self.by_tx
            .get(tx_id)
            .is_some_and(|records| records.iter().any(|e| e.phase == phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(tx: &str, phase: LogPhase) -> RecoveryLogEntry {
        RecoveryLogEntry::new(TxId::from(tx), phase, "coord")
    }

    #[test]
    fn test_file_log_append_and_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.log");

        let mut log = FileLog::open(&path).unwrap();
        log.append(&entry("t1", LogPhase::Start).with_peers(vec!["a".into(), "b".into()]))
            .unwrap();
        log.append(&entry("t1", LogPhase::Prepare)).unwrap();
        assert_eq!(log.entry_count(), 2);

        let entries = log.scan().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].peers, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(entries[1].phase, LogPhase::Prepare);
    }

    #[test]
    fn test_file_log_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.log");
        {
            let mut log = FileLog::open(&path).unwrap();
            log.append(&entry("t1", LogPhase::Start)).unwrap();
        }
        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.entry_count(), 1);
        assert_eq!(log.path(), path.as_path());
    }

    #[test]
    fn test_file_log_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.log");
        {
            let mut log = FileLog::open(&path).unwrap();
            log.append(&entry("t1", LogPhase::Start)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&100u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.scan().unwrap().len(), 1);
    }

    #[test]
    fn test_append_after_torn_tail_is_replayed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.log");
        {
            let log = RecoveryLog::open(FileLog::open(&path).unwrap()).unwrap();
            log.append(entry("t1", LogPhase::Prepare)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&100u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        {
            let log = RecoveryLog::open(FileLog::open(&path).unwrap()).unwrap();
            assert_eq!(log.in_doubt(), vec![TxId::from("t1")]);
            log.append(entry("t1", LogPhase::Abort)).unwrap();
        }

        let log = RecoveryLog::open(FileLog::open(&path).unwrap()).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.terminal_phase(&TxId::from("t1")), Some(LogPhase::Abort));
        assert!(log.in_doubt().is_empty());
    }

    #[test]
    fn test_oversized_length_prefix_ends_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.log");
        {
            let mut log = FileLog::open(&path).unwrap();
            log.append(&entry("t1", LogPhase::Start)).unwrap();
        }
        let valid_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }

        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.entry_count(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[test]
    fn test_file_log_corrupt_record_stops_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.log");
        {
            let mut log = FileLog::open(&path).unwrap();
            log.append(&entry("t1", LogPhase::Start)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&4u32.to_le_bytes()).unwrap();
            f.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap();
        }
        assert_eq!(FileLog::open(&path).unwrap().scan().unwrap().len(), 1);
    }

    #[test]
    fn test_recovery_log_rebuilds_index_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.log");
        {
            let log = RecoveryLog::open(FileLog::open(&path).unwrap()).unwrap();
            log.append(entry("t1", LogPhase::Start)).unwrap();
            log.append(entry("t1", LogPhase::Prepare)).unwrap();
            log.append(entry("t2", LogPhase::Start)).unwrap();
            log.append(entry("t2", LogPhase::Abort)).unwrap();
        }
        let log = RecoveryLog::open(FileLog::open(&path).unwrap()).unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log.in_doubt(), vec![TxId::from("t1")]);
        assert_eq!(log.terminal_phase(&TxId::from("t2")), Some(LogPhase::Abort));
    }

    #[test]
    fn test_ids_without_terminal_record() {
        let log = RecoveryLog::in_memory();
        log.append(entry("t1", LogPhase::Start)).unwrap();
        log.append(entry("t2", LogPhase::Start)).unwrap();
        log.append(entry("t2", LogPhase::Prepare)).unwrap();
        log.append(entry("t3", LogPhase::Start)).unwrap();
        log.append(entry("t3", LogPhase::Commit)).unwrap();

        assert_eq!(
            log.ids_without_terminal_record(),
            vec![TxId::from("t1"), TxId::from("t2")]
        );

        let state = log.recovery_state();
        assert_eq!(state.started, vec![TxId::from("t1")]);
        assert_eq!(state.in_doubt, vec![TxId::from("t2")]);
        assert_eq!(state.committed, vec![TxId::from("t3")]);
        assert!(state.aborted.is_empty());
        assert!(state.unacknowledged.is_empty());
    }

    #[test]
    fn test_decision_without_end_is_unacknowledged() {
        let log = RecoveryLog::in_memory();
        log.append(entry("t1", LogPhase::Prepare)).unwrap();
        log.append(entry("t1", LogPhase::Commit)).unwrap();
        log.append(entry("t2", LogPhase::Prepare)).unwrap();
        log.append(entry("t2", LogPhase::Abort)).unwrap();
        log.append(entry("t2", LogPhase::End)).unwrap();
        log.append(entry("t2", LogPhase::End)).unwrap();

        let state = log.recovery_state();
        assert_eq!(state.unacknowledged, vec![TxId::from("t1")]);
        assert_eq!(state.aborted, vec![TxId::from("t2")]);
        assert_eq!(log.entries_for(&TxId::from("t2")).len(), 3);
        assert_eq!(LogPhase::End.outcome(), None);
        assert!(!LogPhase::End.is_terminal());
    }

    #[test]
    fn test_duplicate_terminal_is_noop() {
        let log = RecoveryLog::in_memory();
        log.append(entry("t1", LogPhase::Abort)).unwrap();
        log.append(entry("t1", LogPhase::Abort)).unwrap();
        assert_eq!(log.entries_for(&TxId::from("t1")).len(), 1);
    }

    #[test]
    fn test_contradicting_terminal_rejected() {
        let log = RecoveryLog::in_memory();
        log.append(entry("t1", LogPhase::Commit)).unwrap();
        assert!(log.append(entry("t1", LogPhase::Abort)).is_err());
        assert_eq!(log.terminal_phase(&TxId::from("t1")), Some(LogPhase::Commit));
    }

    #[test]
    fn test_entries_for_unknown_is_empty() {
        let log = RecoveryLog::in_memory();
        assert!(log.entries_for(&TxId::from("nope")).is_empty());
        assert!(log.is_empty());
    }
}
