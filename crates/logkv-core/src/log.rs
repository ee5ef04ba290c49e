//! # log
//!
//! why: model the replicated log entries and the durable-store seam the consensus core drives
//! relations: entries travel the wire via message.rs, durably stored by logkv-storage
//! what: Operation, LogEntry, the LogStore trait, MemLog for tests

use std::io;
use std::sync::Mutex;

/// operation carried by a log entry
///
/// only PUT exists today; the discriminator is kept so a DELETE can be added
/// without changing the on-disk or wire encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Put,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "PUT",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "PUT" => Some(Operation::Put),
            _ => None,
        }
    }
}

/// A single entry in the replicated log
///
/// keys and values are non-empty and contain no whitespace, so one entry
/// always encodes as exactly five whitespace-separated tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// the index of this entry in the log (1-indexed, gap-free)
    pub index: u64,
    /// the term when this entry was created by a leader
    pub term: u64,
    /// what to do to the state machine
    pub op: Operation,
    pub key: String,
    pub value: String,
}

impl LogEntry {
    /// create a new log entry
    pub fn new(index: u64, term: u64, op: Operation, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            index,
            term,
            op,
            key: key.into(),
            value: value.into(),
        }
    }

    /// encode as one log-file line: `index term operation key value`
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.index,
            self.term,
            self.op.as_str(),
            self.key,
            self.value
        )
    }

    /// parse one log-file line, the inverse of [`LogEntry::to_line`]
    pub fn from_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let index = tokens.next()?.parse().ok()?;
        let term = tokens.next()?.parse().ok()?;
        let op = Operation::parse(tokens.next()?)?;
        let key = tokens.next()?.to_string();
        let value = tokens.next()?.to_string();
        if tokens.next().is_some() {
            return None;
        }
        Some(Self { index, term, op, key, value })
    }
}

/// durable storage seam for the replicated log and election metadata
///
/// read paths are served from an in-memory cache and cannot fail; every
/// mutating operation is durable before it returns. implementations keep
/// their own interior lock, so all methods take `&self`.
pub trait LogStore: Send + Sync {
    /// append one entry; its index must be exactly `last_index + 1`.
    /// on failure the entry must not be visible to any read path
    fn append(&self, entry: LogEntry) -> io::Result<()>;

    /// entry at `index`, if it lies in the retained range
    fn get(&self, index: u64) -> Option<LogEntry>;

    /// `(last_index, last_term)`, falling back to the snapshot boundary and
    /// then to `(0, 0)` on a pristine log
    fn last_info(&self) -> (u64, u64);

    /// term of the entry at `index`; resolves index 0 and the snapshot
    /// boundary, returns `None` outside the retained range
    fn term_at(&self, index: u64) -> Option<u64>;

    /// drop every entry with index >= `index` (conflict resolution)
    fn truncate_from(&self, index: u64) -> io::Result<()>;

    /// entries `[index, last_index]` in order; empty when out of range
    fn entries_from(&self, index: u64) -> Vec<LogEntry>;

    /// lowest retained index (`snapshot_index + 1` once compacted)
    fn first_index(&self) -> u64;

    /// drop every entry with index <= `up_to`; the caller guarantees a
    /// snapshot covering `up_to` is already installed
    fn discard_prefix(&self, up_to: u64) -> io::Result<()>;

    /// clear the whole live log and adopt a peer-supplied snapshot boundary
    fn install_snapshot_meta(&self, index: u64, term: u64) -> io::Result<()>;

    /// durably record `(current_term, voted_for)`
    fn save_meta(&self, term: u64, voted_for: Option<u64>) -> io::Result<()>;

    /// load `(current_term, voted_for)`, `(0, None)` for a fresh node
    fn load_meta(&self) -> io::Result<(u64, Option<u64>)>;
}

// -- in-memory log store --

#[derive(Default)]
struct MemLogInner {
    entries: Vec<LogEntry>,
    snap_index: u64,
    snap_term: u64,
    term: u64,
    voted_for: Option<u64>,
}

impl MemLogInner {
    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(self.snap_index)
    }

    fn first_index(&self) -> u64 {
        self.entries
            .first()
            .map(|e| e.index)
            .unwrap_or(self.snap_index + 1)
    }
}

/// in-memory log store for testing, no persistence across restarts
#[derive(Default)]
pub struct MemLog {
    inner: Mutex<MemLogInner>,
}

impl MemLog {
    /// create an empty in-memory log store
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemLog {
    fn append(&self, entry: LogEntry) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if entry.index != inner.last_index() + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "non-contiguous append: index {} after {}",
                    entry.index,
                    inner.last_index()
                ),
            ));
        }
        inner.entries.push(entry);
        Ok(())
    }

    fn get(&self, index: u64) -> Option<LogEntry> {
        let inner = self.inner.lock().unwrap();
        if index < inner.first_index() || index > inner.last_index() {
            return None;
        }
        let pos = (index - inner.first_index()) as usize;
        inner.entries.get(pos).cloned()
    }

    fn last_info(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        match inner.entries.last() {
            Some(e) => (e.index, e.term),
            None => (inner.snap_index, inner.snap_term),
        }
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        if index == 0 {
            return Some(0);
        }
        if index == inner.snap_index {
            return Some(inner.snap_term);
        }
        if index < inner.first_index() || index > inner.last_index() {
            return None;
        }
        let pos = (index - inner.first_index()) as usize;
        inner.entries.get(pos).map(|e| e.term)
    }

    fn truncate_from(&self, index: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| e.index < index);
        Ok(())
    }

    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.index >= index)
            .cloned()
            .collect()
    }

    fn first_index(&self) -> u64 {
        self.inner.lock().unwrap().first_index()
    }

    fn discard_prefix(&self, up_to: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if up_to < inner.first_index() {
            return Ok(());
        }
        if let Some(term) = inner.entries.iter().find(|e| e.index == up_to).map(|e| e.term) {
            inner.snap_index = up_to;
            inner.snap_term = term;
            inner.entries.retain(|e| e.index > up_to);
        }
        Ok(())
    }

    fn install_snapshot_meta(&self, index: u64, term: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.snap_index = index;
        inner.snap_term = term;
        Ok(())
    }

    fn save_meta(&self, term: u64, voted_for: Option<u64>) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.term = term;
        inner.voted_for = voted_for;
        Ok(())
    }

    fn load_meta(&self) -> io::Result<(u64, Option<u64>)> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.term, inner.voted_for))
    }
}
