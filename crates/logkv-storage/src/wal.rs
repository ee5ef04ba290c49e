//! # wal
//!
//! why: keep the replicated log and election metadata durable across crashes
//! relations: implements logkv-core's LogStore, loaded at bootstrap by logkv-server
//! what: Wal with append/truncate/compact over a text-line file and a one-line meta file

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use logkv_core::{LogEntry, LogStore};

struct WalInner {
    entries: Vec<LogEntry>,
    file: File,
    snap_index: u64,
    snap_term: u64,
}

impl WalInner {
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

/// durable write-ahead log: one entry per line (`index term op key value`),
/// with a sibling `<path>.meta` file holding `current_term voted_for`
///
/// the whole file is scanned into a vector at open; reads are served from
/// that cache and every mutation hits disk before it becomes visible.
/// truncation and compaction rewrite the file to a temp path and rename,
/// since variable-length lines rule out in-place deletion.
pub struct Wal {
    path: PathBuf,
    meta_path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// open (or create) the log at `path`, scanning it into memory
    ///
    /// `snapshot` carries the boundary of the latest locally installed
    /// snapshot; entries it already covers are dropped here, which also
    /// repairs a crash that hit between snapshot rename and compaction
    pub fn open(path: impl Into<PathBuf>, snapshot: Option<(u64, u64)>) -> io::Result<Self> {
        let path = path.into();
        let meta_path = PathBuf::from(format!("{}.meta", path.display()));
        let (snap_index, snap_term) = snapshot.unwrap_or((0, 0));

        let mut entries = Vec::new();
        if path.exists() {
            let mut text = String::new();
            File::open(&path)?.read_to_string(&mut text)?;
            for line in text.lines() {
                if line.is_empty() {
                    continue;
                }
                let entry = LogEntry::from_line(line).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("corrupt log line: {line:?}"),
                    )
                })?;
                entries.push(entry);
            }
        }

        let stale = entries.iter().take_while(|e| e.index <= snap_index).count();
        if stale > 0 {
            debug!(stale, "dropping log prefix already covered by the snapshot");
            entries.drain(..stale);
        }

        // the surviving suffix must be contiguous and join the boundary
        let mut expected = snap_index + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("log gap: expected index {expected}, found {}", entry.index),
                ));
            }
            expected += 1;
        }

        let wal = Self {
            path: path.clone(),
            meta_path,
            inner: Mutex::new(WalInner {
                file: OpenOptions::new().create(true).append(true).open(&path)?,
                entries,
                snap_index,
                snap_term,
            }),
        };
        if stale > 0 {
            let mut inner = wal.inner.lock().unwrap();
            wal.rewrite(&mut inner)?;
        }
        Ok(wal)
    }

    /// rewrite the file from the cache to a temp path and rename into place
    fn rewrite(&self, inner: &mut WalInner) -> io::Result<()> {
        let temp_path = PathBuf::from(format!("{}.tmp", self.path.display()));
        let mut temp = File::create(&temp_path)?;
        for entry in &inner.entries {
            temp.write_all(entry.to_line().as_bytes())?;
            temp.write_all(b"\n")?;
        }
        temp.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

impl LogStore for Wal {
    fn append(&self, entry: LogEntry) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let expected = inner.last_index() + 1;
        if entry.index != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("non-contiguous append: index {} after {}", entry.index, expected - 1),
            ));
        }
        let mut line = entry.to_line();
        line.push('\n');
        inner.file.write_all(line.as_bytes())?;
        inner.file.sync_data()?;
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
        let before = inner.entries.len();
        inner.entries.retain(|e| e.index < index);
        if inner.entries.len() != before {
            debug!(index, dropped = before - inner.entries.len(), "truncated log suffix");
            self.rewrite(&mut inner)?;
        }
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
        let Some(term) = inner
            .entries
            .iter()
            .find(|e| e.index == up_to)
            .map(|e| e.term)
        else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot discard through {up_to}: not in the live log"),
            ));
        };
        inner.snap_index = up_to;
        inner.snap_term = term;
        inner.entries.retain(|e| e.index > up_to);
        self.rewrite(&mut inner)
    }

    fn install_snapshot_meta(&self, index: u64, term: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.snap_index = index;
        inner.snap_term = term;
        self.rewrite(&mut inner)
    }

    fn save_meta(&self, term: u64, voted_for: Option<u64>) -> io::Result<()> {
        // lock shared with the log so meta and entries cannot interleave
        let _inner = self.inner.lock().unwrap();
        let temp_path = PathBuf::from(format!("{}.tmp", self.meta_path.display()));
        let mut temp = File::create(&temp_path)?;
        let voted = voted_for
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        temp.write_all(format!("{term} {voted}\n").as_bytes())?;
        temp.sync_all()?;
        fs::rename(&temp_path, &self.meta_path)
    }

    fn load_meta(&self) -> io::Result<(u64, Option<u64>)> {
        if !self.meta_path.exists() {
            return Ok((0, None));
        }
        let mut text = String::new();
        File::open(&self.meta_path)?.read_to_string(&mut text)?;
        let mut tokens = text.split_whitespace();
        let bad = || io::Error::new(io::ErrorKind::InvalidData, "corrupt meta file");
        let term = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(bad)?;
        let voted_for = match tokens.next().ok_or_else(bad)? {
            "-" => None,
            id => Some(id.parse().map_err(|_| bad())?),
        };
        Ok((term, voted_for))
    }
}
