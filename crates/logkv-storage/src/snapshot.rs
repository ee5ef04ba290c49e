//! # snapshot
//!
//! why: bound log growth by capturing applied state and shipping it to lagging peers
//! relations: state comes from logkv-core's KvStore, compaction lands on the Wal, chunks travel via logkv-server
//! what: SnapshotManager with create/load/latest/chunk io/retention in the LOGKV_SNAPSHOT_V1 format

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

const MAGIC: &str = "LOGKV_SNAPSHOT_V1";

/// snapshot failure: underlying io or a file that is not a snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad snapshot format: {0}")]
    Format(String),
}

impl From<SnapshotError> for io::Error {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Io(err) => err,
            SnapshotError::Format(msg) => io::Error::new(io::ErrorKind::InvalidData, msg),
        }
    }
}

/// coverage of one snapshot file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// highest log index folded into the snapshot state
    pub last_index: u64,
    /// term of that index
    pub last_term: u64,
    /// number of key-value pairs
    pub entries: usize,
}

/// Manages snapshot files for one node.
///
/// A snapshot is written to `temp_<id>.snap`, fsynced, then atomically
/// renamed to `snapshot_<id>_idx_<N>.snap`, so a crash leaves either the old
/// set of snapshots or the new one, never a half-written file. The same temp
/// path receives chunks streamed from a leader. One mutex serializes every
/// snapshot operation on this node.
pub struct SnapshotManager {
    dir: PathBuf,
    server_id: u64,
    retain: usize,
    lock: Mutex<()>,
}

impl SnapshotManager {
    /// create a manager over `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>, server_id: u64, retain: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            server_id,
            retain: retain.max(1),
            lock: Mutex::new(()),
        })
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("temp_{}.snap", self.server_id))
    }

    fn snapshot_path(&self, last_index: u64) -> PathBuf {
        self.dir
            .join(format!("snapshot_{}_idx_{}.snap", self.server_id, last_index))
    }

    /// parse the trailing index out of `snapshot_<id>_idx_<N>.snap`
    fn parse_index(&self, name: &str) -> Option<u64> {
        let prefix = format!("snapshot_{}_idx_", self.server_id);
        name.strip_prefix(&prefix)?.strip_suffix(".snap")?.parse().ok()
    }

    /// every snapshot file for this node, unsorted `(index, path)` pairs
    fn list(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if let Some(index) = dirent.file_name().to_str().and_then(|n| self.parse_index(n)) {
                found.push((index, dirent.path()));
            }
        }
        Ok(found)
    }

    fn latest_path(&self) -> io::Result<Option<(u64, PathBuf)>> {
        Ok(self.list()?.into_iter().max_by_key(|(index, _)| *index))
    }

    /// write the full state as a new snapshot covering `last_index`
    pub fn create(
        &self,
        state: &HashMap<String, String>,
        last_index: u64,
        last_term: u64,
    ) -> Result<PathBuf, SnapshotError> {
        let _guard = self.lock.lock().unwrap();
        let temp_path = self.temp_path();
        let mut temp = File::create(&temp_path)?;
        temp.write_all(format!("{MAGIC}\n{last_index} {last_term} {}\n", state.len()).as_bytes())?;
        for (key, value) in state {
            temp.write_all(format!("{} {}\n{key}\n{value}\n", key.len(), value.len()).as_bytes())?;
        }
        temp.sync_all()?;
        drop(temp);

        let final_path = self.snapshot_path(last_index);
        fs::rename(&temp_path, &final_path)?;
        info!(last_index, last_term, entries = state.len(), "snapshot created");
        self.prune()?;
        Ok(final_path)
    }

    /// metadata of the newest snapshot without loading its state
    pub fn latest_meta(&self) -> Result<Option<SnapshotMeta>, SnapshotError> {
        let _guard = self.lock.lock().unwrap();
        match self.latest_path()? {
            Some((_, path)) => Ok(Some(read_meta(&path)?)),
            None => Ok(None),
        }
    }

    /// load the newest snapshot in full
    pub fn load_latest(
        &self,
    ) -> Result<Option<(HashMap<String, String>, SnapshotMeta)>, SnapshotError> {
        let _guard = self.lock.lock().unwrap();
        let Some((_, path)) = self.latest_path()? else {
            return Ok(None);
        };
        let mut reader = BufReader::new(File::open(&path)?);
        let meta = read_header(&mut reader)?;
        let mut state = HashMap::with_capacity(meta.entries);
        for _ in 0..meta.entries {
            let sizes = read_trimmed_line(&mut reader)?;
            let mut tokens = sizes.split_whitespace();
            let key_len: usize = parse_size(tokens.next())?;
            let value_len: usize = parse_size(tokens.next())?;
            let key = read_trimmed_line(&mut reader)?;
            let value = read_trimmed_line(&mut reader)?;
            if key.len() != key_len || value.len() != value_len {
                return Err(SnapshotError::Format(format!(
                    "length mismatch for key {key:?}"
                )));
            }
            state.insert(key, value);
        }
        Ok(Some((state, meta)))
    }

    /// read up to `size` bytes at `offset` from the newest snapshot file;
    /// short (possibly empty) at end of file
    pub fn read_chunk(&self, offset: u64, size: usize) -> Result<Vec<u8>, SnapshotError> {
        let _guard = self.lock.lock().unwrap();
        let Some((_, path)) = self.latest_path()? else {
            return Ok(Vec::new());
        };
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        let mut read = 0;
        while read < size {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    /// write one streamed chunk into the temp file; chunks must arrive in
    /// ascending, gap-free offsets (the sender's replication loop guarantees
    /// this). on the final chunk the file is renamed into place and its
    /// metadata returned
    pub fn write_chunk(
        &self,
        offset: u64,
        bytes: &[u8],
        is_last: bool,
    ) -> Result<Option<SnapshotMeta>, SnapshotError> {
        let _guard = self.lock.lock().unwrap();
        let temp_path = self.temp_path();
        let mut file = if offset == 0 {
            File::create(&temp_path)?
        } else {
            OpenOptions::new().read(true).write(true).open(&temp_path)?
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        if !is_last {
            return Ok(None);
        }
        let meta = read_meta(&temp_path)?;
        fs::rename(&temp_path, self.snapshot_path(meta.last_index))?;
        info!(last_index = meta.last_index, "received snapshot installed");
        self.prune()?;
        Ok(Some(meta))
    }

    /// delete all but the newest `retain` snapshots for this node
    fn prune(&self) -> Result<(), SnapshotError> {
        let mut snapshots = self.list()?;
        snapshots.sort_by(|a, b| b.0.cmp(&a.0));
        for (index, path) in snapshots.into_iter().skip(self.retain) {
            debug!(index, "deleting old snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn parse_size(token: Option<&str>) -> Result<usize, SnapshotError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| SnapshotError::Format("bad length line".to_string()))
}

fn read_trimmed_line(reader: &mut impl BufRead) -> Result<String, SnapshotError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(SnapshotError::Format("unexpected end of snapshot".to_string()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn read_header(reader: &mut impl BufRead) -> Result<SnapshotMeta, SnapshotError> {
    let magic = read_trimmed_line(reader)?;
    if magic != MAGIC {
        return Err(SnapshotError::Format(format!("bad magic {magic:?}")));
    }
    let meta_line = read_trimmed_line(reader)?;
    let mut tokens = meta_line.split_whitespace();
    let bad = || SnapshotError::Format(format!("bad metadata line {meta_line:?}"));
    let last_index = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
    let last_term = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
    let entries = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
    Ok(SnapshotMeta { last_index, last_term, entries })
}

fn read_meta(path: &PathBuf) -> Result<SnapshotMeta, SnapshotError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> HashMap<String, String> {
        let mut state = HashMap::new();
        state.insert("alpha".to_string(), "1".to_string());
        state.insert("beta".to_string(), "2".to_string());
        state
    }

    #[test]
    fn create_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1, 2).unwrap();

        manager.create(&sample_state(), 10, 2).unwrap();
        let (state, meta) = manager.load_latest().unwrap().unwrap();

        assert_eq!(meta, SnapshotMeta { last_index: 10, last_term: 2, entries: 2 });
        assert_eq!(state, sample_state());
    }

    #[test]
    fn latest_picks_highest_index() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1, 5).unwrap();

        manager.create(&sample_state(), 5, 1).unwrap();
        manager.create(&sample_state(), 20, 2).unwrap();
        manager.create(&sample_state(), 11, 2).unwrap();

        assert_eq!(manager.latest_meta().unwrap().unwrap().last_index, 20);
    }

    #[test]
    fn retention_prunes_older_snapshots() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 3, 2).unwrap();

        for index in [5, 10, 15, 20] {
            manager.create(&sample_state(), index, 1).unwrap();
        }

        let mut kept: Vec<u64> = manager.list().unwrap().into_iter().map(|(i, _)| i).collect();
        kept.sort_unstable();
        assert_eq!(kept, vec![15, 20]);
    }

    #[test]
    fn chunked_transfer_reassembles() {
        let dir = tempdir().unwrap();
        let source = SnapshotManager::new(dir.path().join("leader"), 1, 2).unwrap();
        let sink = SnapshotManager::new(dir.path().join("follower"), 2, 2).unwrap();

        let mut state = HashMap::new();
        for i in 0..50 {
            state.insert(format!("key{i}"), format!("value{i}"));
        }
        source.create(&state, 900, 3).unwrap();

        let mut offset = 0u64;
        loop {
            let chunk = source.read_chunk(offset, 64).unwrap();
            let done = chunk.len() < 64;
            let meta = sink.write_chunk(offset, &chunk, done).unwrap();
            offset += chunk.len() as u64;
            if done {
                let meta = meta.unwrap();
                assert_eq!(meta.last_index, 900);
                assert_eq!(meta.last_term, 3);
                break;
            }
        }

        let (got, meta) = sink.load_latest().unwrap().unwrap();
        assert_eq!(meta.last_index, 900);
        assert_eq!(got, state);
    }

    #[test]
    fn read_chunk_past_end_is_empty() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1, 2).unwrap();
        manager.create(&sample_state(), 4, 1).unwrap();

        let size = fs::metadata(manager.snapshot_path(4)).unwrap().len();
        assert!(manager.read_chunk(size, 1024).unwrap().is_empty());
    }

    #[test]
    fn temp_file_is_not_a_snapshot() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1, 2).unwrap();
        manager.write_chunk(0, b"partial", false).unwrap();

        assert!(manager.latest_meta().unwrap().is_none());
    }
}
