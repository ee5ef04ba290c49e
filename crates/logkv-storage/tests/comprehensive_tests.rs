//! # comprehensive storage tests
//!
//! why: verify crash-safe behavior of the wal and the snapshot manager together
//! relations: exercises logkv-storage through the LogStore seam from logkv-core
//! what: reload after restart, truncation, compaction, metadata, chunked transfer

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::tempdir;

use logkv_core::{KvStore, LogEntry, LogStore, Operation};
use logkv_storage::{SnapshotManager, Wal};

fn entry(index: u64, term: u64) -> LogEntry {
    LogEntry::new(index, term, Operation::Put, format!("k{index}"), format!("v{index}"))
}

// =============================================================================
// SECTION 1: WAL DURABILITY
// =============================================================================

mod wal_durability {
    use super::*;

    #[test]
    fn log_and_metadata_survive_a_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal_7101.log");
        {
            let wal = Wal::open(&path, None).unwrap();
            for i in 1..=3 {
                wal.append(entry(i, 1)).unwrap();
            }
            wal.save_meta(2, Some(3)).unwrap();
        }

        let wal = Wal::open(&path, None).unwrap();
        assert_eq!(wal.last_info(), (3, 1));
        assert_eq!(wal.first_index(), 1);
        assert_eq!(wal.load_meta().unwrap(), (2, Some(3)));
        assert_eq!(wal.entries_from(2).len(), 2);
    }

    #[test]
    fn truncation_survives_a_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path, None).unwrap();
            for i in 1..=5 {
                wal.append(entry(i, if i < 4 { 1 } else { 2 })).unwrap();
            }
            wal.truncate_from(4).unwrap();
            // a new suffix can be appended right away
            wal.append(entry(4, 3)).unwrap();
        }

        let wal = Wal::open(&path, None).unwrap();
        assert_eq!(wal.last_info(), (4, 3));
        assert_eq!(wal.term_at(3), Some(1));
    }

    #[test]
    fn appends_out_of_order_are_refused() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log"), None).unwrap();
        wal.append(entry(1, 1)).unwrap();

        assert!(wal.append(entry(1, 1)).is_err());
        assert!(wal.append(entry(5, 1)).is_err());
        assert_eq!(wal.last_info(), (1, 1));
    }

    #[test]
    fn a_corrupt_log_file_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        std::fs::write(&path, "1 1 PUT a 1\nnot a log line\n").unwrap();
        assert!(Wal::open(&path, None).is_err());
    }

    #[test]
    fn a_gapped_log_file_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        std::fs::write(&path, "1 1 PUT a 1\n3 1 PUT c 3\n").unwrap();
        assert!(Wal::open(&path, None).is_err());
    }

    #[test]
    fn voted_for_none_round_trips() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log"), None).unwrap();
        wal.save_meta(9, None).unwrap();
        assert_eq!(wal.load_meta().unwrap(), (9, None));
    }
}

// =============================================================================
// SECTION 2: WAL COMPACTION
// =============================================================================

mod wal_compaction {
    use super::*;

    #[test]
    fn discard_prefix_keeps_the_boundary_term() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path, None).unwrap();
        for i in 1..=6 {
            wal.append(entry(i, 2)).unwrap();
        }

        wal.discard_prefix(4).unwrap();
        assert_eq!(wal.first_index(), 5);
        assert_eq!(wal.term_at(4), Some(2));
        assert_eq!(wal.term_at(3), None);
        assert_eq!(wal.last_info(), (6, 2));
        assert!(wal.get(4).is_none());
        assert_eq!(wal.get(5).unwrap().index, 5);
    }

    #[test]
    fn reopening_with_the_snapshot_boundary_restores_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path, None).unwrap();
            for i in 1..=6 {
                wal.append(entry(i, 2)).unwrap();
            }
            wal.discard_prefix(4).unwrap();
        }

        let wal = Wal::open(&path, Some((4, 2))).unwrap();
        assert_eq!(wal.first_index(), 5);
        assert_eq!(wal.last_info(), (6, 2));
        assert_eq!(wal.term_at(4), Some(2));
    }

    #[test]
    fn a_crash_between_snapshot_and_compaction_is_repaired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            // the snapshot was renamed into place but discard_prefix never ran
            let wal = Wal::open(&path, None).unwrap();
            for i in 1..=6 {
                wal.append(entry(i, 2)).unwrap();
            }
        }

        let wal = Wal::open(&path, Some((4, 2))).unwrap();
        assert_eq!(wal.first_index(), 5);
        assert_eq!(wal.entries_from(1).len(), 2);

        // and the repair is itself durable
        drop(wal);
        let wal = Wal::open(&path, Some((4, 2))).unwrap();
        assert_eq!(wal.first_index(), 5);
    }

    #[test]
    fn install_snapshot_meta_clears_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path, None).unwrap();
            for i in 1..=3 {
                wal.append(entry(i, 1)).unwrap();
            }
            wal.install_snapshot_meta(900, 7).unwrap();
            assert_eq!(wal.first_index(), 901);
            assert_eq!(wal.last_info(), (900, 7));
            wal.append(entry(901, 8)).unwrap();
        }

        let wal = Wal::open(&path, Some((900, 7))).unwrap();
        assert_eq!(wal.last_info(), (901, 8));
        assert_eq!(wal.first_index(), 901);
    }

    #[test]
    fn discard_below_the_first_index_is_a_noop() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log"), None).unwrap();
        for i in 1..=4 {
            wal.append(entry(i, 1)).unwrap();
        }
        wal.discard_prefix(2).unwrap();
        wal.discard_prefix(1).unwrap();
        assert_eq!(wal.first_index(), 3);
    }
}

// =============================================================================
// SECTION 3: SNAPSHOT ROUND TRIPS
// =============================================================================

mod snapshot_round_trips {
    use super::*;

    #[test]
    fn state_rebuilt_from_snapshot_plus_suffix_matches_full_replay() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log"), None).unwrap();
        let snapshots = SnapshotManager::new(dir.path().join("snapshots"), 1, 2).unwrap();

        // apply 1..=10 the straightforward way
        let full = Arc::new(KvStore::new());
        for i in 1..=10u64 {
            let e = entry(i, 1);
            wal.append(e.clone()).unwrap();
            full.apply(&e);
        }

        // snapshot at 7 and compact
        let mid = Arc::new(KvStore::new());
        for i in 1..=7u64 {
            mid.apply(&wal.get(i).unwrap());
        }
        snapshots.create(&mid.export(), 7, 1).unwrap();
        wal.discard_prefix(7).unwrap();

        // restart path: snapshot state plus the retained suffix
        let (state, meta) = snapshots.load_latest().unwrap().unwrap();
        assert_eq!(meta.last_index, 7);
        let rebuilt = Arc::new(KvStore::new());
        rebuilt.install(state);
        for e in wal.entries_from(meta.last_index + 1) {
            rebuilt.apply(&e);
        }

        assert_eq!(rebuilt.export(), full.export());
    }

    #[test]
    fn chunked_install_lands_byte_identical_state() {
        let dir = tempdir().unwrap();
        let leader = SnapshotManager::new(dir.path().join("leader"), 1, 2).unwrap();
        let follower = SnapshotManager::new(dir.path().join("follower"), 2, 2).unwrap();

        let mut state = HashMap::new();
        for i in 0..200 {
            state.insert(format!("key{i}"), format!("value{i}"));
        }
        leader.create(&state, 900, 3).unwrap();

        let chunk_size = 256;
        let mut offset = 0u64;
        let meta = loop {
            let chunk = leader.read_chunk(offset, chunk_size).unwrap();
            let done = chunk.len() < chunk_size;
            let finished = follower.write_chunk(offset, &chunk, done).unwrap();
            offset += chunk.len() as u64;
            if done {
                break finished.unwrap();
            }
        };

        assert_eq!(meta.last_index, 900);
        assert_eq!(meta.last_term, 3);
        let (got, _) = follower.load_latest().unwrap().unwrap();
        assert_eq!(got, state);
    }

    #[test]
    fn retention_keeps_only_the_newest_snapshots() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotManager::new(dir.path(), 1, 1).unwrap();
        let state = HashMap::from([("a".to_string(), "1".to_string())]);

        snapshots.create(&state, 10, 1).unwrap();
        snapshots.create(&state, 20, 1).unwrap();

        assert_eq!(snapshots.latest_meta().unwrap().unwrap().last_index, 20);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|d| d.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["snapshot_1_idx_20.snap"]);
    }

    #[test]
    fn snapshots_of_other_nodes_are_ignored() {
        let dir = tempdir().unwrap();
        let ours = SnapshotManager::new(dir.path(), 1, 2).unwrap();
        let theirs = SnapshotManager::new(dir.path(), 2, 2).unwrap();
        let state = HashMap::from([("a".to_string(), "1".to_string())]);

        theirs.create(&state, 50, 1).unwrap();
        assert!(ours.latest_meta().unwrap().is_none());
        ours.create(&state, 10, 1).unwrap();
        assert_eq!(ours.latest_meta().unwrap().unwrap().last_index, 10);
    }
}
