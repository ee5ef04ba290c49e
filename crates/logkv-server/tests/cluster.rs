//! # cluster integration tests
//!
//! why: verify whole-node behavior over real tcp: replication, failover, compaction, catch-up
//! relations: spawns Server instances against per-node temp directories
//! what: client protocol checks, three-node scenarios, restart recovery, snapshot install

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use logkv_core::ConsensusConfig;
use logkv_server::{rpc, RoleHint, Server, ServerConfig};

fn spawn_with(
    port: u16,
    role: RoleHint,
    id: u64,
    peer_ports: &[u16],
    dir: &Path,
    tuning: ConsensusConfig,
) -> Server {
    Server::start(ServerConfig {
        port,
        role,
        id,
        peers: peer_ports.iter().map(|p| format!("127.0.0.1:{p}")).collect(),
        data_dir: dir.to_path_buf(),
        tuning,
    })
    .expect("node failed to start")
}

fn spawn(port: u16, role: RoleHint, id: u64, peer_ports: &[u16], dir: &Path) -> Server {
    spawn_with(port, role, id, peer_ports, dir, ConsensusConfig::default())
}

/// restart on the same port, retrying while the old socket drains
fn respawn(port: u16, role: RoleHint, id: u64, dir: &Path, tuning: ConsensusConfig) -> Server {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let attempt = Server::start(ServerConfig {
            port,
            role,
            id,
            peers: Vec::new(),
            data_dir: dir.to_path_buf(),
            tuning: tuning.clone(),
        });
        match attempt {
            Ok(server) => return server,
            Err(_) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(200));
            }
            Err(err) => panic!("node failed to restart: {err}"),
        }
    }
}

/// timeouts large enough that the node never campaigns during a test
fn passive_tuning() -> ConsensusConfig {
    ConsensusConfig {
        election_timeout_min: 60_000,
        election_timeout_max: 120_000,
        ..ConsensusConfig::default()
    }
}

fn request(port: u16, line: &str) -> Option<String> {
    rpc::call_line(&format!("127.0.0.1:{port}"), line, Duration::from_secs(3)).ok()
}

fn put(port: u16, key: &str, value: &str) -> Option<String> {
    request(port, &format!("PUT {key} {value}"))
}

fn get(port: u16, key: &str) -> Option<String> {
    request(port, &format!("GET {key}"))
}

fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn single_node_serves_reads_and_writes() {
    let dir = TempDir::new().unwrap();
    let node = spawn(17801, RoleHint::Leader, 1, &[], dir.path());

    assert_eq!(put(17801, "a", "1").as_deref(), Some("OK"));
    assert_eq!(put(17801, "b", "2").as_deref(), Some("OK"));
    assert_eq!(get(17801, "a").as_deref(), Some("1"));
    assert_eq!(get(17801, "b").as_deref(), Some("2"));
    assert_eq!(get(17801, "c").as_deref(), Some("NOT_FOUND"));

    assert_eq!(put(17801, "a", "3").as_deref(), Some("OK"));
    assert_eq!(get(17801, "a").as_deref(), Some("3"));

    node.shutdown();
}

#[test]
fn protocol_replies_on_a_passive_follower() {
    let dir = TempDir::new().unwrap();
    // one unbound peer keeps quorum unreachable; huge timeouts keep it passive
    let node = spawn_with(17803, RoleHint::Follower, 2, &[17899], dir.path(), passive_tuning());

    assert_eq!(put(17803, "x", "1").as_deref(), Some("NOT_LEADER"));
    assert_eq!(get(17803, "x").as_deref(), Some("NOT_FOUND"));

    assert_eq!(request(17803, "REQUEST_VOTE 5 9 0 0").as_deref(), Some("VOTE_GRANTED 5"));
    // one vote per term
    assert_eq!(request(17803, "REQUEST_VOTE 5 8 0 0").as_deref(), Some("VOTE_DENIED 5"));
    // stale candidates are refused once a higher term is seen
    assert_eq!(request(17803, "HEARTBEAT 7").as_deref(), Some("OK"));
    assert_eq!(request(17803, "REQUEST_VOTE 6 9 0 0").as_deref(), Some("VOTE_DENIED 7"));

    assert_eq!(request(17803, "FROB a b").as_deref(), Some("UNKNOWN_CMD"));
    assert_eq!(request(17803, "PUT lonely").as_deref(), Some("ERROR"));
    assert_eq!(request(17803, "GET").as_deref(), Some("ERROR"));

    // malformed peer rpc and EXIT both close without a reply
    assert_eq!(request(17803, "APPEND_ENTRIES 1 2"), None);
    assert_eq!(request(17803, "EXIT"), None);

    node.shutdown();
}

#[test]
fn three_node_replication_and_failover() {
    let (d1, d2, d3) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
    let n2 = spawn(17812, RoleHint::Follower, 2, &[17811, 17813], d2.path());
    let n3 = spawn(17813, RoleHint::Follower, 3, &[17811, 17812], d3.path());
    thread::sleep(Duration::from_millis(50));
    let n1 = spawn(17811, RoleHint::Leader, 1, &[17812, 17813], d1.path());

    // a committed write is acknowledged and reaches every replica
    assert_eq!(put(17811, "x", "10").as_deref(), Some("OK"));
    for port in [17812, 17813] {
        wait_for("replicated value on followers", Duration::from_secs(5), || {
            get(port, "x").as_deref() == Some("10")
        });
    }

    // kill the leader; a new one emerges and still serves the committed value
    n1.shutdown();
    let mut leader_port = 0;
    wait_for("a new leader", Duration::from_secs(15), || {
        for port in [17812, 17813] {
            if put(port, "y", "20").as_deref() == Some("OK") {
                leader_port = port;
                return true;
            }
        }
        false
    });
    assert_eq!(get(leader_port, "x").as_deref(), Some("10"));

    let other = if leader_port == 17812 { 17813 } else { 17812 };
    wait_for("the follower to learn the new write", Duration::from_secs(5), || {
        get(other, "y").as_deref() == Some("20")
    });

    n2.shutdown();
    n3.shutdown();
}

#[test]
fn a_stale_leader_steps_down_and_serves_weak_reads() {
    let dir = TempDir::new().unwrap();
    let node = spawn_with(17821, RoleHint::Leader, 1, &[], dir.path(), passive_tuning());

    assert_eq!(put(17821, "a", "1").as_deref(), Some("OK"));
    // a heartbeat from a higher term dethrones the leader
    assert_eq!(request(17821, "HEARTBEAT 999").as_deref(), Some("OK"));
    assert_eq!(put(17821, "b", "2").as_deref(), Some("NOT_LEADER"));
    // reads keep coming from applied local state
    assert_eq!(get(17821, "a").as_deref(), Some("1"));

    node.shutdown();
}

#[test]
fn an_isolated_leader_never_acknowledges_writes() {
    let (d1, d2, d3) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
    let n2 = spawn_with(17842, RoleHint::Follower, 2, &[17841, 17843], d2.path(), passive_tuning());
    let n3 = spawn_with(17843, RoleHint::Follower, 3, &[17841, 17842], d3.path(), passive_tuning());
    thread::sleep(Duration::from_millis(50));
    let n1 = spawn_with(17841, RoleHint::Leader, 1, &[17842, 17843], d1.path(), passive_tuning());
    assert_eq!(put(17841, "x", "10").as_deref(), Some("OK"));

    // cut the leader off from the whole majority
    n2.shutdown();
    n3.shutdown();

    // the write is journaled but never committed, so the client gets no reply
    assert_eq!(put(17841, "lost", "99"), None);
    assert_eq!(get(17841, "lost").as_deref(), Some("NOT_FOUND"));
    // earlier committed state is untouched
    assert_eq!(get(17841, "x").as_deref(), Some("10"));

    n1.shutdown();
}

#[test]
fn compaction_round_trip_across_a_restart() {
    let tuning = ConsensusConfig { snapshot_threshold: 20, ..passive_tuning() };
    let dir = TempDir::new().unwrap();

    let node = spawn_with(17851, RoleHint::Leader, 1, &[], dir.path(), tuning.clone());
    for i in 0..20 {
        assert_eq!(put(17851, &format!("key{i}"), &format!("v{i}")).as_deref(), Some("OK"));
    }
    let snapshot_path = dir.path().join("snapshots").join("snapshot_1_idx_20.snap");
    assert!(snapshot_path.exists(), "snapshot should exist after the threshold");
    node.shutdown();

    let node = respawn(17851, RoleHint::Leader, 1, dir.path(), tuning);
    for i in 0..20 {
        assert_eq!(get(17851, &format!("key{i}")).as_deref(), Some(format!("v{i}").as_str()));
    }
    // the restarted node keeps accepting writes past the snapshot
    assert_eq!(put(17851, "fresh", "1").as_deref(), Some("OK"));
    assert_eq!(get(17851, "fresh").as_deref(), Some("1"));

    node.shutdown();
}

#[test]
fn a_lagging_follower_catches_up_through_a_snapshot() {
    let tuning = ConsensusConfig { snapshot_threshold: 20, ..ConsensusConfig::default() };
    let (d1, d2, d3) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());

    let n2 = spawn_with(17862, RoleHint::Follower, 2, &[17861, 17863], d2.path(), tuning.clone());
    thread::sleep(Duration::from_millis(50));
    let n1 = spawn_with(17861, RoleHint::Leader, 1, &[17862, 17863], d1.path(), tuning.clone());

    // node 3 is offline while the cluster commits past the snapshot threshold
    for i in 0..30 {
        assert_eq!(put(17861, &format!("key{i}"), &format!("v{i}")).as_deref(), Some("OK"));
    }
    assert!(d1.path().join("snapshots").join("snapshot_1_idx_20.snap").exists());

    // now it joins and must be caught up via snapshot plus the log suffix
    let n3 = spawn_with(17863, RoleHint::Follower, 3, &[17861, 17862], d3.path(), tuning);
    wait_for("the joiner to hold the newest key", Duration::from_secs(20), || {
        get(17863, "key29").as_deref() == Some("v29")
    });
    // keys only reachable through the snapshot are present too
    for i in [0, 5, 19] {
        assert_eq!(get(17863, &format!("key{i}")).as_deref(), Some(format!("v{i}").as_str()));
    }
    // the installed snapshot landed in the joiner's own directory
    assert!(d3.path().join("snapshots").join("snapshot_3_idx_20.snap").exists());

    n1.shutdown();
    n2.shutdown();
    n3.shutdown();
}
