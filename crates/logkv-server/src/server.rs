//! # server
//!
//! why: wire the consensus core to the network: dispatch, tickers, replication rounds
//! relations: parses requests via logkv-core's message codec, persists through logkv-storage
//! what: Server lifecycle, connection handler, election/heartbeat tickers, put commit path

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use logkv_core::{
    AppendReply, ConsensusConfig, ConsensusNode, KvStore, LogStore, PeerAction, Request,
    SnapshotReply, VoteReply, WireError,
};
use logkv_storage::{SnapshotManager, Wal};

/// outbound timeout for vote requests and plain heartbeats
const VOTE_RPC_TIMEOUT: Duration = Duration::from_millis(100);
/// outbound timeout for entries batches and snapshot chunks
const REPLICATION_RPC_TIMEOUT: Duration = Duration::from_millis(500);
/// how long an inbound connection may sit idle before it is dropped
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// granularity of the election deadline check
const ELECTION_TICK: Duration = Duration::from_millis(15);
/// replication rounds a PUT may consume before the client is dropped
const PUT_COMMIT_ROUNDS: usize = 3;

/// startup role hint from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RoleHint {
    /// campaign for leadership immediately at startup
    Leader,
    /// wait for a leader, campaigning only on election timeout
    Follower,
}

/// everything one node needs to run
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub role: RoleHint,
    pub id: u64,
    /// peer addresses as host:port, excluding this node
    pub peers: Vec<String>,
    /// directory holding `wal_<port>.log`, its meta file and `snapshots/`
    pub data_dir: PathBuf,
    pub tuning: ConsensusConfig,
}

struct Shared {
    node: Mutex<ConsensusNode<Wal>>,
    wal: Arc<Wal>,
    snapshots: SnapshotManager,
    store: Arc<KvStore>,
    tuning: ConsensusConfig,
    shutdown: AtomicBool,
    port: u16,
}

/// One running node: a listener thread, the election ticker and the
/// heartbeat ticker, all owned here and joined on shutdown.
///
/// Exactly one ticker does work at a time: the election ticker is idle
/// while this node leads, the heartbeat ticker is idle while it follows.
pub struct Server {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// recover durable state and bring the node online
    pub fn start(config: ServerConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let snapshots = SnapshotManager::new(
            config.data_dir.join("snapshots"),
            config.id,
            config.tuning.snapshot_retain,
        )?;

        let recovered = snapshots.load_latest().map_err(io::Error::from)?;
        let boundary = recovered.as_ref().map(|(_, meta)| (meta.last_index, meta.last_term));
        let wal = Arc::new(Wal::open(
            config.data_dir.join(format!("wal_{}.log", config.port)),
            boundary,
        )?);
        let store = Arc::new(KvStore::new());

        let mut node = ConsensusNode::new(
            config.id,
            config.peers.clone(),
            config.tuning.clone(),
            wal.clone(),
            store.clone(),
        )?;
        if let Some((state, meta)) = recovered {
            info!(
                last_index = meta.last_index,
                keys = state.len(),
                "recovered applied state from snapshot"
            );
            store.install(state);
            node.bootstrap_applied(meta.last_index);
        }

        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let shared = Arc::new(Shared {
            node: Mutex::new(node),
            wal,
            snapshots,
            store,
            tuning: config.tuning.clone(),
            shutdown: AtomicBool::new(false),
            port: config.port,
        });

        let mut threads = Vec::new();
        threads.push(
            thread::Builder::new()
                .name(format!("logkv-listener-{}", config.port))
                .spawn({
                    let shared = shared.clone();
                    move || listener_loop(shared, listener)
                })?,
        );
        threads.push(
            thread::Builder::new()
                .name(format!("logkv-election-{}", config.port))
                .spawn({
                    let shared = shared.clone();
                    move || election_ticker(shared)
                })?,
        );
        threads.push(
            thread::Builder::new()
                .name(format!("logkv-heartbeat-{}", config.port))
                .spawn({
                    let shared = shared.clone();
                    move || heartbeat_ticker(shared)
                })?,
        );

        info!(port = config.port, id = config.id, "logkv node listening");
        if config.role == RoleHint::Leader {
            run_election(&shared);
        }
        Ok(Self { shared, threads })
    }

    /// address peers and clients can reach this node on
    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.shared.port)
    }

    /// stop the tickers and the listener, then join every owned thread
    pub fn shutdown(self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        // unblock the accept loop so it observes the flag
        let _ = TcpStream::connect(("127.0.0.1", self.shared.port));
        for handle in self.threads {
            let _ = handle.join();
        }
    }

    /// block until the node stops
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/// losing durability is not survivable; stop serving immediately
fn fatal(err: impl std::fmt::Display) -> ! {
    error!("fatal storage failure: {err}");
    std::process::exit(2);
}

fn fatal_io<T>(result: io::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(err),
    }
}

// -- background tickers --

fn election_ticker(shared: Arc<Shared>) {
    loop {
        thread::sleep(ELECTION_TICK);
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let due = {
            let node = shared.node.lock().unwrap();
            node.election_due(Instant::now())
        };
        if due {
            run_election(&shared);
        }
    }
}

fn heartbeat_ticker(shared: Arc<Shared>) {
    let interval = Duration::from_millis(shared.tuning.heartbeat_interval);
    loop {
        thread::sleep(interval);
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        run_replication_round(&shared);
    }
}

/// campaign once: persist candidacy, solicit votes in parallel, tally
fn run_election(shared: &Shared) {
    let (line, peers) = {
        let mut node = shared.node.lock().unwrap();
        if node.is_leader() {
            return;
        }
        let request = fatal_io(node.start_election());
        (request.encode(), node.peers().to_vec())
    };

    let replies: Vec<VoteReply> = thread::scope(|scope| {
        let handles: Vec<_> = peers
            .iter()
            .map(|peer| {
                let line = &line;
                scope.spawn(move || {
                    rpc_line(peer, line, VOTE_RPC_TIMEOUT)
                        .and_then(|reply| VoteReply::parse(&reply).ok())
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect()
    });

    let won = {
        let mut node = shared.node.lock().unwrap();
        for reply in replies {
            fatal_io(node.record_vote(reply));
        }
        // covers the singleton cluster, which wins without any peer votes
        node.is_leader()
    };
    if won {
        // assert leadership right away instead of waiting a full tick
        run_replication_round(shared);
    }
}

enum Outbound {
    Append { line: String, sent_commit: u64 },
    Heartbeat { line: String },
    Chunk { header: String, payload: Vec<u8>, offset: u64, done: bool },
}

enum Outcome {
    Append { reply: AppendReply, sent_commit: u64 },
    Chunk { reply: SnapshotReply, offset: u64, len: usize, done: bool },
    Quiet,
}

/// one leader tick: plan under the lock, talk to every peer off the lock,
/// fold the results back in, then advance commit and apply
fn run_replication_round(shared: &Shared) {
    let chunk_size = shared.tuning.snapshot_chunk_size;

    let work: Vec<(String, Outbound)> = {
        let mut node = shared.node.lock().unwrap();
        if !node.is_leader() {
            return;
        }

        // seed transfer state for peers that fell behind the compacted prefix
        let lagging: Vec<String> = node
            .replication_plan()
            .into_iter()
            .filter_map(|(peer, action)| match action {
                PeerAction::Snapshot if node.snapshot_transfer(&peer).is_none() => Some(peer),
                _ => None,
            })
            .collect();
        for peer in &lagging {
            match shared.snapshots.latest_meta() {
                Ok(Some(meta)) => {
                    node.begin_snapshot_transfer(peer, meta.last_index, meta.last_term)
                }
                Ok(None) => warn!(%peer, "peer lags the compacted prefix but no snapshot exists"),
                Err(err) => fatal(err),
            }
        }

        let mut work = Vec::new();
        for (peer, action) in node.replication_plan() {
            match action {
                PeerAction::Rpc(request @ Request::AppendEntries { .. }) => {
                    let sent_commit = match &request {
                        Request::AppendEntries { leader_commit, .. } => *leader_commit,
                        _ => 0,
                    };
                    work.push((peer, Outbound::Append { line: request.encode(), sent_commit }));
                }
                PeerAction::Rpc(request) => {
                    work.push((peer, Outbound::Heartbeat { line: request.encode() }));
                }
                PeerAction::Snapshot => {
                    let Some(mut transfer) = node.snapshot_transfer(&peer) else {
                        continue;
                    };
                    // restart the stream if a newer snapshot replaced this one mid-flight
                    if let Ok(Some(meta)) = shared.snapshots.latest_meta() {
                        if meta.last_index != transfer.last_index {
                            node.begin_snapshot_transfer(&peer, meta.last_index, meta.last_term);
                            transfer = match node.snapshot_transfer(&peer) {
                                Some(restarted) => restarted,
                                None => continue,
                            };
                        }
                    }
                    let payload = match shared.snapshots.read_chunk(transfer.offset, chunk_size) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(%peer, %err, "snapshot chunk read failed");
                            continue;
                        }
                    };
                    let done = payload.len() < chunk_size;
                    let header = Request::InstallSnapshot {
                        term: node.current_term(),
                        last_index: transfer.last_index,
                        last_term: transfer.last_term,
                        offset: transfer.offset,
                        len: payload.len(),
                        done,
                    }
                    .encode();
                    work.push((
                        peer,
                        Outbound::Chunk { header, payload, offset: transfer.offset, done },
                    ));
                }
            }
        }
        work
    };

    let outcomes: Vec<(String, Outcome)> = thread::scope(|scope| {
        let handles: Vec<_> = work
            .into_iter()
            .map(|(peer, outbound)| {
                scope.spawn(move || {
                    let outcome = match outbound {
                        Outbound::Append { line, sent_commit } => {
                            rpc_line(&peer, &line, REPLICATION_RPC_TIMEOUT)
                                .and_then(|text| AppendReply::parse(&text).ok())
                                .map(|reply| Outcome::Append { reply, sent_commit })
                                .unwrap_or(Outcome::Quiet)
                        }
                        Outbound::Heartbeat { line } => {
                            let _ = rpc_line(&peer, &line, VOTE_RPC_TIMEOUT);
                            Outcome::Quiet
                        }
                        Outbound::Chunk { header, payload, offset, done } => {
                            let len = payload.len();
                            match crate::rpc::call_with_payload(
                                &peer,
                                &header,
                                &payload,
                                REPLICATION_RPC_TIMEOUT,
                            ) {
                                Ok(text) => SnapshotReply::parse(&text)
                                    .ok()
                                    .map(|reply| Outcome::Chunk { reply, offset, len, done })
                                    .unwrap_or(Outcome::Quiet),
                                Err(err) => {
                                    debug!(%peer, %err, "snapshot chunk send failed");
                                    Outcome::Quiet
                                }
                            }
                        }
                    };
                    (peer, outcome)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    {
        let mut node = shared.node.lock().unwrap();
        for (peer, outcome) in outcomes {
            match outcome {
                Outcome::Append { reply: AppendReply::Ack { match_index, .. }, sent_commit } => {
                    node.record_append_ok(&peer, match_index, sent_commit);
                }
                Outcome::Append { reply: AppendReply::Nack { term }, .. } => {
                    fatal_io(node.record_append_rejected(&peer, term));
                }
                Outcome::Chunk { reply, offset, len, done } => {
                    fatal_io(node.record_snapshot_ack(&peer, reply.term, offset, len, done));
                }
                Outcome::Quiet => {}
            }
        }
        node.advance_commit();
        fatal_io(node.apply_committed());
    }
    maybe_snapshot(shared);
}

/// send one line, swallow transport errors (tickers retry)
fn rpc_line(peer: &str, line: &str, timeout: Duration) -> Option<String> {
    match crate::rpc::call_line(peer, line, timeout) {
        Ok(reply) => Some(reply),
        Err(err) => {
            debug!(peer, %err, "rpc failed");
            None
        }
    }
}

// -- inbound connections --

fn listener_loop(shared: Arc<Shared>, listener: TcpListener) {
    for stream in listener.incoming() {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match stream {
            Ok(stream) => {
                let shared = shared.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(&shared, stream) {
                        debug!(%err, "connection ended with error");
                    }
                });
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }
}

fn reply(stream: &mut TcpStream, text: &str) -> io::Result<()> {
    stream.write_all(text.as_bytes())?;
    stream.write_all(b"\n")
}

/// one request per connection: read a line, dispatch, write one reply
fn handle_connection(shared: &Shared, mut stream: TcpStream) -> io::Result<()> {
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }

    let request = match Request::parse(line.trim_end()) {
        Ok(request) => request,
        Err(WireError::UnknownVerb(_)) => return reply(&mut stream, "UNKNOWN_CMD"),
        Err(err) if err.is_client() => return reply(&mut stream, "ERROR"),
        // malformed peer rpc: say nothing, the sender's ticker will retry
        Err(_) => return Ok(()),
    };

    match request {
        Request::Put { key, value } => handle_put(shared, key, value, &mut stream),
        Request::Get { key } => match shared.store.get(&key) {
            Some(value) => reply(&mut stream, &value),
            None => reply(&mut stream, "NOT_FOUND"),
        },
        Request::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
            let vote = {
                let mut node = shared.node.lock().unwrap();
                fatal_io(node.handle_request_vote(term, candidate_id, last_log_index, last_log_term))
            };
            reply(&mut stream, &vote.encode())
        }
        Request::AppendEntries { term, leader_id, prev_log_index, prev_log_term, leader_commit, entries } => {
            let ack = {
                let mut node = shared.node.lock().unwrap();
                let ack = fatal_io(node.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                    entries,
                ));
                fatal_io(node.apply_committed());
                ack
            };
            maybe_snapshot(shared);
            reply(&mut stream, &ack.encode())
        }
        Request::Heartbeat { term } => {
            {
                let mut node = shared.node.lock().unwrap();
                fatal_io(node.handle_heartbeat(term));
            }
            reply(&mut stream, "OK")
        }
        Request::InstallSnapshot { term, last_index, last_term, offset, len, done } => {
            debug!(term, last_index, last_term, offset, len, done, "snapshot chunk arriving");
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                // short payload is a framing error, close silently
                return Ok(());
            }
            let mut node = shared.node.lock().unwrap();
            if fatal_io(node.handle_snapshot_offer(term)) {
                let finished = match shared.snapshots.write_chunk(offset, &payload, done) {
                    Ok(finished) => finished,
                    Err(err) => fatal(err),
                };
                if finished.is_some() {
                    match shared.snapshots.load_latest() {
                        Ok(Some((state, meta))) => {
                            fatal_io(node.install_snapshot(state, meta.last_index, meta.last_term))
                        }
                        Ok(None) => warn!("finalized snapshot vanished before install"),
                        Err(err) => fatal(err),
                    }
                }
            }
            let current = node.current_term();
            drop(node);
            reply(&mut stream, &SnapshotReply { term: current }.encode())
        }
        Request::Exit => Ok(()),
    }
}

/// leader path for a client mutation: journal it, replicate until a
/// majority holds it, apply, and only then acknowledge. if the window
/// closes first the client gets no reply and must retry
fn handle_put(
    shared: &Shared,
    key: String,
    value: String,
    stream: &mut TcpStream,
) -> io::Result<()> {
    let index = {
        let mut node = shared.node.lock().unwrap();
        match fatal_io(node.propose(key, value)) {
            Some(index) => index,
            None => return reply(stream, "NOT_LEADER"),
        }
    };
    for _ in 0..PUT_COMMIT_ROUNDS {
        run_replication_round(shared);
        let committed = shared.node.lock().unwrap().commit_index() >= index;
        if committed {
            // push the new commit index out before acknowledging
            run_replication_round(shared);
            return reply(stream, "OK");
        }
    }
    debug!(index, "no majority within the attempt window, dropping client");
    Ok(())
}

/// capture and persist a snapshot once enough applied entries accumulate,
/// then compact the log prefix it covers
fn maybe_snapshot(shared: &Shared) {
    let payload = {
        let node = shared.node.lock().unwrap();
        if !node.should_snapshot() {
            return;
        }
        node.snapshot_payload()
    };
    let Some((state, index, term)) = payload else {
        return;
    };
    match shared.snapshots.create(&state, index, term) {
        Ok(path) => {
            fatal_io(shared.wal.discard_prefix(index));
            info!(index, path = %path.display(), "log compacted behind snapshot");
        }
        Err(err) => fatal(err),
    }
}
