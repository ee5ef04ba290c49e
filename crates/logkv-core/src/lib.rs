//! # logkv-core
//!
//! why: implement the consensus state machine for the logkv replicated store in pure, portable rust
//! relations: driven by logkv-server over tcp, persisted through the LogStore seam by logkv-storage
//! what: role state machine, election and replication rules, wire codec, kv state machine

pub mod log;
pub mod message;
pub mod node;
pub mod store;

pub use log::{LogEntry, LogStore, MemLog, Operation};
pub use message::{AppendReply, Request, SnapshotReply, VoteReply, WireError};
pub use node::{ConsensusConfig, ConsensusNode, PeerAction, Progress, Role, SnapshotTransfer};
pub use store::KvStore;
