//! # logkv-server
//!
//! why: run one replicated key-value store node: network dispatch, tickers, recovery
//! relations: drives logkv-core's consensus state machine over logkv-storage's wal and snapshots
//! what: Server with listener/tickers, the rpc client, bootstrap plumbing

pub mod rpc;
pub mod server;

pub use server::{RoleHint, Server, ServerConfig};
