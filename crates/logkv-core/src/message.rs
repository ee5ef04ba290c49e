//! # message
//!
//! why: define every request and reply that crosses the wire, with the line codec
//! relations: parsed by the logkv-server dispatcher, built by node.rs for outbound rpc
//! what: Request, VoteReply, AppendReply, SnapshotReply, WireError

use thiserror::Error;

use crate::log::{LogEntry, Operation};

/// wire-level parse failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown verb {0:?}")]
    UnknownVerb(String),
    #[error("malformed {verb} request")]
    Malformed { verb: &'static str },
}

impl WireError {
    /// true when the failing verb belongs to the client protocol, which
    /// answers `ERROR` instead of silently closing
    pub fn is_client(&self) -> bool {
        matches!(self, WireError::Malformed { verb: "PUT" | "GET" })
    }
}

/// one inbound request, a single line framed by newline
///
/// `INSTALL_SNAPSHOT` is the only verb followed by raw payload bytes; the
/// header line announces their length and they are read separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put {
        key: String,
        value: String,
    },
    Get {
        key: String,
    },
    RequestVote {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
        entries: Vec<LogEntry>,
    },
    Heartbeat {
        term: u64,
    },
    InstallSnapshot {
        term: u64,
        last_index: u64,
        last_term: u64,
        offset: u64,
        len: usize,
        done: bool,
    },
    Exit,
}

fn num(token: Option<&str>, verb: &'static str) -> Result<u64, WireError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or(WireError::Malformed { verb })
}

fn word(token: Option<&str>, verb: &'static str) -> Result<String, WireError> {
    token
        .map(str::to_string)
        .ok_or(WireError::Malformed { verb })
}

impl Request {
    /// parse one request line (without the trailing newline)
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| WireError::UnknownVerb(String::new()))?;
        let req = match verb {
            "PUT" => Request::Put {
                key: word(tokens.next(), "PUT")?,
                value: word(tokens.next(), "PUT")?,
            },
            "GET" => Request::Get {
                key: word(tokens.next(), "GET")?,
            },
            "REQUEST_VOTE" => Request::RequestVote {
                term: num(tokens.next(), "REQUEST_VOTE")?,
                candidate_id: num(tokens.next(), "REQUEST_VOTE")?,
                last_log_index: num(tokens.next(), "REQUEST_VOTE")?,
                last_log_term: num(tokens.next(), "REQUEST_VOTE")?,
            },
            "APPEND_ENTRIES" => {
                let term = num(tokens.next(), "APPEND_ENTRIES")?;
                let leader_id = num(tokens.next(), "APPEND_ENTRIES")?;
                let prev_log_index = num(tokens.next(), "APPEND_ENTRIES")?;
                let prev_log_term = num(tokens.next(), "APPEND_ENTRIES")?;
                let leader_commit = num(tokens.next(), "APPEND_ENTRIES")?;
                let count = num(tokens.next(), "APPEND_ENTRIES")?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(parse_entry(&mut tokens)?);
                }
                Request::AppendEntries {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                    entries,
                }
            }
            "HEARTBEAT" => Request::Heartbeat {
                term: num(tokens.next(), "HEARTBEAT")?,
            },
            "INSTALL_SNAPSHOT" => Request::InstallSnapshot {
                term: num(tokens.next(), "INSTALL_SNAPSHOT")?,
                last_index: num(tokens.next(), "INSTALL_SNAPSHOT")?,
                last_term: num(tokens.next(), "INSTALL_SNAPSHOT")?,
                offset: num(tokens.next(), "INSTALL_SNAPSHOT")?,
                len: num(tokens.next(), "INSTALL_SNAPSHOT")? as usize,
                done: match tokens.next() {
                    Some("0") => false,
                    Some("1") => true,
                    _ => return Err(WireError::Malformed { verb: "INSTALL_SNAPSHOT" }),
                },
            },
            "EXIT" => Request::Exit,
            other => return Err(WireError::UnknownVerb(other.to_string())),
        };
        if tokens.next().is_some() {
            return Err(WireError::Malformed {
                verb: match &req {
                    Request::Put { .. } => "PUT",
                    Request::Get { .. } => "GET",
                    Request::RequestVote { .. } => "REQUEST_VOTE",
                    Request::AppendEntries { .. } => "APPEND_ENTRIES",
                    Request::Heartbeat { .. } => "HEARTBEAT",
                    Request::InstallSnapshot { .. } => "INSTALL_SNAPSHOT",
                    Request::Exit => "EXIT",
                },
            });
        }
        Ok(req)
    }

    /// encode as one request line (without the trailing newline)
    pub fn encode(&self) -> String {
        match self {
            Request::Put { key, value } => format!("PUT {key} {value}"),
            Request::Get { key } => format!("GET {key}"),
            Request::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => format!("REQUEST_VOTE {term} {candidate_id} {last_log_index} {last_log_term}"),
            Request::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            } => {
                let mut line = format!(
                    "APPEND_ENTRIES {term} {leader_id} {prev_log_index} {prev_log_term} {leader_commit} {}",
                    entries.len()
                );
                for e in entries {
                    line.push(' ');
                    line.push_str(&e.to_line());
                }
                line
            }
            Request::Heartbeat { term } => format!("HEARTBEAT {term}"),
            Request::InstallSnapshot {
                term,
                last_index,
                last_term,
                offset,
                len,
                done,
            } => format!(
                "INSTALL_SNAPSHOT {term} {last_index} {last_term} {offset} {len} {}",
                if *done { 1 } else { 0 }
            ),
            Request::Exit => "EXIT".to_string(),
        }
    }
}

fn parse_entry(tokens: &mut std::str::SplitWhitespace<'_>) -> Result<LogEntry, WireError> {
    const VERB: &str = "APPEND_ENTRIES";
    let index = num(tokens.next(), VERB)?;
    let term = num(tokens.next(), VERB)?;
    let op = tokens
        .next()
        .and_then(Operation::parse)
        .ok_or(WireError::Malformed { verb: VERB })?;
    let key = word(tokens.next(), VERB)?;
    let value = word(tokens.next(), VERB)?;
    Ok(LogEntry { index, term, op, key, value })
}

/// reply to `REQUEST_VOTE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteReply {
    Granted { term: u64 },
    Denied { term: u64 },
}

impl VoteReply {
    pub fn encode(&self) -> String {
        match self {
            VoteReply::Granted { term } => format!("VOTE_GRANTED {term}"),
            VoteReply::Denied { term } => format!("VOTE_DENIED {term}"),
        }
    }

    pub fn parse(line: &str) -> Result<Self, WireError> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("VOTE_GRANTED") => Ok(VoteReply::Granted {
                term: num(tokens.next(), "REQUEST_VOTE")?,
            }),
            Some("VOTE_DENIED") => Ok(VoteReply::Denied {
                term: num(tokens.next(), "REQUEST_VOTE")?,
            }),
            _ => Err(WireError::Malformed { verb: "REQUEST_VOTE" }),
        }
    }
}

/// reply to `APPEND_ENTRIES`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendReply {
    Ack { term: u64, match_index: u64 },
    Nack { term: u64 },
}

impl AppendReply {
    pub fn encode(&self) -> String {
        match self {
            AppendReply::Ack { term, match_index } => format!("ACK {term} {match_index}"),
            AppendReply::Nack { term } => format!("NACK {term}"),
        }
    }

    pub fn parse(line: &str) -> Result<Self, WireError> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("ACK") => Ok(AppendReply::Ack {
                term: num(tokens.next(), "APPEND_ENTRIES")?,
                match_index: num(tokens.next(), "APPEND_ENTRIES")?,
            }),
            Some("NACK") => Ok(AppendReply::Nack {
                term: num(tokens.next(), "APPEND_ENTRIES")?,
            }),
            _ => Err(WireError::Malformed { verb: "APPEND_ENTRIES" }),
        }
    }
}

/// reply to an `INSTALL_SNAPSHOT` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotReply {
    pub term: u64,
}

impl SnapshotReply {
    pub fn encode(&self) -> String {
        format!("ACK {}", self.term)
    }

    pub fn parse(line: &str) -> Result<Self, WireError> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("ACK") => Ok(SnapshotReply {
                term: num(tokens.next(), "INSTALL_SNAPSHOT")?,
            }),
            _ => Err(WireError::Malformed { verb: "INSTALL_SNAPSHOT" }),
        }
    }
}
