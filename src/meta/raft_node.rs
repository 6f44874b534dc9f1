//! Consensus log handle
//!
//! The cluster manager only needs two things from consensus: "am I the
//! leader" and "append these bytes". [`ConsensusLog`] is that seam.
//!
//! [`RaftNode`] is the single-node implementation used by the server: a
//! proposal is appended to an in-memory log and committed at once, and every
//! committed entry is pushed to the apply channel.

use crate::common::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Entry of the replicated log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

/// What the cluster manager needs from the consensus layer
pub trait ConsensusLog: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Current leader, if known
    fn leader(&self) -> Option<String>;

    /// Submit an opaque record; returns its log index
    fn propose(&self, data: Vec<u8>) -> Result<u64>;
}

/// Raft role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug)]
struct RaftState {
    role: RaftRole,
    term: u64,
    leader_id: Option<String>,
    /// Index of the last entry folded into a snapshot
    snapshot_index: u64,
    log: Vec<LogEntry>,
}

/// Raft node state
pub struct RaftNode {
    node_id: String,
    state: Mutex<RaftState>,
    commits: mpsc::UnboundedSender<LogEntry>,
    /// `Some(term)` while this node leads in `term`
    leadership: watch::Sender<Option<u64>>,
}

impl RaftNode {
    /// Create a follower; committed entries come out of the returned receiver
    pub fn new(node_id: String) -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (commits, commit_rx) = mpsc::unbounded_channel();
        let (leadership, _) = watch::channel(None);
        let node = Self {
            node_id,
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                term: 0,
                leader_id: None,
                snapshot_index: 0,
                log: Vec::new(),
            }),
            commits,
            leadership,
        };
        (node, commit_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get_role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn get_term(&self) -> u64 {
        self.state.lock().term
    }

    /// Number of entries in the local log
    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Index of the last proposed entry
    pub fn last_index(&self) -> u64 {
        let state = self.state.lock();
        state.snapshot_index + state.log.len() as u64
    }

    /// Drop the in-memory log; the next entry follows `index`.
    ///
    /// Called after recovering a snapshot that already covers `index`.
    pub fn restore_from_snapshot(&self, index: u64) {
        let mut state = self.state.lock();
        state.snapshot_index = index;
        state.log.clear();
    }

    /// Copy of the log entries, in index order
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().log.clone()
    }

    /// Watch leadership; `Some(term)` while this node leads in `term`.
    ///
    /// A step-down followed by a re-election shows up as a new term even
    /// when the receiver never observed the `None` in between.
    pub fn subscribe_leadership(&self) -> watch::Receiver<Option<u64>> {
        self.leadership.subscribe()
    }

    /// Become leader (single-node cluster, or tests)
    pub fn become_leader(&self) -> u64 {
        let term = {
            let mut state = self.state.lock();
            state.term += 1;
            state.role = RaftRole::Leader;
            state.leader_id = Some(self.node_id.clone());
            tracing::info!("Node {} became leader for term {}", self.node_id, state.term);
            state.term
        };
        self.leadership.send_replace(Some(term));
        term
    }

    /// Step down to follower
    pub fn step_down(&self, new_term: u64, leader_id: Option<String>) {
        {
            let mut state = self.state.lock();
            state.role = RaftRole::Follower;
            state.term = state.term.max(new_term);
            state.leader_id = leader_id;
        }
        self.leadership.send_replace(None);
    }
}

impl ConsensusLog for RaftNode {
    fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    fn leader(&self) -> Option<String> {
        self.state.lock().leader_id.clone()
    }

    fn propose(&self, data: Vec<u8>) -> Result<u64> {
        let entry = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                return Err(Error::NotLeader(
                    state
                        .leader_id
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                ));
            }
            let entry = LogEntry {
                term: state.term,
                index: state.snapshot_index + state.log.len() as u64 + 1,
                data,
            };
            state.log.push(entry.clone());
            entry
        };

        let index = entry.index;
        self.commits
            .send(entry)
            .map_err(|_| Error::Internal("apply loop is gone".into()))?;
        Ok(index)
    }
}
