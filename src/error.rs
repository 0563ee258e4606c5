// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types used across the replication and failover layers.

use std::fmt;
use std::io;

use crate::rdma::WcStatus;

/// Failure of a one-sided RDMA operation.
///
/// The primitive layer reports these without retrying; deciding whether a
/// failure is recoverable is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdmaError {
    /// The queue pair refused to accept a single work request.
    Post { opcode: &'static str, rc: i32 },
    /// The queue pair refused a chained post; `bad_index` is the first
    /// request that was not accepted.
    BatchRejected { bad_index: usize, rc: i32 },
    /// A completion arrived with an error status.
    Completion { wr_id: u64, status: WcStatus },
    /// A successful completion carried another request's tag.
    UnexpectedCompletion { expected: u64, got: u64 },
    /// Polling the completion queue gave up before a completion arrived.
    PollTimeout,
}

impl fmt::Display for RdmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RdmaError::Post { opcode, rc } => write!(f, "post of {} failed: rc={}", opcode, rc),
            RdmaError::BatchRejected { bad_index, rc } => {
                write!(f, "batch post rejected at request {}: rc={}", bad_index, rc)
            }
            RdmaError::Completion { wr_id, status } => {
                write!(f, "work request {} completed with {:?}", wr_id, status)
            }
            RdmaError::UnexpectedCompletion { expected, got } => write!(
                f,
                "expected completion of work request {}, got {}",
                expected, got
            ),
            RdmaError::PollTimeout => write!(f, "timed out polling for a completion"),
        }
    }
}

impl std::error::Error for RdmaError {}

/// A circular staging buffer could not take more bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// `requested` bytes did not fit into the `free` bytes left.
    Full { requested: usize, free: usize },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Full { requested, free } => write!(
                f,
                "staging buffer full: requested {} bytes, {} free",
                requested, free
            ),
        }
    }
}

impl std::error::Error for BufferError {}

/// Errors reported by the state manager for conditions that are not fatal
/// to the replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The thread's partition of the lock bitmap has no free slot left.
    NoFreeSlot { thread: usize },
    /// The staging buffer has no room for the record.
    Buffer(BufferError),
    /// Reading state back from the remote node failed.
    Rdma(RdmaError),
    /// The remote log pointers do not fit the local log buffer.
    CorruptLog { head: i64, state_tail: i64 },
    /// Moving the log head to `new_head` would reclaim bytes that are not
    /// on the backup yet; only bytes before `flushed` may be reused.
    UnflushedLog { new_head: usize, flushed: usize },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::NoFreeSlot { thread } => {
                write!(f, "no free lock slot in partition of thread {}", thread)
            }
            StateError::Buffer(e) => write!(f, "{}", e),
            StateError::Rdma(e) => write!(f, "RDMA error: {}", e),
            StateError::CorruptLog { head, state_tail } => write!(
                f,
                "remote log pointers out of range: head={} state_tail={}",
                head, state_tail
            ),
            StateError::UnflushedLog { new_head, flushed } => write!(
                f,
                "can't release log up to {}: flushed only up to {}",
                new_head, flushed
            ),
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Buffer(e) => Some(e),
            StateError::Rdma(e) => Some(e),
            StateError::NoFreeSlot { .. }
            | StateError::CorruptLog { .. }
            | StateError::UnflushedLog { .. } => None,
        }
    }
}

impl From<BufferError> for StateError {
    fn from(e: BufferError) -> Self {
        StateError::Buffer(e)
    }
}

impl From<RdmaError> for StateError {
    fn from(e: RdmaError) -> Self {
        StateError::Rdma(e)
    }
}

/// Errors on a client's statement connection.
#[derive(Debug)]
pub enum ClientError {
    /// The peer closed the connection, or a send/receive on it failed.
    ConnectionClosed,
    /// The connection could not be established.
    Io(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ConnectionClosed => write!(f, "connection closed"),
            ClientError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            ClientError::ConnectionClosed => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// Errors of the failover handshake and the resumption that follows it.
#[derive(Debug)]
pub enum FailoverError {
    /// The backup could not be reached.
    BackupUnreachable(ClientError),
    /// The backup answered the promotion request with something other than
    /// a success reply.
    Declined(String),
    /// The connection to the backup broke while resuming.
    Connection(ClientError),
    /// The backup was never promoted; the thread has no node to serve it.
    NoServingNode,
}

impl fmt::Display for FailoverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverError::BackupUnreachable(e) => write!(f, "backup unreachable: {}", e),
            FailoverError::Declined(reply) => {
                write!(f, "backup declined promotion: {:?}", reply)
            }
            FailoverError::Connection(e) => write!(f, "backup connection failed: {}", e),
            FailoverError::NoServingNode => write!(f, "no serving node left"),
        }
    }
}

impl std::error::Error for FailoverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FailoverError::BackupUnreachable(e) | FailoverError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClientError> for FailoverError {
    fn from(e: ClientError) -> Self {
        FailoverError::Connection(e)
    }
}
