// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! State replication is a library that keeps the mutable state of a
//! transactional primary node alive on a backup node, and lets clients move
//! their in-flight transactions over to that backup when the primary
//! disappears.
//!
//! The primary keeps two kinds of state that must survive a crash: the table
//! of row/table locks held by running transactions and an append-only
//! operation log. Both are staged in local circular buffers and mirrored into
//! the backup's memory with batched one-sided RDMA writes ("doorbell"
//! batches: one post, one completion for a whole chain of writes).
//!
//! # How does it work
//! A [StateManager](struct.StateManager.html) owns the staging buffers and the
//! [LockBitmap](struct.LockBitmap.html) of occupied remote lock slots. It is
//! constructed over two [QueuePair](trait.QueuePair.html)s, one targeting the
//! remote lock region and one targeting the remote log region:
//!
//! ```
//! use std::sync::Arc;
//! use state_replication::{LockRecord, LoopbackQp, RemoteRegion, StateConfig, StateManager};
//!
//! let config = StateConfig {
//!     lock_slots: 64,
//!     lock_buffer_size: 20 * 64,
//!     log_buffer_size: 4096,
//!     ..Default::default()
//! };
//! let lock_region = Arc::new(RemoteRegion::new(config.lock_region_size()));
//! let log_region = Arc::new(RemoteRegion::new(config.log_region_size()));
//!
//! let primary = StateManager::new(
//!     config.clone(),
//!     LoopbackQp::new(lock_region.clone()),
//!     LoopbackQp::new(log_region.clone()),
//! );
//!
//! let mut lock = LockRecord::record(7, 0, 1, 42);
//! primary.append_lock_state(&mut lock, 0).expect("slot available");
//! primary.flush_states();
//!
//! // The backup rebuilds its lock table from the replicated bitmap + slots.
//! let backup = StateManager::new(
//!     config,
//!     LoopbackQp::new(lock_region),
//!     LoopbackQp::new(log_region),
//! );
//! let mut table = state_replication::LockTable::new();
//! assert_eq!(backup.fetch_lock_states(&mut table).unwrap(), 1);
//! ```
//!
//! On the client side, a [Proxy](struct.Proxy.html) drives one thread per
//! client connection against the primary. When a connection breaks, a
//! control thread asks the backup to finish its promotion and every client
//! thread resumes its in-flight transaction on the backup at the exact
//! statement where the primary went away.

#[macro_use]
extern crate logging;

#[macro_use]
extern crate static_assertions;

mod bitmap;
mod buffer;
mod config;
mod context;
mod coroutine;
mod doorbell;
mod error;
mod failover;
mod lock;
mod loopback;
mod rdma;
mod state_manager;

pub use crate::bitmap::LockBitmap;
pub use crate::buffer::{CircularBuffer, RegisteredBuffer};
pub use crate::config::{NodeConfig, NodeRole, ProxyConfig, StateConfig};
pub use crate::context::{ClientState, FailoverContext, Signal};
pub use crate::coroutine::{Coroutine, CoroutineScheduler};
pub use crate::doorbell::{
    Doorbell, LockWriteBatch, LogBatch, LogPointers, LogSegment, LogWriteBatch,
    LogWriteTwoRangeBatch,
};
pub use crate::error::{BufferError, ClientError, FailoverError, RdmaError, StateError};
pub use crate::failover::{
    Connector, NodeCrashInfo, Proxy, ProxyReport, StatementSession, TcpConnector, TcpSession,
    ThreadLatency, Transaction, Workload,
};
pub use crate::lock::{
    Lock, LockDataId, LockDataKind, LockId, LockListInBucket, LockRecord, LockRequestQueue,
    LockTable, QueueId, LOCK_TABLE, LOCK_WAIT, TABLE_RECORD_NO,
};
pub use crate::loopback::{LoopbackQp, RemoteRegion};
pub use crate::rdma::{
    Completion, MemoryAttr, Opcode, QueuePair, SendFlags, SendWr, Sge, WcStatus, UNTAGGED_WR_ID,
};
pub use crate::state_manager::{Flushers, StateManager};

/// Size of one lock record in the remote lock region.
pub const LOCK_STATE_SIZE_REMOTE: usize = 16;

/// Size of one lock record in the local staging buffer: the remote record
/// followed by the slot index it belongs to.
pub const LOCK_STATE_SIZE_LOCAL: usize = 20;
const_assert!(LOCK_STATE_SIZE_LOCAL == LOCK_STATE_SIZE_REMOTE + 4);

/// Default number of slots in the remote lock region.
pub const LOCK_MAX_COUNT: usize = 8192;

/// Number of consecutive record numbers that share one lock bucket.
pub const BUCKET_SIZE: i32 = 100;

/// Payloads smaller than this are posted inline with the descriptor.
pub const INLINE_THRESHOLD: usize = 64;
const_assert!(LOCK_STATE_SIZE_REMOTE < INLINE_THRESHOLD);

/// Default limit for a single RDMA message; larger transfers are chunked.
pub const MAX_MSG_SIZE: usize = 1024 * 1024 * 1024;

/// Default number of coroutines per scheduler.
pub const CORO_NUM: usize = 1;

/// Size of the log pointer block (head, tail, state-tail) stored after the
/// remote log bytes.
pub const LOG_META_SIZE: usize = 3 * core::mem::size_of::<i64>();
const_assert_eq!(LOG_META_SIZE, 24);

/// Maximum size of a single reply read from a database node.
pub const RECV_BUFFER_SIZE: usize = 8192;

/// Reply sent by a node when the current transaction was aborted.
pub const ABORT_REPLY: &str = "abort\n";

/// Reply sent by the backup once it accepted a promotion request.
pub const SUCCESS_REPLY: &str = "success\n";

/// Control message asking the backup to finish its promotion.
pub const RECONNECT_PREPARE: &str = "reconnect_prepare";
