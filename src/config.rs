// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Configuration types.

use std::time::Duration;

use crate::{
    CORO_NUM, LOCK_MAX_COUNT, LOCK_STATE_SIZE_LOCAL, LOCK_STATE_SIZE_REMOTE, LOG_META_SIZE,
    MAX_MSG_SIZE,
};

/// Sizing of the replicated state of a primary.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Number of slots in the remote lock region.
    pub lock_slots: usize,
    /// Size of the local lock staging buffer in bytes. Must be a multiple
    /// of the local record size so records never straddle the wrap.
    pub lock_buffer_size: usize,
    /// Size of the log staging buffer, and of the remote log bytes.
    pub log_buffer_size: usize,
    /// Number of worker threads the lock bitmap is partitioned between.
    pub thread_num: usize,
    /// Coroutines per scheduler.
    pub coro_num: usize,
    /// Transfers at or above this size are chunked.
    pub max_msg_size: usize,
    /// Bound on each completion poll; `None` blocks forever.
    pub poll_timeout: Option<Duration>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lock_slots: LOCK_MAX_COUNT,
            lock_buffer_size: LOCK_MAX_COUNT * LOCK_STATE_SIZE_LOCAL,
            log_buffer_size: 64 * 1024 * 1024,
            thread_num: 1,
            coro_num: CORO_NUM,
            max_msg_size: MAX_MSG_SIZE,
            poll_timeout: None,
        }
    }
}

impl StateConfig {
    /// Bytes of the lock bitmap; slot 0 starts right after it remotely.
    pub fn bitmap_size(&self) -> usize {
        (self.lock_slots + 7) / 8
    }

    /// Bytes the remote lock region needs: the bitmap and every slot.
    pub fn lock_region_size(&self) -> usize {
        self.bitmap_size() + self.lock_slots * LOCK_STATE_SIZE_REMOTE
    }

    /// Bytes the remote log region needs: the log and its pointer block.
    pub fn log_region_size(&self) -> usize {
        self.log_buffer_size + LOG_META_SIZE
    }

    /// Checks the invariants the state manager relies on.
    pub(crate) fn validate(&self) {
        assert!(self.lock_slots > 0, "Need at least one lock slot");
        assert!(
            self.lock_buffer_size >= LOCK_STATE_SIZE_LOCAL
                && self.lock_buffer_size % LOCK_STATE_SIZE_LOCAL == 0,
            "Lock buffer must hold a whole number of records"
        );
        assert!(
            self.log_buffer_size > 1,
            "Log buffer needs room for data and its reserved byte"
        );
        assert!(
            self.thread_num > 0 && self.thread_num <= self.bitmap_size(),
            "Every thread needs at least one byte of the bitmap"
        );
    }
}

/// Role of a database node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    ReadWrite,
    /// Clients of a read-only node run a single transaction each and are
    /// not failed over.
    ReadOnly,
}

/// Settings for one database node as seen by the client proxy.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// Name of the workload driving this node.
    pub workload: String,
    /// Number of records the workload draws keys from.
    pub record_num: usize,
    /// Number of client threads (one connection each).
    pub thread_num: usize,
    /// `host:port` of the node.
    pub addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::ReadWrite,
            workload: String::from("smallbank"),
            record_num: 1000,
            thread_num: 1,
            addr: String::from("127.0.0.1:8765"),
        }
    }
}

/// Settings of the failover-aware client proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// The primary node.
    pub primary: NodeConfig,
    /// `host:port` of the backup that takes over.
    pub backup_addr: String,
    /// Resume the in-flight transaction at its unfinished statement instead
    /// of starting a new one.
    pub resumption_open: bool,
    /// Transactions each client thread runs against the primary; `None`
    /// runs until the connection breaks.
    pub primary_txns_per_thread: Option<usize>,
    /// Fresh transactions each thread runs on the backup after resuming;
    /// `None` runs forever.
    pub backup_txns_per_thread: Option<usize>,
    /// How long to keep retrying a backup that refuses connections, e.g.
    /// because it is still coming up.
    pub connect_retry_timeout: Duration,
    /// Pause after the first refused connect; doubles after every attempt.
    pub connect_retry_delay: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            primary: NodeConfig::default(),
            backup_addr: String::from("127.0.0.1:8766"),
            resumption_open: true,
            primary_txns_per_thread: None,
            backup_txns_per_thread: None,
            connect_retry_timeout: Duration::from_secs(5),
            connect_retry_delay: Duration::from_millis(10),
        }
    }
}
