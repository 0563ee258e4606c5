// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The one-sided RDMA capability this crate is written against.
//!
//! Connection setup and memory registration happen elsewhere; all the
//! replication code needs is a connected queue pair that can post work
//! requests against a registered remote region and poll for their
//! completions.

use std::time::Duration;

use bitflags::bitflags;

use crate::error::RdmaError;

/// Operation carried by a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Copy local bytes into remote memory.
    RdmaWrite,
    /// Copy remote bytes into local memory.
    RdmaRead,
    /// Atomically replace the remote 8-byte word with `swap` if it equals
    /// `compare`. The previous remote value lands in the local buffer.
    CompareSwap { compare: u64, swap: u64 },
}

impl Opcode {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Opcode::RdmaWrite => "RDMA_WRITE",
            Opcode::RdmaRead => "RDMA_READ",
            Opcode::CompareSwap { .. } => "ATOMIC_CMP_AND_SWP",
        }
    }
}

bitflags! {
    /// Send flags of a work request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u32 {
        /// Generate a completion for this request.
        const SIGNALED = 1 << 0;
        /// Copy the payload into the descriptor instead of referencing
        /// local memory.
        const INLINE = 1 << 1;
    }
}

/// Status of a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// The local buffer or its key was not valid.
    LocalProtectionError,
    /// The remote address was outside the region or the rkey did not match.
    RemoteAccessError,
    /// The request was flushed because an earlier one in the chain failed.
    Flushed,
}

/// Scatter/gather entry: the local side of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Work request id of requests that carry no coroutine tag.
pub const UNTAGGED_WR_ID: u64 = u64::MAX;

/// A send work request as chained into a doorbell batch.
///
/// `remote_addr` holds an offset into the remote region until the request
/// is rebased right before posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub sge: Sge,
    pub remote_addr: u64,
    pub rkey: u32,
    pub flags: SendFlags,
}

impl SendWr {
    /// A write of `length` bytes at `local_addr` to `remote_offset`.
    pub fn write(local_addr: u64, length: u32, remote_offset: u64) -> SendWr {
        SendWr {
            wr_id: UNTAGGED_WR_ID,
            opcode: Opcode::RdmaWrite,
            sge: Sge {
                addr: local_addr,
                length,
                lkey: 0,
            },
            remote_addr: remote_offset,
            rkey: 0,
            flags: SendFlags::empty(),
        }
    }
}

/// Address and access key of a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAttr {
    pub buf: u64,
    pub key: u32,
}

/// A polled work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub status: WcStatus,
}

/// A connected reliable queue pair.
///
/// # Note
/// Descriptors handed to a queue pair reference local memory by raw address.
/// Callers keep that memory alive and untouched until the matching
/// completion has been polled, exactly like with a real NIC.
pub trait QueuePair: Send + Sync {
    /// The local registered region; its key goes into every `Sge`.
    fn local_mr(&self) -> MemoryAttr;

    /// The remote registered region this queue pair targets.
    fn remote_mr(&self) -> MemoryAttr;

    /// Posts a single request. `remote_offset` is relative to the remote
    /// region and rebased by the queue pair.
    fn post_send(
        &self,
        opcode: Opcode,
        local_addr: u64,
        size: u32,
        remote_offset: u64,
        flags: SendFlags,
        wr_id: u64,
    ) -> Result<(), RdmaError>;

    /// Posts a chain of already rebased requests with a single doorbell.
    ///
    /// On rejection the error names the first request that was not posted.
    fn post_batch(&self, chain: &[SendWr]) -> Result<(), RdmaError>;

    /// Blocks until a completion arrives. `None` waits forever.
    fn poll_till_completion(&self, timeout: Option<Duration>) -> Result<Completion, RdmaError>;
}

impl<Q: QueuePair + ?Sized> QueuePair for std::sync::Arc<Q> {
    fn local_mr(&self) -> MemoryAttr {
        (**self).local_mr()
    }

    fn remote_mr(&self) -> MemoryAttr {
        (**self).remote_mr()
    }

    fn post_send(
        &self,
        opcode: Opcode,
        local_addr: u64,
        size: u32,
        remote_offset: u64,
        flags: SendFlags,
        wr_id: u64,
    ) -> Result<(), RdmaError> {
        (**self).post_send(opcode, local_addr, size, remote_offset, flags, wr_id)
    }

    fn post_batch(&self, chain: &[SendWr]) -> Result<(), RdmaError> {
        (**self).post_batch(chain)
    }

    fn poll_till_completion(&self, timeout: Option<Duration>) -> Result<Completion, RdmaError> {
        (**self).poll_till_completion(timeout)
    }
}
