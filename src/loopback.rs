// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An in-memory queue pair.
//!
//! `LoopbackQp` executes work requests directly against a `RemoteRegion` in
//! the same process. It checks keys and bounds the way a NIC would, keeps
//! a completion queue, records every posted chain, and can be told to fail
//! the next post or poll. Tests and demos run the replication code over it.

use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::RdmaError;
use crate::rdma::{Completion, MemoryAttr, Opcode, QueuePair, SendFlags, SendWr, Sge, WcStatus};

/// Base address regions pretend to live at, so that un-rebased offsets fail.
const REGION_BASE: u64 = 0x7f00_0000_0000;

/// Key used for the local side of every loopback queue pair.
const LOOPBACK_LKEY: u32 = 0x1001;

static NEXT_RKEY: AtomicU32 = AtomicU32::new(0x2001);

/// Memory of a (pretend) remote node.
pub struct RemoteRegion {
    mem: Mutex<Vec<u8>>,
    base: u64,
    rkey: u32,
}

impl RemoteRegion {
    /// A zeroed region of `bytes` bytes with a fresh rkey.
    pub fn new(bytes: usize) -> RemoteRegion {
        let rkey = NEXT_RKEY.fetch_add(1, Ordering::Relaxed);
        RemoteRegion {
            mem: Mutex::new(vec![0u8; bytes]),
            base: REGION_BASE + ((rkey as u64) << 32),
            rkey,
        }
    }

    pub fn len(&self) -> usize {
        self.mem.lock().len()
    }

    pub fn attr(&self) -> MemoryAttr {
        MemoryAttr {
            buf: self.base,
            key: self.rkey,
        }
    }

    /// Copy of `len` bytes at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.mem.lock()[offset..offset + len].to_vec()
    }

    /// Overwrites bytes at `offset`, as the remote node itself would.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.mem.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads a little endian i64 at `offset`.
    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.mem.lock()[offset..offset + 8]);
        i64::from_le_bytes(raw)
    }

    /// Executes one request. `remote_addr` is absolute.
    fn execute(&self, wr: &SendWr) -> WcStatus {
        let len = wr.sge.length as usize;
        if wr.rkey != self.rkey || wr.remote_addr < self.base {
            return WcStatus::RemoteAccessError;
        }
        let off = (wr.remote_addr - self.base) as usize;
        let mut mem = self.mem.lock();
        if off + len > mem.len() {
            return WcStatus::RemoteAccessError;
        }

        // The descriptor references live local memory of `len` bytes; the
        // caller holds it until the completion is polled.
        match wr.opcode {
            Opcode::RdmaWrite => unsafe {
                ptr::copy_nonoverlapping(wr.sge.addr as *const u8, mem[off..].as_mut_ptr(), len)
            },
            Opcode::RdmaRead => unsafe {
                ptr::copy_nonoverlapping(mem[off..].as_ptr(), wr.sge.addr as *mut u8, len)
            },
            Opcode::CompareSwap { compare, swap } => {
                if len != 8 || off % 8 != 0 {
                    return WcStatus::RemoteAccessError;
                }
                let mut old = [0u8; 8];
                old.copy_from_slice(&mem[off..off + 8]);
                if u64::from_le_bytes(old) == compare {
                    mem[off..off + 8].copy_from_slice(&swap.to_le_bytes());
                }
                unsafe { ptr::copy_nonoverlapping(old.as_ptr(), wr.sge.addr as *mut u8, 8) };
            }
        }
        WcStatus::Success
    }
}

/// A queue pair connected to a `RemoteRegion` in the same process.
pub struct LoopbackQp {
    remote: std::sync::Arc<RemoteRegion>,
    cq: Mutex<VecDeque<Completion>>,

    /// Every chain handed to `post_batch`, in order.
    batches: Mutex<Vec<Vec<SendWr>>>,
    /// Number of single requests handed to `post_send`.
    single_posts: AtomicUsize,

    fail_next_post: AtomicBool,
    fail_next_poll: AtomicBool,
}

impl LoopbackQp {
    pub fn new(remote: std::sync::Arc<RemoteRegion>) -> LoopbackQp {
        LoopbackQp {
            remote,
            cq: Mutex::new(VecDeque::new()),
            batches: Mutex::new(Vec::new()),
            single_posts: AtomicUsize::new(0),
            fail_next_post: AtomicBool::new(false),
            fail_next_poll: AtomicBool::new(false),
        }
    }

    pub fn region(&self) -> &RemoteRegion {
        &self.remote
    }

    /// Chains posted so far.
    pub fn batches(&self) -> Vec<Vec<SendWr>> {
        self.batches.lock().clone()
    }

    /// Number of single requests posted so far.
    pub fn single_posts(&self) -> usize {
        self.single_posts.load(Ordering::Relaxed)
    }

    /// Makes the next `post_send` or `post_batch` get rejected.
    pub fn fail_next_post(&self) {
        self.fail_next_post.store(true, Ordering::SeqCst);
    }

    /// Makes the next poll report an error completion.
    pub fn fail_next_poll(&self) {
        self.fail_next_poll.store(true, Ordering::SeqCst);
    }

    /// Runs a chain in order. The first failing request completes with its
    /// error and the rest are flushed, whether signaled or not.
    fn run_chain(&self, chain: &[SendWr]) {
        let mut cq = self.cq.lock();
        let mut failed = false;
        for wr in chain {
            if failed {
                cq.push_back(Completion {
                    wr_id: wr.wr_id,
                    status: WcStatus::Flushed,
                });
                continue;
            }
            let status = if wr.sge.lkey != LOOPBACK_LKEY {
                WcStatus::LocalProtectionError
            } else {
                self.remote.execute(wr)
            };
            if status != WcStatus::Success {
                error!("loopback request {} failed: {:?}", wr.wr_id, status);
                failed = true;
                cq.push_back(Completion {
                    wr_id: wr.wr_id,
                    status,
                });
            } else if wr.flags.contains(SendFlags::SIGNALED) {
                cq.push_back(Completion {
                    wr_id: wr.wr_id,
                    status,
                });
            }
        }
    }
}

impl QueuePair for LoopbackQp {
    fn local_mr(&self) -> MemoryAttr {
        MemoryAttr {
            buf: 0,
            key: LOOPBACK_LKEY,
        }
    }

    fn remote_mr(&self) -> MemoryAttr {
        self.remote.attr()
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
        if self.fail_next_post.swap(false, Ordering::SeqCst) {
            return Err(RdmaError::Post {
                opcode: opcode.name(),
                rc: -1,
            });
        }
        self.single_posts.fetch_add(1, Ordering::Relaxed);
        let remote = self.remote_mr();
        let wr = SendWr {
            wr_id,
            opcode,
            sge: Sge {
                addr: local_addr,
                length: size,
                lkey: self.local_mr().key,
            },
            remote_addr: remote.buf + remote_offset,
            rkey: remote.key,
            flags,
        };
        self.run_chain(&[wr]);
        Ok(())
    }

    fn post_batch(&self, chain: &[SendWr]) -> Result<(), RdmaError> {
        if self.fail_next_post.swap(false, Ordering::SeqCst) {
            return Err(RdmaError::BatchRejected { bad_index: 0, rc: -1 });
        }
        self.batches.lock().push(chain.to_vec());
        self.run_chain(chain);
        Ok(())
    }

    fn poll_till_completion(&self, _timeout: Option<Duration>) -> Result<Completion, RdmaError> {
        let next = self.cq.lock().pop_front();
        match next {
            Some(mut c) => {
                if self.fail_next_poll.swap(false, Ordering::SeqCst) {
                    c.status = WcStatus::RemoteAccessError;
                }
                Ok(c)
            }
            // Everything executes at post time; an empty queue never fills up.
            None => Err(RdmaError::PollTimeout),
        }
    }
}
