// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Synchronous RDMA operations, issued on behalf of a coroutine.
//!
//! Every call posts its work request(s) and polls until the matching
//! completion arrives before returning. The coroutine id only tags the work
//! requests so completions can be matched; no cooperative scheduling happens
//! here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::RdmaError;
use crate::rdma::{Opcode, QueuePair, SendFlags, SendWr, WcStatus};
use crate::INLINE_THRESHOLD;

/// Descriptor of one coroutine on a scheduler's run list.
#[derive(Debug)]
pub struct Coroutine {
    pub coro_id: usize,

    /// Set while the coroutine waits for a completion.
    is_wait_poll: AtomicBool,

    /// Run list links (indices into the scheduler's array).
    pub prev_coro: usize,
    pub next_coro: usize,
}

impl Coroutine {
    pub fn is_waiting(&self) -> bool {
        self.is_wait_poll.load(Ordering::Acquire)
    }
}

/// Issues synchronous RDMA operations for one worker thread.
pub struct CoroutineScheduler {
    t_id: usize,
    coro_array: Vec<Coroutine>,

    /// Transfers at or above this many bytes are split into chunks.
    max_msg_size: usize,

    /// How long to poll for a completion; `None` blocks forever.
    poll_timeout: Option<Duration>,
}

impl CoroutineScheduler {
    /// Creates a scheduler for thread `t_id` with `coro_num` coroutines
    /// linked into a circular run list.
    pub fn new(t_id: usize, coro_num: usize, max_msg_size: usize) -> CoroutineScheduler {
        assert!(coro_num > 0, "Need at least one coroutine");
        assert!(max_msg_size > 0, "Message size limit must be positive");
        let coro_array = (0..coro_num)
            .map(|i| Coroutine {
                coro_id: i,
                is_wait_poll: AtomicBool::new(false),
                prev_coro: (i + coro_num - 1) % coro_num,
                next_coro: (i + 1) % coro_num,
            })
            .collect();

        CoroutineScheduler {
            t_id,
            coro_array,
            max_msg_size,
            poll_timeout: None,
        }
    }

    /// Bounds how long each poll may block.
    pub fn with_poll_timeout(mut self, timeout: Option<Duration>) -> CoroutineScheduler {
        self.poll_timeout = timeout;
        self
    }

    pub fn thread_id(&self) -> usize {
        self.t_id
    }

    pub fn coro_num(&self) -> usize {
        self.coro_array.len()
    }

    pub fn coroutine(&self, coro_id: usize) -> &Coroutine {
        &self.coro_array[coro_id]
    }

    /// Writes `size` bytes at `local_addr` to `remote_offset`, chunked at the
    /// message size limit. Each chunk completes before the next is posted.
    pub fn write_sync<Q: QueuePair + ?Sized>(
        &self,
        coro_id: usize,
        qp: &Q,
        local_addr: u64,
        remote_offset: u64,
        size: usize,
    ) -> Result<(), RdmaError> {
        self.transfer_sync(coro_id, qp, Opcode::RdmaWrite, local_addr, remote_offset, size)
    }

    /// Reads `size` bytes at `remote_offset` into `local_addr`, chunked like
    /// `write_sync`.
    pub fn read_sync<Q: QueuePair + ?Sized>(
        &self,
        coro_id: usize,
        qp: &Q,
        local_addr: u64,
        remote_offset: u64,
        size: usize,
    ) -> Result<(), RdmaError> {
        self.transfer_sync(coro_id, qp, Opcode::RdmaRead, local_addr, remote_offset, size)
    }

    /// Compare-and-swap on the 8-byte word at `remote_offset`. The previous
    /// remote value is stored at `local_addr`.
    pub fn cas_sync<Q: QueuePair + ?Sized>(
        &self,
        coro_id: usize,
        qp: &Q,
        local_addr: u64,
        remote_offset: u64,
        compare: u64,
        swap: u64,
    ) -> Result<(), RdmaError> {
        let op = Opcode::CompareSwap { compare, swap };
        self.post_and_wait(coro_id, qp, op, local_addr, 8, remote_offset, SendFlags::SIGNALED)
    }

    /// Posts the first `doorbell_size` requests of `chain` with one doorbell
    /// and waits for the single completion of the last one, which is tagged
    /// with `coro_id`.
    pub fn batch_sync<Q: QueuePair + ?Sized>(
        &self,
        coro_id: usize,
        qp: &Q,
        chain: &mut [SendWr],
        doorbell_size: usize,
    ) -> Result<(), RdmaError> {
        assert!(doorbell_size > 0 && doorbell_size <= chain.len());
        chain[doorbell_size - 1].wr_id = coro_id as u64;

        let coro = &self.coro_array[coro_id];
        coro.is_wait_poll.store(true, Ordering::Release);
        let r = qp
            .post_batch(&chain[..doorbell_size])
            .map_err(|e| {
                error!(
                    "thread {} coro {}: batch post failed: {}",
                    self.t_id, coro_id, e
                );
                e
            })
            .and_then(|_| self.wait_completion(coro_id, qp, doorbell_size - 1));
        coro.is_wait_poll.store(false, Ordering::Release);
        r
    }

    fn transfer_sync<Q: QueuePair + ?Sized>(
        &self,
        coro_id: usize,
        qp: &Q,
        op: Opcode,
        local_addr: u64,
        remote_offset: u64,
        size: usize,
    ) -> Result<(), RdmaError> {
        let mut done = 0;
        while done < size {
            let len = (size - done).min(self.max_msg_size);
            let mut flags = SendFlags::SIGNALED;
            if op == Opcode::RdmaWrite && len < INLINE_THRESHOLD {
                flags |= SendFlags::INLINE;
            }
            self.post_and_wait(
                coro_id,
                qp,
                op,
                local_addr + done as u64,
                len,
                remote_offset + done as u64,
                flags,
            )?;
            done += len;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn post_and_wait<Q: QueuePair + ?Sized>(
        &self,
        coro_id: usize,
        qp: &Q,
        op: Opcode,
        local_addr: u64,
        len: usize,
        remote_offset: u64,
        flags: SendFlags,
    ) -> Result<(), RdmaError> {
        let coro = &self.coro_array[coro_id];
        coro.is_wait_poll.store(true, Ordering::Release);
        let r = qp
            .post_send(op, local_addr, len as u32, remote_offset, flags, coro_id as u64)
            .map_err(|e| {
                error!("thread {} coro {}: post failed: {}", self.t_id, coro_id, e);
                e
            })
            .and_then(|_| self.wait_completion(coro_id, qp, 0));
        coro.is_wait_poll.store(false, Ordering::Release);
        r
    }

    /// Waits for the completion tagged `coro_id`. An error completion of an
    /// earlier request in the chain also flushes the up to `untagged`
    /// requests behind it; those completions are drained so that the next
    /// call doesn't pick them up.
    fn wait_completion<Q: QueuePair + ?Sized>(
        &self,
        coro_id: usize,
        qp: &Q,
        untagged: usize,
    ) -> Result<(), RdmaError> {
        let tag = coro_id as u64;
        let c = qp.poll_till_completion(self.poll_timeout).map_err(|e| {
            error!("thread {} coro {}: poll failed: {}", self.t_id, coro_id, e);
            e
        })?;
        if c.status != WcStatus::Success {
            error!(
                "thread {} coro {}: completion {} failed with {:?}",
                self.t_id, coro_id, c.wr_id, c.status
            );
            if c.wr_id != tag {
                self.drain_chain(coro_id, qp, untagged);
            }
            return Err(RdmaError::Completion {
                wr_id: c.wr_id,
                status: c.status,
            });
        }
        if c.wr_id != tag {
            error!(
                "thread {} coro {}: completion tagged {} instead",
                self.t_id, coro_id, c.wr_id
            );
            return Err(RdmaError::UnexpectedCompletion {
                expected: tag,
                got: c.wr_id,
            });
        }
        Ok(())
    }

    /// Polls away the flushed completions of a failed chain, up to and
    /// including the tagged one.
    fn drain_chain<Q: QueuePair + ?Sized>(&self, coro_id: usize, qp: &Q, max: usize) {
        for _ in 0..max {
            match qp.poll_till_completion(self.poll_timeout) {
                Ok(c) if c.wr_id == coro_id as u64 => return,
                Ok(c) => trace!("coro {}: drained completion {:?}", coro_id, c),
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::RegisteredBuffer;
    use crate::loopback::{LoopbackQp, RemoteRegion};
    use crate::rdma::UNTAGGED_WR_ID;

    // Tests that the run list links every coroutine in a circle.
    #[test]
    fn test_run_list() {
        let s = CoroutineScheduler::new(0, 3, 1024);
        assert_eq!(s.coro_num(), 3);
        assert_eq!(s.coroutine(0).prev_coro, 2);
        assert_eq!(s.coroutine(0).next_coro, 1);
        assert_eq!(s.coroutine(2).next_coro, 0);
        assert!(!s.coroutine(1).is_waiting());
    }

    // Tests that transfers above the limit are split into sequential chunks.
    #[test]
    fn test_write_sync_chunks() {
        let region = Arc::new(RemoteRegion::new(64));
        let qp = LoopbackQp::new(region.clone());
        let s = CoroutineScheduler::new(0, 1, 16);
        let local = RegisteredBuffer::new(40);
        let data: Vec<u8> = (0..40).collect();
        local.write(0, &data);

        s.write_sync(0, &qp, local.addr(), 8, 40).unwrap();
        assert_eq!(qp.single_posts(), 3);
        assert_eq!(region.read(8, 40), data);
        assert!(!s.coroutine(0).is_waiting());
    }

    // Tests that a transfer of exactly the limit is a single chunk.
    #[test]
    fn test_write_sync_at_limit() {
        let region = Arc::new(RemoteRegion::new(64));
        let qp = LoopbackQp::new(region);
        let s = CoroutineScheduler::new(0, 1, 16);
        let local = RegisteredBuffer::new(16);
        s.write_sync(0, &qp, local.addr(), 0, 16).unwrap();
        assert_eq!(qp.single_posts(), 1);
    }

    // Tests reading remote bytes back through chunked reads.
    #[test]
    fn test_read_sync() {
        let region = Arc::new(RemoteRegion::new(64));
        region.write(10, &[5; 30]);
        let qp = LoopbackQp::new(region);
        let s = CoroutineScheduler::new(0, 1, 8);
        let local = RegisteredBuffer::new(30);
        s.read_sync(0, &qp, local.addr(), 10, 30).unwrap();
        assert_eq!(local.to_vec(0, 30), vec![5; 30]);
    }

    // Tests claiming a remote word with compare-and-swap.
    #[test]
    fn test_cas_sync() {
        let region = Arc::new(RemoteRegion::new(16));
        let qp = LoopbackQp::new(region.clone());
        let s = CoroutineScheduler::new(0, 1, 1024);
        let local = RegisteredBuffer::new(8);
        s.cas_sync(0, &qp, local.addr(), 0, 0, 77).unwrap();
        assert_eq!(region.read_i64(0), 77);
        s.cas_sync(0, &qp, local.addr(), 0, 0, 88).unwrap();
        assert_eq!(region.read_i64(0), 77);
    }

    // Tests that post and poll failures are reported, not retried.
    #[test]
    fn test_failures_reported() {
        let region = Arc::new(RemoteRegion::new(16));
        let qp = LoopbackQp::new(region);
        let s = CoroutineScheduler::new(0, 1, 1024);
        let local = RegisteredBuffer::new(8);

        qp.fail_next_post();
        assert!(s.write_sync(0, &qp, local.addr(), 0, 8).is_err());
        assert_eq!(qp.single_posts(), 0);

        qp.fail_next_poll();
        match s.write_sync(0, &qp, local.addr(), 0, 8) {
            Err(RdmaError::Completion { .. }) => {}
            r => panic!("unexpected result {:?}", r),
        }
        assert!(!s.coroutine(0).is_waiting());
    }

    // Tests that a failed chain leaves no stale completions behind.
    #[test]
    fn test_failed_batch_drained() {
        let region = Arc::new(RemoteRegion::new(64));
        region.write(0, &[4; 8]);
        let qp = LoopbackQp::new(region.clone());
        let s = CoroutineScheduler::new(0, 1, 1024);
        let local = RegisteredBuffer::new(8);
        let remote = qp.remote_mr();
        let lkey = qp.local_mr().key;
        let mut chain: Vec<SendWr> = [1000u64, 8, 16]
            .iter()
            .map(|&off| {
                let mut wr = SendWr::write(local.addr(), 8, remote.buf + off);
                wr.rkey = remote.key;
                wr.sge.lkey = lkey;
                wr
            })
            .collect();
        chain[2].flags = SendFlags::SIGNALED;

        match s.batch_sync(0, &qp, &mut chain, 3) {
            Err(RdmaError::Completion { wr_id, .. }) => assert_eq!(wr_id, UNTAGGED_WR_ID),
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(qp.poll_till_completion(None), Err(RdmaError::PollTimeout));

        s.read_sync(0, &qp, local.addr(), 0, 8).unwrap();
        assert_eq!(local.to_vec(0, 8), vec![4; 8]);
    }

    // Tests that a completion carrying a foreign tag is an error.
    #[test]
    fn test_foreign_completion() {
        let region = Arc::new(RemoteRegion::new(16));
        let qp = LoopbackQp::new(region);
        let s = CoroutineScheduler::new(0, 2, 1024);
        let local = RegisteredBuffer::new(8);
        qp.post_send(Opcode::RdmaWrite, local.addr(), 8, 0, SendFlags::SIGNALED, 1)
            .unwrap();
        assert_eq!(
            s.write_sync(0, &qp, local.addr(), 8, 8),
            Err(RdmaError::UnexpectedCompletion {
                expected: 0,
                got: 1
            })
        );
    }

    // Tests that a batch is tagged on its last request and completes once.
    #[test]
    fn test_batch_sync_tags_last() {
        let region = Arc::new(RemoteRegion::new(64));
        let qp = LoopbackQp::new(region.clone());
        let s = CoroutineScheduler::new(0, 2, 1024);
        let local = RegisteredBuffer::new(8);
        local.write(0, &[1; 8]);
        let remote = qp.remote_mr();
        let lkey = qp.local_mr().key;
        let mut chain: Vec<SendWr> = (0..3u64)
            .map(|i| {
                let mut wr = SendWr::write(local.addr(), 8, remote.buf + i * 8);
                wr.rkey = remote.key;
                wr.sge.lkey = lkey;
                wr
            })
            .collect();
        chain[2].flags = SendFlags::SIGNALED;

        s.batch_sync(1, &qp, &mut chain, 3).unwrap();
        let posted = qp.batches();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0][2].wr_id, 1);
        assert_eq!(region.read(0, 24), vec![1; 24]);
        assert_eq!(qp.poll_till_completion(None), Err(RdmaError::PollTimeout));
    }
}
