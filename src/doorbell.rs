// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Doorbell batches: chains of RDMA writes posted with one doorbell ring and
//! observed through one completion.

use arrayvec::ArrayVec;

use crate::coroutine::CoroutineScheduler;
use crate::error::RdmaError;
use crate::rdma::{QueuePair, SendFlags, SendWr};
use crate::INLINE_THRESHOLD;

/// A contiguous local range and where it goes in the remote region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSegment {
    pub local_addr: u64,
    pub remote_offset: u64,
    pub len: u32,
}

impl LogSegment {
    pub fn new(local_addr: u64, remote_offset: u64, len: usize) -> LogSegment {
        LogSegment {
            local_addr,
            remote_offset,
            len: len as u32,
        }
    }
}

/// Builds a write request for `seg`. Small payloads go inline.
fn write_req(seg: LogSegment) -> SendWr {
    let mut wr = SendWr::write(seg.local_addr, seg.len, seg.remote_offset);
    if (seg.len as usize) < INLINE_THRESHOLD {
        wr.flags = SendFlags::INLINE;
    }
    wr
}

/// A batch of chained write requests.
///
/// Implementors only hold the requests; `send_reqs` finishes the chain
/// (rebasing, keys, signaling) and rings the doorbell.
pub trait Doorbell {
    /// The requests built so far.
    fn requests(&self) -> &[SendWr];

    fn requests_mut(&mut self) -> &mut [SendWr];

    /// Number of requests the batch must hold before it can be sent.
    fn expected_len(&self) -> usize;

    /// Rebases every remote offset onto `qp.remote_mr()`, sets the remote
    /// and local keys, signals only the last request and posts the chain
    /// through `batch_sync`.
    ///
    /// # Panics
    /// If the batch does not hold exactly `expected_len()` requests.
    fn send_reqs<Q: QueuePair + ?Sized>(
        &mut self,
        sched: &CoroutineScheduler,
        qp: &Q,
        coro_id: usize,
    ) -> Result<(), RdmaError> {
        let expected = self.expected_len();
        assert_eq!(
            self.requests().len(),
            expected,
            "doorbell batch sent before all requests were set"
        );
        let remote = qp.remote_mr();
        let lkey = qp.local_mr().key;

        let reqs = self.requests_mut();
        let last = reqs.len() - 1;
        for (i, wr) in reqs.iter_mut().enumerate() {
            wr.remote_addr += remote.buf;
            wr.rkey = remote.key;
            wr.sge.lkey = lkey;
            wr.flags.set(SendFlags::SIGNALED, i == last);
        }

        sched.batch_sync(coro_id, qp, reqs, expected).map_err(|e| {
            error!("doorbell batch of {} requests failed: {}", expected, e);
            e
        })
    }
}

/// One write per dirty lock slot.
pub struct LockWriteBatch {
    reqs: Vec<SendWr>,
    capacity: usize,
}

impl LockWriteBatch {
    /// Creates a batch that must be filled with exactly `n` requests.
    pub fn new(n: usize) -> LockWriteBatch {
        assert!(n > 0, "Empty lock batch");
        LockWriteBatch {
            reqs: Vec::with_capacity(n),
            capacity: n,
        }
    }

    /// Appends the write of one lock record.
    pub fn set_next_lock_write_req(&mut self, local_addr: u64, remote_offset: u64, size: usize) {
        assert!(self.reqs.len() < self.capacity, "lock batch overfilled");
        self.reqs
            .push(write_req(LogSegment::new(local_addr, remote_offset, size)));
    }
}

impl Doorbell for LockWriteBatch {
    fn requests(&self) -> &[SendWr] {
        &self.reqs
    }

    fn requests_mut(&mut self) -> &mut [SendWr] {
        &mut self.reqs
    }

    fn expected_len(&self) -> usize {
        self.capacity
    }
}

/// The three log pointer writes that close every log batch.
#[derive(Debug, Clone, Copy)]
pub struct LogPointers {
    pub head: LogSegment,
    pub tail: LogSegment,
    pub state_tail: LogSegment,
}

/// A log batch of `N` requests: `N - 3` log ranges followed by the head,
/// tail and state-tail pointer writes.
pub struct LogBatch<const N: usize> {
    reqs: ArrayVec<SendWr, N>,
}

/// Single contiguous dirty range.
pub type LogWriteBatch = LogBatch<4>;

/// Dirty range that wraps: suffix before the end, prefix after the start.
pub type LogWriteTwoRangeBatch = LogBatch<5>;

impl<const N: usize> LogBatch<N> {
    fn build(ranges: &[LogSegment], ptrs: &LogPointers) -> LogBatch<N> {
        debug_assert_eq!(ranges.len() + 3, N);
        let mut reqs = ArrayVec::new();
        for r in ranges {
            reqs.push(write_req(*r));
        }
        reqs.push(write_req(ptrs.head));
        reqs.push(write_req(ptrs.tail));
        reqs.push(write_req(ptrs.state_tail));
        LogBatch { reqs }
    }
}

impl LogBatch<4> {
    pub fn single_range(range: LogSegment, ptrs: &LogPointers) -> LogWriteBatch {
        LogBatch::build(&[range], ptrs)
    }
}

impl LogBatch<5> {
    pub fn two_range(suffix: LogSegment, prefix: LogSegment, ptrs: &LogPointers) -> LogWriteTwoRangeBatch {
        LogBatch::build(&[suffix, prefix], ptrs)
    }
}

impl<const N: usize> Doorbell for LogBatch<N> {
    fn requests(&self) -> &[SendWr] {
        &self.reqs
    }

    fn requests_mut(&mut self) -> &mut [SendWr] {
        &mut self.reqs
    }

    fn expected_len(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::RegisteredBuffer;
    use crate::loopback::{LoopbackQp, RemoteRegion};

    fn pointers(meta: &RegisteredBuffer, base: u64) -> LogPointers {
        LogPointers {
            head: LogSegment::new(meta.addr_at(0), base, 8),
            tail: LogSegment::new(meta.addr_at(8), base + 8, 8),
            state_tail: LogSegment::new(meta.addr_at(16), base + 16, 8),
        }
    }

    // Tests that a lock batch is rebased, keyed and signaled only at the end.
    #[test]
    fn test_lock_batch_chain() {
        let region = Arc::new(RemoteRegion::new(2 + 16 * 16));
        let qp = LoopbackQp::new(region.clone());
        let sched = CoroutineScheduler::new(0, 1, 1 << 20);
        let local = RegisteredBuffer::new(32);
        local.write(0, &[0xAB; 16]);
        local.write(16, &[0xCD; 16]);

        let mut batch = LockWriteBatch::new(2);
        batch.set_next_lock_write_req(local.addr_at(0), 2 + 16 * 2, 16);
        batch.set_next_lock_write_req(local.addr_at(16), 2 + 16 * 5, 16);
        batch.send_reqs(&sched, &qp, 0).unwrap();

        let chain = &qp.batches()[0];
        let remote = qp.remote_mr();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].remote_addr, remote.buf + 34);
        assert!(chain.iter().all(|wr| wr.rkey == remote.key));
        assert!(chain.iter().all(|wr| wr.flags.contains(SendFlags::INLINE)));
        assert!(!chain[0].flags.contains(SendFlags::SIGNALED));
        assert!(chain[1].flags.contains(SendFlags::SIGNALED));
        assert_eq!(region.read(34, 16), vec![0xAB; 16]);
        assert_eq!(region.read(82, 16), vec![0xCD; 16]);
    }

    // Tests that sending a lock batch with missing requests panics.
    #[test]
    #[should_panic(expected = "before all requests")]
    fn test_lock_batch_underfilled() {
        let region = Arc::new(RemoteRegion::new(64));
        let qp = LoopbackQp::new(region);
        let sched = CoroutineScheduler::new(0, 1, 1 << 20);
        let mut batch = LockWriteBatch::new(2);
        batch.set_next_lock_write_req(0, 0, 16);
        let _ = batch.send_reqs(&sched, &qp, 0);
    }

    // Tests the four-request log batch layout.
    #[test]
    fn test_single_range_log_batch() {
        let region = Arc::new(RemoteRegion::new(100 + 24));
        let qp = LoopbackQp::new(region.clone());
        let sched = CoroutineScheduler::new(0, 1, 1 << 20);
        let log = RegisteredBuffer::new(100);
        log.write(10, &[7; 70]);
        let meta = RegisteredBuffer::new(24);
        meta.write(16, &80i64.to_le_bytes());

        let mut batch = LogWriteBatch::single_range(
            LogSegment::new(log.addr_at(10), 10, 70),
            &pointers(&meta, 100),
        );
        assert_eq!(batch.requests().len(), 4);
        assert!(!batch.requests()[0].flags.contains(SendFlags::INLINE));
        batch.send_reqs(&sched, &qp, 0).unwrap();

        assert_eq!(region.read(10, 70), vec![7; 70]);
        assert_eq!(region.read_i64(116), 80);
    }

    // Tests the five-request log batch layout for a wrapped range.
    #[test]
    fn test_two_range_log_batch() {
        let region = Arc::new(RemoteRegion::new(100 + 24));
        let qp = LoopbackQp::new(region.clone());
        let sched = CoroutineScheduler::new(0, 1, 1 << 20);
        let log = RegisteredBuffer::new(100);
        log.write(80, &[1; 20]);
        log.write(0, &[2; 20]);
        let meta = RegisteredBuffer::new(24);

        let mut batch = LogWriteTwoRangeBatch::two_range(
            LogSegment::new(log.addr_at(80), 80, 20),
            LogSegment::new(log.addr_at(0), 0, 20),
            &pointers(&meta, 100),
        );
        batch.send_reqs(&sched, &qp, 0).unwrap();

        let chain = &qp.batches()[0];
        assert_eq!(chain.len(), 5);
        assert_eq!(chain[4].wr_id, 0);
        assert_eq!(region.read(80, 20), vec![1; 20]);
        assert_eq!(region.read(0, 20), vec![2; 20]);
    }

    // Tests that a failing batch is reported to the caller.
    #[test]
    fn test_batch_failure_reported() {
        let region = Arc::new(RemoteRegion::new(64));
        let qp = LoopbackQp::new(region);
        let sched = CoroutineScheduler::new(0, 1, 1 << 20);
        let local = RegisteredBuffer::new(16);
        let mut batch = LockWriteBatch::new(1);
        batch.set_next_lock_write_req(local.addr(), 0, 16);
        qp.fail_next_post();
        assert!(batch.send_reqs(&sched, &qp, 0).is_err());
    }
}
