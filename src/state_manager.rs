// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The state manager: stages lock and log state locally and replicates it to
//! the backup's memory, and on the backup reads it back.
//!
//! Remote layout of the lock region is `[bitmap][slot 0][slot 1]...`, each
//! slot holding one 16-byte lock record. The log region holds the log bytes
//! followed by three little endian i64 pointers: head, tail and state-tail.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::bitmap::LockBitmap;
use crate::buffer::{CircularBuffer, RegisteredBuffer};
use crate::config::StateConfig;
use crate::coroutine::CoroutineScheduler;
use crate::doorbell::{
    Doorbell, LockWriteBatch, LogPointers, LogSegment, LogWriteBatch, LogWriteTwoRangeBatch,
};
use crate::error::StateError;
use crate::lock::{LockRecord, LockTable};
use crate::rdma::QueuePair;
use crate::{LOCK_STATE_SIZE_LOCAL, LOCK_STATE_SIZE_REMOTE, LOG_META_SIZE};

/// Coroutine used for every state flush.
const FLUSH_CORO: usize = 0;

/// What the log flusher has made durable on the backup.
#[derive(Debug, Default)]
struct LogFlushState {
    /// Offset in the log buffer up to which bytes are on the backup.
    flushed_log_offset: usize,
    /// Total log bytes flushed so far; never wraps.
    flushed_log_bytes: u64,
}

/// Log cursors captured by the last `flush_states`: the log should be made
/// durable up to `need_flush`.
#[derive(Debug, Default, Clone, Copy)]
struct LogWatermark {
    need_flush: usize,
    head: usize,
    tail: usize,
}

/// Wake-up flags of the background flushers.
#[derive(Debug, Default)]
struct FlushSignals {
    lock_pending: bool,
    log_pending: bool,
    stopped: bool,
}

/// Tracks and replicates the lock table and log of a primary node.
///
/// All methods take `&self`; the manager is meant to be shared between the
/// transaction threads that append state and the threads that flush it.
///
/// # Locking
/// At most one `flush_states` runs at a time (`state_latch`). Lock slot
/// allocation and staging happen under `lock_latch`, which `flush_states`
/// also holds while it snapshots the lock buffer tail and the bitmap, so
/// every bit in a snapshot has its record before the snapshot tail. A lock
/// flush holds `lock_flush` from its snapshot until the staged range is
/// released. Latches are always taken in the order `state_latch`,
/// `lock_flush`, `lock_latch`, and `log_flush` before `watermark`.
pub struct StateManager<Q: QueuePair> {
    config: StateConfig,
    sched: CoroutineScheduler,

    state_latch: Mutex<()>,

    lock_latch: Mutex<LockBitmap>,
    lock_buffer: CircularBuffer,
    /// Offset of the first staged lock record not yet on the backup.
    lock_flush: Mutex<usize>,
    bitmap_buf: RegisteredBuffer,
    slot_buf: RegisteredBuffer,
    lock_qp: Q,

    log_buffer: CircularBuffer,
    log_meta: RegisteredBuffer,
    log_flush: Mutex<LogFlushState>,
    watermark: Mutex<LogWatermark>,
    log_qp: Q,
    remote_log_head_off: u64,
    remote_log_tail_off: u64,
    remote_log_state_tail_off: u64,

    signals: Mutex<FlushSignals>,
    lock_cv: Condvar,
    log_cv: Condvar,
}

impl<Q: QueuePair> StateManager<Q> {
    /// Creates a state manager replicating locks through `lock_qp` and the
    /// log through `log_qp`.
    ///
    /// # Panics
    /// If `config` is inconsistent, e.g. the lock buffer does not hold a
    /// whole number of records.
    pub fn new(config: StateConfig, lock_qp: Q, log_qp: Q) -> StateManager<Q> {
        config.validate();
        let bitmap = LockBitmap::new(config.lock_slots, config.thread_num);
        let bitmap_size = bitmap.bitmap_size();
        let sched = CoroutineScheduler::new(0, config.coro_num, config.max_msg_size)
            .with_poll_timeout(config.poll_timeout);
        let remote_log_head_off = config.log_buffer_size as u64;

        StateManager {
            sched,
            state_latch: Mutex::new(()),
            lock_latch: Mutex::new(bitmap),
            lock_buffer: CircularBuffer::new(config.lock_buffer_size),
            lock_flush: Mutex::new(0),
            bitmap_buf: RegisteredBuffer::new(bitmap_size),
            slot_buf: RegisteredBuffer::new(LOCK_STATE_SIZE_REMOTE),
            lock_qp,
            // One byte stays free so that a tail equal to the flushed offset
            // always means nothing is dirty.
            log_buffer: CircularBuffer::with_reserve(config.log_buffer_size, 1),
            log_meta: RegisteredBuffer::new(LOG_META_SIZE),
            log_flush: Mutex::new(Default::default()),
            watermark: Mutex::new(Default::default()),
            log_qp,
            remote_log_head_off,
            remote_log_tail_off: remote_log_head_off + 8,
            remote_log_state_tail_off: remote_log_head_off + 16,
            signals: Mutex::new(Default::default()),
            lock_cv: Condvar::new(),
            log_cv: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &CoroutineScheduler {
        &self.sched
    }

    /// Bytes of the lock bitmap at the start of the remote lock region.
    pub fn bitmap_size(&self) -> usize {
        self.bitmap_buf.len()
    }

    /// Remote offset of lock slot `slot`.
    pub fn lock_remote_offset(&self, slot: usize) -> u64 {
        (slot * LOCK_STATE_SIZE_REMOTE + self.bitmap_size()) as u64
    }

    /// Offset of the first staged lock record not yet flushed.
    pub fn flush_first_lock(&self) -> usize {
        *self.lock_flush.lock()
    }

    /// Offset in the log buffer up to which the log is on the backup.
    pub fn flushed_log_offset(&self) -> usize {
        self.log_flush.lock().flushed_log_offset
    }

    /// Total number of log bytes flushed since creation.
    pub fn flushed_log_bytes(&self) -> u64 {
        self.log_flush.lock().flushed_log_bytes
    }

    /// Copy of the current local lock bitmap.
    pub fn bitmap_snapshot(&self) -> Vec<u8> {
        self.lock_latch.lock().as_bytes().to_vec()
    }

    pub fn lock_buffer(&self) -> &CircularBuffer {
        &self.lock_buffer
    }

    pub fn log_buffer(&self) -> &CircularBuffer {
        &self.log_buffer
    }

    /// Stages a lock for replication. A lock without a slot gets the first
    /// free slot of `thread`'s bitmap partition. Returns the slot.
    pub fn append_lock_state(&self, lock: &mut LockRecord, thread: usize) -> Result<usize, StateError> {
        let slot = {
            let mut bitmap = self.lock_latch.lock();
            let fresh = lock.offset.is_none();
            let slot = match lock.offset {
                Some(slot) => slot,
                None => bitmap
                    .get_first_free_bit(thread)
                    .ok_or(StateError::NoFreeSlot { thread })?,
            };
            lock.offset = Some(slot);

            if let Err(e) = self.lock_buffer.write_lock(lock) {
                if fresh {
                    bitmap.set_bit_to_free(slot);
                    lock.offset = None;
                }
                return Err(e.into());
            }
            slot
        };

        let mut s = self.signals.lock();
        s.lock_pending = true;
        self.lock_cv.notify_one();
        Ok(slot)
    }

    /// Releases a lock's slot. The slot record stays on the backup but its
    /// bit is cleared by the next `flush_states`.
    pub fn erase_lock_state(&self, lock: &mut LockRecord) {
        if let Some(slot) = lock.offset.take() {
            self.lock_latch.lock().set_bit_to_free(slot);
        }
    }

    /// Stages log bytes. Returns the offset they were written at.
    pub fn append_log(&self, data: &[u8]) -> Result<usize, StateError> {
        Ok(self.log_buffer.write(data)?)
    }

    /// Reclaims log bytes up to `new_head` once they are no longer needed.
    /// Only bytes already on the backup can be reclaimed; anything past the
    /// flushed offset is refused with `UnflushedLog`.
    pub fn release_log(&self, new_head: usize) -> Result<(), StateError> {
        let st = self.log_flush.lock();
        let size = self.log_buffer.size();
        let head = self.log_buffer.head();
        let flushed = st.flushed_log_offset;
        let releasable = (flushed + size - head) % size;
        if new_head >= size || (new_head + size - head) % size > releasable {
            warn!(
                "refusing to release log up to {}: flushed up to {}",
                new_head, flushed
            );
            return Err(StateError::UnflushedLog { new_head, flushed });
        }
        self.log_buffer.advance_head(new_head);
        Ok(())
    }

    /// Flushes the lock records staged between the last flushed offset and
    /// `curr_tail` with a single doorbell batch. `curr_tail` and `free_size`
    /// must come from one snapshot of the lock buffer taken after the last
    /// flush. Returns the number of records sent.
    ///
    /// # Panics
    /// If the batch fails: a partially replicated lock table can't be told
    /// apart from a failed one.
    pub fn flush_locks(&self, curr_tail: usize, free_size: usize) -> usize {
        let mut first = self.lock_flush.lock();
        self.flush_locks_from(&mut first, curr_tail, free_size)
    }

    /// Snapshots the lock buffer and flushes everything staged so far.
    pub fn flush_dirty_locks(&self) -> usize {
        let mut first = self.lock_flush.lock();
        let (tail, free) = {
            let _bitmap = self.lock_latch.lock();
            self.lock_buffer.tail_and_free_size()
        };
        self.flush_locks_from(&mut first, tail, free)
    }

    fn flush_locks_from(&self, first: &mut usize, last: usize, free_size: usize) -> usize {
        let size = self.lock_buffer.size();
        let dirty = if *first == last && free_size < size {
            size
        } else {
            (last + size - *first) % size
        };
        let count = dirty / LOCK_STATE_SIZE_LOCAL;
        if count == 0 {
            return 0;
        }

        let mem = self.lock_buffer.memory();
        let mut batch = LockWriteBatch::new(count);
        let mut offset = *first;
        for _ in 0..count {
            let lock = self.lock_buffer.read_lock(offset);
            let slot = lock
                .offset
                .expect("staged lock records always carry their slot");
            batch.set_next_lock_write_req(
                mem.addr_at(offset),
                self.lock_remote_offset(slot),
                LOCK_STATE_SIZE_REMOTE,
            );
            offset = (offset + LOCK_STATE_SIZE_LOCAL) % size;
        }

        if let Err(e) = batch.send_reqs(&self.sched, &self.lock_qp, FLUSH_CORO) {
            error!("Failed to flush {} lock records to the backup", count);
            panic!("lock state replication failed: {}", e);
        }

        self.lock_buffer
            .release(*first, last, count * LOCK_STATE_SIZE_LOCAL);
        trace!("flushed {} lock records [{}, {})", count, *first, last);
        *first = last;
        count
    }

    /// Flushes the log range between the last flushed offset and
    /// `curr_state_tail`, together with the head, tail and state-tail
    /// pointers. A range that wraps the buffer end goes out as two ranges.
    ///
    /// # Panics
    /// If the batch fails.
    pub fn flush_logs(&self, curr_state_tail: usize, curr_head: usize, curr_tail: usize) {
        let mut st = self.log_flush.lock();
        self.flush_logs_locked(&mut st, curr_state_tail, curr_head, curr_tail);
    }

    /// Flushes the log up to the watermark of the last `flush_states`.
    /// Returns whether anything was sent.
    pub fn flush_pending_logs(&self) -> bool {
        let mut st = self.log_flush.lock();
        let w = *self.watermark.lock();
        if w.need_flush == st.flushed_log_offset {
            return false;
        }
        self.flush_logs_locked(&mut st, w.need_flush, w.head, w.tail);
        true
    }

    fn flush_logs_locked(
        &self,
        st: &mut LogFlushState,
        curr_state_tail: usize,
        curr_head: usize,
        curr_tail: usize,
    ) {
        let size = self.log_buffer.size();
        assert!(curr_state_tail < size && curr_head < size && curr_tail < size);
        let flushed = st.flushed_log_offset;
        if flushed == curr_state_tail {
            return;
        }

        self.log_meta.write(0, &(curr_head as i64).to_le_bytes());
        self.log_meta.write(8, &(curr_tail as i64).to_le_bytes());
        self.log_meta.write(16, &(curr_state_tail as i64).to_le_bytes());
        let ptrs = LogPointers {
            head: LogSegment::new(self.log_meta.addr_at(0), self.remote_log_head_off, 8),
            tail: LogSegment::new(self.log_meta.addr_at(8), self.remote_log_tail_off, 8),
            state_tail: LogSegment::new(
                self.log_meta.addr_at(16),
                self.remote_log_state_tail_off,
                8,
            ),
        };

        let mem = self.log_buffer.memory();
        let r = if flushed < curr_state_tail || curr_state_tail == 0 {
            let end = if curr_state_tail == 0 { size } else { curr_state_tail };
            let range = LogSegment::new(mem.addr_at(flushed), flushed as u64, end - flushed);
            LogWriteBatch::single_range(range, &ptrs).send_reqs(&self.sched, &self.log_qp, FLUSH_CORO)
        } else {
            let suffix = LogSegment::new(mem.addr_at(flushed), flushed as u64, size - flushed);
            let prefix = LogSegment::new(mem.addr_at(0), 0, curr_state_tail);
            LogWriteTwoRangeBatch::two_range(suffix, prefix, &ptrs).send_reqs(
                &self.sched,
                &self.log_qp,
                FLUSH_CORO,
            )
        };
        if let Err(e) = r {
            error!(
                "Failed to flush log [{}, {}) to the backup",
                flushed, curr_state_tail
            );
            panic!("log state replication failed: {}", e);
        }

        let dirty = (curr_state_tail + size - flushed) % size;
        st.flushed_log_bytes += dirty as u64;
        st.flushed_log_offset = curr_state_tail;
        trace!("flushed {} log bytes up to {}", dirty, curr_state_tail);
    }

    /// Replicates a consistent checkpoint of the lock state and moves the log
    /// watermark to the current log tail.
    ///
    /// Lock records staged before the snapshot are written first, then the
    /// bitmap snapshot, so the backup never sees a live bit ahead of its
    /// slot contents. The log itself is flushed by the log flusher (or
    /// `flush_pending_logs`) up to the new watermark.
    ///
    /// # Panics
    /// If replicating the lock state fails.
    pub fn flush_states(&self) {
        let _state = self.state_latch.lock();
        let (log_head, log_tail) = self.log_buffer.head_and_tail();

        {
            let mut first = self.lock_flush.lock();
            let (lock_tail, lock_free) = {
                let bitmap = self.lock_latch.lock();
                self.bitmap_buf.write(0, bitmap.as_bytes());
                self.lock_buffer.tail_and_free_size()
            };

            self.flush_locks_from(&mut first, lock_tail, lock_free);
            if let Err(e) = self.sched.write_sync(
                FLUSH_CORO,
                &self.lock_qp,
                self.bitmap_buf.addr(),
                0,
                self.bitmap_size(),
            ) {
                error!("Failed to write the lock bitmap to the backup");
                panic!("lock bitmap replication failed: {}", e);
            }
        }

        *self.watermark.lock() = LogWatermark {
            need_flush: log_tail,
            head: log_head,
            tail: log_tail,
        };
        let mut s = self.signals.lock();
        s.log_pending = true;
        self.log_cv.notify_one();
        debug!("checkpoint: log watermark at {}", log_tail);
    }

    /// Rebuilds `table` from the replicated bitmap and lock slots. Slots are
    /// visited in ascending order. The local bitmap adopts the remote one so
    /// that a promoted backup does not hand out occupied slots.
    ///
    /// Returns the number of locks inserted.
    pub fn fetch_lock_states(&self, table: &mut LockTable) -> Result<usize, StateError> {
        let _state = self.state_latch.lock();
        let bitmap_size = self.bitmap_size();
        self.bitmap_buf.clear(0, bitmap_size);
        self.sched
            .read_sync(FLUSH_CORO, &self.lock_qp, self.bitmap_buf.addr(), 0, bitmap_size)?;
        let remote_bitmap = self.bitmap_buf.to_vec(0, bitmap_size);

        let mut inserted = 0;
        for bit in LockBitmap::valid_bits(&remote_bitmap) {
            if bit >= self.config.lock_slots {
                warn!("ignoring bit {} past the last lock slot", bit);
                continue;
            }
            self.sched.read_sync(
                FLUSH_CORO,
                &self.lock_qp,
                self.slot_buf.addr(),
                self.lock_remote_offset(bit),
                LOCK_STATE_SIZE_REMOTE,
            )?;
            let mut raw = [0u8; LOCK_STATE_SIZE_REMOTE];
            self.slot_buf.read(0, &mut raw);
            let mut lock = LockRecord::decode_remote(&raw);
            lock.offset = Some(bit);
            table.insert_reconstructed(lock);
            inserted += 1;
        }

        self.lock_latch.lock().load(&remote_bitmap);
        info!("recovered {} locks from the backup region", inserted);
        Ok(inserted)
    }

    /// Reloads the log from the backup region: restores the head and
    /// state-tail pointers and reads back the bytes between them. Bytes past
    /// the state-tail were never made durable and are dropped.
    ///
    /// Returns the number of log bytes recovered.
    pub fn fetch_log_states(&self) -> Result<usize, StateError> {
        let mut st = self.log_flush.lock();
        self.log_meta.clear(0, LOG_META_SIZE);
        self.sched.read_sync(
            FLUSH_CORO,
            &self.log_qp,
            self.log_meta.addr(),
            self.remote_log_head_off,
            LOG_META_SIZE,
        )?;
        let word = |off: usize| {
            let mut raw = [0u8; 8];
            self.log_meta.read(off, &mut raw);
            i64::from_le_bytes(raw)
        };
        let (head, tail, state_tail) = (word(0), word(8), word(16));

        let size = self.log_buffer.size();
        let in_range = |v: i64| v >= 0 && (v as usize) < size;
        if !in_range(head) || !in_range(state_tail) {
            return Err(StateError::CorruptLog { head, state_tail });
        }
        let (head, state_tail) = (head as usize, state_tail as usize);
        let used = (state_tail + size - head) % size;
        debug!(
            "recovering log: head={} tail={} state_tail={}",
            head, tail, state_tail
        );

        let mem = self.log_buffer.memory();
        if head < state_tail {
            self.sched
                .read_sync(FLUSH_CORO, &self.log_qp, mem.addr_at(head), head as u64, used)?;
        } else if used > 0 {
            let first = size - head;
            self.sched
                .read_sync(FLUSH_CORO, &self.log_qp, mem.addr_at(head), head as u64, first)?;
            self.sched
                .read_sync(FLUSH_CORO, &self.log_qp, mem.addr(), 0, used - first)?;
        }

        self.log_buffer.restore(head, state_tail, used);
        st.flushed_log_offset = state_tail;
        *self.watermark.lock() = LogWatermark {
            need_flush: state_tail,
            head,
            tail: state_tail,
        };
        info!("recovered {} log bytes from the backup region", used);
        Ok(used)
    }

    fn lock_flush_loop(&self) {
        loop {
            {
                let mut s = self.signals.lock();
                while !s.lock_pending && !s.stopped {
                    self.lock_cv.wait(&mut s);
                }
                if !s.lock_pending {
                    break;
                }
                s.lock_pending = false;
            }
            self.flush_dirty_locks();
        }
    }

    fn log_flush_loop(&self) {
        loop {
            {
                let mut s = self.signals.lock();
                while !s.log_pending && !s.stopped {
                    self.log_cv.wait(&mut s);
                }
                if !s.log_pending {
                    break;
                }
                s.log_pending = false;
            }
            self.flush_pending_logs();
        }
    }
}

impl<Q: QueuePair + 'static> StateManager<Q> {
    /// Starts the background lock and log flushers. Staged lock records are
    /// flushed as they arrive; the log is flushed whenever `flush_states`
    /// moves the watermark. The flushers finish pending work and stop when
    /// the returned handle is dropped.
    pub fn spawn_flushers(self: &Arc<Self>) -> Flushers<Q> {
        self.signals.lock().stopped = false;
        let lock_mgr = self.clone();
        let log_mgr = self.clone();
        let handles = vec![
            thread::Builder::new()
                .name(String::from("lock-flusher"))
                .spawn(move || lock_mgr.lock_flush_loop()),
            thread::Builder::new()
                .name(String::from("log-flusher"))
                .spawn(move || log_mgr.log_flush_loop()),
        ]
        .into_iter()
        .filter_map(|h| match h {
            Ok(h) => Some(h),
            Err(e) => {
                error!("Failed to spawn flusher thread: {}", e);
                None
            }
        })
        .collect();

        Flushers {
            mgr: self.clone(),
            handles,
        }
    }
}

/// Handle of the background flushers; stops and joins them on drop.
pub struct Flushers<Q: QueuePair + 'static> {
    mgr: Arc<StateManager<Q>>,
    handles: Vec<JoinHandle<()>>,
}

impl<Q: QueuePair + 'static> Flushers<Q> {
    /// Stops the flushers after they drained pending work. Returns false if
    /// one of them died, i.e. replication failed.
    pub fn shutdown(mut self) -> bool {
        self.stop()
    }

    fn stop(&mut self) -> bool {
        {
            let mut s = self.mgr.signals.lock();
            s.stopped = true;
            self.mgr.lock_cv.notify_all();
            self.mgr.log_cv.notify_all();
        }
        let mut clean = true;
        for h in self.handles.drain(..) {
            if h.join().is_err() {
                error!("A state flusher thread panicked");
                clean = false;
            }
        }
        clean
    }
}

impl<Q: QueuePair + 'static> Drop for Flushers<Q> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::loopback::{LoopbackQp, RemoteRegion};
    use crate::rdma::SendFlags;

    struct Setup {
        mgr: StateManager<Arc<LoopbackQp>>,
        lock_qp: Arc<LoopbackQp>,
        log_qp: Arc<LoopbackQp>,
        lock_region: Arc<RemoteRegion>,
        log_region: Arc<RemoteRegion>,
    }

    fn setup(slots: usize, lock_records: usize, log_size: usize) -> Setup {
        let config = StateConfig {
            lock_slots: slots,
            lock_buffer_size: lock_records * LOCK_STATE_SIZE_LOCAL,
            log_buffer_size: log_size,
            ..Default::default()
        };
        let lock_region = Arc::new(RemoteRegion::new(config.lock_region_size()));
        let log_region = Arc::new(RemoteRegion::new(config.log_region_size()));
        let lock_qp = Arc::new(LoopbackQp::new(lock_region.clone()));
        let log_qp = Arc::new(LoopbackQp::new(log_region.clone()));
        Setup {
            mgr: StateManager::new(config, lock_qp.clone(), log_qp.clone()),
            lock_qp,
            log_qp,
            lock_region,
            log_region,
        }
    }

    // Tests that appended locks get consecutive slots of the thread.
    #[test]
    fn test_append_assigns_slots() {
        let s = setup(16, 8, 128);
        let mut a = LockRecord::record(1, 0, 1, 7);
        let mut b = LockRecord::record(2, 0, 1, 8);
        assert_eq!(s.mgr.append_lock_state(&mut a, 0), Ok(0));
        assert_eq!(s.mgr.append_lock_state(&mut b, 0), Ok(1));
        assert_eq!(a.offset, Some(0));
        // Re-appending keeps the slot.
        assert_eq!(s.mgr.append_lock_state(&mut a, 0), Ok(0));
        assert_eq!(s.mgr.lock_buffer().tail_and_free_size(), (60, 100));
    }

    // Tests that flush_locks writes each record at its slot's remote offset.
    #[test]
    fn test_flush_locks_writes_slots() {
        let s = setup(16, 8, 128);
        let mut a = LockRecord::record(1, 0, 1, 7);
        let mut b = LockRecord::record(2, 0, 3, 9);
        s.mgr.append_lock_state(&mut a, 0).unwrap();
        s.mgr.append_lock_state(&mut b, 0).unwrap();

        let (tail, free) = s.mgr.lock_buffer().tail_and_free_size();
        assert_eq!(s.mgr.flush_locks(tail, free), 2);
        assert_eq!(s.mgr.flush_first_lock(), tail);
        assert_eq!(s.mgr.lock_buffer().free_size(), 8 * LOCK_STATE_SIZE_LOCAL);

        assert_eq!(s.lock_region.read(2, 16), a.encode_remote().to_vec());
        assert_eq!(s.lock_region.read(18, 16), b.encode_remote().to_vec());
        let chain = &s.lock_qp.batches()[0];
        assert_eq!(chain.len(), 2);
        assert!(chain[1].flags.contains(SendFlags::SIGNALED));
    }

    // Tests that a second flush without new records sends nothing.
    #[test]
    fn test_flush_locks_idempotent() {
        let s = setup(16, 8, 128);
        let mut a = LockRecord::record(1, 0, 1, 7);
        s.mgr.append_lock_state(&mut a, 0).unwrap();
        assert_eq!(s.mgr.flush_dirty_locks(), 1);
        let before = s.lock_region.read(0, s.lock_region.len());
        assert_eq!(s.mgr.flush_dirty_locks(), 0);
        assert_eq!(s.lock_qp.batches().len(), 1);
        assert_eq!(s.lock_region.read(0, s.lock_region.len()), before);
    }

    // Tests the dirty count when staged records wrap the buffer end.
    #[test]
    fn test_flush_locks_wraparound() {
        let s = setup(16, 4, 128);
        for i in 0..3 {
            let mut l = LockRecord::record(i, 0, 1, i);
            s.mgr.append_lock_state(&mut l, 0).unwrap();
        }
        assert_eq!(s.mgr.flush_dirty_locks(), 3);
        for i in 3..6 {
            let mut l = LockRecord::record(i, 0, 1, i);
            s.mgr.append_lock_state(&mut l, 0).unwrap();
        }
        // first = 60, tail = 40: the three records straddle the end.
        assert_eq!(s.mgr.lock_buffer().tail_and_free_size(), (40, 20));
        assert_eq!(s.mgr.flush_dirty_locks(), 3);
        assert_eq!(s.mgr.flush_first_lock(), 40);
        let slot5 = s.mgr.lock_remote_offset(5) as usize;
        assert_eq!(
            s.lock_region.read(slot5, 16),
            LockRecord::record(5, 0, 1, 5).encode_remote().to_vec()
        );
    }

    // Tests that a completely full lock buffer is flushed as a whole.
    #[test]
    fn test_flush_locks_full_buffer() {
        let s = setup(16, 2, 128);
        let mut a = LockRecord::record(1, 0, 1, 1);
        let mut b = LockRecord::record(2, 0, 1, 2);
        s.mgr.append_lock_state(&mut a, 0).unwrap();
        s.mgr.append_lock_state(&mut b, 0).unwrap();
        let mut c = LockRecord::record(3, 0, 1, 3);
        assert!(s.mgr.append_lock_state(&mut c, 0).is_err());
        assert_eq!(c.offset, None);
        assert_eq!(s.mgr.bitmap_snapshot(), vec![0b11, 0]);

        assert_eq!(s.mgr.lock_buffer().tail_and_free_size(), (0, 0));
        assert_eq!(s.mgr.flush_dirty_locks(), 2);
        assert!(s.mgr.append_lock_state(&mut c, 0).is_ok());
    }

    // Tests that the bitmap reaches the backup only after the slot writes.
    #[test]
    fn test_flush_states_orders_bitmap_after_slots() {
        let s = setup(16, 8, 128);
        let mut a = LockRecord::record(1, 0, 1, 7);
        s.mgr.append_lock_state(&mut a, 0).unwrap();
        s.mgr.flush_states();

        assert_eq!(s.lock_qp.batches().len(), 1);
        assert_eq!(s.lock_qp.single_posts(), 1);
        assert_eq!(s.lock_region.read(0, 2), vec![0b1, 0]);

        s.mgr.erase_lock_state(&mut a);
        s.mgr.flush_states();
        assert_eq!(s.lock_region.read(0, 2), vec![0, 0]);
        assert_eq!(s.lock_qp.batches().len(), 1);
    }

    // Tests a log flush that does not wrap.
    #[test]
    fn test_flush_logs_single_range() {
        let s = setup(16, 8, 100);
        s.mgr.append_log(&[3; 40]).unwrap();
        s.mgr.flush_logs(40, 0, 40);
        assert_eq!(s.mgr.flushed_log_offset(), 40);
        assert_eq!(s.log_qp.batches()[0].len(), 4);
        assert_eq!(s.log_region.read(0, 40), vec![3; 40]);
        assert_eq!(s.log_region.read_i64(100), 0);
        assert_eq!(s.log_region.read_i64(108), 40);
        assert_eq!(s.log_region.read_i64(116), 40);
    }

    // Tests that flushing up to an unchanged state-tail is a no-op.
    #[test]
    fn test_flush_logs_noop() {
        let s = setup(16, 8, 100);
        s.mgr.append_log(&[3; 10]).unwrap();
        s.mgr.flush_logs(10, 0, 10);
        s.mgr.flush_logs(10, 0, 10);
        assert_eq!(s.log_qp.batches().len(), 1);
        assert_eq!(s.mgr.flushed_log_bytes(), 10);
    }

    // Tests that a checkpoint moves the watermark the log flush follows.
    #[test]
    fn test_flush_states_drives_log() {
        let s = setup(16, 8, 100);
        s.mgr.append_log(b"hello").unwrap();
        assert!(!s.mgr.flush_pending_logs());
        s.mgr.flush_states();
        assert!(s.mgr.flush_pending_logs());
        assert_eq!(s.log_region.read(0, 5), b"hello".to_vec());
        assert_eq!(s.log_region.read_i64(116), 5);
        assert!(!s.mgr.flush_pending_logs());
    }

    // Tests that a log filled up to its last usable byte is still flushed.
    #[test]
    fn test_flush_logs_nearly_full() {
        let s = setup(16, 8, 100);
        assert!(s.mgr.append_log(&[7; 100]).is_err());
        assert_eq!(s.mgr.append_log(&[7; 99]), Ok(0));
        s.mgr.flush_states();
        assert!(s.mgr.flush_pending_logs());
        assert_eq!(s.mgr.flushed_log_bytes(), 99);
        assert_eq!(s.mgr.flushed_log_offset(), 99);
        assert_eq!(s.log_region.read(0, 99), vec![7; 99]);

        // The same after the log wrapped around once.
        s.mgr.release_log(99).unwrap();
        assert_eq!(s.mgr.append_log(&[8; 99]), Ok(99));
        s.mgr.flush_states();
        assert!(s.mgr.flush_pending_logs());
        assert_eq!(s.mgr.flushed_log_bytes(), 198);
        assert_eq!(s.mgr.flushed_log_offset(), 98);
        assert_eq!(s.log_region.read(0, 98), vec![8; 98]);
        assert_eq!(s.log_region.read(99, 1), vec![8]);
    }

    // Tests that log bytes not yet on the backup can't be reclaimed.
    #[test]
    fn test_release_log_only_flushed() {
        let s = setup(16, 8, 100);
        s.mgr.append_log(&[1; 50]).unwrap();
        assert_eq!(
            s.mgr.release_log(50),
            Err(StateError::UnflushedLog {
                new_head: 50,
                flushed: 0
            })
        );
        assert!(s.mgr.append_log(&[9; 60]).is_err());
        assert_eq!(s.mgr.log_buffer().head(), 0);

        s.mgr.flush_logs(30, 0, 50);
        assert!(s.mgr.release_log(40).is_err());
        assert_eq!(s.mgr.release_log(30), Ok(()));
        assert_eq!(s.mgr.log_buffer().head(), 30);
        assert_eq!(s.mgr.log_buffer().read_range(30, 20), vec![1; 20]);
        assert!(s.mgr.release_log(100).is_err());
    }

    // Tests that slot numbers past a partial last bitmap byte are never used.
    #[test]
    fn test_partial_bitmap_byte() {
        let s = setup(12, 16, 100);
        for i in 0..12 {
            let mut l = LockRecord::record(i, 0, 1, i);
            assert_eq!(s.mgr.append_lock_state(&mut l, 0), Ok(i as usize));
        }
        let mut l = LockRecord::record(12, 0, 1, 12);
        assert_eq!(
            s.mgr.append_lock_state(&mut l, 0),
            Err(StateError::NoFreeSlot { thread: 0 })
        );
        s.mgr.flush_states();
        assert_eq!(s.lock_region.read(0, 2), vec![0xFF, 0x0F]);
    }

    // Tests that append errors leave the bitmap untouched.
    #[test]
    fn test_no_free_slot() {
        let s = setup(8, 16, 100);
        for _ in 0..8 {
            let mut l = LockRecord::record(1, 0, 1, 1);
            s.mgr.append_lock_state(&mut l, 0).unwrap();
        }
        let mut l = LockRecord::record(1, 0, 1, 1);
        assert_eq!(
            s.mgr.append_lock_state(&mut l, 0),
            Err(StateError::NoFreeSlot { thread: 0 })
        );
    }

    // Tests that a failing lock batch brings the process down.
    #[test]
    #[should_panic(expected = "lock state replication failed")]
    fn test_lock_flush_failure_is_fatal() {
        let s = setup(16, 8, 100);
        let mut a = LockRecord::record(1, 0, 1, 7);
        s.mgr.append_lock_state(&mut a, 0).unwrap();
        s.lock_qp.fail_next_post();
        s.mgr.flush_dirty_locks();
    }

    // Tests that the background flushers replicate without explicit flushes.
    #[test]
    fn test_background_flushers() {
        let s = setup(16, 8, 100);
        let mgr = Arc::new(s.mgr);
        let flushers = mgr.spawn_flushers();
        let mut a = LockRecord::record(4, 0, 2, 3);
        mgr.append_lock_state(&mut a, 0).unwrap();
        mgr.append_log(&[9; 12]).unwrap();
        mgr.flush_states();
        assert!(flushers.shutdown());

        assert_eq!(mgr.flush_first_lock(), LOCK_STATE_SIZE_LOCAL);
        assert_eq!(mgr.flushed_log_offset(), 12);
        assert_eq!(s.lock_region.read(2, 16), a.encode_remote().to_vec());
        assert_eq!(s.log_region.read(0, 12), vec![9; 12]);
    }
}
