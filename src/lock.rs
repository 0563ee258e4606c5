// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock records as they are replicated, and the lock table a backup
//! rebuilds from them.
//!
//! Queues are index lists over an arena of locks: a lock is identified by
//! its [LockId](struct.LockId.html) for as long as the table lives, and
//! `prev`/`next` links are ids rather than pointers.

use std::collections::HashMap;

use crate::{BUCKET_SIZE, LOCK_STATE_SIZE_LOCAL, LOCK_STATE_SIZE_REMOTE};

/// `type_mode` flag of a table-level lock.
pub const LOCK_TABLE: u32 = 1;

/// `type_mode` flag of a lock that is still waiting to be granted.
pub const LOCK_WAIT: u32 = 32;

/// `record_no` of a table-level lock.
pub const TABLE_RECORD_NO: i32 = -1;

/// One lock as it travels between the staging buffer and the remote slot.
///
/// The remote encoding is 16 bytes: `trx_id`, `type_mode`, `table_id` and
/// `record_no`, little endian. The local staging encoding appends the slot
/// index (`-1` when unassigned) so the flusher knows where the record goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub trx_id: i32,
    pub type_mode: u32,
    pub table_id: i32,
    pub record_no: i32,
    /// Slot in the remote lock region; assigned on first append, stable until
    /// the lock is erased.
    pub offset: Option<usize>,
}

impl LockRecord {
    /// A lock on a single record.
    pub fn record(trx_id: i32, type_mode: u32, table_id: i32, record_no: i32) -> LockRecord {
        LockRecord {
            trx_id,
            type_mode,
            table_id,
            record_no,
            offset: None,
        }
    }

    /// A lock on a whole table.
    pub fn table(trx_id: i32, type_mode: u32, table_id: i32) -> LockRecord {
        LockRecord::record(trx_id, type_mode | LOCK_TABLE, table_id, TABLE_RECORD_NO)
    }

    pub fn is_table_lock(&self) -> bool {
        self.record_no == TABLE_RECORD_NO
    }

    pub fn is_waiting(&self) -> bool {
        self.type_mode & LOCK_WAIT != 0
    }

    /// The resource this lock protects.
    pub fn data_id(&self) -> LockDataId {
        if self.is_table_lock() {
            LockDataId::table(self.table_id)
        } else {
            LockDataId::record(self.table_id, self.record_no)
        }
    }

    pub fn encode_remote(&self) -> [u8; LOCK_STATE_SIZE_REMOTE] {
        let mut raw = [0u8; LOCK_STATE_SIZE_REMOTE];
        raw[0..4].copy_from_slice(&self.trx_id.to_le_bytes());
        raw[4..8].copy_from_slice(&self.type_mode.to_le_bytes());
        raw[8..12].copy_from_slice(&self.table_id.to_le_bytes());
        raw[12..16].copy_from_slice(&self.record_no.to_le_bytes());
        raw
    }

    /// Decodes a remote slot. The slot index is not part of the remote
    /// record; the caller knows it from the bitmap.
    pub fn decode_remote(raw: &[u8; LOCK_STATE_SIZE_REMOTE]) -> LockRecord {
        let word = |i: usize| [raw[i], raw[i + 1], raw[i + 2], raw[i + 3]];
        LockRecord {
            trx_id: i32::from_le_bytes(word(0)),
            type_mode: u32::from_le_bytes(word(4)),
            table_id: i32::from_le_bytes(word(8)),
            record_no: i32::from_le_bytes(word(12)),
            offset: None,
        }
    }

    pub fn encode_local(&self) -> [u8; LOCK_STATE_SIZE_LOCAL] {
        let mut raw = [0u8; LOCK_STATE_SIZE_LOCAL];
        raw[..LOCK_STATE_SIZE_REMOTE].copy_from_slice(&self.encode_remote());
        let slot = self.offset.map_or(-1, |o| o as i32);
        raw[LOCK_STATE_SIZE_REMOTE..].copy_from_slice(&slot.to_le_bytes());
        raw
    }

    pub fn decode_local(raw: &[u8; LOCK_STATE_SIZE_LOCAL]) -> LockRecord {
        let mut remote = [0u8; LOCK_STATE_SIZE_REMOTE];
        remote.copy_from_slice(&raw[..LOCK_STATE_SIZE_REMOTE]);
        let mut lock = LockRecord::decode_remote(&remote);
        let mut slot = [0u8; 4];
        slot.copy_from_slice(&raw[LOCK_STATE_SIZE_REMOTE..]);
        let slot = i32::from_le_bytes(slot);
        lock.offset = if slot < 0 { None } else { Some(slot as usize) };
        lock
    }
}

/// Stable identifier of a lock in a [LockTable](struct.LockTable.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(usize);

/// Stable identifier of a request queue in a [LockTable](struct.LockTable.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(usize);

/// Kind of a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataKind {
    Table,
    Record,
}

/// Key of a bucket in the lock table.
///
/// Record locks are sharded by `record_no / BUCKET_SIZE`, so several record
/// queues share one key; table locks use bucket `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDataId {
    pub table_id: i32,
    pub bucket_id: i32,
    pub kind: LockDataKind,
}

impl LockDataId {
    pub fn table(table_id: i32) -> LockDataId {
        LockDataId {
            table_id,
            bucket_id: -1,
            kind: LockDataKind::Table,
        }
    }

    pub fn record(table_id: i32, record_no: i32) -> LockDataId {
        LockDataId {
            table_id,
            bucket_id: record_no / BUCKET_SIZE,
            kind: LockDataKind::Record,
        }
    }
}

/// A lock in the arena, or the sentinel head of a queue.
#[derive(Debug, Clone)]
pub struct Lock {
    pub record: LockRecord,
    pub prev: Option<LockId>,
    pub next: Option<LockId>,
}

/// Competing requests for one `(table_id, record_no)`, as a doubly linked
/// list hanging off a sentinel.
#[derive(Debug, Clone)]
pub struct LockRequestQueue {
    pub record_no: i32,
    pub sentinel: LockId,
    /// Next queue in the same bucket.
    pub next: Option<QueueId>,
}

/// The queues whose keys fall into one bucket, most recently created first.
#[derive(Debug, Clone)]
pub struct LockListInBucket {
    pub bucket_id: i32,
    pub first_queue: Option<QueueId>,
}

/// The lock table a backup reconstructs after failover.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Vec<Lock>,
    queues: Vec<LockRequestQueue>,
    buckets: HashMap<LockDataId, LockListInBucket>,

    /// Locks held by each transaction, in the order they were inserted.
    txn_locks: HashMap<i32, Vec<LockId>>,

    /// Number of live locks, sentinels excluded.
    live: usize,
}

impl LockTable {
    pub fn new() -> LockTable {
        Default::default()
    }

    /// Number of locks in the table.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn lock(&self, id: LockId) -> &Lock {
        &self.locks[id.0]
    }

    pub fn queue(&self, id: QueueId) -> &LockRequestQueue {
        &self.queues[id.0]
    }

    pub fn bucket(&self, key: &LockDataId) -> Option<&LockListInBucket> {
        self.buckets.get(key)
    }

    /// Locks of transaction `trx_id`.
    pub fn locks_of(&self, trx_id: i32) -> &[LockId] {
        self.txn_locks.get(&trx_id).map_or(&[], |v| v.as_slice())
    }

    /// The queue for `record_no` of `table_id`, if any.
    pub fn record_queue(&self, table_id: i32, record_no: i32) -> Option<QueueId> {
        let bucket = self.buckets.get(&LockDataId::record(table_id, record_no))?;
        self.find_record_queue(bucket, record_no)
    }

    /// The queue of table-level locks on `table_id`, if any.
    pub fn table_queue(&self, table_id: i32) -> Option<QueueId> {
        self.buckets
            .get(&LockDataId::table(table_id))
            .and_then(|b| b.first_queue)
    }

    /// Queues in a bucket, front to back.
    pub fn bucket_queues(&self, key: &LockDataId) -> Vec<QueueId> {
        let mut out = Vec::new();
        let mut cur = self.buckets.get(key).and_then(|b| b.first_queue);
        while let Some(q) = cur {
            out.push(q);
            cur = self.queues[q.0].next;
        }
        out
    }

    /// Locks in a queue, front to back (sentinel excluded).
    pub fn queue_locks(&self, queue: QueueId) -> Vec<LockId> {
        let mut out = Vec::new();
        let mut cur = self.locks[self.queues[queue.0].sentinel.0].next;
        while let Some(l) = cur {
            out.push(l);
            cur = self.locks[l.0].next;
        }
        out
    }

    /// Inserts a lock read back from a remote slot.
    ///
    /// A lock on a new resource gets a fresh queue as its only member. A lock
    /// on a resource that already has a queue becomes the first entry after
    /// that queue's sentinel, ahead of the locks inserted before it.
    pub fn insert_reconstructed(&mut self, record: LockRecord) -> LockId {
        let key = record.data_id();
        let id = self.alloc_lock(record);
        self.live += 1;
        self.txn_locks.entry(record.trx_id).or_default().push(id);

        let existing = self.buckets.get(&key).map(|bucket| match key.kind {
            LockDataKind::Table => bucket.first_queue,
            LockDataKind::Record => self.find_record_queue(bucket, record.record_no),
        });

        match existing {
            Some(Some(queue)) => {
                let sentinel = self.queues[queue.0].sentinel;
                self.link_after(sentinel, id);
            }
            Some(None) => {
                let queue = self.new_queue(record.record_no, id);
                if let Some(bucket) = self.buckets.get_mut(&key) {
                    self.queues[queue.0].next = bucket.first_queue;
                    bucket.first_queue = Some(queue);
                }
            }
            None => {
                let queue = self.new_queue(record.record_no, id);
                self.buckets.insert(
                    key,
                    LockListInBucket {
                        bucket_id: key.bucket_id,
                        first_queue: Some(queue),
                    },
                );
            }
        }
        id
    }

    /// Unlinks a lock from its queue and returns its record. The queue stays
    /// in place even when it becomes empty.
    pub fn remove(&mut self, id: LockId) -> LockRecord {
        let (prev, next) = {
            let l = &self.locks[id.0];
            (l.prev, l.next)
        };
        let prev = prev.expect("only sentinels have no predecessor");
        self.locks[prev.0].next = next;
        if let Some(n) = next {
            self.locks[n.0].prev = Some(prev);
        }
        self.locks[id.0].prev = None;
        self.locks[id.0].next = None;
        self.live -= 1;

        let record = self.locks[id.0].record;
        if let Some(held) = self.txn_locks.get_mut(&record.trx_id) {
            held.retain(|l| *l != id);
        }
        record
    }

    fn find_record_queue(&self, bucket: &LockListInBucket, record_no: i32) -> Option<QueueId> {
        let mut cur = bucket.first_queue;
        while let Some(q) = cur {
            if self.queues[q.0].record_no == record_no {
                return Some(q);
            }
            cur = self.queues[q.0].next;
        }
        None
    }

    fn alloc_lock(&mut self, record: LockRecord) -> LockId {
        self.locks.push(Lock {
            record,
            prev: None,
            next: None,
        });
        LockId(self.locks.len() - 1)
    }

    fn new_queue(&mut self, record_no: i32, first: LockId) -> QueueId {
        let sentinel = self.alloc_lock(LockRecord::record(-1, 0, -1, record_no));
        self.link_after(sentinel, first);
        self.queues.push(LockRequestQueue {
            record_no,
            sentinel,
            next: None,
        });
        QueueId(self.queues.len() - 1)
    }

    fn link_after(&mut self, at: LockId, id: LockId) {
        let old_next = self.locks[at.0].next;
        self.locks[id.0].prev = Some(at);
        self.locks[id.0].next = old_next;
        if let Some(n) = old_next {
            self.locks[n.0].prev = Some(id);
        }
        self.locks[at.0].next = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed(mut l: LockRecord, slot: usize) -> LockRecord {
        l.offset = Some(slot);
        l
    }

    // Tests the byte layout of the remote and local encodings.
    #[test]
    fn test_record_encoding() {
        let lock = placed(LockRecord::record(3, LOCK_WAIT, 1, 7), 5);
        let remote = lock.encode_remote();
        assert_eq!(&remote[0..4], &3i32.to_le_bytes());
        assert_eq!(&remote[12..16], &7i32.to_le_bytes());

        let local = lock.encode_local();
        assert_eq!(&local[..16], &remote[..]);
        assert_eq!(&local[16..], &5i32.to_le_bytes());
        assert_eq!(LockRecord::decode_local(&local), lock);

        let mut unplaced = lock;
        unplaced.offset = None;
        assert_eq!(&unplaced.encode_local()[16..], &(-1i32).to_le_bytes());
        assert_eq!(LockRecord::decode_remote(&remote), unplaced);
        assert!(lock.is_waiting());
    }

    // Tests bucket assignment for record and table locks.
    #[test]
    fn test_data_id() {
        assert_eq!(LockRecord::record(1, 0, 4, 7).data_id().bucket_id, 0);
        assert_eq!(LockRecord::record(1, 0, 4, 250).data_id().bucket_id, 2);
        let t = LockRecord::table(1, 0, 4);
        assert!(t.is_table_lock());
        assert_eq!(t.type_mode & LOCK_TABLE, LOCK_TABLE);
        assert_eq!(t.data_id(), LockDataId::table(4));
    }

    // Tests that two locks on one record share a queue, newest first.
    #[test]
    fn test_same_record_shares_queue() {
        let mut t = LockTable::new();
        let a = t.insert_reconstructed(placed(LockRecord::record(10, 0, 1, 7), 2));
        let b = t.insert_reconstructed(placed(LockRecord::record(11, 0, 1, 7), 5));

        let q = t.record_queue(1, 7).expect("queue exists");
        assert_eq!(t.queue_locks(q), vec![b, a]);
        assert_eq!(t.lock(b).prev, Some(t.queue(q).sentinel));
        assert_eq!(t.lock(b).next, Some(a));
        assert_eq!(t.lock(a).prev, Some(b));
        assert_eq!(t.bucket_count(), 1);
        assert_eq!(t.len(), 2);
    }

    // Tests that different records in one bucket get separate queues.
    #[test]
    fn test_bucket_holds_several_queues() {
        let mut t = LockTable::new();
        t.insert_reconstructed(placed(LockRecord::record(1, 0, 1, 7), 0));
        t.insert_reconstructed(placed(LockRecord::record(2, 0, 1, 42), 1));
        t.insert_reconstructed(placed(LockRecord::record(3, 0, 1, 142), 2));

        let key = LockDataId::record(1, 7);
        let queues = t.bucket_queues(&key);
        assert_eq!(queues.len(), 2);
        assert_eq!(t.queue(queues[0]).record_no, 42);
        assert_eq!(t.queue(queues[1]).record_no, 7);
        assert_eq!(t.bucket(&key).map(|b| b.bucket_id), Some(0));
        assert_eq!(t.bucket(&LockDataId::record(1, 142)).map(|b| b.bucket_id), Some(1));
    }

    // Tests that table locks land in the table queue, and per-txn lists.
    #[test]
    fn test_table_locks_and_txn_lists() {
        let mut t = LockTable::new();
        let a = t.insert_reconstructed(placed(LockRecord::table(1, 0, 3), 0));
        let b = t.insert_reconstructed(placed(LockRecord::table(2, 0, 3), 1));
        let c = t.insert_reconstructed(placed(LockRecord::record(1, 0, 3, 9), 2));

        let q = t.table_queue(3).expect("table queue");
        assert_eq!(t.queue_locks(q), vec![b, a]);
        assert_eq!(t.bucket(&LockDataId::table(3)).map(|b| b.bucket_id), Some(-1));
        assert_eq!(t.locks_of(1), &[a, c]);
        assert_eq!(t.locks_of(2), &[b]);
        assert!(t.locks_of(99).is_empty());
    }

    // Tests unlinking a lock from the middle of a queue.
    #[test]
    fn test_remove() {
        let mut t = LockTable::new();
        let a = t.insert_reconstructed(placed(LockRecord::record(1, 0, 1, 7), 0));
        let b = t.insert_reconstructed(placed(LockRecord::record(2, 0, 1, 7), 1));
        let c = t.insert_reconstructed(placed(LockRecord::record(3, 0, 1, 7), 2));
        let q = t.record_queue(1, 7).unwrap();
        assert_eq!(t.queue_locks(q), vec![c, b, a]);

        let removed = t.remove(b);
        assert_eq!(removed.trx_id, 2);
        assert_eq!(t.queue_locks(q), vec![c, a]);
        assert_eq!(t.lock(a).prev, Some(c));
        assert_eq!(t.len(), 2);
        assert!(t.locks_of(2).is_empty());
    }
}
