// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A primary that takes row locks and writes log records while the background
//! flushers replicate them; a backup then rebuilds the lock table and log.

use std::sync::Arc;

use state_replication::{
    LockDataId, LockRecord, LockTable, LoopbackQp, RemoteRegion, StateConfig, StateManager,
};

const THREADS: usize = 2;
const TXNS_PER_THREAD: i32 = 8;

fn main() {
    let _r = env_logger::try_init();

    let config = StateConfig {
        lock_slots: 256,
        lock_buffer_size: 64 * 20,
        log_buffer_size: 4096,
        thread_num: THREADS,
        ..Default::default()
    };
    let lock_region = Arc::new(RemoteRegion::new(config.lock_region_size()));
    let log_region = Arc::new(RemoteRegion::new(config.log_region_size()));

    let primary = Arc::new(StateManager::new(
        config.clone(),
        LoopbackQp::new(lock_region.clone()),
        LoopbackQp::new(log_region.clone()),
    ));
    let flushers = primary.spawn_flushers();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let primary = primary.clone();
            std::thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..TXNS_PER_THREAD {
                    let trx_id = t as i32 * 1000 + i;
                    let mut lock = LockRecord::record(trx_id, 0, 1, i * 37);
                    primary
                        .append_lock_state(&mut lock, t)
                        .expect("lock slot available");
                    let entry = format!("trx {} updates row {}\n", trx_id, i * 37);
                    primary.append_log(entry.as_bytes()).expect("log has room");

                    // Every other transaction commits and drops its lock.
                    if i % 2 == 0 {
                        primary.erase_lock_state(&mut lock);
                    } else {
                        held.push(lock);
                    }
                }
                held
            })
        })
        .collect();
    let held: Vec<LockRecord> = workers
        .into_iter()
        .flat_map(|w| w.join().expect("worker panicked"))
        .collect();

    primary.flush_states();
    if !flushers.shutdown() {
        panic!("replication failed");
    }
    println!(
        "primary: {} locks held, {} log bytes replicated",
        held.len(),
        primary.flushed_log_bytes()
    );

    let backup = StateManager::new(
        config,
        LoopbackQp::new(lock_region),
        LoopbackQp::new(log_region),
    );
    let mut table = LockTable::new();
    let recovered = backup
        .fetch_lock_states(&mut table)
        .expect("lock region readable");
    let log_bytes = backup.fetch_log_states().expect("log region readable");
    assert_eq!(recovered, held.len());

    println!(
        "backup: {} locks in {} bucket(s), {} log bytes",
        table.len(),
        table.bucket_count(),
        log_bytes
    );
    for lock in &held {
        let queue = table
            .record_queue(lock.table_id, lock.record_no)
            .expect("queue for every held lock");
        println!(
            "  trx {:>4} holds row {:>3} (bucket {})",
            lock.trx_id,
            table.queue(queue).record_no,
            LockDataId::record(lock.table_id, lock.record_no).bucket_id
        );
    }
    let (head, tail) = backup.log_buffer().head_and_tail();
    print!(
        "{}",
        String::from_utf8_lossy(&backup.log_buffer().read_range(head, tail - head))
    );
}
