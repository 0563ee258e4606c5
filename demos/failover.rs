// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runs the failover proxy over TCP against two toy nodes on localhost: a
//! primary that dies after a fixed number of statements and a backup that
//! accepts the promotion request and serves the resumed transactions.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use state_replication::{
    NodeConfig, Proxy, ProxyConfig, TcpConnector, Transaction, Workload, ABORT_REPLY,
    RECONNECT_PREPARE, SUCCESS_REPLY,
};

const THREADS: usize = 4;
const STATEMENTS: usize = 6;

/// Bank transfers; every seventh one is rejected by the node.
struct Transfers {
    current: Mutex<Vec<Transaction>>,
    next_id: AtomicUsize,
}

impl Workload for Transfers {
    fn generate_transaction(&self, thread: usize) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stmts = vec![String::from("begin")];
        for i in 0..STATEMENTS - 2 {
            stmts.push(format!("update account set bal = bal - 1 where id = {}", id * 7 + i));
        }
        stmts.push(if id % 7 == 6 {
            String::from("rollback")
        } else {
            String::from("commit")
        });
        let txn = Transaction::new(stmts);
        self.current.lock().unwrap()[thread] = txn.clone();
        txn
    }

    fn get_transaction(&self, thread: usize) -> Transaction {
        self.current.lock().unwrap()[thread].clone()
    }
}

/// Serves one client connection until the node dies or the client leaves.
fn serve(mut stream: TcpStream, alive: Arc<AtomicBool>, budget: Arc<AtomicUsize>) {
    let mut buf = [0u8; 512];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let msg = String::from_utf8_lossy(&buf[..n]);
        let msg = msg.trim_end_matches('\0');
        if !alive.load(Ordering::SeqCst) {
            return;
        }

        let reply = if msg.parse::<usize>().is_ok() {
            "ok\n"
        } else if msg == RECONNECT_PREPARE {
            SUCCESS_REPLY
        } else if budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_err()
        {
            println!("primary: crashing");
            alive.store(false, Ordering::SeqCst);
            return;
        } else if msg == "rollback" {
            ABORT_REPLY
        } else {
            "done\n"
        };
        if stream.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

/// Starts a node answering `budget` statements; returns its address.
fn start_node(budget: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let alive = Arc::new(AtomicBool::new(true));
    let budget = Arc::new(AtomicUsize::new(budget));
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => continue,
            };
            // A dead node refuses new work by closing right away.
            if !alive.load(Ordering::SeqCst) {
                continue;
            }
            let (alive, budget) = (alive.clone(), budget.clone());
            thread::spawn(move || serve(stream, alive, budget));
        }
    });
    addr
}

fn main() {
    let _r = env_logger::try_init();

    let primary_addr = start_node(50);
    let backup_addr = start_node(usize::MAX);

    let config = ProxyConfig {
        primary: NodeConfig {
            thread_num: THREADS,
            addr: primary_addr,
            ..Default::default()
        },
        backup_addr,
        resumption_open: true,
        primary_txns_per_thread: None,
        backup_txns_per_thread: Some(5),
        ..Default::default()
    };
    let workload = Transfers {
        current: Mutex::new(vec![Transaction::default(); THREADS]),
        next_id: AtomicUsize::new(0),
    };
    let proxy = Proxy::new(config, workload, TcpConnector::default());
    let report = proxy.run();

    println!(
        "commits: {}, aborts: {}, elapsed: {:?}, stranded: {}",
        report.commits, report.aborts, report.elapsed, report.stranded
    );
    for lat in &report.latencies {
        println!(
            "thread {}: before {:?}, breakpoint {:?}, remaining on backup {:?}",
            lat.thread, lat.before, lat.breakpoint, lat.remain_backup
        );
    }
}
