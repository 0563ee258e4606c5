// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The failover-aware client proxy.
//!
//! One client thread per connection runs transactions against the primary,
//! statement by statement, advancing a per-thread cursor after every reply.
//! When a connection breaks, a notifier thread asks the backup to finish its
//! promotion and one reconnect thread per client picks the interrupted
//! transaction up on the backup at the statement the cursor points to.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::config::{NodeRole, ProxyConfig};
use crate::context::{ClientState, FailoverContext};
use crate::error::{ClientError, FailoverError};
use crate::{ABORT_REPLY, RECONNECT_PREPARE, RECV_BUFFER_SIZE, SUCCESS_REPLY};

/// Longest pause between two connects to a backup.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// An ordered list of statements sent one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub statements: Vec<String>,
}

impl Transaction {
    pub fn new<S: Into<String>>(statements: Vec<S>) -> Transaction {
        Transaction {
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Source of the transactions client threads run.
pub trait Workload: Send + Sync {
    /// Produces a new transaction for `thread`; it becomes the thread's
    /// current transaction.
    fn generate_transaction(&self, thread: usize) -> Transaction;

    /// Returns `thread`'s current transaction, i.e. the one last produced by
    /// `generate_transaction`.
    fn get_transaction(&self, thread: usize) -> Transaction;
}

/// A request/reply connection to a database node.
pub trait StatementSession {
    /// Sends one message and waits for its reply.
    fn send_recv(&mut self, msg: &str) -> Result<String, ClientError>;
}

/// Opens sessions to database nodes.
pub trait Connector: Send + Sync {
    type Session: StatementSession;

    fn connect(&self, addr: &str) -> Result<Self::Session, ClientError>;
}

/// Connects to nodes over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    /// Bound on waiting for a reply; `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl Connector for TcpConnector {
    type Session = TcpSession;

    fn connect(&self, addr: &str) -> Result<TcpSession, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.read_timeout)?;
        Ok(TcpSession {
            stream,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }
}

/// A TCP session. Messages are sent NUL-terminated; each reply is what a
/// single read returns, up to the first NUL.
pub struct TcpSession {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl StatementSession for TcpSession {
    fn send_recv(&mut self, msg: &str) -> Result<String, ClientError> {
        let mut out = Vec::with_capacity(msg.len() + 1);
        out.extend_from_slice(msg.as_bytes());
        out.push(0);
        if let Err(e) = self.stream.write_all(&out) {
            warn!("send failed: {}", e);
            return Err(ClientError::ConnectionClosed);
        }

        let n = match self.stream.read(&mut self.buf) {
            Ok(0) => {
                debug!("connection has been closed by the peer");
                return Err(ClientError::ConnectionClosed);
            }
            Ok(n) => n,
            Err(e) => {
                warn!("connection was broken: {}", e);
                return Err(ClientError::ConnectionClosed);
            }
        };
        let reply = &self.buf[..n];
        let end = reply.iter().position(|&b| b == 0).unwrap_or(n);
        Ok(String::from_utf8_lossy(&reply[..end]).into_owned())
    }
}

/// Crash history of one node.
#[derive(Debug, Clone, Default)]
pub struct NodeCrashInfo {
    pub crash_count: usize,
    pub crash_times: Vec<SystemTime>,
}

/// Per-thread failover timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLatency {
    pub thread: usize,
    /// Time on the primary before the connection broke.
    pub before: Option<Duration>,
    /// Time from the break until connected to the backup.
    pub breakpoint: Option<Duration>,
    /// Time to finish the interrupted transaction on the backup.
    pub remain_backup: Option<Duration>,
}

/// Outcome of a proxy run.
#[derive(Debug, Clone)]
pub struct ProxyReport {
    pub commits: usize,
    pub aborts: usize,
    pub elapsed: Duration,
    /// Commits per second.
    pub commit_throughput: f64,
    /// Aborts per second.
    pub abort_throughput: f64,
    pub latencies: Vec<ThreadLatency>,
    /// Threads whose transaction could not be moved to the backup.
    pub stranded: usize,
}

enum TxnOutcome {
    Committed,
    Aborted,
}

/// Drives client threads against a primary and moves them to the backup
/// when the primary goes away.
pub struct Proxy<W: Workload, C: Connector> {
    config: ProxyConfig,
    workload: W,
    connector: C,
    ctx: FailoverContext,
    crashes: Mutex<HashMap<String, NodeCrashInfo>>,
}

impl<W: Workload, C: Connector> Proxy<W, C> {
    pub fn new(config: ProxyConfig, workload: W, connector: C) -> Proxy<W, C> {
        let ctx = FailoverContext::new(config.primary.thread_num);
        Proxy {
            config,
            workload,
            connector,
            ctx,
            crashes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn context(&self) -> &FailoverContext {
        &self.ctx
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    /// Crash history recorded for the node at `addr`.
    pub fn crash_info(&self, addr: &str) -> Option<NodeCrashInfo> {
        self.crashes.lock().get(addr).cloned()
    }

    /// Runs client `thread` against the primary until its transaction bound
    /// is reached or the connection breaks. A break marks the thread
    /// `DetectedDown` and raises `conn_closed`; its cursor is left at the
    /// first statement without a reply.
    pub fn run_client(&self, thread: usize) -> Result<(), ClientError> {
        let r = self.drive_primary(thread);
        match &r {
            Ok(()) => {
                self.ctx
                    .transition(thread, ClientState::Active, ClientState::Finished);
            }
            Err(e) => {
                warn!(
                    "client {}: lost primary {} at statement {}: {}",
                    thread,
                    self.config.primary.addr,
                    self.ctx.next_sql_index(thread),
                    e
                );
                self.ctx.mark_breakpoint(thread);
                if self.config.primary.role == NodeRole::ReadOnly {
                    self.ctx.set_state(thread, ClientState::Stranded);
                } else {
                    self.ctx
                        .transition(thread, ClientState::Active, ClientState::DetectedDown);
                    self.ctx.conn_closed.raise();
                }
            }
        }
        r
    }

    fn drive_primary(&self, thread: usize) -> Result<(), ClientError> {
        let primary = &self.config.primary;
        let mut session = self.connector.connect(&primary.addr)?;
        session.send_recv(&thread.to_string())?;
        self.ctx.mark_started(thread);

        let bound = match primary.role {
            NodeRole::ReadOnly => Some(1),
            NodeRole::ReadWrite => self.config.primary_txns_per_thread,
        };
        let mut done = 0;
        while bound.map_or(true, |b| done < b) {
            let txn = self.workload.generate_transaction(thread);
            self.ctx.set_next_sql_index(thread, 0);
            self.run_statements(thread, &mut session, &txn)?;
            done += 1;
        }
        Ok(())
    }

    /// Sends `txn` from the thread's cursor on. The cursor moves past a
    /// statement only once its reply arrived.
    fn run_statements<S: StatementSession>(
        &self,
        thread: usize,
        session: &mut S,
        txn: &Transaction,
    ) -> Result<TxnOutcome, ClientError> {
        loop {
            let idx = self.ctx.next_sql_index(thread);
            let stmt = match txn.statements.get(idx) {
                Some(stmt) => stmt,
                None => return Ok(TxnOutcome::Committed),
            };
            let reply = session.send_recv(stmt)?;
            trace!("client {}: statement {} -> {:?}", thread, idx, reply);
            if reply == ABORT_REPLY {
                self.ctx.record_abort(thread);
                return Ok(TxnOutcome::Aborted);
            }
            if idx + 1 == txn.len() {
                self.ctx.record_commit(thread);
            }
            self.ctx.advance_sql_index(thread);
        }
    }

    /// Connects to the backup, retrying with a growing pause until
    /// `connect_retry_timeout` has passed.
    fn connect_backup(&self) -> Result<C::Session, ClientError> {
        let deadline = Instant::now() + self.config.connect_retry_timeout;
        let mut delay = self.config.connect_retry_delay;
        loop {
            match self.connector.connect(&self.config.backup_addr) {
                Ok(s) => return Ok(s),
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(e);
                    }
                    debug!("backup {} not reachable yet: {}", self.config.backup_addr, e);
                    thread::sleep(delay.min(deadline - now));
                    delay = (delay * 2).min(MAX_CONNECT_RETRY_DELAY);
                }
            }
        }
    }

    fn record_crash(&self, addr: &str) {
        let mut crashes = self.crashes.lock();
        let info = crashes.entry(addr.to_string()).or_default();
        info.crash_count += 1;
        info.crash_times.push(SystemTime::now());
    }

    /// Connects to the backup, announces the client count and waits for a
    /// client to lose the primary. Then asks the backup to finish its
    /// promotion. On success `need_backup` is raised; on any failure it is
    /// cancelled so that waiting threads give up.
    ///
    /// Returns `Ok(false)` if the primary never went down.
    pub fn notify_backup_to_recover(&self) -> Result<bool, FailoverError> {
        let r = self.promote_backup();
        match &r {
            Ok(true) => self.ctx.need_backup.raise(),
            Ok(false) => self.ctx.need_backup.cancel(),
            Err(e) => {
                warn!("failover to {} failed: {}", self.config.backup_addr, e);
                self.ctx.need_backup.cancel();
            }
        }
        r
    }

    fn promote_backup(&self) -> Result<bool, FailoverError> {
        let mut session = self
            .connect_backup()
            .map_err(FailoverError::BackupUnreachable)?;
        session
            .send_recv(&self.ctx.thread_num().to_string())
            .map_err(FailoverError::BackupUnreachable)?;

        if !self.ctx.conn_closed.wait() {
            debug!("primary {} stayed up", self.config.primary.addr);
            return Ok(false);
        }
        self.record_crash(&self.config.primary.addr);
        info!(
            "primary {} is down, promoting backup {}",
            self.config.primary.addr, self.config.backup_addr
        );

        let reply = session.send_recv(RECONNECT_PREPARE)?;
        if reply != SUCCESS_REPLY {
            return Err(FailoverError::Declined(reply));
        }
        info!("backup {} is ready", self.config.backup_addr);
        Ok(true)
    }

    /// Moves client `thread` to the backup once its primary connection
    /// broke and the backup is ready. With resumption on, the interrupted
    /// transaction continues at the thread's cursor; otherwise a new one
    /// starts from its first statement. Afterwards the thread keeps running
    /// transactions on the backup.
    ///
    /// Returns right away if the client finished without a break.
    pub fn reconnect_to_backup(&self, thread: usize) -> Result<(), FailoverError> {
        if self.ctx.wait_for_handoff(thread) != ClientState::DetectedDown {
            return Ok(());
        }
        self.ctx.transition(
            thread,
            ClientState::DetectedDown,
            ClientState::WaitingBackupReady,
        );
        if !self.ctx.need_backup.wait() {
            warn!("client {}: backup never became ready", thread);
            self.ctx.set_state(thread, ClientState::Stranded);
            return Err(FailoverError::NoServingNode);
        }
        self.ctx.transition(
            thread,
            ClientState::WaitingBackupReady,
            ClientState::Resuming,
        );

        let r = self.drive_backup(thread);
        if let Err(e) = &r {
            warn!("client {}: resumption on backup failed: {}", thread, e);
            self.ctx.set_state(thread, ClientState::Stranded);
        }
        r
    }

    fn drive_backup(&self, thread: usize) -> Result<(), FailoverError> {
        let mut session = self.connect_backup()?;
        session.send_recv(&thread.to_string())?;
        let reconnected = self.ctx.mark_reconnected(thread);

        let txn = if self.config.resumption_open {
            self.workload.get_transaction(thread)
        } else {
            self.ctx.set_next_sql_index(thread, 0);
            self.workload.generate_transaction(thread)
        };
        info!(
            "client {}: resuming on backup at statement {} of {}",
            thread,
            self.ctx.next_sql_index(thread),
            txn.len()
        );
        let outcome = self.run_statements(thread, &mut session, &txn)?;
        self.ctx.mark_resumed(thread, reconnected);
        info!(
            "client {}: interrupted transaction {} on backup",
            thread,
            match outcome {
                TxnOutcome::Committed => "committed",
                TxnOutcome::Aborted => "aborted",
            }
        );
        self.ctx
            .transition(thread, ClientState::Resuming, ClientState::ActiveOnBackup);

        let mut done = 0;
        while self.config.backup_txns_per_thread.map_or(true, |b| done < b) {
            let txn = self.workload.generate_transaction(thread);
            self.ctx.set_next_sql_index(thread, 0);
            self.run_statements(thread, &mut session, &txn)?;
            done += 1;
        }
        Ok(())
    }

    /// Runs every client thread, and for a read-write primary the notifier
    /// and reconnect threads, until all of them are done.
    pub fn run(&self) -> ProxyReport {
        let n = self.ctx.thread_num();
        let failover = self.config.primary.role == NodeRole::ReadWrite;
        let start = Instant::now();

        thread::scope(|s| {
            let clients: Vec<_> = (0..n)
                .map(|t| s.spawn(move || self.run_client(t)))
                .collect();
            let notifier = if failover {
                Some(s.spawn(|| self.notify_backup_to_recover()))
            } else {
                None
            };
            let reconnectors: Vec<_> = if failover {
                (0..n)
                    .map(|t| s.spawn(move || self.reconnect_to_backup(t)))
                    .collect()
            } else {
                Vec::new()
            };

            for (t, h) in clients.into_iter().enumerate() {
                if h.join().is_err() {
                    error!("client {} panicked", t);
                    self.ctx.set_state(t, ClientState::Stranded);
                }
            }
            // No client lost the primary: release the notifier.
            if !self.ctx.conn_closed.is_raised() {
                self.ctx.conn_closed.cancel();
            }
            if let Some(h) = notifier {
                if h.join().is_err() {
                    error!("failover notifier panicked");
                }
            }
            for (t, h) in reconnectors.into_iter().enumerate() {
                if h.join().is_err() {
                    error!("reconnect thread {} panicked", t);
                }
            }
        });

        let elapsed = start.elapsed();
        let commits = self.ctx.total_commits();
        let aborts = self.ctx.total_aborts();
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let latencies = (0..n)
            .map(|t| ThreadLatency {
                thread: t,
                before: self.ctx.before_latency(t),
                breakpoint: self.ctx.breakpoint_latency(t),
                remain_backup: self.ctx.remain_backup_latency(t),
            })
            .collect();
        let stranded = (0..n)
            .filter(|&t| self.ctx.state(t) == ClientState::Stranded)
            .count();

        let report = ProxyReport {
            commits,
            aborts,
            elapsed,
            commit_throughput: commits as f64 / secs,
            abort_throughput: aborts as f64 / secs,
            latencies,
            stranded,
        };
        info!(
            "commits: {}, aborts: {}, time: {:?}, commit tput: {:.1}/s, abort tput: {:.1}/s",
            report.commits,
            report.aborts,
            report.elapsed,
            report.commit_throughput,
            report.abort_throughput
        );
        if stranded > 0 {
            warn!("{} client(s) were left without a serving node", stranded);
        }
        report
    }
}
