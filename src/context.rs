// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared state of the failover proxy: per-thread statement cursors and
//! counters, per-thread client states and the signals that hand a crashed
//! primary's clients over to the backup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Pending,
    Raised,
    Cancelled,
}

/// A one-shot event. Waiters block until it is raised or cancelled.
///
/// Cancelling lets waiters know the event will never happen, e.g. the
/// backup declined the promotion or the primary never went down.
pub struct Signal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl Default for Signal {
    fn default() -> Self {
        Signal {
            state: Mutex::new(SignalState::Pending),
            cv: Condvar::new(),
        }
    }
}

impl Signal {
    pub fn new() -> Signal {
        Default::default()
    }

    /// Raises the signal. Has no effect once cancelled.
    pub fn raise(&self) {
        let mut s = self.state.lock();
        if *s == SignalState::Pending {
            *s = SignalState::Raised;
        }
        self.cv.notify_all();
    }

    /// Cancels the signal. Has no effect once raised.
    pub fn cancel(&self) {
        let mut s = self.state.lock();
        if *s == SignalState::Pending {
            *s = SignalState::Cancelled;
        }
        self.cv.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.state.lock() == SignalState::Raised
    }

    /// Blocks until the signal is raised (true) or cancelled (false).
    pub fn wait(&self) -> bool {
        let mut s = self.state.lock();
        while *s == SignalState::Pending {
            self.cv.wait(&mut s);
        }
        *s == SignalState::Raised
    }

    /// Like `wait`, but gives up after `timeout`. Returns `None` if the
    /// signal is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock();
        while *s == SignalState::Pending {
            if self.cv.wait_until(&mut s, deadline).timed_out() {
                break;
            }
        }
        match *s {
            SignalState::Pending => None,
            r => Some(r == SignalState::Raised),
        }
    }
}

/// Where a client thread stands in the failover sequence.
///
/// `Active -> DetectedDown -> WaitingBackupReady -> Resuming ->
/// ActiveOnBackup`. A thread whose primary connection never broke ends in
/// `Finished`; one whose backup never became ready ends in `Stranded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Active,
    DetectedDown,
    WaitingBackupReady,
    Resuming,
    ActiveOnBackup,
    Finished,
    Stranded,
}

#[derive(Debug, Default, Clone, Copy)]
struct ThreadTimes {
    /// When the thread started talking to the primary.
    started: Option<Instant>,
    /// When the thread saw its primary connection break.
    breakpoint: Option<Instant>,
    /// Time spent on the primary before the break.
    before_latency: Option<Duration>,
    /// Time from the break until the backup connection was up.
    breakpoint_latency: Option<Duration>,
    /// Time to finish the interrupted transaction on the backup.
    remain_backup_latency: Option<Duration>,
}

/// Failover bookkeeping shared by the client, notifier and reconnect
/// threads of one proxy run.
///
/// `next_sql_index[t]` is written by thread `t`'s primary client while it is
/// `Active` and by its reconnect thread only once it left `DetectedDown`, so
/// the two never race on the cursor.
pub struct FailoverContext {
    next_sql_index: Vec<CachePadded<AtomicUsize>>,
    commits: Vec<CachePadded<AtomicUsize>>,
    aborts: Vec<CachePadded<AtomicUsize>>,

    states: Vec<Mutex<ClientState>>,
    state_cv: Condvar,

    times: Vec<Mutex<ThreadTimes>>,

    /// Raised by the first client that loses its primary connection.
    pub conn_closed: Signal,
    /// Raised once the backup accepted the promotion.
    pub need_backup: Signal,
}

impl FailoverContext {
    pub fn new(thread_num: usize) -> FailoverContext {
        let padded = || {
            (0..thread_num)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect::<Vec<_>>()
        };
        FailoverContext {
            next_sql_index: padded(),
            commits: padded(),
            aborts: padded(),
            states: (0..thread_num)
                .map(|_| Mutex::new(ClientState::Active))
                .collect(),
            state_cv: Condvar::new(),
            times: (0..thread_num).map(|_| Mutex::new(Default::default())).collect(),
            conn_closed: Signal::new(),
            need_backup: Signal::new(),
        }
    }

    pub fn thread_num(&self) -> usize {
        self.states.len()
    }

    /// Index of the next statement thread `thread` has to send.
    pub fn next_sql_index(&self, thread: usize) -> usize {
        self.next_sql_index[thread].load(Ordering::Acquire)
    }

    pub fn set_next_sql_index(&self, thread: usize, idx: usize) {
        self.next_sql_index[thread].store(idx, Ordering::Release);
    }

    pub fn advance_sql_index(&self, thread: usize) {
        self.next_sql_index[thread].fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_commit(&self, thread: usize) {
        self.commits[thread].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self, thread: usize) {
        self.aborts[thread].fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self, thread: usize) -> usize {
        self.commits[thread].load(Ordering::Relaxed)
    }

    pub fn aborts(&self, thread: usize) -> usize {
        self.aborts[thread].load(Ordering::Relaxed)
    }

    pub fn total_commits(&self) -> usize {
        (0..self.thread_num()).map(|t| self.commits(t)).sum()
    }

    pub fn total_aborts(&self) -> usize {
        (0..self.thread_num()).map(|t| self.aborts(t)).sum()
    }

    pub fn state(&self, thread: usize) -> ClientState {
        *self.states[thread].lock()
    }

    /// Moves `thread` from `from` to `to`. Returns false, leaving the state
    /// alone, if the thread is not in `from`.
    pub fn transition(&self, thread: usize, from: ClientState, to: ClientState) -> bool {
        let mut s = self.states[thread].lock();
        if *s != from {
            return false;
        }
        *s = to;
        trace!("client {}: {:?} -> {:?}", thread, from, to);
        self.state_cv.notify_all();
        true
    }

    /// Forces `thread` into `to` whatever its state.
    pub fn set_state(&self, thread: usize, to: ClientState) {
        *self.states[thread].lock() = to;
        self.state_cv.notify_all();
    }

    /// Blocks while `thread` still runs against the primary. Returns the
    /// state it left `Active` for.
    pub fn wait_for_handoff(&self, thread: usize) -> ClientState {
        let mut s = self.states[thread].lock();
        while *s == ClientState::Active {
            self.state_cv.wait(&mut s);
        }
        *s
    }

    pub(crate) fn mark_started(&self, thread: usize) {
        self.times[thread].lock().started = Some(Instant::now());
    }

    /// Records that `thread` lost its primary connection now.
    pub(crate) fn mark_breakpoint(&self, thread: usize) {
        let mut t = self.times[thread].lock();
        let now = Instant::now();
        t.before_latency = t.started.map(|s| now.duration_since(s));
        t.breakpoint = Some(now);
    }

    /// Records that `thread`'s backup connection is up.
    pub(crate) fn mark_reconnected(&self, thread: usize) -> Instant {
        let mut t = self.times[thread].lock();
        let now = Instant::now();
        t.breakpoint_latency = t.breakpoint.map(|b| now.duration_since(b));
        now
    }

    pub(crate) fn mark_resumed(&self, thread: usize, since: Instant) {
        self.times[thread].lock().remain_backup_latency = Some(since.elapsed());
    }

    /// Time thread `thread` ran on the primary before the break.
    pub fn before_latency(&self, thread: usize) -> Option<Duration> {
        self.times[thread].lock().before_latency
    }

    /// Time between the break and the backup connection of `thread`.
    pub fn breakpoint_latency(&self, thread: usize) -> Option<Duration> {
        self.times[thread].lock().breakpoint_latency
    }

    /// Time it took `thread` to finish its interrupted transaction.
    pub fn remain_backup_latency(&self, thread: usize) -> Option<Duration> {
        self.times[thread].lock().remain_backup_latency
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    // Tests that waiters see a raise that happened before or after they wait.
    #[test]
    fn test_signal_raise() {
        let s = Arc::new(Signal::new());
        let s2 = s.clone();
        let waiter = thread::spawn(move || s2.wait());
        s.raise();
        assert!(waiter.join().unwrap());
        assert!(s.wait());
        assert!(s.is_raised());
    }

    // Tests that a cancelled signal releases waiters and can't be raised.
    #[test]
    fn test_signal_cancel() {
        let s = Signal::new();
        assert_eq!(s.wait_timeout(Duration::from_millis(5)), None);
        s.cancel();
        s.raise();
        assert!(!s.wait());
        assert_eq!(s.wait_timeout(Duration::from_millis(5)), Some(false));
    }

    // Tests that transitions only apply from the expected state.
    #[test]
    fn test_transitions() {
        let ctx = FailoverContext::new(2);
        assert!(!ctx.transition(0, ClientState::DetectedDown, ClientState::Resuming));
        assert!(ctx.transition(0, ClientState::Active, ClientState::DetectedDown));
        assert_eq!(ctx.state(0), ClientState::DetectedDown);
        assert_eq!(ctx.state(1), ClientState::Active);
        assert_eq!(ctx.wait_for_handoff(0), ClientState::DetectedDown);
    }

    // Tests that a reconnect thread blocks until its client leaves Active.
    #[test]
    fn test_wait_for_handoff_blocks() {
        let ctx = Arc::new(FailoverContext::new(1));
        let c2 = ctx.clone();
        let waiter = thread::spawn(move || c2.wait_for_handoff(0));
        thread::sleep(Duration::from_millis(10));
        ctx.set_next_sql_index(0, 3);
        ctx.transition(0, ClientState::Active, ClientState::Finished);
        assert_eq!(waiter.join().unwrap(), ClientState::Finished);
        assert_eq!(ctx.next_sql_index(0), 3);
    }

    // Tests the per-thread counters and their totals.
    #[test]
    fn test_counters() {
        let ctx = FailoverContext::new(3);
        ctx.record_commit(0);
        ctx.record_commit(2);
        ctx.record_abort(1);
        ctx.advance_sql_index(1);
        assert_eq!(ctx.total_commits(), 2);
        assert_eq!(ctx.total_aborts(), 1);
        assert_eq!(ctx.next_sql_index(1), 1);
    }
}
