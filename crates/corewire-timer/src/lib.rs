//! Multi-timer scheduler: dense handle allocation, a min-heap of live timers
//! keyed by absolute expiration, and a single service worker thread that
//! sleeps on a condition variable until either the next expiration or an
//! external wake.
//!
//! Cancellation (`stop_timer`/`delete_timer`) is O(1): rather than
//! re-heapifying, each live heap entry is an indirect reference (a shared
//! [`heap::SlotCell`]) that cancellation tombstones in place. The worker
//! discards tombstoned references lazily as it pops them.

mod handle;
mod heap;

use std::{
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub use handle::{TimerHandle, INVALID_HANDLE};

use handle::HandleTable;
use heap::{HeapItem, SlotCell};

/// `MAX_TIMER_COUNT` from the original: default handle pool size.
pub const DEFAULT_MAX_TIMERS: usize = 100;

/// `MAX_TIMER_INTERVAL` from the original: half the representable range, so
/// that `now + interval` never overflows on any reasonable clock epoch.
pub const DEFAULT_MAX_INTERVAL_MS: u64 = u64::MAX / 2;

/// Bound on how long `TimerManager::drop` waits for the worker to
/// acknowledge shutdown before giving up on joining it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerManagerConfig {
    pub max_timers: usize,
    pub max_interval_ms: u64,
}

impl Default for TimerManagerConfig {
    fn default() -> Self {
        Self { max_timers: DEFAULT_MAX_TIMERS, max_interval_ms: DEFAULT_MAX_INTERVAL_MS }
    }
}

/// A point-in-time view of one live timer, for callers who want to log or
/// inspect scheduler state without a bespoke dump routine.
#[derive(Debug, Clone)]
pub struct TimerSnapshot {
    pub handle: TimerHandle,
    pub remaining: Duration,
    pub auto_reset: bool,
    pub state: TimerState,
}

type Callback<U> = Arc<dyn Fn(TimerHandle, U) + Send + Sync>;

struct TimerEntry<U> {
    interval: Duration,
    expiration: Instant,
    state: TimerState,
    auto_reset: bool,
    callback: Callback<U>,
    user: U,
    /// The heap's live reference to this entry, if `state == Active`.
    cell: Option<SlotCell>,
}

struct ManagerState<U> {
    table: HandleTable<TimerEntry<U>>,
    heap: std::collections::BinaryHeap<HeapItem>,
    shutdown: bool,
}

/// A running multi-timer scheduler, backed by one dedicated worker thread.
///
/// `U` is the opaque user payload handed back to callbacks verbatim,
/// matching the original's `void* user`, but `Clone + Send + 'static`
/// instead of a raw pointer, since the worker thread and caller threads each
/// need their own copy.
pub struct TimerManager<U> {
    state: Arc<Mutex<ManagerState<U>>>,
    condvar: Arc<Condvar>,
    worker: Option<JoinHandle<()>>,
    config: TimerManagerConfig,
}

impl<U: Clone + Send + 'static> TimerManager<U> {
    pub fn new() -> std::io::Result<Self> {
        Self::with_config(TimerManagerConfig::default())
    }

    pub fn with_config(config: TimerManagerConfig) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(ManagerState {
            table: HandleTable::new(config.max_timers),
            heap: std::collections::BinaryHeap::new(),
            shutdown: false,
        }));
        let condvar = Arc::new(Condvar::new());

        let worker_state = Arc::clone(&state);
        let worker_condvar = Arc::clone(&condvar);
        let worker = thread::Builder::new()
            .name("timer-manager-worker".into())
            .spawn(move || service_loop(&worker_state, &worker_condvar))?;

        Ok(Self { state, condvar, worker: Some(worker), config })
    }

    /// Creates an active, auto-resetting timer with the default state.
    /// Returns [`INVALID_HANDLE`] if `interval_ms` exceeds the configured
    /// maximum or the handle pool is exhausted.
    pub fn create_timer<F>(&self, interval_ms: u64, callback: F, user: U) -> TimerHandle
    where
        F: Fn(TimerHandle, U) + Send + Sync + 'static,
    {
        self.create_timer_with(interval_ms, callback, user, TimerState::Active, true)
    }

    /// Full form of [`Self::create_timer`], with explicit initial state and
    /// auto-reset behavior.
    pub fn create_timer_with<F>(
        &self,
        interval_ms: u64,
        callback: F,
        user: U,
        initial_state: TimerState,
        auto_reset: bool,
    ) -> TimerHandle
    where
        F: Fn(TimerHandle, U) + Send + Sync + 'static,
    {
        if interval_ms > self.config.max_interval_ms {
            tracing::warn!(interval_ms, "timer interval exceeds configured maximum");
            return INVALID_HANDLE;
        }

        let interval = Duration::from_millis(interval_ms);
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let cell = if initial_state == TimerState::Active {
            Some(heap::new_cell(INVALID_HANDLE))
        } else {
            None
        };

        let entry = TimerEntry {
            interval,
            expiration: now + interval,
            state: initial_state,
            auto_reset,
            callback: Arc::new(callback),
            user,
            cell: cell.clone(),
        };

        let Some(handle) = guard.table.insert(entry) else {
            tracing::warn!(capacity = self.config.max_timers, "timer pool exhausted");
            return INVALID_HANDLE;
        };

        if let Some(cell) = &cell {
            cell.store(handle, std::sync::atomic::Ordering::SeqCst);
            guard.heap.push(HeapItem { expiration: now + interval, cell: Arc::clone(cell) });
            drop(guard);
            self.condvar.notify_one();
        }

        handle
    }

    /// Transitions `handle` to `Suspended`, tombstoning any live heap
    /// reference. Returns `false` if `handle` is not a currently live timer.
    pub fn stop_timer(&self, handle: TimerHandle, trigger_service: bool) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = guard.table.get_mut(handle) else {
            tracing::debug!(handle, "stop_timer: invalid handle");
            return false;
        };

        if let Some(cell) = entry.cell.take() {
            heap::tombstone(&cell);
        }
        entry.state = TimerState::Suspended;
        let fire = trigger_service.then(|| (Arc::clone(&entry.callback), entry.user.clone()));

        drop(guard);
        if let Some((callback, user)) = fire {
            callback(handle, user);
        }

        true
    }

    /// Recomputes expiration from now, reactivates, and pushes a fresh heap
    /// reference, waking the worker. Returns `false` if `handle` is invalid.
    pub fn restart_timer(&self, handle: TimerHandle, trigger_service: bool) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = guard.table.get_mut(handle) else {
            tracing::debug!(handle, "restart_timer: invalid handle");
            return false;
        };

        if let Some(old) = entry.cell.take() {
            heap::tombstone(&old);
        }

        let interval = entry.interval;
        entry.expiration = now + interval;
        entry.state = TimerState::Active;
        let cell = heap::new_cell(handle);
        entry.cell = Some(Arc::clone(&cell));
        let fire = trigger_service.then(|| (Arc::clone(&entry.callback), entry.user.clone()));

        guard.heap.push(HeapItem { expiration: now + interval, cell });
        drop(guard);
        self.condvar.notify_one();

        if let Some((callback, user)) = fire {
            callback(handle, user);
        }

        true
    }

    /// Tombstones any live heap reference and returns the handle to the free
    /// list. The worker discards the tombstoned heap entry later, lazily.
    pub fn delete_timer(&self, handle: TimerHandle) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = guard.table.remove(handle) else {
            tracing::debug!(handle, "delete_timer: invalid handle");
            return false;
        };
        if let Some(cell) = entry.cell {
            heap::tombstone(&cell);
        }
        true
    }

    pub fn is_timer_active(&self, handle: TimerHandle) -> bool {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.table.get(handle).is_some_and(|e| e.state == TimerState::Active)
    }

    /// A structured, loggable view of every live timer. Stands in for the
    /// original's stdout dump routines without reproducing a bespoke
    /// pretty-printer.
    pub fn snapshot(&self) -> Vec<TimerSnapshot> {
        let now = Instant::now();
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .table
            .iter()
            .map(|(handle, entry)| TimerSnapshot {
                handle,
                remaining: entry.expiration.saturating_duration_since(now),
                auto_reset: entry.auto_reset,
                state: entry.state,
            })
            .collect()
    }
}

impl<U> Drop for TimerManager<U> {
    fn drop(&mut self) {
        {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            guard.shutdown = true;
        }
        self.condvar.notify_all();

        let Some(worker) = self.worker.take() else { return };
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        if worker.is_finished() {
            let _ = worker.join();
        } else {
            tracing::error!("timer manager worker did not exit within shutdown grace period");
        }
    }
}

/// The single service worker loop. Holds the manager mutex except while
/// sleeping on the condition variable and while a callback runs.
fn service_loop<U: Clone>(state: &Arc<Mutex<ManagerState<U>>>, condvar: &Arc<Condvar>) {
    let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());

    loop {
        if guard.shutdown {
            return;
        }

        let Some(top) = guard.heap.peek() else {
            guard = condvar.wait(guard).unwrap_or_else(|e| e.into_inner());
            continue;
        };

        if heap::is_tombstoned(&top.cell) {
            guard.heap.pop();
            continue;
        }

        let now = Instant::now();
        if top.expiration > now {
            let wait_for = top.expiration - now;
            let (g, _timeout) =
                condvar.wait_timeout(guard, wait_for).unwrap_or_else(|e| e.into_inner());
            guard = g;
            continue;
        }

        let item = guard.heap.pop().expect("peeked item must be poppable");
        let handle = item.cell.load(std::sync::atomic::Ordering::SeqCst);
        if handle == INVALID_HANDLE {
            // Tombstoned between peek and pop.
            continue;
        }

        let Some(entry) = guard.table.get_mut(handle) else {
            corewire_utils::safe_panic!("heap referenced a handle with no table entry");
            continue;
        };

        if entry.auto_reset {
            let interval = entry.interval;
            entry.expiration = now + interval;
            guard.heap.push(HeapItem { expiration: now + interval, cell: item.cell });
        } else {
            entry.state = TimerState::Suspended;
            entry.cell = None;
        }

        let callback = Arc::clone(&entry.callback);
        let user = entry.user.clone();

        drop(guard);
        callback(handle, user);
        guard = state.lock().unwrap_or_else(|e| e.into_inner());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn one_shot_fires_exactly_once_then_deactivates() {
        let mgr: TimerManager<mpsc::Sender<()>> = TimerManager::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = mgr.create_timer_with(
            20,
            |_h, tx: mpsc::Sender<()>| {
                let _ = tx.send(());
            },
            tx,
            TimerState::Active,
            false,
        );

        rx.recv_timeout(Duration::from_millis(500)).expect("timer should fire once");
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err(), "one-shot timer must not fire twice");
        assert!(!mgr.is_timer_active(handle));
    }

    #[test]
    fn restart_of_fired_one_shot_fires_again() {
        let mgr: TimerManager<mpsc::Sender<()>> = TimerManager::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = mgr.create_timer_with(
            20,
            |_h, tx: mpsc::Sender<()>| {
                let _ = tx.send(());
            },
            tx,
            TimerState::Active,
            false,
        );

        rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert!(!mgr.is_timer_active(handle));

        mgr.restart_timer(handle, false);
        assert!(mgr.is_timer_active(handle));
        rx.recv_timeout(Duration::from_millis(500)).expect("restarted one-shot should fire again");
    }

    #[test]
    fn delete_before_expiration_never_fires() {
        let mgr: TimerManager<mpsc::Sender<()>> = TimerManager::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = mgr.create_timer(500, |_h, tx: mpsc::Sender<()>| {
            let _ = tx.send(());
        }, tx);

        mgr.delete_timer(handle);
        assert!(rx.recv_timeout(Duration::from_millis(700)).is_err());
    }

    #[test]
    fn stop_prevents_further_fires() {
        let mgr: TimerManager<mpsc::Sender<()>> = TimerManager::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = mgr.create_timer(15, |_h, tx: mpsc::Sender<()>| {
            let _ = tx.send(());
        }, tx);

        rx.recv_timeout(Duration::from_millis(500)).unwrap();
        mgr.stop_timer(handle, false);
        assert!(!mgr.is_timer_active(handle));

        // drain anything already in flight, then confirm silence
        while rx.recv_timeout(Duration::from_millis(30)).is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn late_creation_of_short_timer_fires_before_long_one() {
        let mgr: TimerManager<mpsc::Sender<&'static str>> = TimerManager::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let tx_long = tx.clone();
        mgr.create_timer(2000, move |_h, tx: mpsc::Sender<&'static str>| {
            let _ = tx.send("long");
        }, tx_long);

        thread::sleep(Duration::from_millis(50));

        mgr.create_timer_with(
            30,
            |_h, tx: mpsc::Sender<&'static str>| {
                let _ = tx.send("short");
            },
            tx,
            TimerState::Active,
            false,
        );

        let first = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(first, "short");
    }

    #[test]
    fn multi_timer_independence_within_tolerance() {
        let mgr: TimerManager<mpsc::Sender<u64>> = TimerManager::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let intervals = [10u64, 20, 50, 100];

        for &ms in &intervals {
            let tx = tx.clone();
            mgr.create_timer(ms, move |_h, tx: mpsc::Sender<u64>| {
                let _ = tx.send(ms);
            }, tx);
        }

        let mut counts: std::collections::HashMap<u64, u32> =
            intervals.iter().map(|&i| (i, 0)).collect();

        let deadline = Instant::now() + Duration::from_millis(600);
        while Instant::now() < deadline {
            if let Ok(ms) = rx.recv_timeout(Duration::from_millis(50)) {
                *counts.get_mut(&ms).unwrap() += 1;
            }
        }

        // the fastest timer should have fired noticeably more often than
        // the slowest, proving independent scheduling rather than one
        // dominating or starving the others
        assert!(counts[&10] > counts[&100]);
        for &ms in &intervals {
            assert!(counts[&ms] >= 1, "interval {ms}ms never fired");
        }
    }

    #[test]
    fn invalid_handle_operations_are_reported_not_fatal() {
        let mgr: TimerManager<()> = TimerManager::new().unwrap();
        assert!(!mgr.stop_timer(INVALID_HANDLE, false));
        assert!(!mgr.restart_timer(999, false));
        assert!(!mgr.delete_timer(INVALID_HANDLE));
        assert!(!mgr.is_timer_active(INVALID_HANDLE));
    }

    #[test]
    fn interval_over_max_is_rejected() {
        let mgr: TimerManager<()> = TimerManager::with_config(TimerManagerConfig {
            max_timers: 4,
            max_interval_ms: 1000,
        })
        .unwrap();
        let handle = mgr.create_timer(5000, |_h, _u| {}, ());
        assert_eq!(handle, INVALID_HANDLE);
    }

    #[test]
    fn pool_exhaustion_returns_invalid_handle() {
        let mgr: TimerManager<()> =
            TimerManager::with_config(TimerManagerConfig { max_timers: 2, max_interval_ms: u64::MAX / 2 })
                .unwrap();
        assert_ne!(mgr.create_timer(1000, |_h, _u| {}, ()), INVALID_HANDLE);
        assert_ne!(mgr.create_timer(1000, |_h, _u| {}, ()), INVALID_HANDLE);
        assert_eq!(mgr.create_timer(1000, |_h, _u| {}, ()), INVALID_HANDLE);
    }

    #[test]
    fn snapshot_reports_live_timers() {
        let mgr: TimerManager<()> = TimerManager::new().unwrap();
        let h = mgr.create_timer(1000, |_h, _u| {}, ());
        let snap = mgr.snapshot();
        let entry = snap.iter().find(|s| s.handle == h).expect("snapshot must include live timer");
        assert_eq!(entry.state, TimerState::Active);
        assert!(entry.remaining <= Duration::from_millis(1000));
    }
}
