//! One-shot trap that resolves after the runtime's next collection cycle.
//!
//! The trap hands a fresh [`Sentinel`] to the runtime. The runtime keeps it
//! until its next collection, then finalizes it from the collector thread. The
//! sentinel's hook reads the memory counters right there and passes the
//! snapshot back through a capacity-1 channel, so the reading lands shortly
//! after the cycle and never before it.
//!
//! One sentinel and one channel exist per wait. A finalizer fires at most once,
//! so a new trap must be armed after every resolved wait.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::error::MonitorError;
use crate::runtime::{HeapRuntime, HeapStats};
use crate::snapshot::{Snapshot, capture_snapshot};

type Hook = Box<dyn FnOnce(&dyn HeapStats) + Send + 'static>;

/// Object whose finalization signals a completed collection cycle.
///
/// Owned by the runtime between registration and finalization.
pub struct Sentinel {
    hook: Hook,
}

impl Sentinel {
    fn new(hook: impl FnOnce(&dyn HeapStats) + Send + 'static) -> Self {
        Self {
            hook: Box::new(hook),
        }
    }

    /// Runs the finalizer hook. Called by the runtime after a collection.
    pub fn finalize(self, stats: &dyn HeapStats) {
        (self.hook)(stats)
    }
}

impl std::fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sentinel").finish_non_exhaustive()
    }
}

/// Arms GC traps.
pub struct Trap;

impl Trap {
    /// Registers a fresh sentinel with `runtime` and returns the pending wait.
    pub fn arm<R: HeapRuntime + ?Sized>(runtime: &R) -> Result<PendingTrap, MonitorError> {
        let (tx, rx) = channel::bounded(1);
        runtime.register_finalizer(Sentinel::new(move |stats| handoff(&tx, stats)))?;
        Ok(PendingTrap { rx })
    }
}

fn handoff(tx: &Sender<Result<Snapshot, MonitorError>>, stats: &dyn HeapStats) {
    // The collector thread must never block on a slow or vanished waiter.
    let _ = tx.try_send(capture_snapshot(stats));
}

/// A trap whose sentinel is armed but not yet finalized.
#[derive(Debug)]
pub struct PendingTrap {
    rx: Receiver<Result<Snapshot, MonitorError>>,
}

impl PendingTrap {
    /// Blocks until the sentinel is finalized.
    pub fn wait(self) -> Result<Snapshot, MonitorError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(MonitorError::TrapAbandoned),
        }
    }

    /// Waits up to `timeout`; `Ok(None)` means the cycle has not completed yet
    /// and the same sentinel stays armed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Snapshot>, MonitorError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(MonitorError::TrapAbandoned),
        }
    }
}

/// Suspends the caller until the runtime completes its next collection cycle.
pub fn await_next_gc<R: HeapRuntime + ?Sized>(runtime: &R) -> Result<Snapshot, MonitorError> {
    Trap::arm(runtime)?.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ScriptedRuntime;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_trap_resolves_after_collection() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedRuntime::stats(1, 100)));
        runtime.push_stats(ScriptedRuntime::stats(2, 150));

        let rt = Arc::clone(&runtime);
        let waiter = thread::spawn(move || await_next_gc(&*rt));

        assert!(runtime.wait_armed(Duration::from_secs(5)));
        assert_eq!(runtime.collect(), 1);

        let snapshot = waiter.join().unwrap().unwrap();
        assert_eq!(snapshot.gc_cycle, 2);
        assert_eq!(snapshot.alloc_bytes, 150);
        assert_eq!(runtime.pending(), 0);
    }

    #[test]
    fn test_wait_timeout_keeps_sentinel_armed() {
        let runtime = ScriptedRuntime::new(ScriptedRuntime::stats(1, 100));
        let pending = Trap::arm(&runtime).unwrap();

        assert!(pending.wait_timeout(Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(runtime.pending(), 1);

        runtime.push_stats(ScriptedRuntime::stats(2, 120));
        runtime.collect();
        let snapshot = pending.wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(snapshot.map(|s| s.gc_cycle), Some(2));
    }

    #[test]
    fn test_abandoned_sentinel_reports_error() {
        let runtime = ScriptedRuntime::new(ScriptedRuntime::stats(1, 100));
        let pending = Trap::arm(&runtime).unwrap();

        runtime.stop();

        assert!(matches!(pending.wait(), Err(MonitorError::TrapAbandoned)));
        assert!(matches!(Trap::arm(&runtime), Err(MonitorError::RuntimeStopped)));
    }

    #[test]
    fn test_stats_failure_is_delivered_to_waiter() {
        let runtime = ScriptedRuntime::new(ScriptedRuntime::stats(1, 100));
        runtime.push_failure("mallctl returned EINVAL");
        let pending = Trap::arm(&runtime).unwrap();

        runtime.collect();

        assert!(matches!(pending.wait(), Err(MonitorError::Stats(_))));
    }

    #[test]
    fn test_finalizer_fires_once_per_registration() {
        let runtime = ScriptedRuntime::new(ScriptedRuntime::stats(1, 100));
        let pending = Trap::arm(&runtime).unwrap();

        runtime.push_stats(ScriptedRuntime::stats(2, 100));
        assert_eq!(runtime.collect(), 1);
        runtime.push_stats(ScriptedRuntime::stats(3, 100));
        assert_eq!(runtime.collect(), 0);

        assert_eq!(pending.wait().unwrap().gc_cycle, 2);
    }
}
