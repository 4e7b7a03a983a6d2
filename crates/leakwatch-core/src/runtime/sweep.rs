//! Production runtime: a sweeper thread that performs collection cycles.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender};
use crossbeam::select;
use tracing::{debug, warn};

#[cfg(feature = "jemalloc")]
use super::jemalloc::{self, JemallocStats};
use super::{AllocatorStats, HeapRuntime, HeapStats, RuntimeStats};
use crate::error::MonitorError;
use crate::trap::Sentinel;

/// Returns unused allocator pages to the OS as part of a collection cycle.
#[cfg(feature = "jemalloc")]
fn release_memory_to_os() {
    if !jemalloc::purge_arenas() {
        warn!("jemalloc rejected arena purge");
    }
}

#[cfg(not(feature = "jemalloc"))]
fn release_memory_to_os() {}

struct SweepInner {
    counters: &'static dyn AllocatorStats,
    cycle: AtomicU32,
    last_gc: Mutex<DateTime<Utc>>,
    pending: Mutex<Vec<Sentinel>>,
    stopped: AtomicBool,
    #[cfg(feature = "jemalloc")]
    jemalloc: JemallocStats,
}

impl SweepInner {
    fn pending(&self) -> MutexGuard<'_, Vec<Sentinel>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn collect(&self) -> usize {
        release_memory_to_os();

        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        *self.last_gc.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();

        // Sentinels registered from here on wait for the next cycle.
        let sentinels = std::mem::take(&mut *self.pending());
        let count = sentinels.len();
        for sentinel in sentinels {
            sentinel.finalize(self);
        }

        debug!(gc_cycle = cycle, finalized = count, "collection cycle complete");
        count
    }

    fn abandon_pending(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let abandoned = std::mem::take(&mut *self.pending());
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning pending sentinels");
        }
    }
}

impl HeapStats for SweepInner {
    fn read_stats(&self) -> Result<RuntimeStats, MonitorError> {
        let counters = self.counters.counters();

        #[cfg(feature = "jemalloc")]
        let (heap_alloc_bytes, sys_bytes) = self.jemalloc.read()?;
        #[cfg(not(feature = "jemalloc"))]
        let (heap_alloc_bytes, sys_bytes) = (counters.live_bytes, counters.live_bytes);

        Ok(RuntimeStats {
            alloc_bytes: counters.live_bytes,
            heap_alloc_bytes,
            sys_bytes,
            heap_objects: counters.live_objects,
            total_alloc_bytes: counters.total_bytes,
            mallocs: counters.allocations,
            gc_cycle: self.cycle.load(Ordering::SeqCst),
            last_gc: *self.last_gc.lock().unwrap_or_else(PoisonError::into_inner),
        })
    }
}

/// Runtime whose collection cycles run on a dedicated sweeper thread.
///
/// Every `interval` the sweeper purges allocator arenas, advances the cycle
/// counter and finalizes the sentinels registered since the previous cycle.
/// Dropping the runtime stops the sweeper and abandons pending sentinels.
pub struct SweepRuntime {
    inner: Arc<SweepInner>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SweepRuntime {
    /// Starts the sweeper thread.
    ///
    /// # Arguments
    /// * `counters` - Allocator counters, usually the process's global allocator
    /// * `interval` - Time between collection cycles
    pub fn start(
        counters: &'static dyn AllocatorStats,
        interval: Duration,
    ) -> Result<Self, MonitorError> {
        let inner = Arc::new(SweepInner {
            counters,
            cycle: AtomicU32::new(0),
            last_gc: Mutex::new(Utc::now()),
            pending: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            #[cfg(feature = "jemalloc")]
            jemalloc: JemallocStats::new()?,
        });

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let sweeper = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("leakwatch-sweep".to_string())
            .spawn(move || {
                let ticker = channel::tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            sweeper.collect();
                        }
                    }
                }
                sweeper.abandon_pending();
            })?;

        Ok(Self {
            inner,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Runs a collection cycle immediately on the calling thread.
    pub fn collect_now(&self) -> usize {
        self.inner.collect()
    }

    /// Completed collection cycles.
    pub fn cycles(&self) -> u32 {
        self.inner.cycle.load(Ordering::SeqCst)
    }
}

impl HeapStats for SweepRuntime {
    fn read_stats(&self) -> Result<RuntimeStats, MonitorError> {
        self.inner.read_stats()
    }
}

impl HeapRuntime for SweepRuntime {
    fn register_finalizer(&self, sentinel: Sentinel) -> Result<(), MonitorError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(MonitorError::RuntimeStopped);
        }
        self.inner.pending().push(sentinel);
        Ok(())
    }
}

impl Drop for SweepRuntime {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("sweeper thread panicked");
        }
        self.inner.abandon_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CountingAlloc;
    use crate::trap::{Trap, await_next_gc};
    use std::alloc::System;

    static COUNTERS: CountingAlloc<System> = CountingAlloc::new(System);

    #[test]
    fn test_collect_now_finalizes_pending_trap() {
        let runtime = SweepRuntime::start(&COUNTERS, Duration::from_secs(3600)).unwrap();
        let pending = Trap::arm(&runtime).unwrap();

        assert_eq!(runtime.collect_now(), 1);

        let snapshot = pending.wait().unwrap();
        assert_eq!(snapshot.gc_cycle, 1);
        assert_eq!(runtime.cycles(), 1);
    }

    #[test]
    fn test_sweeper_thread_drives_cycles() {
        let runtime = SweepRuntime::start(&COUNTERS, Duration::from_millis(5)).unwrap();

        let first = await_next_gc(&runtime).unwrap();
        let second = await_next_gc(&runtime).unwrap();

        assert!(second.gc_cycle > first.gc_cycle);
    }

    #[test]
    fn test_drop_abandons_pending_sentinels() {
        let runtime = SweepRuntime::start(&COUNTERS, Duration::from_secs(3600)).unwrap();
        let pending = Trap::arm(&runtime).unwrap();

        drop(runtime);

        assert!(matches!(pending.wait(), Err(MonitorError::TrapAbandoned)));
    }
}
