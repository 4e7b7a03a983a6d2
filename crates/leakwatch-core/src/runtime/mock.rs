//! Scripted runtime for testing.
//!
//! Collections happen only when the test calls [`ScriptedRuntime::collect`],
//! and every collection moves to the next scripted reading, so cycle numbers,
//! heap sizes and read failures are fully deterministic.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::{HeapRuntime, HeapStats, RuntimeStats};
use crate::error::MonitorError;
use crate::trap::Sentinel;

enum Step {
    Stats(RuntimeStats),
    Fail(String),
}

struct ScriptState {
    current: Result<RuntimeStats, String>,
    script: VecDeque<Step>,
    pending: Vec<Sentinel>,
    stopped: bool,
}

/// Runtime whose collections and readings are driven by the test.
pub struct ScriptedRuntime {
    state: Mutex<ScriptState>,
    armed: Condvar,
}

impl ScriptedRuntime {
    /// Creates a runtime that reports `initial` until the first collection.
    pub fn new(initial: RuntimeStats) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                current: Ok(initial),
                script: VecDeque::new(),
                pending: Vec::new(),
                stopped: false,
            }),
            armed: Condvar::new(),
        }
    }

    /// Convenience reading with the given cycle number and live bytes.
    pub fn stats(gc_cycle: u32, alloc_bytes: u64) -> RuntimeStats {
        RuntimeStats {
            alloc_bytes,
            heap_alloc_bytes: alloc_bytes,
            sys_bytes: alloc_bytes,
            heap_objects: alloc_bytes / 16,
            total_alloc_bytes: alloc_bytes,
            mallocs: alloc_bytes / 16,
            gc_cycle,
            last_gc: Utc::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the reading reported after the next unconsumed collection.
    pub fn push_stats(&self, stats: RuntimeStats) {
        self.lock().script.push_back(Step::Stats(stats));
    }

    /// Queues a failing read after the next unconsumed collection.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.lock().script.push_back(Step::Fail(message.into()));
    }

    /// Number of sentinels waiting for a collection.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Blocks until at least one sentinel is registered or `timeout` elapses.
    pub fn wait_armed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.pending.is_empty() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            state = self
                .armed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Runs one collection: advances the script and finalizes pending sentinels.
    ///
    /// Returns the number of finalized sentinels.
    pub fn collect(&self) -> usize {
        let sentinels = {
            let mut state = self.lock();
            match state.script.pop_front() {
                Some(Step::Stats(stats)) => state.current = Ok(stats),
                Some(Step::Fail(msg)) => state.current = Err(msg),
                None => {}
            }
            std::mem::take(&mut state.pending)
        };

        let count = sentinels.len();
        for sentinel in sentinels {
            sentinel.finalize(self);
        }
        count
    }

    /// Stops accepting sentinels and abandons the pending ones.
    pub fn stop(&self) {
        let abandoned = {
            let mut state = self.lock();
            state.stopped = true;
            std::mem::take(&mut state.pending)
        };
        drop(abandoned);
    }
}

impl HeapStats for ScriptedRuntime {
    fn read_stats(&self) -> Result<RuntimeStats, MonitorError> {
        self.lock().current.clone().map_err(MonitorError::Stats)
    }
}

impl HeapRuntime for ScriptedRuntime {
    fn register_finalizer(&self, sentinel: Sentinel) -> Result<(), MonitorError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(MonitorError::RuntimeStopped);
        }
        state.pending.push(sentinel);
        self.armed.notify_all();
        Ok(())
    }
}
