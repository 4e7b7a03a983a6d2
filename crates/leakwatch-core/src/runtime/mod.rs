//! Host runtime boundary.
//!
//! The observer needs two capabilities from the process it watches:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       HeapRuntime                        │
//! │  ┌──────────────────────┐   ┌──────────────────────────┐ │
//! │  │      HeapStats       │   │   register_finalizer     │ │
//! │  │  synchronous read of │   │  one-shot hook, run by   │ │
//! │  │  memory counters     │   │  the collector thread    │ │
//! │  └──────────────────────┘   └──────────────────────────┘ │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │
//!              ┌───────────────┴───────────────┐
//!              │                               │
//!       ┌──────▼────────┐              ┌───────▼─────────┐
//!       │  SweepRuntime │              │ ScriptedRuntime │
//!       │  (production) │              │    (testing)    │
//!       └──────┬────────┘              └─────────────────┘
//!              │
//!       ┌──────▼────────┐
//!       │ CountingAlloc │ + jemalloc statistics
//!       └───────────────┘
//! ```
//!
//! Rust has no tracing collector, so [`SweepRuntime`] runs collection cycles on
//! a fixed interval: each cycle purges allocator arenas, advances the cycle
//! counter and finalizes every sentinel registered since the previous cycle.

pub mod alloc;
#[cfg(feature = "jemalloc")]
mod jemalloc;
pub mod mock;
mod sweep;

use chrono::{DateTime, Utc};

use crate::error::MonitorError;
use crate::trap::Sentinel;

pub use alloc::{AllocCounters, AllocatorStats, CountingAlloc};
pub use mock::ScriptedRuntime;
pub use sweep::SweepRuntime;

/// Raw memory counters as reported by the runtime.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RuntimeStats {
    pub alloc_bytes: u64,
    pub heap_alloc_bytes: u64,
    pub sys_bytes: u64,
    pub heap_objects: u64,
    pub total_alloc_bytes: u64,
    pub mallocs: u64,
    pub gc_cycle: u32,
    pub last_gc: DateTime<Utc>,
}

/// Synchronous, side-effect-free read of memory counters.
pub trait HeapStats: Send + Sync {
    fn read_stats(&self) -> Result<RuntimeStats, MonitorError>;
}

/// A runtime that can notify about completed collection cycles.
pub trait HeapRuntime: HeapStats {
    /// Hands `sentinel` to the runtime.
    ///
    /// The runtime finalizes it exactly once, on its own thread, after the next
    /// collection cycle completes. Dropping it unfinalized abandons the waiter.
    fn register_finalizer(&self, sentinel: Sentinel) -> Result<(), MonitorError>;
}
