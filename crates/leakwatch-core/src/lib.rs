//! leakwatch-core - heap growth observer synchronized with collection cycles.
//!
//! Provides:
//! - `snapshot` - point-in-time memory counters and the sampler
//! - `runtime` - host runtime boundary (stats read, finalizer registration),
//!   the counting allocator, the sweeper runtime and a scripted test runtime
//! - `trap` - one-shot trap resolving after the next collection cycle
//! - `history` - fixed-capacity ring of recent snapshots
//! - `leak` - deltas, growth rate and leak classification
//! - `monitor` - the background control loop and its lifecycle
//! - `fmt` - byte/duration formatting for log messages

pub mod error;
pub mod fmt;
pub mod history;
pub mod leak;
pub mod monitor;
pub mod runtime;
pub mod snapshot;
pub mod trap;

pub use error::MonitorError;
pub use history::HistoryRing;
pub use leak::{ClassifierConfig, LeakReason, LeakReport, classify, diff};
pub use monitor::{
    CloseHandle, ClosedSignal, Monitor, MonitorBuilder, MonitorConfig, MonitorState, ReportCadence,
};
pub use runtime::{HeapRuntime, HeapStats, RuntimeStats};
pub use snapshot::{Snapshot, capture_snapshot};
pub use trap::{PendingTrap, Sentinel, Trap, await_next_gc};
