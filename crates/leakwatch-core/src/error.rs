//! Error type shared by the runtime adapters, the trap and the monitor.

/// Errors surfaced by the observer.
///
/// Only fatal conditions are represented here. Cycle-number anomalies are
/// logged by the control loop and never become errors.
#[derive(Debug)]
pub enum MonitorError {
    /// Reading runtime memory statistics failed.
    Stats(String),
    /// The runtime discarded an armed sentinel without finalizing it.
    TrapAbandoned,
    /// The runtime no longer accepts sentinels.
    RuntimeStopped,
    /// Spawning a background thread failed.
    Spawn(std::io::Error),
    /// The monitor thread panicked.
    Panicked,
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Stats(msg) => write!(f, "failed to read memory statistics: {}", msg),
            MonitorError::TrapAbandoned => write!(f, "sentinel dropped before collection"),
            MonitorError::RuntimeStopped => write!(f, "runtime stopped accepting finalizers"),
            MonitorError::Spawn(e) => write!(f, "failed to spawn thread: {}", e),
            MonitorError::Panicked => write!(f, "monitor thread panicked"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        MonitorError::Spawn(e)
    }
}

#[cfg(feature = "jemalloc")]
impl From<tikv_jemalloc_ctl::Error> for MonitorError {
    fn from(e: tikv_jemalloc_ctl::Error) -> Self {
        MonitorError::Stats(e.to_string())
    }
}
