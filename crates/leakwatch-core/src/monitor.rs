//! Background control loop tying trap, history and classifier together.
//!
//! ```text
//!   Created ──spawn──▶ Running ──close()──▶ Closing ──loop exits──▶ Closed
//!                         │                                           ▲
//!                         └────────── stats failure / abandoned ──────┘
//! ```
//!
//! Each iteration arms one trap, waits for the collection cycle, validates
//! the cycle number, pushes the snapshot into the history ring, logs a sample
//! record and, when the report cadence is due, classifies the history and
//! emits a [`LeakReport`]. The closed signal fires exactly once, when the
//! loop's thread finishes for whatever reason.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{Dispatch, debug, error, info, warn};

use crate::error::MonitorError;
use crate::fmt::{format_bytes, format_duration, format_rate_per_hour, format_signed_bytes};
use crate::history::HistoryRing;
use crate::leak::{ClassifierConfig, LeakReason, LeakReport, classify};
use crate::runtime::HeapRuntime;
use crate::snapshot::Snapshot;
use crate::trap::Trap;

/// How often a [`LeakReport`] is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportCadence {
    /// After every `n` advancing collection cycles.
    EveryCycles(u32),
    /// Once at least this much sample time has passed since the last report.
    Every(Duration),
}

/// Monitor settings.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Snapshots retained for classification.
    pub history_size: usize,
    pub report_cadence: ReportCadence,
    pub classifier: ClassifierConfig,
    /// How often a pending wait wakes up to look for a close request.
    pub close_poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_size: 120,
            report_cadence: ReportCadence::EveryCycles(10),
            classifier: ClassifierConfig::default(),
            close_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Lifecycle of a [`Monitor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Created = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl MonitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MonitorState::Created,
            1 => MonitorState::Running,
            2 => MonitorState::Closing,
            _ => MonitorState::Closed,
        }
    }
}

/// Read-only signal that fires once the control loop has exited.
///
/// Backed by a channel whose only sender lives on the loop's thread, so every
/// clone observes the disconnect, and it can be used in `select!`.
#[derive(Clone, Debug)]
pub struct ClosedSignal {
    rx: Receiver<Infallible>,
}

impl ClosedSignal {
    /// Blocks until the monitor has closed.
    pub fn wait(&self) {
        // Nothing is ever sent; `recv` only returns once the sender is gone.
        let _ = self.rx.recv();
    }

    /// Returns `true` if the monitor closed within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Underlying receiver, for use with `crossbeam::select!`.
    pub fn receiver(&self) -> &Receiver<Infallible> {
        &self.rx
    }
}

/// Cloneable handle that asks a monitor to stop.
#[derive(Clone, Debug)]
pub struct CloseHandle {
    tx: Sender<()>,
    state: Arc<AtomicU8>,
}

impl CloseHandle {
    /// Requests a graceful stop. Repeated requests are no-ops.
    pub fn close(&self) {
        let _ = self.state.compare_exchange(
            MonitorState::Running as u8,
            MonitorState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // Capacity 1: a second request finds the slot full, which is fine.
        let _ = self.tx.try_send(());
    }
}

/// Outcome of comparing a cycle number with the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleCheck {
    First,
    /// The cycle advanced; `skipped` cycles completed without a sample.
    Advanced { skipped: u32 },
    Duplicate,
    Regressed { last: u32 },
}

/// Tracks the last observed cycle number.
#[derive(Debug, Default)]
pub struct CycleTracker {
    last: Option<u32>,
}

impl CycleTracker {
    pub fn observe(&mut self, cycle: u32) -> CycleCheck {
        let check = match self.last {
            None => CycleCheck::First,
            Some(last) if cycle == last => CycleCheck::Duplicate,
            Some(last) if cycle < last => CycleCheck::Regressed { last },
            Some(last) => CycleCheck::Advanced {
                skipped: cycle - last - 1,
            },
        };
        self.last = Some(cycle);
        check
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }
}

/// Decides when the next report is due.
#[derive(Debug)]
struct ReportSchedule {
    cadence: ReportCadence,
    cycles_since_report: u32,
    last_report_at: Option<DateTime<Utc>>,
}

impl ReportSchedule {
    fn new(cadence: ReportCadence) -> Self {
        Self {
            cadence,
            cycles_since_report: 0,
            last_report_at: None,
        }
    }

    /// Records a sample and returns whether a report is due now.
    fn due(&mut self, snapshot: &Snapshot, advanced: bool) -> bool {
        match self.cadence {
            ReportCadence::EveryCycles(n) => {
                if advanced {
                    self.cycles_since_report += 1;
                }
                if self.cycles_since_report >= n.max(1) {
                    self.cycles_since_report = 0;
                    return true;
                }
                false
            }
            ReportCadence::Every(period) => {
                let Some(last) = self.last_report_at else {
                    self.last_report_at = Some(snapshot.taken_at);
                    return false;
                };
                let Ok(period) = TimeDelta::from_std(period) else {
                    return false;
                };
                if snapshot.taken_at - last >= period {
                    self.last_report_at = Some(snapshot.taken_at);
                    return true;
                }
                false
            }
        }
    }
}

/// Configures and starts a [`Monitor`].
pub struct MonitorBuilder<R: HeapRuntime + 'static> {
    runtime: Arc<R>,
    config: MonitorConfig,
    dispatch: Option<Dispatch>,
    reports: Option<Sender<LeakReport>>,
}

impl<R: HeapRuntime + 'static> MonitorBuilder<R> {
    pub fn new(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            config: MonitorConfig::default(),
            dispatch: None,
            reports: None,
        }
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Logging sink for the control loop. Without it the global default is used.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Also forwards every report to `reports`. Sends never block the loop;
    /// reports are dropped while the channel is full.
    pub fn with_reports(mut self, reports: Sender<LeakReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Starts the control loop on its own thread and returns immediately.
    pub fn spawn(self) -> Result<Monitor, MonitorError> {
        let state = Arc::new(AtomicU8::new(MonitorState::Created as u8));
        let (closing_tx, closing_rx) = channel::bounded(1);
        let (closed_tx, closed_rx) = channel::bounded::<Infallible>(0);

        let control = ControlLoop {
            runtime: self.runtime,
            config: self.config,
            reports: self.reports,
            closing: closing_rx,
            state: Arc::clone(&state),
            _closed: closed_tx,
        };
        let dispatch = self.dispatch;

        state.store(MonitorState::Running as u8, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("leakwatch-monitor".to_string())
            .spawn(move || match dispatch {
                Some(dispatch) => tracing::dispatcher::with_default(&dispatch, || control.run()),
                None => control.run(),
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                state.store(MonitorState::Closed as u8, Ordering::SeqCst);
                return Err(MonitorError::Spawn(e));
            }
        };

        Ok(Monitor {
            close: CloseHandle {
                tx: closing_tx,
                state: Arc::clone(&state),
            },
            closed: ClosedSignal { rx: closed_rx },
            state,
            handle: Some(handle),
        })
    }
}

/// Handle to a running memory monitor.
///
/// Dropping the handle requests a close but does not wait for it.
pub struct Monitor {
    close: CloseHandle,
    closed: ClosedSignal,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Starts a monitor with default settings.
    pub fn start<R: HeapRuntime + 'static>(runtime: Arc<R>) -> Result<Self, MonitorError> {
        MonitorBuilder::new(runtime).spawn()
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Requests a graceful stop; the loop exits after its current wait.
    pub fn close(&self) {
        self.close.close();
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    pub fn closed(&self) -> ClosedSignal {
        self.closed.clone()
    }

    /// Waits for the control loop's thread to finish.
    pub fn join(mut self) -> Result<(), MonitorError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| MonitorError::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.close.close();
    }
}

/// Marks the monitor closed when the loop's thread finishes, unwinding included.
///
/// Created inside `run`, so it drops before the loop's `_closed` sender and the
/// state reads `Closed` by the time the closed signal fires.
struct ClosedOnExit(Arc<AtomicU8>);

impl Drop for ClosedOnExit {
    fn drop(&mut self) {
        self.0.store(MonitorState::Closed as u8, Ordering::SeqCst);
    }
}

/// State owned by the monitor thread.
struct ControlLoop<R: HeapRuntime> {
    runtime: Arc<R>,
    config: MonitorConfig,
    reports: Option<Sender<LeakReport>>,
    closing: Receiver<()>,
    state: Arc<AtomicU8>,
    /// Dropped when the loop's thread finishes, firing the closed signal.
    _closed: Sender<Infallible>,
}

impl<R: HeapRuntime> ControlLoop<R> {
    fn close_requested(&self) -> bool {
        match self.closing.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Waits for the next collection. `Ok(None)` means a close was requested.
    fn next_snapshot(&self) -> Result<Option<Snapshot>, MonitorError> {
        let pending = Trap::arm(&*self.runtime)?;
        loop {
            if let Some(snapshot) = pending.wait_timeout(self.config.close_poll_interval)? {
                return Ok(Some(snapshot));
            }
            if self.close_requested() {
                return Ok(None);
            }
        }
    }

    fn run(self) {
        let _exit = ClosedOnExit(Arc::clone(&self.state));
        info!(
            history_size = self.config.history_size,
            cadence = ?self.config.report_cadence,
            "memory monitor started"
        );

        let mut history = HistoryRing::new(self.config.history_size);
        let mut cycles = CycleTracker::default();
        let mut schedule = ReportSchedule::new(self.config.report_cadence);

        loop {
            let snapshot = match self.next_snapshot() {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "memory monitor stopping");
                    break;
                }
            };

            let advanced = match cycles.observe(snapshot.gc_cycle) {
                CycleCheck::First => true,
                CycleCheck::Advanced { skipped } => {
                    if skipped > 0 {
                        debug!(
                            skipped,
                            gc_cycle = snapshot.gc_cycle,
                            "collection cycles skipped"
                        );
                    }
                    true
                }
                CycleCheck::Duplicate => {
                    error!(
                        last_cycle = snapshot.gc_cycle,
                        gc_cycle = snapshot.gc_cycle,
                        "unexpected duplicate cycle number"
                    );
                    false
                }
                CycleCheck::Regressed { last } => {
                    error!(
                        last_cycle = last,
                        gc_cycle = snapshot.gc_cycle,
                        "cycle number went backwards"
                    );
                    false
                }
            };

            history.push(snapshot);
            emit_sample(&snapshot);

            if schedule.due(&snapshot, advanced) {
                let report = classify(&history, &self.config.classifier);
                emit_report(&report);
                if let Some(reports) = &self.reports {
                    let _ = reports.try_send(report);
                }
            }

            if self.close_requested() {
                break;
            }
        }

        info!(last_cycle = ?cycles.last(), "memory monitor closed");
    }
}

fn emit_sample(snapshot: &Snapshot) {
    let since_gc = snapshot.time_since_gc();
    debug!(
        gc_cycle = snapshot.gc_cycle,
        alloc_bytes = snapshot.alloc_bytes,
        heap_alloc_bytes = snapshot.heap_alloc_bytes,
        total_alloc_bytes = snapshot.total_alloc_bytes,
        mallocs = snapshot.mallocs,
        heap_objects = snapshot.heap_objects,
        time_since_gc = ?since_gc.to_std().unwrap_or_default(),
        "gc ran ({} live, {} since gc)",
        format_bytes(snapshot.alloc_bytes),
        format_duration(since_gc)
    );
}

fn emit_report(report: &LeakReport) {
    macro_rules! report_event {
        ($level:ident) => {
            $level!(
                start = %report.start,
                end = %report.end,
                collections = report.collections,
                growth = report.growth,
                growth_per_hour = report.growth_per_hour,
                reason = %report.reason,
                "heap {} over {} ({}, {})",
                report.reason,
                format_duration(report.window()),
                format_signed_bytes(report.growth),
                format_rate_per_hour(report.growth_per_hour)
            )
        };
    }

    if report.reason == LeakReason::LeakSuspected {
        report_event!(warn);
    } else {
        report_event!(info);
    }
}
