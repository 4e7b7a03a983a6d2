//! jemalloc statistics and arena purging.

use tikv_jemalloc_ctl::{epoch, epoch_mib, stats};

use crate::error::MonitorError;

/// Cached MIBs for the jemalloc statistics the sweeper reads.
pub(crate) struct JemallocStats {
    epoch: epoch_mib,
    active: stats::active_mib,
    resident: stats::resident_mib,
}

impl JemallocStats {
    pub(crate) fn new() -> Result<Self, MonitorError> {
        Ok(Self {
            epoch: epoch::mib()?,
            active: stats::active::mib()?,
            resident: stats::resident::mib()?,
        })
    }

    /// Returns `(active, resident)` bytes after refreshing jemalloc's stats epoch.
    pub(crate) fn read(&self) -> Result<(u64, u64), MonitorError> {
        self.epoch.advance()?;
        let active = self.active.read()? as u64;
        let resident = self.resident.read()? as u64;
        Ok((active, resident))
    }
}

/// Returns dirty pages of all arenas to the OS.
///
/// Returns `false` if jemalloc rejected the request.
pub(crate) fn purge_arenas() -> bool {
    // SAFETY: "arena.<i>.purge" takes no input and produces no output, so all
    // pointers are null. MALLCTL_ARENAS_ALL = 4096 selects every arena.
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.4096.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        )
    };
    rc == 0
}
