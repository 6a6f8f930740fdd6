use sysinfo::{Pid, System};

/// Tracks the peak resident memory of the current process.
pub struct PeakMemory {
    sys: System,
    pid: Option<Pid>,
    peak_bytes: u64,
}

impl Default for PeakMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeakMemory {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::debug!("process id unavailable; memory reporting disabled");
        }
        Self {
            sys: System::new(),
            pid,
            peak_bytes: 0,
        }
    }

    /// Samples current resident memory and returns the peak so far, in MB.
    pub fn peak_mb(&mut self) -> f64 {
        if let Some(pid) = self.pid {
            if self.sys.refresh_process(pid) {
                if let Some(process) = self.sys.process(pid) {
                    self.peak_bytes = self.peak_bytes.max(process.memory());
                }
            }
        }
        self.peak_bytes as f64 / (1024.0 * 1024.0)
    }
}
