//! System measurement seam.
//!
//! The resource manager and self-monitor never talk to the OS directly; they
//! pull numbers through [`SystemProbe`] so tests can pin memory and load to
//! exact values.

use std::sync::Mutex;
use sysinfo::{Pid, System};

/// Supplies process memory, platform memory limit, and CPU load.
pub trait SystemProbe: Send + Sync {
    /// Bytes of memory currently used by this process.
    fn memory_used(&self) -> u64;

    /// Total memory available to the platform, in bytes.
    fn memory_limit(&self) -> u64;

    /// One-minute load average, where the platform exposes one.
    fn load_average(&self) -> Option<f64>;

    /// Number of logical CPUs.
    fn cpu_count(&self) -> usize;
}

/// [`SystemProbe`] backed by `sysinfo`.
///
/// Refreshes process and memory data on each call; callers poll at a bounded
/// interval (the budget check), so refresh cost stays off hot paths.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
        }
    }
}

impl SystemProbe for SysinfoProbe {
    fn memory_used(&self) -> u64 {
        let mut sys = match self.system.lock() {
            Ok(sys) => sys,
            Err(_) => return 0,
        };
        let pid = Pid::from_u32(std::process::id());
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn memory_limit(&self) -> u64 {
        let mut sys = match self.system.lock() {
            Ok(sys) => sys,
            Err(_) => return 0,
        };
        sys.refresh_memory();
        sys.total_memory()
    }

    fn load_average(&self) -> Option<f64> {
        // sysinfo reports zeros on platforms without getloadavg.
        let load = System::load_average();
        if load.one <= 0.0 && load.five <= 0.0 && load.fifteen <= 0.0 {
            None
        } else {
            Some(load.one)
        }
    }

    fn cpu_count(&self) -> usize {
        let sys = match self.system.lock() {
            Ok(sys) => sys,
            Err(_) => return 0,
        };
        sys.cpus().len()
    }
}

/// A probe pinned to fixed values, for tests.
pub struct FixedProbe {
    pub memory_used: std::sync::atomic::AtomicU64,
    pub memory_limit: u64,
    pub load_average: Option<f64>,
    pub cpu_count: usize,
}

impl FixedProbe {
    pub fn new(memory_used: u64, memory_limit: u64) -> Self {
        Self {
            memory_used: std::sync::atomic::AtomicU64::new(memory_used),
            memory_limit,
            load_average: None,
            cpu_count: 4,
        }
    }

    pub fn with_load(mut self, load: f64, cpu_count: usize) -> Self {
        self.load_average = Some(load);
        self.cpu_count = cpu_count;
        self
    }

    /// Change the reported process memory mid-test.
    pub fn set_memory_used(&self, bytes: u64) {
        self.memory_used
            .store(bytes, std::sync::atomic::Ordering::SeqCst);
    }
}

impl SystemProbe for FixedProbe {
    fn memory_used(&self) -> u64 {
        self.memory_used.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    fn load_average(&self) -> Option<f64> {
        self.load_average
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_probe_reports_pinned_values() {
        let probe = FixedProbe::new(100, 1_000).with_load(2.8, 4);
        assert_eq!(probe.memory_used(), 100);
        assert_eq!(probe.memory_limit(), 1_000);
        assert_eq!(probe.load_average(), Some(2.8));
        assert_eq!(probe.cpu_count(), 4);

        probe.set_memory_used(250);
        assert_eq!(probe.memory_used(), 250);
    }

    #[test]
    fn sysinfo_probe_reports_nonzero_platform_memory() {
        let probe = SysinfoProbe::new();
        assert!(probe.memory_limit() > 0);
        assert!(probe.cpu_count() > 0);
    }
}
