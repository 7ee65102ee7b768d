//! Process memory accounting for the streaming loop.

use log::trace;
use std::fs;

/// Watches resident set size against a configured ceiling.
///
/// Readings come from `/proc/self/status`; on platforms without procfs the
/// monitor is inert and never reports pressure.
#[derive(Debug)]
pub struct MemoryMonitor {
    limit_bytes: u64,
    pressure_threshold: f64,
}

impl MemoryMonitor {
    pub fn new(limit_bytes: u64, pressure_threshold: f64) -> Self {
        MemoryMonitor {
            limit_bytes,
            pressure_threshold,
        }
    }

    /// Current resident set size, if the platform exposes it.
    pub fn rss_bytes() -> Option<u64> {
        read_status_kib("VmRSS:").map(|kib| kib * 1024)
    }

    /// Peak resident set size of this process so far.
    pub fn peak_bytes() -> Option<u64> {
        read_status_kib("VmHWM:").map(|kib| kib * 1024)
    }

    /// RSS above the pressure threshold (fraction of the ceiling)?
    pub fn over_pressure(&self) -> bool {
        match Self::rss_bytes() {
            Some(rss) => {
                let level = rss as f64 / self.limit_bytes as f64;
                trace!("Memory level {:.1}%", level * 100.0);
                level >= self.pressure_threshold
            }
            None => false,
        }
    }

    /// RSS above the ceiling itself?
    pub fn over_limit(&self) -> bool {
        Self::rss_bytes().map_or(false, |rss| rss > self.limit_bytes)
    }
}

fn read_status_kib(field: &str) -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with(field))?;
    line.split_whitespace().nth(1)?.parse().ok()
}
