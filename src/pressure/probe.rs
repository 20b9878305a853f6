//! Memory probes: where resident-memory readings come from.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of resident-memory readings for the coordinating process.
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> Result<u64>;
}

/// Reads `/proc/self/statm` (resident pages times the page size).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsProbe;

impl MemoryProbe for ProcfsProbe {
    #[cfg(target_os = "linux")]
    fn resident_bytes(&self) -> Result<u64> {
        use anyhow::Context;

        let statm = std::fs::read_to_string("/proc/self/statm")
            .context("Failed to read /proc/self/statm")?;
        let pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .context("Malformed /proc/self/statm")?
            .parse()
            .context("Malformed resident page count in /proc/self/statm")?;
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
        Ok(pages.saturating_mul(page_size))
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(&self) -> Result<u64> {
        anyhow::bail!("Resident memory probing is only supported on Linux")
    }
}

/// A probe that reports whatever it was last set to.
#[derive(Debug, Default)]
pub struct StaticProbe(AtomicU64);

impl StaticProbe {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for StaticProbe {
    fn resident_bytes(&self) -> Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for std::sync::Arc<P> {
    fn resident_bytes(&self) -> Result<u64> {
        (**self).resident_bytes()
    }
}
