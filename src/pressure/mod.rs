//! Resource pressure monitor.
//!
//! The monitor samples resident memory of the coordinating process,
//! classifies it against a configured ceiling and answers one question for
//! the scheduler: may another worker be spawned right now? It publishes a
//! [`PressureEvent`] on every level transition and purges registered caches
//! when pressure turns critical. It never stops a run by itself.

pub mod probe;

pub use probe::{MemoryProbe, ProcfsProbe, StaticProbe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ratio below which pressure is normal.
pub const HIGH_RATIO: f64 = 0.75;
/// Ratio above which pressure is critical.
pub const CRITICAL_RATIO: f64 = 0.85;
/// Ratio above which a post-cleanup reading is logged as an emergency.
pub const EMERGENCY_RATIO: f64 = 0.90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    #[default]
    Normal,
    High,
    Critical,
}

impl PressureLevel {
    /// Classify a reading against the ceiling.
    pub fn classify(resident_bytes: u64, ceiling_bytes: u64) -> Self {
        if ceiling_bytes == 0 {
            return PressureLevel::Critical;
        }
        let ratio = resident_bytes as f64 / ceiling_bytes as f64;
        if ratio < HIGH_RATIO {
            PressureLevel::Normal
        } else if ratio <= CRITICAL_RATIO {
            PressureLevel::High
        } else {
            PressureLevel::Critical
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressureLevel::Normal => write!(f, "normal"),
            PressureLevel::High => write!(f, "high"),
            PressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// One memory reading. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub resident_memory_bytes: u64,
    pub pressure_level: PressureLevel,
}

/// Published once per level transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureEvent {
    pub previous: PressureLevel,
    pub current: PressureLevel,
    pub sample: MemorySample,
}

/// An in-memory structure that can be dropped under memory pressure.
pub trait Purgeable: Send + Sync {
    fn name(&self) -> &str;
    /// Drop everything; returns how many entries were released.
    fn purge(&self) -> usize;
}

pub struct PressureMonitor {
    ceiling_bytes: u64,
    probe: Box<dyn MemoryProbe>,
    level: Mutex<PressureLevel>,
    last: Mutex<Option<MemorySample>>,
    /// Serialises sampling, cleanup and spawn decisions.
    decision: Mutex<()>,
    events: broadcast::Sender<PressureEvent>,
    purgeables: Mutex<Vec<Weak<dyn Purgeable>>>,
    cleanups: AtomicU64,
}

impl std::fmt::Debug for PressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureMonitor")
            .field("ceiling_bytes", &self.ceiling_bytes)
            .field("cleanups", &self.cleanup_count())
            .finish()
    }
}

impl PressureMonitor {
    pub fn new(ceiling_bytes: u64, probe: Box<dyn MemoryProbe>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            ceiling_bytes,
            probe,
            level: Mutex::new(PressureLevel::Normal),
            last: Mutex::new(None),
            decision: Mutex::new(()),
            events,
            purgeables: Mutex::new(Vec::new()),
            cleanups: AtomicU64::new(0),
        }
    }

    /// Monitor over this process's real resident memory.
    pub fn procfs(ceiling_bytes: u64) -> Self {
        Self::new(ceiling_bytes, Box::new(ProcfsProbe))
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    /// Subscribe to level transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<PressureEvent> {
        self.events.subscribe()
    }

    /// Register a cache to purge on cleanup. Held weakly, so a finished run's
    /// caches drop out on their own.
    pub fn register_purgeable(&self, target: Arc<dyn Purgeable>) {
        let mut purgeables = self.purgeables.lock().unwrap_or_else(|e| e.into_inner());
        purgeables.retain(|p| p.strong_count() > 0);
        purgeables.push(Arc::downgrade(&target));
    }

    /// Take a reading, publish a transition if the level changed, and run
    /// cleanup when the level crosses into critical.
    pub fn sample(&self) -> MemorySample {
        let _decision = self.decision.lock().unwrap_or_else(|e| e.into_inner());
        self.sample_locked()
    }

    fn sample_locked(&self) -> MemorySample {
        let (sample, previous) = self.observe();
        if sample.pressure_level == PressureLevel::Critical && previous != PressureLevel::Critical
        {
            self.cleanup_locked();
        }
        sample
    }

    /// Read the probe and record the level; no cleanup.
    fn observe(&self) -> (MemorySample, PressureLevel) {
        let resident = match self.probe.resident_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Memory probe failed; treating usage as zero");
                0
            }
        };
        let sample = MemorySample {
            timestamp: Utc::now(),
            resident_memory_bytes: resident,
            pressure_level: PressureLevel::classify(resident, self.ceiling_bytes),
        };

        let previous = {
            let mut level = self.level.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *level, sample.pressure_level)
        };
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(sample);

        if previous != sample.pressure_level {
            info!(
                from = %previous,
                to = %sample.pressure_level,
                resident_mb = resident / (1024 * 1024),
                "Memory pressure changed"
            );
            // No subscribers is fine.
            let _ = self.events.send(PressureEvent {
                previous,
                current: sample.pressure_level,
                sample,
            });
        }
        (sample, previous)
    }

    /// Admission predicate: enough headroom below the ceiling and not critical.
    pub fn can_spawn(&self, min_free_bytes: u64) -> bool {
        let _decision = self.decision.lock().unwrap_or_else(|e| e.into_inner());
        let sample = self.sample_locked();
        let free = self.free_bytes(&sample);
        let allowed = free >= min_free_bytes && sample.pressure_level != PressureLevel::Critical;
        if !allowed {
            debug!(
                level = %sample.pressure_level,
                free_bytes = free,
                min_free_bytes,
                "Spawn denied by pressure monitor"
            );
        }
        allowed
    }

    /// Headroom below the ceiling at the given sample.
    pub fn free_bytes(&self, sample: &MemorySample) -> u64 {
        self.ceiling_bytes
            .saturating_sub(sample.resident_memory_bytes)
    }

    /// Most recent reading, if any.
    pub fn last_sample(&self) -> Option<MemorySample> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn level(&self) -> PressureLevel {
        *self.level.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Aggressive cleanup: purge every registered cache, return freed heap to
    /// the OS where supported, then resample.
    pub fn cleanup(&self) -> MemorySample {
        let _decision = self.decision.lock().unwrap_or_else(|e| e.into_inner());
        self.cleanup_locked()
    }

    fn cleanup_locked(&self) -> MemorySample {
        let targets: Vec<Arc<dyn Purgeable>> = {
            let mut purgeables = self.purgeables.lock().unwrap_or_else(|e| e.into_inner());
            purgeables.retain(|p| p.strong_count() > 0);
            purgeables.iter().filter_map(Weak::upgrade).collect()
        };
        let mut released = 0;
        for target in &targets {
            let n = target.purge();
            debug!(cache = target.name(), entries = n, "Purged cache");
            released += n;
        }
        release_free_heap();
        self.cleanups.fetch_add(1, Ordering::SeqCst);

        let (sample, _) = self.observe();
        let ratio = if self.ceiling_bytes == 0 {
            1.0
        } else {
            sample.resident_memory_bytes as f64 / self.ceiling_bytes as f64
        };
        if ratio > EMERGENCY_RATIO {
            warn!(
                resident_mb = sample.resident_memory_bytes / (1024 * 1024),
                ceiling_mb = self.ceiling_bytes / (1024 * 1024),
                "emergency: memory still above 90% of the ceiling after cleanup"
            );
        } else {
            info!(caches = targets.len(), entries = released, "Memory cleanup finished");
        }
        sample
    }

    /// How many cleanup cycles have run.
    pub fn cleanup_count(&self) -> u64 {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Sample on a fixed interval until cancelled.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample();
                    }
                }
            }
        })
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn release_free_heap() {
    // SAFETY: malloc_trim only returns unused arena memory to the OS.
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn release_free_heap() {}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    struct CountingCache(AtomicU64);

    impl Purgeable for CountingCache {
        fn name(&self) -> &str {
            "counting"
        }
        fn purge(&self) -> usize {
            self.0.fetch_add(1, Ordering::SeqCst);
            3
        }
    }

    fn monitor(resident: u64) -> (Arc<StaticProbe>, PressureMonitor) {
        let probe = Arc::new(StaticProbe::new(resident));
        let monitor = PressureMonitor::new(1000 * MB, Box::new(probe.clone()));
        (probe, monitor)
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(PressureLevel::classify(740, 1000), PressureLevel::Normal);
        assert_eq!(PressureLevel::classify(750, 1000), PressureLevel::High);
        assert_eq!(PressureLevel::classify(850, 1000), PressureLevel::High);
        assert_eq!(PressureLevel::classify(851, 1000), PressureLevel::Critical);
        assert_eq!(PressureLevel::classify(1, 0), PressureLevel::Critical);
    }

    #[test]
    fn test_can_spawn_requires_headroom() {
        let (probe, monitor) = monitor(100 * MB);
        assert!(monitor.can_spawn(800 * MB));
        probe.set(300 * MB);
        assert!(!monitor.can_spawn(800 * MB));
        assert!(monitor.can_spawn(500 * MB));
    }

    #[test]
    fn test_can_spawn_denied_when_critical() {
        let (_probe, monitor) = monitor(900 * MB);
        assert!(!monitor.can_spawn(0));
    }

    #[test]
    fn test_transitions_published_once() {
        let (probe, monitor) = monitor(100 * MB);
        let mut rx = monitor.subscribe();

        monitor.sample();
        assert!(rx.try_recv().is_err());

        probe.set(800 * MB);
        monitor.sample();
        monitor.sample();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.previous, PressureLevel::Normal);
        assert_eq!(event.current, PressureLevel::High);
        assert!(rx.try_recv().is_err());

        probe.set(100 * MB);
        monitor.sample();
        assert_eq!(rx.try_recv().unwrap().current, PressureLevel::Normal);
    }

    #[test]
    fn test_crossing_into_critical_runs_cleanup() {
        let (probe, monitor) = monitor(100 * MB);
        let cache = Arc::new(CountingCache(AtomicU64::new(0)));
        monitor.register_purgeable(cache.clone());

        probe.set(900 * MB);
        monitor.sample();
        assert_eq!(monitor.cleanup_count(), 1);
        assert_eq!(cache.0.load(Ordering::SeqCst), 1);

        // Staying critical does not repeat the cleanup.
        monitor.sample();
        assert_eq!(monitor.cleanup_count(), 1);
        assert_eq!(monitor.level(), PressureLevel::Critical);
    }

    #[test]
    fn test_dropped_purgeables_are_skipped() {
        let (_probe, monitor) = monitor(100 * MB);
        {
            let cache = Arc::new(CountingCache(AtomicU64::new(0)));
            monitor.register_purgeable(cache);
        }
        monitor.cleanup();
        assert_eq!(monitor.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn test_sampler_stops_on_cancel() {
        let (_probe, monitor) = monitor(100 * MB);
        let monitor = Arc::new(monitor);
        let cancel = CancellationToken::new();
        let handle = monitor.spawn_sampler(Duration::from_secs(1), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(monitor.last_sample().is_some());
    }
}
