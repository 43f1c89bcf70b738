//! Recovery pause after freeing a relation
//!
//! Dropping a large relation does not hand memory back to the OS right away.
//! Before the next window is loaded the ingestion manager waits until the
//! process resident set drops below a target, the timeout elapses, or the run
//! is cancelled.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;

use super::config::RecoveryConfig;
use super::error::PanelError;

/// Source of the current process resident set size
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// Resident memory of this process, via sysinfo
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            // Only our own process is ever refreshed
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(self.pid).map(|process| process.memory())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Resident set dropped to the target
    Reclaimed { resident_bytes: u64 },
    /// Timeout elapsed first; the caller proceeds anyway
    TimedOut { resident_bytes: Option<u64> },
    /// No target configured, a single sample was taken
    Unmonitored { resident_bytes: Option<u64> },
}

pub struct RecoveryPause {
    config: RecoveryConfig,
    probe: Arc<dyn MemoryProbe>,
    cancel: CancellationToken,
}

fn mb(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) => format!("{:.1} MB", b as f64 / (1024.0 * 1024.0)),
        None => "n/a".to_string(),
    }
}

impl RecoveryPause {
    pub fn new(config: RecoveryConfig, probe: Arc<dyn MemoryProbe>, cancel: CancellationToken) -> Self {
        Self { config, probe, cancel }
    }

    /// Block until memory is reclaimed, the timeout elapses, or the run is cancelled
    ///
    /// Runs on a blocking thread; sleeps in poll-interval steps so that
    /// cancellation is observed within one interval.
    pub fn wait(&self) -> Result<RecoveryOutcome, PanelError> {
        let Some(target) = self.config.rss_target_bytes else {
            let resident = self.probe.resident_bytes();
            log::info!("   └─ Process memory after free: {}", mb(resident));
            return Ok(RecoveryOutcome::Unmonitored { resident_bytes: resident });
        };

        let started = Instant::now();
        log::info!(
            "😴 Waiting up to {:?} for resident memory to drop below {}",
            self.config.timeout,
            mb(Some(target))
        );

        loop {
            if self.cancel.is_cancelled() {
                log::warn!("⚠️  Recovery pause cancelled");
                return Err(PanelError::Cancelled);
            }

            let resident = self.probe.resident_bytes();
            if let Some(bytes) = resident {
                if bytes <= target {
                    log::info!("   └─ ✅ Memory reclaimed: {} after {:?}", mb(resident), started.elapsed());
                    return Ok(RecoveryOutcome::Reclaimed { resident_bytes: bytes });
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                log::warn!("   └─ ⚠️  Recovery timed out at {}", mb(resident));
                return Ok(RecoveryOutcome::TimedOut { resident_bytes: resident });
            }

            let remaining = self.config.timeout - elapsed;
            std::thread::sleep(self.config.poll_interval.min(remaining).max(Duration::from_millis(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed series of samples, repeating the last one
    struct ScriptedProbe {
        samples: Mutex<VecDeque<u64>>,
    }

    impl ScriptedProbe {
        fn new(samples: &[u64]) -> Arc<Self> {
            Arc::new(Self { samples: Mutex::new(samples.iter().copied().collect()) })
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            let mut samples = self.samples.lock().unwrap();
            if samples.len() > 1 {
                samples.pop_front()
            } else {
                samples.front().copied()
            }
        }
    }

    fn config(target: Option<u64>, timeout_ms: u64) -> RecoveryConfig {
        RecoveryConfig {
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(1),
            rss_target_bytes: target,
        }
    }

    #[test]
    fn test_waits_until_target_reached() {
        let probe = ScriptedProbe::new(&[900, 700, 400, 300]);
        let pause = RecoveryPause::new(config(Some(500), 5_000), probe, CancellationToken::new());

        let outcome = pause.wait().unwrap();
        assert_eq!(outcome, RecoveryOutcome::Reclaimed { resident_bytes: 400 });
    }

    #[test]
    fn test_times_out_when_memory_stays_high() {
        let probe = ScriptedProbe::new(&[900]);
        let pause = RecoveryPause::new(config(Some(500), 20), probe, CancellationToken::new());

        let started = Instant::now();
        let outcome = pause.wait().unwrap();
        assert_eq!(outcome, RecoveryOutcome::TimedOut { resident_bytes: Some(900) });
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_without_target_samples_once() {
        let probe = ScriptedProbe::new(&[900]);
        let pause = RecoveryPause::new(config(None, 60_000), probe, CancellationToken::new());

        let started = Instant::now();
        let outcome = pause.wait().unwrap();
        assert_eq!(outcome, RecoveryOutcome::Unmonitored { resident_bytes: Some(900) });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancellation_aborts_wait() {
        let probe = ScriptedProbe::new(&[900]);
        let token = CancellationToken::new();
        token.cancel();
        let pause = RecoveryPause::new(config(Some(500), 60_000), probe, token);

        assert!(matches!(pause.wait(), Err(PanelError::Cancelled)));
    }

    #[test]
    fn test_process_probe_reports_memory() {
        let probe = ProcessMemoryProbe::new();
        assert!(probe.resident_bytes().unwrap_or(1) > 0);
    }
}
