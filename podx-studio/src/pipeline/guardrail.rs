//! Admission control: concurrency slots and media length.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::{RunConfig, RunId, SourceUrl};
use crate::{Error, Result};

/// Registry of runs currently holding a concurrency slot.
#[derive(Debug)]
pub struct SlotRegistry {
    max: usize,
    active: Mutex<HashSet<RunId>>,
}

impl SlotRegistry {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            active: Mutex::new(HashSet::new()),
        })
    }

    /// Reserve a slot for `run_id`.
    ///
    /// The check and the insert happen under one lock, so two concurrent
    /// callers can never both take the last slot.
    pub fn try_acquire(self: &Arc<Self>, run_id: RunId) -> Result<SlotGuard> {
        let mut active = self.active.lock();
        if active.len() >= self.max {
            return Err(Error::ConcurrencyLimitExceeded { limit: self.max });
        }
        active.insert(run_id);
        drop(active);

        debug!(run_id = %run_id, "Concurrency slot reserved");
        Ok(SlotGuard {
            registry: Arc::clone(self),
            run_id,
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active.lock().contains(run_id)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    fn release(&self, run_id: &RunId) {
        if self.active.lock().remove(run_id) {
            debug!(run_id = %run_id, "Concurrency slot released");
        }
    }
}

/// A reserved slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    registry: Arc<SlotRegistry>,
    run_id: RunId,
}

impl SlotGuard {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry.release(&self.run_id);
    }
}

/// Pre-flight media duration probe.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Duration of the source media in seconds, `None` when unknown.
    async fn duration_secs(&self, source: &SourceUrl) -> Option<u64>;
}

/// Probe that never knows the duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

#[async_trait]
impl MediaProbe for NoopProbe {
    async fn duration_secs(&self, _source: &SourceUrl) -> Option<u64> {
        None
    }
}

/// Probe backed by `ffprobe`.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_path: String,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn parse_duration(stdout: &str) -> Option<u64> {
        stdout
            .lines()
            .map(str::trim)
            .find_map(|line| line.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.ceil() as u64)
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn duration_secs(&self, source: &SourceUrl) -> Option<u64> {
        let mut cmd = process_utils::supervised_command(&self.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
            source.as_str(),
        ])
        .stdin(Stdio::null());

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Self::parse_duration(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(output)) => {
                debug!(url = %source, status = %output.status, "ffprobe could not read source");
                None
            }
            Ok(Err(e)) => {
                debug!(url = %source, error = %e, "Failed to run ffprobe");
                None
            }
            Err(_) => {
                debug!(url = %source, "ffprobe timed out");
                None
            }
        }
    }
}

/// Admits or rejects runs before any stage is invoked.
#[derive(Clone)]
pub struct Guardrail {
    slots: Arc<SlotRegistry>,
    probe: Arc<dyn MediaProbe>,
    max_audio_secs: u64,
}

impl Guardrail {
    pub fn new(slots: Arc<SlotRegistry>, probe: Arc<dyn MediaProbe>, max_audio_secs: u64) -> Self {
        Self {
            slots,
            probe,
            max_audio_secs,
        }
    }

    pub fn slots(&self) -> &Arc<SlotRegistry> {
        &self.slots
    }

    /// Admit a run: reserve a slot, then check the media length.
    ///
    /// A rejection after the slot was reserved releases it again. An unknown
    /// duration admits the run.
    pub async fn admit(&self, run_id: RunId, config: &RunConfig) -> Result<SlotGuard> {
        let guard = self.slots.try_acquire(run_id)?;

        if let Some(duration_secs) = self.probe.duration_secs(&config.source).await
            && duration_secs > self.max_audio_secs
        {
            info!(
                run_id = %run_id,
                duration_secs,
                max_secs = self.max_audio_secs,
                "Rejecting run, media too long"
            );
            return Err(Error::MediaTooLong {
                duration_secs,
                max_secs: self.max_audio_secs,
            });
        }

        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageOptions;

    struct FixedProbe(Option<u64>);

    #[async_trait]
    impl MediaProbe for FixedProbe {
        async fn duration_secs(&self, _source: &SourceUrl) -> Option<u64> {
            self.0
        }
    }

    fn config() -> RunConfig {
        RunConfig::new(
            SourceUrl::parse("https://cdn.example.com/ep.mp3").unwrap(),
            StageOptions::default(),
        )
    }

    #[test]
    fn test_slot_limit() {
        let slots = SlotRegistry::new(1);
        let first = slots.try_acquire(RunId::new()).unwrap();
        assert!(matches!(
            slots.try_acquire(RunId::new()),
            Err(Error::ConcurrencyLimitExceeded { limit: 1 })
        ));
        assert_eq!(slots.active_count(), 1);

        drop(first);
        assert_eq!(slots.active_count(), 0);
        assert!(slots.try_acquire(RunId::new()).is_ok());
    }

    #[test]
    fn test_concurrent_acquire_admits_exactly_max() {
        let slots = SlotRegistry::new(2);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let slots = slots.clone();
                std::thread::spawn(move || slots.try_acquire(RunId::new()).ok())
            })
            .collect();

        let guards: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 2);
        assert_eq!(slots.active_count(), 2);
    }

    #[tokio::test]
    async fn test_media_too_long_releases_slot() {
        let slots = SlotRegistry::new(1);
        let guardrail = Guardrail::new(slots.clone(), Arc::new(FixedProbe(Some(5 * 3600))), 4 * 3600);

        let err = guardrail.admit(RunId::new(), &config()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MediaTooLong {
                duration_secs: 18000,
                max_secs: 14400
            }
        ));
        assert_eq!(slots.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_duration_admits() {
        let slots = SlotRegistry::new(1);
        let guardrail = Guardrail::new(slots.clone(), Arc::new(NoopProbe), 60);
        let id = RunId::new();

        let guard = guardrail.admit(id, &config()).await.unwrap();
        assert_eq!(guard.run_id(), id);
        assert!(slots.is_active(&id));
    }

    #[test]
    fn test_parse_ffprobe_duration() {
        assert_eq!(FfprobeProbe::parse_duration("3601.25\n"), Some(3602));
        assert_eq!(FfprobeProbe::parse_duration("N/A\n"), None);
        assert_eq!(FfprobeProbe::parse_duration(""), None);
    }
}
