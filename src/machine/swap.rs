//! Swap-out rate sampler.
//!
//! Samples the kernel's cumulative `pgpgout` counter on a fixed period and
//! keeps a short window. The reported rate weights newer intervals higher, so
//! a single spike fades quickly while sustained thrashing stays visible.

use crate::machine::kernel;
use crate::timer::{spawn_periodic, ShutdownSignal};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Period between samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Samples retained.
pub const WINDOW: usize = 10;

/// Rolling window of `pgpgout` samples.
#[derive(Debug)]
pub struct SwapOutSampler {
    samples: Mutex<VecDeque<u64>>,
    interval: Duration,
}

impl SwapOutSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(WINDOW)),
            interval,
        }
    }

    /// Append a sample, evicting the oldest when the window is full.
    pub fn record(&self, pgpgout: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == WINDOW {
            samples.pop_front();
        }
        samples.push_back(pgpgout);
    }

    /// Linearly weighted page-out rate in pages per second.
    pub fn rate(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.len() < 2 {
            return 0.0;
        }
        let mut weighted = 0.0;
        let mut weights = 0.0;
        for (i, pair) in samples.iter().collect::<Vec<_>>().windows(2).enumerate() {
            let delta = pair[1].saturating_sub(*pair[0]) as f64;
            let weight = (i + 1) as f64;
            weighted += delta * weight;
            weights += weight;
        }
        weighted / weights / self.interval.as_secs_f64().max(f64::EPSILON)
    }

    /// Start sampling `vmstat` on a background thread.
    pub fn spawn(
        self: &Arc<Self>,
        vmstat: PathBuf,
        shutdown: Arc<ShutdownSignal>,
    ) -> std::io::Result<JoinHandle<()>> {
        let sampler = Arc::clone(self);
        sampler.sample(&vmstat);
        let interval = self.interval;
        spawn_periodic("rqd-swapout", interval, shutdown, move || {
            sampler.sample(&vmstat);
        })
    }

    fn sample(&self, vmstat: &PathBuf) {
        match kernel::read_table(vmstat).map(|c| kernel::parse_pgpgout(&c)) {
            Ok(Some(value)) => self.record(value),
            Ok(None) => tracing::debug!(path = %vmstat.display(), "vmstat has no pgpgout"),
            Err(e) => tracing::debug!(error = %e, "failed to sample pgpgout"),
        }
    }
}

impl Default for SwapOutSampler {
    fn default() -> Self {
        Self::new(SAMPLE_INTERVAL)
    }
}
