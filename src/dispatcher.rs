//! Outbound reports to the dispatcher.
//!
//! Reports are sent from plain threads (timers, supervisors, NIMBY), so the
//! HTTP client is the blocking one.

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use rqd_protocol::{BootReport, FrameCompleteReport, HostReport};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Where reports go.
pub trait Dispatcher: Send + Sync {
    fn report_startup(&self, report: &BootReport) -> Result<()>;
    fn report_status(&self, report: &HostReport) -> Result<()>;
    fn report_frame_completion(&self, report: &FrameCompleteReport) -> Result<()>;
}

/// Exponential backoff: 2^n seconds, capped at `max`.
pub fn calculate_backoff(attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.min(16); // Prevent overflow
    Duration::from_secs(2u64.pow(exponent)).min(max)
}

/// JSON-over-HTTP dispatcher client with host failover.
pub struct HttpDispatcher {
    client: reqwest::blocking::Client,
    hosts: Vec<String>,
    port: u16,
    max_retries: u32,
    max_backoff: Duration,
}

impl HttpDispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(Error::Config("dispatcher.hosts is empty".into()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Dispatcher(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            hosts: config.hosts.clone(),
            port: config.port,
            max_retries: config.max_retries.max(1),
            max_backoff: config.max_backoff,
        })
    }

    fn url(&self, host: &str, endpoint: &str) -> String {
        if host.contains(':') {
            format!("http://{}/api/v1/report/{}", host, endpoint)
        } else {
            format!("http://{}:{}/api/v1/report/{}", host, self.port, endpoint)
        }
    }

    /// Try every host in order, backing off between rounds.
    fn post<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let backoff = calculate_backoff(attempt - 1, self.max_backoff);
                tracing::debug!(endpoint, attempt, backoff = ?backoff, "retrying report");
                std::thread::sleep(backoff);
            }
            for host in &self.hosts {
                let url = self.url(host, endpoint);
                let sent = self
                    .client
                    .post(&url)
                    .json(body)
                    .send()
                    .and_then(|r| r.error_for_status());
                match sent {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        tracing::debug!(url = %url, error = %e, "report failed");
                        last_error = format!("{}: {}", url, e);
                    }
                }
            }
        }
        Err(Error::Dispatcher(format!(
            "{} report dropped after {} attempts, last error: {}",
            endpoint, self.max_retries, last_error
        )))
    }
}

impl Dispatcher for HttpDispatcher {
    fn report_startup(&self, report: &BootReport) -> Result<()> {
        self.post("startup", report)
    }

    fn report_status(&self, report: &HostReport) -> Result<()> {
        self.post("status", report)
    }

    fn report_frame_completion(&self, report: &FrameCompleteReport) -> Result<()> {
        self.post("frame-complete", report)
    }
}

/// Everything a [`RecordingDispatcher`] has received.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub startups: Vec<BootReport>,
    pub statuses: Vec<HostReport>,
    pub completions: Vec<FrameCompleteReport>,
}

/// In-memory dispatcher for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    recorded: Mutex<Recorded>,
    cond: Condvar,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every report fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Recorded {
        self.recorded.lock().clone()
    }

    pub fn completions(&self) -> Vec<FrameCompleteReport> {
        self.recorded.lock().completions.clone()
    }

    pub fn statuses(&self) -> Vec<HostReport> {
        self.recorded.lock().statuses.clone()
    }

    /// Block until `done` holds or `timeout` passes; returns whether it held.
    pub fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&Recorded) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock();
        while !done(&recorded) {
            if self.cond.wait_until(&mut recorded, deadline).timed_out() {
                return done(&recorded);
            }
        }
        true
    }

    fn record(&self, f: impl FnOnce(&mut Recorded)) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Dispatcher("recording dispatcher set to fail".into()));
        }
        f(&mut self.recorded.lock());
        self.cond.notify_all();
        Ok(())
    }
}

impl Dispatcher for RecordingDispatcher {
    fn report_startup(&self, report: &BootReport) -> Result<()> {
        self.record(|r| r.startups.push(report.clone()))
    }

    fn report_status(&self, report: &HostReport) -> Result<()> {
        self.record(|r| r.statuses.push(report.clone()))
    }

    fn report_frame_completion(&self, report: &FrameCompleteReport) -> Result<()> {
        self.record(|r| r.completions.push(report.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rqd_protocol::{CoreDetail, RenderHost};

    #[test]
    fn test_calculate_backoff() {
        let cap = Duration::from_secs(60);
        assert_eq!(calculate_backoff(0, cap), Duration::from_secs(1));
        assert_eq!(calculate_backoff(1, cap), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, cap), Duration::from_secs(8));
        assert_eq!(calculate_backoff(6, cap), Duration::from_secs(60));
        assert_eq!(calculate_backoff(100, cap), Duration::from_secs(60));
    }

    #[test]
    fn test_urls() {
        let dispatcher = HttpDispatcher::new(&DispatcherConfig::default()).unwrap();
        assert_eq!(
            dispatcher.url("cuebot1", "status"),
            "http://cuebot1:8443/api/v1/report/status"
        );
        assert_eq!(
            dispatcher.url("cuebot1:9000", "startup"),
            "http://cuebot1:9000/api/v1/report/startup"
        );
    }

    #[test]
    fn test_empty_host_list_rejected() {
        let config = DispatcherConfig {
            hosts: Vec::new(),
            ..Default::default()
        };
        assert!(HttpDispatcher::new(&config).is_err());
    }

    #[test]
    fn test_unreachable_dispatcher_gives_up() {
        let config = DispatcherConfig {
            // Port 9 (discard) on loopback refuses connections.
            hosts: vec!["127.0.0.1:9".into()],
            timeout: Duration::from_millis(200),
            max_retries: 1,
            ..Default::default()
        };
        let dispatcher = HttpDispatcher::new(&config).unwrap();
        let report = HostReport {
            host: RenderHost::default(),
            frames: Vec::new(),
            core_info: CoreDetail::default(),
        };
        let err = dispatcher.report_status(&report).unwrap_err();
        assert!(matches!(err, Error::Dispatcher(_)));
    }

    #[test]
    fn test_recording_dispatcher() {
        let dispatcher = RecordingDispatcher::new();
        let report = HostReport {
            host: RenderHost::default(),
            frames: Vec::new(),
            core_info: CoreDetail::default(),
        };
        dispatcher.report_status(&report).unwrap();
        assert!(dispatcher.wait_until(Duration::from_millis(10), |r| r.statuses.len() == 1));
        assert!(!dispatcher.wait_until(Duration::from_millis(10), |r| !r.completions.is_empty()));

        dispatcher.set_failing(true);
        assert!(dispatcher.report_status(&report).is_err());
        assert_eq!(dispatcher.statuses().len(), 1);
    }
}
