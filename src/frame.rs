//! Running frame records and the frame cache.
//!
//! A frame's supervisor thread owns its lifecycle fields (pid, kill state);
//! the RSS walker owns its telemetry. Each half sits behind its own lock.

use crate::error::{Error, Result};
use crate::ledger::Reservation;
use crate::process;
use parking_lot::{Mutex, RwLock};
use rqd_protocol::{ChildProcStat, RunFrame, RunningFrameInfo};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Figures written by the RSS walker. Memory is KiB.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub rss: u64,
    pub max_rss: u64,
    pub vsize: u64,
    pub max_vsize: u64,
    pub used_swap_memory: u64,
    pub used_gpu_memory: u64,
    pub max_used_gpu_memory: u64,
    pub pcpu: f64,
    pub llu_time: u64,
    pub children: Vec<ChildProcStat>,
    pub soft_limit_warned: bool,
}

#[derive(Debug, Default)]
struct Lifecycle {
    pid: Option<u32>,
    kill_reason: Option<String>,
    exited: bool,
}

/// A frame this host is running.
#[derive(Debug)]
pub struct RunningFrame {
    pub request: RunFrame,
    pub reservation: Reservation,
    pub log_path: PathBuf,
    /// Epoch seconds.
    pub start_time: u64,
    lifecycle: Mutex<Lifecycle>,
    telemetry: Mutex<Telemetry>,
}

impl RunningFrame {
    /// Build the record, tagging the request with its CPU and GPU lists.
    pub fn new(mut request: RunFrame, reservation: Reservation) -> Self {
        if let Some(taskset) = &reservation.taskset {
            request.attributes.insert("CPU_LIST".into(), taskset.clone());
        }
        if let Some(gpuset) = &reservation.gpuset {
            request.attributes.insert("GPU_LIST".into(), gpuset.clone());
        }
        let log_path = PathBuf::from(&request.log_dir).join(request.log_file_name());
        Self {
            request,
            reservation,
            log_path,
            start_time: crate::util::epoch_secs(),
            lifecycle: Mutex::new(Lifecycle::default()),
            telemetry: Mutex::new(Telemetry::default()),
        }
    }

    pub fn frame_id(&self) -> &str {
        &self.request.frame_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.lifecycle.lock().pid
    }

    pub fn kill_reason(&self) -> Option<String> {
        self.lifecycle.lock().kill_reason.clone()
    }

    pub fn is_kill_requested(&self) -> bool {
        self.lifecycle.lock().kill_reason.is_some()
    }

    /// Record the child's pid, delivering any kill that arrived before it.
    pub fn set_pid(&self, pid: u32, signal: i32) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.pid = Some(pid);
        if let Some(reason) = &lifecycle.kill_reason {
            tracing::info!(frame_id = %self.request.frame_id, pid, reason = %reason, "delivering deferred kill");
            signal_group(&self.request.frame_id, pid, signal);
        }
    }

    /// Mark the child reaped; later kills become no-ops.
    pub fn mark_exited(&self) {
        self.lifecycle.lock().exited = true;
    }

    /// Signal the frame's process group.
    ///
    /// Repeated kills keep the first reason. A kill before the child is
    /// spawned is deferred until its pid is known.
    pub fn kill(&self, reason: &str, signal: i32) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.kill_reason.is_none() {
            lifecycle.kill_reason = Some(reason.to_string());
        }
        if lifecycle.exited {
            tracing::debug!(frame_id = %self.request.frame_id, "kill after exit ignored");
            return;
        }
        match lifecycle.pid {
            Some(pid) => {
                tracing::info!(frame_id = %self.request.frame_id, pid, reason = %reason, "killing frame");
                signal_group(&self.request.frame_id, pid, signal);
            }
            None => {
                tracing::warn!(frame_id = %self.request.frame_id, reason = %reason, "kill before pid is known, deferring");
            }
        }
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.lock().clone()
    }

    /// Mutate telemetry under its lock.
    pub fn update_telemetry<R>(&self, f: impl FnOnce(&mut Telemetry) -> R) -> R {
        f(&mut self.telemetry.lock())
    }

    /// Telemetry projection for reports.
    pub fn info(&self) -> RunningFrameInfo {
        let t = self.telemetry.lock().clone();
        let r = &self.request;
        RunningFrameInfo {
            frame_id: r.frame_id.clone(),
            job_id: r.job_id.clone(),
            job_name: r.job_name.clone(),
            frame_name: r.frame_name.clone(),
            layer_id: r.layer_id.clone(),
            num_cores: r.num_cores,
            num_gpus: r.num_gpus,
            pid: self.pid(),
            start_time: self.start_time,
            rss: t.rss,
            max_rss: t.max_rss,
            vsize: t.vsize,
            max_vsize: t.max_vsize,
            used_swap_memory: t.used_swap_memory,
            used_gpu_memory: t.used_gpu_memory,
            max_used_gpu_memory: t.max_used_gpu_memory,
            pcpu: t.pcpu,
            llu_time: t.llu_time,
            attributes: r.attributes.clone(),
            children: t.children,
        }
    }
}

fn signal_group(frame_id: &str, pid: u32, signal: i32) {
    match process::kill_group(pid as libc::pid_t, signal) {
        Ok(true) => {}
        Ok(false) => tracing::debug!(frame_id = %frame_id, pid, "process group already gone"),
        Err(e) => tracing::warn!(frame_id = %frame_id, pid, error = %e, "failed to signal frame"),
    }
}

/// Frames currently running, keyed by frame id.
#[derive(Debug, Default)]
pub struct FrameCache {
    frames: RwLock<HashMap<String, Arc<RunningFrame>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame; an id that is already present is rejected.
    pub fn insert(&self, frame: Arc<RunningFrame>) -> Result<()> {
        let mut frames = self.frames.write();
        let id = frame.frame_id().to_string();
        if frames.contains_key(&id) {
            return Err(Error::DuplicateFrameViolation(id));
        }
        frames.insert(id, frame);
        Ok(())
    }

    pub fn remove(&self, frame_id: &str) -> Option<Arc<RunningFrame>> {
        self.frames.write().remove(frame_id)
    }

    pub fn get(&self, frame_id: &str) -> Option<Arc<RunningFrame>> {
        self.frames.read().get(frame_id).cloned()
    }

    pub fn contains(&self, frame_id: &str) -> bool {
        self.frames.read().contains_key(frame_id)
    }

    /// Copy of the current values, so callers never hold the cache lock.
    pub fn snapshot(&self) -> Vec<Arc<RunningFrame>> {
        let mut frames: Vec<_> = self.frames.read().values().cloned().collect();
        frames.sort_by(|a, b| a.frame_id().cmp(b.frame_id()));
        frames
    }

    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str) -> Arc<RunningFrame> {
        let request = RunFrame {
            frame_id: id.into(),
            job_name: "job".into(),
            frame_name: format!("{}-render", id),
            log_dir: "/tmp/logs".into(),
            num_cores: 100,
            ..Default::default()
        };
        let reservation = Reservation {
            cores: 100,
            taskset: Some("0,1".into()),
            gpuset: None,
        };
        Arc::new(RunningFrame::new(request, reservation))
    }

    #[test]
    fn test_cache_rejects_duplicates() {
        let cache = FrameCache::new();
        cache.insert(frame("f1")).unwrap();
        let err = cache.insert(frame("f1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateFrameViolation(id) if id == "f1"));
        assert_eq!(cache.len(), 1);

        cache.insert(frame("f2")).unwrap();
        let ids: Vec<_> = cache.snapshot().iter().map(|f| f.frame_id().to_string()).collect();
        assert_eq!(ids, vec!["f1", "f2"]);

        assert!(cache.remove("f1").is_some());
        assert!(cache.remove("f1").is_none());
        assert!(!cache.contains("f1"));
    }

    #[test]
    fn test_new_frame_tags_cpu_list() {
        let f = frame("f1");
        assert_eq!(f.request.attributes["CPU_LIST"], "0,1");
        assert!(!f.request.attributes.contains_key("GPU_LIST"));
        assert_eq!(f.log_path, PathBuf::from("/tmp/logs/job.f1-render.rqlog"));
    }

    #[test]
    fn test_kill_before_pid_is_deferred() {
        let f = frame("f1");
        f.kill("dispatcher asked", libc::SIGKILL);
        f.kill("second reason", libc::SIGKILL);
        assert_eq!(f.kill_reason().as_deref(), Some("dispatcher asked"));

        let mut child = std::process::Command::new("sleep");
        child.arg("30");
        std::os::unix::process::CommandExt::process_group(&mut child, 0);
        let mut child = child.spawn().unwrap();
        f.set_pid(child.id(), libc::SIGKILL);
        let status = child.wait().unwrap();
        assert_eq!(crate::process::translate_exit(status).signal, libc::SIGKILL);

        f.mark_exited();
        // After exit this only logs.
        f.kill("late", libc::SIGKILL);
    }

    #[test]
    fn test_info_projects_telemetry() {
        let f = frame("f1");
        f.update_telemetry(|t| {
            t.rss = 10;
            t.max_rss = 20;
            t.pcpu = 1.5;
        });
        let info = f.info();
        assert_eq!(info.frame_id, "f1");
        assert_eq!(info.rss, 10);
        assert_eq!(info.max_rss, 20);
        assert_eq!(info.pcpu, 1.5);
        assert_eq!(info.pid, None);
        assert_eq!(info.attributes["CPU_LIST"], "0,1");
    }
}
