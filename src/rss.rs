//! Per-frame memory and CPU telemetry.
//!
//! Each pass snapshots the process table once, then folds every running
//! frame's descendant tree into its telemetry record.

use crate::frame::RunningFrame;
use crate::machine::procfs::{self, ProcessTable};
use crate::machine::GpuProbe;
use parking_lot::Mutex;
use rqd_protocol::ChildProcStat;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    ticks: u64,
    at: f64,
    pcpu: f64,
}

/// Walks `/proc` on behalf of the frame cache.
#[derive(Debug)]
pub struct RssWalker {
    proc_root: PathBuf,
    boot_time: u64,
    page_kib: u64,
    clock_ticks: u64,
    history: Mutex<HashMap<u32, CpuSample>>,
}

impl RssWalker {
    pub fn new(proc_root: PathBuf, boot_time: u64) -> Self {
        Self {
            proc_root,
            boot_time,
            page_kib: procfs::page_size_kib(),
            clock_ticks: procfs::clock_ticks(),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh telemetry for `frames`.
    ///
    /// Returns frames whose RSS passed their hard memory limit.
    pub fn walk(&self, frames: &[Arc<RunningFrame>], gpu: &GpuProbe) -> Vec<Arc<RunningFrame>> {
        if frames.iter().all(|f| f.pid().is_none()) {
            return Vec::new();
        }
        let table = match ProcessTable::read(&self.proc_root) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read process table");
                return Vec::new();
            }
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.update_from_table(&table, frames, gpu, now)
    }

    /// Fold one process-table snapshot into the frames' telemetry.
    pub fn update_from_table(
        &self,
        table: &ProcessTable,
        frames: &[Arc<RunningFrame>],
        gpu: &GpuProbe,
        now: f64,
    ) -> Vec<Arc<RunningFrame>> {
        let mut history = self.history.lock();
        let mut next_history = HashMap::new();
        let mut over_limit = Vec::new();

        for frame in frames {
            let Some(pid) = frame.pid() else { continue };
            let mut rss = 0u64;
            let mut vsize = 0u64;
            let mut swap = 0u64;
            let mut pcpu = 0.0;
            let mut children = Vec::new();

            for child_pid in table.descendants(pid) {
                let Some(entry) = table.get(child_pid) else { continue };
                let stat = &entry.stat;
                let child_rss = stat.rss * self.page_kib;
                let child_vsize = stat.vsize / 1024;
                rss += child_rss;
                vsize += child_vsize;
                swap += entry.swap;

                let ticks = stat.total_time();
                let started = self.boot_time as f64 + stat.start_ticks as f64 / self.clock_ticks as f64;
                let child_pcpu = match history.get(&child_pid) {
                    Some(prev) if now > prev.at => {
                        let ratio = ticks.saturating_sub(prev.ticks) as f64
                            / self.clock_ticks as f64
                            / (now - prev.at);
                        (prev.pcpu + ratio) / 2.0
                    }
                    Some(prev) => prev.pcpu,
                    None if now > started => ticks as f64 / self.clock_ticks as f64 / (now - started),
                    None => 0.0,
                };
                next_history.insert(
                    child_pid,
                    CpuSample {
                        ticks,
                        at: now,
                        pcpu: child_pcpu,
                    },
                );
                pcpu += child_pcpu;

                children.push(ChildProcStat {
                    pid: child_pid,
                    name: stat.name.clone(),
                    cmdline: entry.cmdline.clone(),
                    rss: child_rss,
                    vsize: child_vsize,
                    pcpu: child_pcpu,
                    start_time: stat.start_ticks / self.clock_ticks,
                });
            }

            let gpu_used = if frame.request.num_gpus > 0 {
                gpu.used_memory(&frame.reservation.gpu_ids())
            } else {
                0
            };
            let llu_time = std::fs::metadata(&frame.log_path)
                .and_then(|m| m.modified())
                .map(crate::util::system_time_secs)
                .ok();

            let (warn_soft, kill_hard) = frame.update_telemetry(|t| {
                t.rss = rss;
                t.max_rss = t.max_rss.max(rss);
                t.vsize = vsize;
                t.max_vsize = t.max_vsize.max(vsize);
                t.used_swap_memory = swap;
                t.pcpu = pcpu;
                t.used_gpu_memory = gpu_used;
                t.max_used_gpu_memory = t.max_used_gpu_memory.max(gpu_used);
                if let Some(llu) = llu_time {
                    t.llu_time = llu;
                }
                t.children = children;

                let soft = frame.request.soft_memory_limit.map(|l| rss > l).unwrap_or(false);
                let warn_soft = soft && !t.soft_limit_warned;
                if warn_soft {
                    t.soft_limit_warned = true;
                }
                let hard = frame.request.hard_memory_limit.map(|l| rss > l).unwrap_or(false);
                (warn_soft, hard)
            });

            if warn_soft {
                tracing::warn!(
                    frame_id = %frame.frame_id(),
                    rss,
                    limit = ?frame.request.soft_memory_limit,
                    "frame exceeded its soft memory limit"
                );
            }
            if kill_hard {
                tracing::warn!(
                    frame_id = %frame.frame_id(),
                    rss,
                    limit = ?frame.request.hard_memory_limit,
                    "frame exceeded its hard memory limit"
                );
                over_limit.push(Arc::clone(frame));
            }
        }

        *history = next_history;
        over_limit
    }
}
