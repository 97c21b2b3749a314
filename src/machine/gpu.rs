//! GPU inventory via the vendor CLI.
//!
//! Results are cached for [`CACHE_TTL`]. The first failure marks GPUs as
//! unsupported for the rest of the process's life; the host then reports
//! zero GPUs.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// How long a query result stays valid.
pub const CACHE_TTL: Duration = Duration::from_secs(60);

const NVIDIA_SMI: &str = "nvidia-smi";

const QUERY_ARGS: &[&str] = &[
    "--query-gpu=index,memory.total,memory.free,memory.used",
    "--format=csv,noheader,nounits",
];

/// One GPU as reported by the vendor CLI. Memory is KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub total_mem: u64,
    pub free_mem: u64,
    pub used_mem: u64,
}

/// Aggregate GPU figures for the host descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuTotals {
    pub count: u32,
    pub total_mem: u64,
    pub free_mem: u64,
}

#[derive(Debug, Default)]
struct GpuCache {
    fetched_at: Option<Instant>,
    devices: Vec<GpuDevice>,
    unsupported: bool,
}

/// Cached view of the host's GPUs.
#[derive(Debug)]
pub struct GpuProbe {
    command: String,
    cache: Mutex<GpuCache>,
}

impl GpuProbe {
    /// Create a probe; a disabled probe reports no GPUs and never runs the CLI.
    pub fn new(enabled: bool) -> Self {
        Self::with_command(NVIDIA_SMI, enabled)
    }

    pub fn with_command(command: impl Into<String>, enabled: bool) -> Self {
        Self {
            command: command.into(),
            cache: Mutex::new(GpuCache {
                unsupported: !enabled,
                ..Default::default()
            }),
        }
    }

    /// Devices, refreshed when the cache has expired.
    pub fn devices(&self) -> Vec<GpuDevice> {
        self.fetch(false)
    }

    /// Devices, bypassing the cache.
    pub fn refresh(&self) -> Vec<GpuDevice> {
        self.fetch(true)
    }

    pub fn totals(&self) -> GpuTotals {
        let devices = self.devices();
        GpuTotals {
            count: devices.len() as u32,
            total_mem: devices.iter().map(|d| d.total_mem).sum(),
            free_mem: devices.iter().map(|d| d.free_mem).sum(),
        }
    }

    /// Memory in use on the given GPUs right now, in KiB.
    pub fn used_memory(&self, indices: &[u32]) -> u64 {
        if indices.is_empty() {
            return 0;
        }
        self.refresh()
            .iter()
            .filter(|d| indices.contains(&d.index))
            .map(|d| d.used_mem)
            .sum()
    }

    pub fn is_supported(&self) -> bool {
        !self.cache.lock().unsupported
    }

    fn fetch(&self, force: bool) -> Vec<GpuDevice> {
        let mut cache = self.cache.lock();
        if cache.unsupported {
            return Vec::new();
        }
        let fresh = cache
            .fetched_at
            .map(|at| at.elapsed() < CACHE_TTL)
            .unwrap_or(false);
        if fresh && !force {
            return cache.devices.clone();
        }

        match self.query() {
            Ok(devices) => {
                cache.devices = devices;
                cache.fetched_at = Some(Instant::now());
                cache.devices.clone()
            }
            Err(e) => {
                tracing::warn!(error = %e, "GPU query failed, disabling GPU support");
                cache.unsupported = true;
                cache.devices.clear();
                Vec::new()
            }
        }
    }

    fn query(&self) -> Result<Vec<GpuDevice>> {
        let output = std::process::Command::new(&self.command)
            .args(QUERY_ARGS)
            .output()
            .map_err(|e| Error::op(&format!("run {}", self.command), e))?;
        if !output.status.success() {
            return Err(Error::rqd(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_query_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `index, total MiB, free MiB, used MiB` lines, converting to KiB.
pub fn parse_query_output(output: &str) -> Result<Vec<GpuDevice>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return Err(Error::rqd(format!("malformed GPU line: {}", line)));
            }
            let num = |i: usize| {
                fields[i]
                    .parse::<u64>()
                    .map_err(|e| Error::rqd(format!("malformed GPU field '{}': {}", fields[i], e)))
            };
            Ok(GpuDevice {
                index: num(0)? as u32,
                total_mem: num(1)? * 1024,
                free_mem: num(2)? * 1024,
                used_mem: num(3)? * 1024,
            })
        })
        .collect()
}
