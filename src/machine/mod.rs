//! Host probe.
//!
//! Static facts (hostname, boot time, CPU topology) are sampled once when the
//! probe is created. Dynamic facts (memory, swap, load, scratch disk, GPUs)
//! are recomputed on every call to [`Machine::dynamic_info`].

pub mod gpu;
pub mod kernel;
pub mod procfs;
pub mod swap;
pub mod topology;

use crate::config::RqdConfig;
use crate::error::Result;
use rqd_protocol::{RenderHost, CORE_UNITS};
use std::sync::Arc;

pub use gpu::{GpuProbe, GpuTotals};
pub use swap::SwapOutSampler;
pub use topology::CpuTopology;

/// Facts that do not change while the agent runs.
#[derive(Debug, Clone)]
pub struct StaticHostInfo {
    pub hostname: String,
    pub boot_time: u64,
    pub facility: String,
    pub os: String,
    pub topology: CpuTopology,
    pub num_procs: u32,
    pub cores_per_proc: u32,
    pub threads_per_proc: u32,
    /// Threads per physical core.
    pub smt_multiplier: f64,
    pub is_desktop: bool,
    pub tags: Vec<String>,
}

impl StaticHostInfo {
    /// Ledger total in core units: one unit block per logical thread.
    pub fn total_cores(&self) -> i32 {
        self.topology.num_threads() as i32 * CORE_UNITS
    }
}

/// Facts recomputed on each call. Memory is KiB.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicHostInfo {
    pub total_mem: u64,
    pub free_mem: u64,
    pub total_swap: u64,
    pub free_swap: u64,
    pub total_mcp: u64,
    pub free_mcp: u64,
    /// One-minute load in hundredths, divided by the SMT multiplier.
    pub load: u32,
    pub gpus: GpuTotals,
    /// Pages per second.
    pub swapout_rate: f64,
}

/// Samples the host for the rest of the agent.
pub struct Machine {
    config: Arc<RqdConfig>,
    static_info: StaticHostInfo,
    swap: Arc<SwapOutSampler>,
    gpu: GpuProbe,
}

impl Machine {
    /// Probe static host facts.
    pub fn new(config: Arc<RqdConfig>) -> Result<Self> {
        let static_info = probe_static(&config)?;
        tracing::info!(
            hostname = %static_info.hostname,
            procs = static_info.num_procs,
            cores_per_proc = static_info.cores_per_proc,
            threads_per_proc = static_info.threads_per_proc,
            desktop = static_info.is_desktop,
            "probed host"
        );
        let gpu = GpuProbe::new(config.launch.allow_gpu);
        Ok(Self {
            config,
            static_info,
            swap: Arc::new(SwapOutSampler::default()),
            gpu,
        })
    }

    pub fn static_info(&self) -> &StaticHostInfo {
        &self.static_info
    }

    pub fn swap_sampler(&self) -> &Arc<SwapOutSampler> {
        &self.swap
    }

    pub fn gpu(&self) -> &GpuProbe {
        &self.gpu
    }

    /// Sample memory, swap, load, scratch disk and GPUs.
    pub fn dynamic_info(&self) -> Result<DynamicHostInfo> {
        let paths = &self.config.paths;
        let mem = kernel::parse_meminfo(&kernel::read_table(&paths.meminfo)?)?;
        let loadavg = kernel::parse_loadavg(&kernel::read_table(&paths.loadavg)?)?;
        let (free_mcp, total_mcp) = kernel::disk_space(&paths.temp_dir).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "failed to stat scratch disk");
            (0, 0)
        });

        let total_mem = self.config.overrides.total_memory.unwrap_or(mem.total_mem);
        Ok(DynamicHostInfo {
            total_mem,
            free_mem: mem.free_mem.min(total_mem),
            total_swap: mem.total_swap,
            free_swap: mem.free_swap,
            total_mcp,
            free_mcp,
            load: normalize_load(loadavg, self.static_info.smt_multiplier),
            gpus: self.gpu.totals(),
            swapout_rate: self.swap.rate(),
        })
    }

    /// Host descriptor fields the probe owns.
    ///
    /// Lock and hardware state are filled in by the agent.
    pub fn render_host(&self, dynamic: &DynamicHostInfo) -> RenderHost {
        let info = &self.static_info;
        let mut attributes = std::collections::BTreeMap::new();
        if info.smt_multiplier >= 1.0 {
            attributes.insert(
                "hyperthreadingMultiplier".to_string(),
                format!("{}", info.smt_multiplier),
            );
        }
        attributes.insert("swapout".to_string(), format!("{:.2}", dynamic.swapout_rate));
        attributes.insert("SP_OS".to_string(), info.os.clone());

        RenderHost {
            name: info.hostname.clone(),
            boot_time: info.boot_time,
            facility: info.facility.clone(),
            os: info.os.clone(),
            num_procs: info.num_procs,
            cores_per_proc: info.cores_per_proc,
            total_mem: dynamic.total_mem,
            free_mem: dynamic.free_mem,
            total_swap: dynamic.total_swap,
            free_swap: dynamic.free_swap,
            total_mcp: dynamic.total_mcp,
            free_mcp: dynamic.free_mcp,
            load: dynamic.load,
            num_gpus: dynamic.gpus.count,
            total_gpu_mem: dynamic.gpus.total_mem,
            free_gpu_mem: dynamic.gpus.free_mem,
            tags: info.tags.clone(),
            attributes,
            ..Default::default()
        }
    }

    /// Enough free memory to keep running frames on a NIMBY host.
    pub fn is_nimby_safe_to_run_jobs(&self, dynamic: &DynamicHostInfo) -> bool {
        dynamic.free_mem >= self.config.nimby.minimum_mem
    }

    /// Memory, swap and load all leave room to hand the host back to the farm.
    pub fn is_nimby_safe_to_unlock(&self, dynamic: &DynamicHostInfo) -> bool {
        let nimby = &self.config.nimby;
        // Load is already per SMT multiplier, so capacity is physical cores.
        let capacity = self.static_info.topology.num_cores().max(1) as u64;
        let load_percent = dynamic.load as u64 / capacity;
        dynamic.free_mem >= nimby.minimum_mem
            && dynamic.free_swap >= nimby.minimum_swap
            && load_percent < nimby.maximum_load as u64
    }

    /// Whether an interactive user session is open.
    pub fn is_user_logged_in(&self) -> bool {
        !logged_in_users().is_empty()
    }
}

/// Load average in hundredths per SMT multiplier, clamped at zero.
pub fn normalize_load(loadavg: f64, smt_multiplier: f64) -> u32 {
    let multiplier = if smt_multiplier >= 1.0 { smt_multiplier } else { 1.0 };
    (loadavg * 100.0 / multiplier).round().max(0.0) as u32
}

fn probe_static(config: &RqdConfig) -> Result<StaticHostInfo> {
    let overrides = &config.overrides;
    let measured = measure_topology(config);

    let has_override = overrides.num_procs.is_some()
        || overrides.cores_per_proc.is_some()
        || overrides.threads_per_proc.is_some();
    let topology = if has_override {
        let procs = overrides.num_procs.unwrap_or_else(|| measured.num_procs().max(1));
        let cores = overrides
            .cores_per_proc
            .unwrap_or_else(|| measured.cores_per_proc().max(1));
        let threads = overrides
            .threads_per_proc
            .unwrap_or_else(|| measured.threads_per_proc().max(cores));
        CpuTopology::uniform(procs, cores, threads)
    } else {
        measured
    };

    let boot_time = kernel::read_table(&config.paths.stat)
        .and_then(|s| kernel::parse_boot_time(&s))
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to read boot time");
            0
        });

    Ok(StaticHostInfo {
        hostname: overrides.hostname.clone().unwrap_or_else(hostname),
        boot_time,
        facility: config.dispatcher.facility.clone(),
        os: overrides
            .os
            .clone()
            .unwrap_or_else(|| std::env::consts::OS.to_string()),
        num_procs: topology.num_procs(),
        cores_per_proc: topology.cores_per_proc(),
        threads_per_proc: topology.threads_per_proc(),
        smt_multiplier: topology.smt_multiplier(),
        topology,
        is_desktop: overrides.is_desktop.unwrap_or_else(|| detect_desktop(config)),
        tags: overrides.tags.clone(),
    })
}

fn measure_topology(config: &RqdConfig) -> CpuTopology {
    match kernel::read_table(&config.paths.cpuinfo).and_then(|c| CpuTopology::parse_cpuinfo(&c)) {
        Ok(topology) => topology,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse cpuinfo, assuming one thread per core");
            // SAFETY: sysconf has no preconditions.
            let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) }.max(1) as u32;
            CpuTopology::uniform(1, online, online)
        }
    }
}

/// Graphical boot target or runlevel 5 means a workstation.
fn detect_desktop(config: &RqdConfig) -> bool {
    if let Ok(inittab) = std::fs::read_to_string(&config.paths.inittab) {
        if inittab.lines().any(|l| l.trim().starts_with("id:5:initdefault:")) {
            return true;
        }
    }
    std::fs::canonicalize(&config.paths.init_target)
        .map(|target| target.to_string_lossy().ends_with("graphical.target"))
        .unwrap_or(false)
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

static UTMP_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Users with an open login session, from utmp.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn logged_in_users() -> Vec<String> {
    let _guard = UTMP_LOCK.lock();
    let mut users = Vec::new();
    // SAFETY: the utmpx iterator is process-global; UTMP_LOCK serialises it
    // and each entry is copied out before the next call.
    unsafe {
        libc::setutxent();
        loop {
            let entry = libc::getutxent();
            if entry.is_null() {
                break;
            }
            if (*entry).ut_type == libc::USER_PROCESS {
                let name = std::ffi::CStr::from_ptr((*entry).ut_user.as_ptr());
                let name = name.to_string_lossy().into_owned();
                if !name.is_empty() {
                    users.push(name);
                }
            }
        }
        libc::endutxent();
    }
    users
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn logged_in_users() -> Vec<String> {
    let _guard = UTMP_LOCK.lock();
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_load() {
        assert_eq!(normalize_load(4.0, 2.0), 200);
        assert_eq!(normalize_load(1.234, 1.0), 123);
        assert_eq!(normalize_load(2.0, 0.0), 200);
        assert_eq!(normalize_load(-1.0, 1.0), 0);
    }

    fn test_config() -> RqdConfig {
        let mut config = RqdConfig::default();
        config.overrides.num_procs = Some(2);
        config.overrides.cores_per_proc = Some(4);
        config.overrides.threads_per_proc = Some(8);
        config.overrides.hostname = Some("render01".into());
        config.overrides.is_desktop = Some(false);
        config
    }

    #[test]
    fn test_overrides_supersede_measurement() {
        let machine = Machine::new(Arc::new(test_config())).unwrap();
        let info = machine.static_info();
        assert_eq!(info.hostname, "render01");
        assert_eq!(info.num_procs, 2);
        assert_eq!(info.cores_per_proc, 4);
        assert_eq!(info.threads_per_proc, 8);
        assert_eq!(info.smt_multiplier, 2.0);
        assert_eq!(info.total_cores(), 1600);
        assert!(!info.is_desktop);
    }

    #[test]
    fn test_dynamic_info_from_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        let loadavg = dir.path().join("loadavg");
        std::fs::write(
            &meminfo,
            "MemTotal: 1000 kB\nMemFree: 100 kB\nCached: 50 kB\nSwapTotal: 10 kB\nSwapFree: 5 kB\n",
        )
        .unwrap();
        std::fs::write(&loadavg, "8.00 4.00 2.00 1/100 999\n").unwrap();

        let mut config = test_config();
        config.paths.meminfo = meminfo;
        config.paths.loadavg = loadavg;
        config.paths.temp_dir = dir.path().to_path_buf();
        config.overrides.total_memory = Some(800);
        config.nimby.minimum_mem = 100;
        config.nimby.minimum_swap = 5;
        config.nimby.maximum_load = 75;

        let machine = Machine::new(Arc::new(config)).unwrap();
        let dynamic = machine.dynamic_info().unwrap();
        assert_eq!(dynamic.total_mem, 800);
        assert_eq!(dynamic.free_mem, 150);
        assert_eq!(dynamic.free_swap, 5);
        assert_eq!(dynamic.load, 400);
        assert!(dynamic.total_mcp > 0);

        // 400 hundredths over 8 physical cores is 50% of capacity.
        assert!(machine.is_nimby_safe_to_run_jobs(&dynamic));
        assert!(machine.is_nimby_safe_to_unlock(&dynamic));

        let busy = DynamicHostInfo {
            load: 1600,
            ..dynamic.clone()
        };
        assert!(!machine.is_nimby_safe_to_unlock(&busy));

        let host = machine.render_host(&dynamic);
        assert_eq!(host.name, "render01");
        assert_eq!(host.load, 400);
        assert_eq!(host.attributes["hyperthreadingMultiplier"], "2");
    }

    #[test]
    fn test_detect_desktop_from_inittab() {
        let dir = tempfile::tempdir().unwrap();
        let inittab = dir.path().join("inittab");
        std::fs::write(&inittab, "# comment\nid:5:initdefault:\n").unwrap();
        let mut config = RqdConfig::default();
        config.paths.inittab = inittab;
        config.paths.init_target = dir.path().join("missing.target");
        assert!(detect_desktop(&config));

        std::fs::write(&config.paths.inittab, "id:3:initdefault:\n").unwrap();
        assert!(!detect_desktop(&config));
    }
}
