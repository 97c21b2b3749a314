//! Wire types shared by rqd, its control clients and the dispatcher.
//!
//! Every message is plain serde data encoded as JSON. The agent never
//! interprets a frame's payload; these types only carry identity, resource
//! requests and telemetry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Protocol version reported in boot reports.
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known ports.
pub mod ports {
    /// Port rqd serves its control surface on.
    pub const RQD_CONTROL: u16 = 8444;

    /// Port the dispatcher accepts reports on.
    pub const DISPATCHER: u16 = 8443;
}

/// Number of core units per physical core (cores travel as hundredths).
pub const CORE_UNITS: i32 = 100;

// ============================================================================
// Host
// ============================================================================

/// Administrative lock state of the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    #[default]
    Open,
    Locked,
    NimbyLocked,
}

/// Hardware state of the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardwareState {
    #[default]
    Up,
    Down,
    Rebooting,
    RebootWhenIdle,
    Repair,
}

impl std::fmt::Display for HardwareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardwareState::Up => write!(f, "UP"),
            HardwareState::Down => write!(f, "DOWN"),
            HardwareState::Rebooting => write!(f, "REBOOTING"),
            HardwareState::RebootWhenIdle => write!(f, "REBOOT_WHEN_IDLE"),
            HardwareState::Repair => write!(f, "REPAIR"),
        }
    }
}

/// Host descriptor sent with every report.
///
/// Memory figures are KiB. `load` is the one-minute load average in
/// hundredths, already divided by the SMT multiplier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RenderHost {
    pub name: String,
    pub boot_time: u64,
    pub facility: String,
    pub os: String,
    pub nimby_enabled: bool,
    pub nimby_locked: bool,
    pub lock_state: LockState,
    pub state: HardwareState,
    pub num_procs: u32,
    pub cores_per_proc: u32,
    pub total_mem: u64,
    pub free_mem: u64,
    pub total_swap: u64,
    pub free_swap: u64,
    pub total_mcp: u64,
    pub free_mcp: u64,
    pub load: u32,
    pub num_gpus: u32,
    pub total_gpu_mem: u64,
    pub free_gpu_mem: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Snapshot of the core ledger, in core units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CoreDetail {
    pub total_cores: i32,
    pub idle_cores: i32,
    pub locked_cores: i32,
    pub booked_cores: i32,
    pub total_threads: u32,
    /// Reserved physical cores, keyed by physical cpu id.
    #[serde(default)]
    pub reserved_cores: BTreeMap<u32, BTreeSet<u32>>,
}

// ============================================================================
// Frames
// ============================================================================

/// A frame launch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunFrame {
    pub frame_id: String,
    pub job_id: String,
    pub layer_id: String,
    pub job_name: String,
    pub frame_name: String,
    pub command: String,
    pub uid: i32,
    #[serde(default)]
    pub gid: Option<i32>,
    pub user_name: String,
    pub log_dir: String,
    /// Requested cores in core units.
    pub num_cores: i32,
    #[serde(default)]
    pub num_gpus: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// The agent adds `CPU_LIST` and `GPU_LIST` here after reservation.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_nimby: bool,
    #[serde(default)]
    pub os: String,
    /// Pin the frame to whole physical cores.
    #[serde(default)]
    pub threadable: bool,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// KiB.
    #[serde(default)]
    pub soft_memory_limit: Option<u64>,
    /// KiB.
    #[serde(default)]
    pub hard_memory_limit: Option<u64>,
}

impl RunFrame {
    /// Whether the frame asked for a pinned thread set.
    ///
    /// Accepts both the explicit flag and the `CUE_THREADABLE=1` environment
    /// convention used by older submitters.
    pub fn is_threadable(&self) -> bool {
        self.threadable
            || self
                .environment
                .get("CUE_THREADABLE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
    }

    /// Name of the frame's log file inside `log_dir`.
    pub fn log_file_name(&self) -> String {
        format!("{}.{}.rqlog", self.job_name, self.frame_name)
    }
}

/// Stats for one process in a frame's descendant tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChildProcStat {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    /// KiB.
    pub rss: u64,
    /// KiB.
    pub vsize: u64,
    pub pcpu: f64,
    /// Seconds since boot.
    pub start_time: u64,
}

/// Telemetry projection of a live frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunningFrameInfo {
    pub frame_id: String,
    pub job_id: String,
    pub job_name: String,
    pub frame_name: String,
    pub layer_id: String,
    pub num_cores: i32,
    pub num_gpus: u32,
    pub pid: Option<u32>,
    pub start_time: u64,
    pub rss: u64,
    pub max_rss: u64,
    pub vsize: u64,
    pub max_vsize: u64,
    pub used_swap_memory: u64,
    pub used_gpu_memory: u64,
    pub max_used_gpu_memory: u64,
    pub pcpu: f64,
    /// Last modification of the frame's log file (epoch seconds).
    pub llu_time: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<ChildProcStat>,
}

// ============================================================================
// Reports
// ============================================================================

/// Sent once after the agent starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootReport {
    pub protocol_version: u32,
    pub host: RenderHost,
    pub core_info: CoreDetail,
}

/// Periodic status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostReport {
    pub host: RenderHost,
    pub frames: Vec<RunningFrameInfo>,
    pub core_info: CoreDetail,
}

/// Sent once per frame termination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameCompleteReport {
    pub host: RenderHost,
    pub frame: RunningFrameInfo,
    pub exit_status: i32,
    pub exit_signal: i32,
    /// Seconds.
    pub run_time: u64,
}

// ============================================================================
// Control requests
// ============================================================================

/// Body of a kill request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KillFrameRequest {
    #[serde(default)]
    pub reason: String,
}

/// Body of a lock/unlock request, in core units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoresRequest {
    pub cores: i32,
}

/// Error kinds surfaced to control-plane callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    CoreReservationFailure,
    InvalidUser,
    DuplicateFrameViolation,
    NimbyLocked,
    FrameNotFound,
    BadRequest,
    RqdException,
}

/// JSON body returned with every failed control request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_frame_defaults() {
        let json = r#"{
            "frame_id": "f1", "job_id": "j1", "layer_id": "l1",
            "job_name": "show-shot-job", "frame_name": "0001-render",
            "command": "echo hi", "uid": 1000, "user_name": "artist",
            "log_dir": "/tmp/logs", "num_cores": 100
        }"#;
        let frame: RunFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.gid, None);
        assert_eq!(frame.num_gpus, 0);
        assert!(!frame.ignore_nimby);
        assert!(!frame.is_threadable());
        assert_eq!(frame.log_file_name(), "show-shot-job.0001-render.rqlog");
    }

    #[test]
    fn test_threadable_from_environment() {
        let mut frame = RunFrame::default();
        frame.environment.insert("CUE_THREADABLE".into(), "1".into());
        assert!(frame.is_threadable());

        frame.environment.insert("CUE_THREADABLE".into(), "0".into());
        assert!(!frame.is_threadable());

        frame.threadable = true;
        assert!(frame.is_threadable());
    }

    #[test]
    fn test_lock_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&LockState::NimbyLocked).unwrap(),
            "\"NIMBY_LOCKED\""
        );
        assert_eq!(
            serde_json::to_string(&HardwareState::RebootWhenIdle).unwrap(),
            "\"REBOOT_WHEN_IDLE\""
        );
    }
}
