//! Agent configuration.
//!
//! Configuration is a single TOML file loaded once at startup and shared
//! immutably afterwards. Every section and field has a default, so an absent
//! file yields a working agent for a plain render node.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rqd/rqd.toml";

/// Exit statuses the agent reports instead of a child's own.
pub mod exit_status {
    /// The frame never reached exec.
    pub const FAILED_LAUNCH: i32 = 256;

    /// The frame was evicted because NIMBY locked the host.
    pub const NIMBY_KILL: i32 = 286;

    /// A Windows exit code below the signed 32-bit range.
    pub const WIN32_UNDERFLOW: i32 = 303;

    /// A Windows exit code above the signed 32-bit range.
    pub const WIN32_OVERFLOW: i32 = 304;
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RqdConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub overrides: OverrideConfig,

    #[serde(default)]
    pub launch: LaunchConfig,

    #[serde(default)]
    pub nimby: NimbyConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl RqdConfig {
    /// Load configuration and apply environment overrides.
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// read if present, otherwise defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    tracing::debug!("no configuration file, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `CUEBOT_HOSTS` and `CUEBOT_FACILITY`, which supersede the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(hosts) = lookup("CUEBOT_HOSTS") {
            let hosts: Vec<String> = hosts
                .split([',', ' '])
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
            if !hosts.is_empty() {
                self.dispatcher.hosts = hosts;
            }
        }
        if let Some(facility) = lookup("CUEBOT_FACILITY") {
            if !facility.trim().is_empty() {
                self.dispatcher.facility = facility.trim().to_string();
            }
        }
    }

    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.report.min_interval > self.report.max_interval {
            return Err(Error::Config(format!(
                "report.min_interval ({}) exceeds report.max_interval ({})",
                humantime::format_duration(self.report.min_interval),
                humantime::format_duration(self.report.max_interval)
            )));
        }
        if self.report.min_interval.is_zero() {
            return Err(Error::Config("report.min_interval must be positive".into()));
        }
        if let Some(procs) = self.overrides.num_procs {
            if procs == 0 {
                return Err(Error::Config("overrides.num_procs must be positive".into()));
            }
        }
        if let (Some(cores), Some(threads)) = (
            self.overrides.cores_per_proc,
            self.overrides.threads_per_proc,
        ) {
            if cores == 0 || threads < cores {
                return Err(Error::Config(format!(
                    "overrides.threads_per_proc ({}) must be >= cores_per_proc ({}) > 0",
                    threads, cores
                )));
            }
        }
        Ok(())
    }
}

/// Dispatcher connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Dispatcher hosts, tried in order.
    pub hosts: Vec<String>,
    pub port: u16,
    pub facility: String,
    /// Per-call timeout.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Attempts per report before it is dropped.
    pub max_retries: u32,
    /// Cap on the exponential backoff between attempts.
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
            port: rqd_protocol::ports::DISPATCHER,
            facility: "cloud".to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 5,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Report timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    #[serde(with = "duration_str")]
    pub min_interval: Duration,
    #[serde(with = "duration_str")]
    pub max_interval: Duration,
    /// Period of the RSS walker.
    #[serde(with = "duration_str")]
    pub rss_update_interval: Duration,
    /// How soon a report fires after a frame completes.
    #[serde(with = "duration_str")]
    pub vacancy_delay: Duration,
    /// Delay between boot report attempts.
    #[serde(with = "duration_str")]
    pub startup_retry_delay: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            rss_update_interval: Duration::from_secs(10),
            vacancy_delay: Duration::from_secs(2),
            startup_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Kernel and system file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub proc_root: PathBuf,
    pub cpuinfo: PathBuf,
    pub meminfo: PathBuf,
    pub stat: PathBuf,
    pub loadavg: PathBuf,
    pub vmstat: PathBuf,
    pub inittab: PathBuf,
    pub init_target: PathBuf,
    /// Where command and stat files are written, and whose disk is the
    /// scratch space reported to the dispatcher.
    pub temp_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            cpuinfo: PathBuf::from("/proc/cpuinfo"),
            meminfo: PathBuf::from("/proc/meminfo"),
            stat: PathBuf::from("/proc/stat"),
            loadavg: PathBuf::from("/proc/loadavg"),
            vmstat: PathBuf::from("/proc/vmstat"),
            inittab: PathBuf::from("/etc/inittab"),
            init_target: PathBuf::from("/lib/systemd/system/default.target"),
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// Operator overrides that supersede measurement.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OverrideConfig {
    /// Total physical memory in KiB.
    pub total_memory: Option<u64>,
    pub num_procs: Option<u32>,
    pub cores_per_proc: Option<u32>,
    pub threads_per_proc: Option<u32>,
    pub is_desktop: Option<bool>,
    pub nimby: Option<bool>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub tags: Vec<String>,
}

/// Frame launch behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Run frames through `su` as the frame's user.
    pub become_job_user: bool,
    /// Create missing frame users before launch.
    pub create_user_if_not_exists: bool,
    pub allow_gpu: bool,
    /// Pass the agent's own PATH to frames instead of `default_path`.
    pub use_path_env_var: bool,
    /// Signal delivered to a frame's process group on kill.
    pub kill_signal: i32,
    /// `time -p -o` wrapper; unset disables stat collection.
    pub time_command: Option<PathBuf>,
    /// `taskset -c` wrapper; unset disables pinning.
    pub taskset_command: Option<PathBuf>,
    pub su_command: PathBuf,
    pub shell: PathBuf,
    /// Prefix frames with `nice` on desktop hosts.
    pub nice_on_desktop: bool,
    pub homedir_root: PathBuf,
    pub max_log_rotations: u32,
    /// Pause before reporting a failed launch.
    #[serde(with = "duration_str")]
    pub failed_launch_delay: Duration,
    pub default_path: String,
    pub timezone: String,
    pub reboot_command: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            become_job_user: true,
            create_user_if_not_exists: false,
            allow_gpu: false,
            use_path_env_var: false,
            kill_signal: libc::SIGKILL,
            time_command: Some(PathBuf::from("/usr/bin/time")),
            taskset_command: Some(PathBuf::from("/usr/bin/taskset")),
            su_command: PathBuf::from("/bin/su"),
            shell: PathBuf::from("/bin/sh"),
            nice_on_desktop: true,
            homedir_root: PathBuf::from("/net/homedirs"),
            max_log_rotations: 15,
            failed_launch_delay: Duration::from_secs(2),
            default_path: "/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin"
                .to_string(),
            timezone: "PST8PDT".to_string(),
            reboot_command: vec!["/sbin/reboot".to_string(), "-f".to_string()],
        }
    }
}

/// How NIMBY observes human input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputSourceKind {
    /// Poll the input device files directly.
    #[default]
    Select,
    /// Ask the display server for its idle time.
    Library,
    /// Never observe input; activity only arrives programmatically.
    None,
}

/// NIMBY thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbyConfig {
    /// Poll period while the host is locked.
    #[serde(with = "duration_str")]
    pub check_interval_locked: Duration,
    /// Poll period while the host is open.
    #[serde(with = "duration_str")]
    pub check_interval_unlocked: Duration,
    /// Input silence required before unlocking.
    #[serde(with = "duration_str")]
    pub minimum_idle: Duration,
    /// Free memory (KiB) required to run or unlock.
    pub minimum_mem: u64,
    /// Free swap (KiB) required to unlock.
    pub minimum_swap: u64,
    /// Load ceiling, as percent of core capacity, to unlock.
    pub maximum_load: u32,
    pub input_source: InputSourceKind,
    pub input_dir: PathBuf,
    pub idle_command: String,
}

impl Default for NimbyConfig {
    fn default() -> Self {
        Self {
            check_interval_locked: Duration::from_secs(5),
            check_interval_unlocked: Duration::from_secs(5),
            minimum_idle: Duration::from_secs(300),
            minimum_mem: 512 * 1024,
            minimum_swap: 1024 * 1024,
            maximum_load: 75,
            input_source: InputSourceKind::Select,
            input_dir: PathBuf::from("/dev/input"),
            idle_command: "xprintidle".to_string(),
        }
    }
}

/// Control surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", rqd_protocol::ports::RQD_CONTROL),
        }
    }
}

/// Serde adapter for human-readable durations ("15s", "500ms", "5m").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = RqdConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dispatcher.port, 8443);
        assert_eq!(config.launch.kill_signal, libc::SIGKILL);
        assert_eq!(config.report.min_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = RqdConfig::from_toml(
            r#"
            [dispatcher]
            hosts = ["cuebot1", "cuebot2"]
            timeout = "3s"

            [overrides]
            num_procs = 2
            cores_per_proc = 4
            threads_per_proc = 8
            tags = ["desktop", "gpu"]

            [nimby]
            minimum_idle = "10m"
            input_source = "none"
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatcher.hosts, vec!["cuebot1", "cuebot2"]);
        assert_eq!(config.dispatcher.timeout, Duration::from_secs(3));
        assert_eq!(config.dispatcher.facility, "cloud");
        assert_eq!(config.overrides.threads_per_proc, Some(8));
        assert_eq!(config.nimby.minimum_idle, Duration::from_secs(600));
        assert_eq!(config.nimby.input_source, InputSourceKind::None);
        assert_eq!(config.report.max_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CUEBOT_HOSTS", "a.example, b.example"),
            ("CUEBOT_FACILITY", "lax"),
        ]
        .into_iter()
        .collect();

        let mut config = RqdConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.dispatcher.hosts, vec!["a.example", "b.example"]);
        assert_eq!(config.dispatcher.facility, "lax");

        // Empty values leave the file settings alone.
        let mut config = RqdConfig::default();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.dispatcher.hosts, vec!["localhost"]);
        assert_eq!(config.dispatcher.facility, "cloud");
    }

    #[test]
    fn test_validate_rejects_bad_topology() {
        let mut config = RqdConfig::default();
        config.overrides.cores_per_proc = Some(8);
        config.overrides.threads_per_proc = Some(4);
        assert!(config.validate().is_err());

        let mut config = RqdConfig::default();
        config.report.min_interval = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_durations() {
        let config = RqdConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = RqdConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.nimby.minimum_idle, config.nimby.minimum_idle);
        assert_eq!(parsed.launch.failed_launch_delay, config.launch.failed_launch_delay);
    }
}
