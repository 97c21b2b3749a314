//! Building a frame's environment, command file and command line.

use crate::config::LaunchConfig;
use crate::ledger::Reservation;
use rqd_protocol::RunFrame;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Host facts the environment depends on.
#[derive(Debug, Clone)]
pub struct EnvContext<'a> {
    pub hostname: &'a str,
    pub os: &'a str,
    /// More than one thread per physical core.
    pub hyperthreaded: bool,
    /// The agent's own PATH, used when `use_path_env_var` is set.
    pub agent_path: Option<String>,
}

/// The child's complete environment.
///
/// Base variables come first, then the frame's own, then values derived
/// from the reservation, each layer overriding the one before.
pub fn compose_environment(
    config: &LaunchConfig,
    frame: &RunFrame,
    reservation: &Reservation,
    ctx: &EnvContext<'_>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let path = match (&ctx.agent_path, config.use_path_env_var) {
        (Some(path), true) => path.clone(),
        _ => config.default_path.clone(),
    };
    let home = config.homedir_root.join(&frame.user_name);
    env.insert("PATH".into(), path);
    env.insert("TZ".into(), config.timezone.clone());
    env.insert("USER".into(), frame.user_name.clone());
    env.insert("LOGNAME".into(), frame.user_name.clone());
    env.insert("HOME".into(), home.to_string_lossy().into_owned());
    env.insert("MAIL".into(), format!("/usr/mail/{}", frame.user_name));
    env.insert("TERM".into(), "unknown".into());
    env.insert("SP_OS".into(), ctx.os.to_string());
    env.insert("CUE3".into(), "1".into());
    env.insert("CUE_FRAME_ID".into(), frame.frame_id.clone());
    env.insert("CUE_JOB_ID".into(), frame.job_id.clone());
    env.insert("CUE_LAYER_ID".into(), frame.layer_id.clone());
    env.insert("CUE_HOST".into(), ctx.hostname.to_string());
    env.insert("CUE_LOG_PATH".into(), frame.log_dir.clone());

    for (key, value) in &frame.environment {
        env.insert(key.clone(), value.clone());
    }

    let threads = reservation.thread_count();
    if threads > 0 {
        let requested = env
            .get("CUE_THREADS")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        env.insert("CUE_THREADS".into(), requested.max(threads).to_string());
        env.insert(
            "CUE_HT".into(),
            if ctx.hyperthreaded { "True" } else { "False" }.into(),
        );
    }
    if let Some(gpuset) = &reservation.gpuset {
        env.insert("CUE_GPU_CORES".into(), gpuset.clone());
    }
    env
}

/// `<temp>/rqd-cmd-<frame_id>-<epoch>`.
pub fn command_file_path(temp_dir: &Path, frame_id: &str, epoch: u64) -> PathBuf {
    temp_dir.join(format!("rqd-cmd-{}-{}", frame_id, epoch))
}

/// `<temp>/rqd-stat-<frame_id>-<epoch>`.
pub fn stat_file_path(temp_dir: &Path, frame_id: &str, epoch: u64) -> PathBuf {
    temp_dir.join(format!("rqd-stat-{}-{}", frame_id, epoch))
}

/// Write the frame's command to an executable script.
pub fn write_command_file(path: &Path, command: &str) -> io::Result<()> {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", command))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
}

/// Inputs to the command line.
#[derive(Debug, Clone)]
pub struct CommandSpec<'a> {
    pub nice: bool,
    pub stat_file: Option<&'a Path>,
    pub taskset: Option<&'a str>,
    /// Run through `su` as this user.
    pub user: Option<&'a str>,
    pub script: &'a Path,
}

/// `[nice] [time -p -o STAT] [taskset -c LIST] (su USER -c "sh SCRIPT" | sh SCRIPT)`.
///
/// The script is handed to the shell rather than executed directly, so a
/// freshly written file can never fail with ETXTBSY.
pub fn build_command_line(config: &LaunchConfig, spec: &CommandSpec<'_>) -> Vec<String> {
    let mut argv = Vec::new();
    if spec.nice {
        argv.push("nice".to_string());
    }
    if let (Some(time), Some(stat)) = (&config.time_command, spec.stat_file) {
        argv.push(time.to_string_lossy().into_owned());
        argv.push("-p".into());
        argv.push("-o".into());
        argv.push(stat.to_string_lossy().into_owned());
    }
    if let (Some(taskset), Some(list)) = (&config.taskset_command, spec.taskset) {
        argv.push(taskset.to_string_lossy().into_owned());
        argv.push("-c".into());
        argv.push(list.to_string());
    }
    let shell = config.shell.to_string_lossy().into_owned();
    let script = spec.script.to_string_lossy().into_owned();
    match spec.user {
        Some(user) => {
            argv.push(config.su_command.to_string_lossy().into_owned());
            argv.push(user.to_string());
            argv.push("-c".into());
            argv.push(format!("{} {}", shell, script));
        }
        None => {
            argv.push(shell);
            argv.push(script);
        }
    }
    argv
}

/// CPU times reported by `time -p`, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeStat {
    pub real: f64,
    pub user: f64,
    pub sys: f64,
}

/// Parse the `real`/`user`/`sys` lines `time -p` writes.
pub fn parse_time_stat(content: &str) -> Option<TimeStat> {
    let mut stat = TimeStat::default();
    let mut seen = 0;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        match key {
            "real" => stat.real = value,
            "user" => stat.user = value,
            "sys" => stat.sys = value,
            _ => continue,
        }
        seen += 1;
    }
    (seen > 0).then_some(stat)
}
