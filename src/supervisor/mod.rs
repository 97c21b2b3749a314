//! Frame supervisor.
//!
//! One thread per frame: prepare the log and command, spawn the child in its
//! own process group, wait, write the footer, then hand the exit back to the
//! agent for release and reporting.

pub mod launch;
pub mod logfile;

use crate::agent::Agent;
use crate::config::exit_status;
use crate::error::{Error, Result};
use crate::frame::RunningFrame;
use crate::privileges::{self, PrivilegeGuard};
use crate::process::{self, ExitOutcome};
use launch::{CommandSpec, EnvContext, TimeStat};
use logfile::{Footer, FrameLog};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

/// Temporary files removed when dropped.
struct TempFiles(Vec<PathBuf>);

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "failed to remove temp file");
                }
            }
        }
    }
}

/// A child that ran to completion.
struct Completed {
    exit: ExitOutcome,
    time_stat: Option<TimeStat>,
    log: FrameLog,
}

/// Run `frame` to completion and report it. Called on the frame's own thread.
pub fn supervise(agent: &Agent, frame: Arc<RunningFrame>) {
    let started = Instant::now();
    let completed = match execute(agent, &frame) {
        Ok(completed) => Some(completed),
        Err(e) => {
            tracing::error!(frame_id = %frame.frame_id(), error = %e, "frame failed to launch");
            frame.mark_exited();
            std::thread::sleep(agent.config().launch.failed_launch_delay);
            None
        }
    };

    let mut exit = completed
        .as_ref()
        .map(|c| c.exit)
        .unwrap_or_else(ExitOutcome::failed_launch);
    if agent.is_nimby_locked() && !frame.request.ignore_nimby {
        exit.status = exit_status::NIMBY_KILL;
    }

    if let Some(mut completed) = completed {
        let footer = Footer {
            exit_status: exit.status,
            exit_signal: exit.signal,
            kill_message: frame.kill_reason(),
            start_time: frame.start_time,
            end_time: crate::util::epoch_secs(),
            max_rss: frame.telemetry().max_rss,
            utime: completed.time_stat.map(|t| t.user),
            stime: completed.time_stat.map(|t| t.sys),
            hostname: agent.machine().static_info().hostname.clone(),
        };
        if let Err(e) = completed.log.write_footer(&footer) {
            tracing::warn!(frame_id = %frame.frame_id(), error = %e, "failed to write log footer");
        }
    }

    tracing::info!(
        frame_id = %frame.frame_id(),
        exit_status = exit.status,
        exit_signal = exit.signal,
        "frame finished"
    );
    agent.complete_frame(&frame, exit, started.elapsed());
}

fn execute(agent: &Agent, frame: &RunningFrame) -> Result<Completed> {
    let config = agent.config();
    let launch_config = &config.launch;
    let request = &frame.request;
    let info = agent.machine().static_info();

    let impersonate = launch_config.become_job_user && is_root();
    if launch_config.become_job_user && !impersonate {
        tracing::debug!(frame_id = %request.frame_id, "agent is not root, running frame as agent user");
    }
    if impersonate
        && launch_config.create_user_if_not_exists
        && !privileges::user_exists(&request.user_name)
    {
        let home = launch_config.homedir_root.join(&request.user_name);
        privileges::create_user(&request.user_name, request.uid, request.gid, &home)
            .map_err(|e| Error::op(&format!("create user {}", request.user_name), e))?;
    }

    let log_dir = Path::new(&request.log_dir);
    {
        let _guard = PrivilegeGuard::escalate()?;
        std::fs::create_dir_all(log_dir)
            .map_err(|e| Error::op(&format!("create log directory {}", log_dir.display()), e))?;
    }
    let owner = impersonate.then(|| (request.uid as u32, request.gid.unwrap_or(request.uid) as u32));
    let mut log = FrameLog::create(&frame.log_path, launch_config.max_log_rotations, owner)
        .map_err(|e| Error::op(&format!("open log {}", frame.log_path.display()), e))?;

    let agent_path = std::env::var("PATH").ok();
    let env = launch::compose_environment(
        launch_config,
        request,
        &frame.reservation,
        &EnvContext {
            hostname: &info.hostname,
            os: &info.os,
            hyperthreaded: info.smt_multiplier > 1.0,
            agent_path,
        },
    );

    let epoch = crate::util::epoch_secs();
    let temp_dir = &config.paths.temp_dir;
    let script = launch::command_file_path(temp_dir, &request.frame_id, epoch);
    let mut temp_files = TempFiles(vec![script.clone()]);
    launch::write_command_file(&script, &request.command)
        .map_err(|e| Error::op(&format!("write command file {}", script.display()), e))?;

    let use_time = launch_config
        .time_command
        .as_deref()
        .map(Path::exists)
        .unwrap_or(false);
    let stat_file = use_time.then(|| launch::stat_file_path(temp_dir, &request.frame_id, epoch));
    if let Some(stat) = &stat_file {
        temp_files.0.push(stat.clone());
    }
    let use_taskset = launch_config
        .taskset_command
        .as_deref()
        .map(Path::exists)
        .unwrap_or(false);

    let argv = launch::build_command_line(
        launch_config,
        &CommandSpec {
            nice: info.is_desktop && launch_config.nice_on_desktop,
            stat_file: stat_file.as_deref(),
            taskset: frame.reservation.taskset.as_deref().filter(|_| use_taskset),
            user: impersonate.then_some(request.user_name.as_str()),
            script: &script,
        },
    );

    let header = [
        ("command", request.command.clone()),
        ("commandLine", argv.join(" ")),
        ("uid", request.uid.to_string()),
        ("gid", request.gid.map(|g| g.to_string()).unwrap_or_default()),
        ("user", request.user_name.clone()),
        ("logDestination", frame.log_path.display().to_string()),
        ("cwd", working_dir(request, log_dir).display().to_string()),
        ("renderHost", info.hostname.clone()),
        ("jobId", request.job_id.clone()),
        ("frameId", request.frame_id.clone()),
        ("jobName", request.job_name.clone()),
        ("frameName", request.frame_name.clone()),
        ("numCores", request.num_cores.to_string()),
        ("taskset", frame.reservation.taskset.clone().unwrap_or_default()),
        ("gpus", frame.reservation.gpuset.clone().unwrap_or_default()),
    ];
    log.write_header(&header, &env)
        .map_err(|e| Error::op("write log header", e))?;

    let (stdout, stderr) = log.stdio()?;
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .env_clear()
        .envs(&env)
        .current_dir(working_dir(request, log_dir))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);

    let mut child = {
        let _guard = if impersonate {
            Some(PrivilegeGuard::escalate()?)
        } else {
            None
        };
        command
            .spawn()
            .map_err(|e| Error::op(&format!("spawn {}", argv[0]), e))?
    };
    let pid = child.id();
    frame.set_pid(pid, launch_config.kill_signal);
    tracing::info!(frame_id = %request.frame_id, pid, cores = request.num_cores, "frame started");

    let status = child.wait();
    frame.mark_exited();
    let status = status.map_err(|e| Error::op("wait for frame", e))?;
    let exit = process::translate_exit(status);

    let time_stat = stat_file
        .as_deref()
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|c| launch::parse_time_stat(&c));

    drop(temp_files);
    Ok(Completed {
        exit,
        time_stat,
        log,
    })
}

fn working_dir(request: &rqd_protocol::RunFrame, log_dir: &Path) -> PathBuf {
    request
        .working_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| log_dir.to_path_buf())
}

fn is_root() -> bool {
    // SAFETY: id getters have no preconditions.
    unsafe { libc::getuid() == 0 || libc::geteuid() == 0 }
}
