//! Process utilities for frame children.
//!
//! Frames run in their own process group, so signals go to the group and
//! reach every descendant the render spawned.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use crate::config::exit_status;

/// Exit fields reported to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub status: i32,
    pub signal: i32,
}

impl ExitOutcome {
    pub fn failed_launch() -> Self {
        Self {
            status: exit_status::FAILED_LAUNCH,
            signal: 0,
        }
    }
}

/// Send `signal` to the process group led by `pgid`.
///
/// Returns false if the group no longer exists.
pub fn kill_group(pgid: libc::pid_t, signal: i32) -> std::io::Result<bool> {
    if pgid <= 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {}", pgid),
        ));
    }
    // SAFETY: killpg has no memory-safety preconditions.
    if unsafe { libc::killpg(pgid, signal) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Translate a raw return code: negative values mean "killed by signal |rc|".
pub fn translate_return_code(rc: i64) -> ExitOutcome {
    if rc < 0 {
        ExitOutcome {
            status: 1,
            signal: rc.unsigned_abs().min(i32::MAX as u64) as i32,
        }
    } else {
        ExitOutcome {
            status: rc.min(i32::MAX as i64) as i32,
            signal: 0,
        }
    }
}

/// Translate a reaped child's status.
pub fn translate_exit(status: ExitStatus) -> ExitOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => translate_return_code(code as i64),
        (None, Some(signal)) => ExitOutcome { status: 1, signal },
        (None, None) => ExitOutcome { status: 1, signal: 0 },
    }
}

/// Clamp a Windows process exit code into the signed 32-bit range.
pub fn clamp_win32_exit(rc: i64) -> i32 {
    if rc < i32::MIN as i64 {
        exit_status::WIN32_UNDERFLOW
    } else if rc > i32::MAX as i64 {
        exit_status::WIN32_OVERFLOW
    } else {
        rc as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;

    #[test]
    fn test_translate_return_code() {
        assert_eq!(translate_return_code(0), ExitOutcome { status: 0, signal: 0 });
        assert_eq!(translate_return_code(3), ExitOutcome { status: 3, signal: 0 });
        assert_eq!(translate_return_code(-9), ExitOutcome { status: 1, signal: 9 });
        assert_eq!(translate_return_code(-15), ExitOutcome { status: 1, signal: 15 });
    }

    #[test]
    fn test_clamp_win32_exit() {
        assert_eq!(clamp_win32_exit(0), 0);
        assert_eq!(clamp_win32_exit(-1), -1);
        assert_eq!(clamp_win32_exit(i32::MIN as i64 - 1), exit_status::WIN32_UNDERFLOW);
        assert_eq!(clamp_win32_exit(0xC000_0005), exit_status::WIN32_OVERFLOW);
    }

    #[test]
    fn test_translate_real_exits() {
        let status = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .status()
            .unwrap();
        assert_eq!(translate_exit(status), ExitOutcome { status: 7, signal: 0 });

        let status = std::process::Command::new("/bin/sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .unwrap();
        assert_eq!(
            translate_exit(status),
            ExitOutcome {
                status: 1,
                signal: libc::SIGTERM
            }
        );
    }

    #[test]
    fn test_kill_group_reaches_grandchildren() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(kill_group(child.id() as libc::pid_t, libc::SIGKILL).unwrap());
        let status = child.wait().unwrap();
        assert_eq!(translate_exit(status).signal, libc::SIGKILL);
    }

    #[test]
    fn test_kill_group_refuses_init() {
        assert!(kill_group(1, libc::SIGKILL).is_err());
        assert!(kill_group(0, libc::SIGKILL).is_err());
    }
}
