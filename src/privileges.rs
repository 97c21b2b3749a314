//! Scoped changes of the effective user.
//!
//! Effective ids are process-wide, so at most one guard exists at a time;
//! the guard holds a global lock until it restores the previous identity.

use parking_lot::{Mutex, MutexGuard};
use std::io;

static PRIVILEGE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Restores the saved effective uid/gid when dropped.
pub struct PrivilegeGuard {
    saved: Option<(libc::uid_t, libc::gid_t)>,
    _lock: MutexGuard<'static, ()>,
}

impl PrivilegeGuard {
    /// Regain root as the effective user when the real user is root.
    ///
    /// A no-op for unprivileged agents.
    pub fn escalate() -> io::Result<Self> {
        let lock = PRIVILEGE_LOCK.lock();
        // SAFETY: id getters have no preconditions.
        let (ruid, euid, egid) = unsafe { (libc::getuid(), libc::geteuid(), libc::getegid()) };
        if ruid != 0 || euid == 0 {
            return Ok(Self {
                saved: None,
                _lock: lock,
            });
        }
        set_effective(0, None)?;
        Ok(Self {
            saved: Some((euid, egid)),
            _lock: lock,
        })
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if let Some((uid, gid)) = self.saved.take() {
            // Root first so the gid can be restored.
            let restored = set_effective(0, None).and_then(|_| set_effective(uid, Some(gid)));
            if let Err(e) = restored {
                tracing::error!(uid, gid, error = %e, "failed to restore effective user");
            }
        }
    }
}

fn set_effective(uid: libc::uid_t, gid: Option<libc::gid_t>) -> io::Result<()> {
    // SAFETY: setegid/seteuid have no memory-safety preconditions.
    unsafe {
        if uid == 0 {
            if libc::seteuid(0) != 0 {
                return Err(io::Error::last_os_error());
            }
            if let Some(gid) = gid {
                if libc::setegid(gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        } else {
            if let Some(gid) = gid {
                if libc::setegid(gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if libc::seteuid(uid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Whether a local account exists for `name`.
pub fn user_exists(name: &str) -> bool {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return false;
    };
    // SAFETY: cname is a valid NUL-terminated string; only nullness is inspected.
    unsafe { !libc::getpwnam(cname.as_ptr()).is_null() }
}

/// Create a local account for a frame user with `useradd`.
pub fn create_user(name: &str, uid: i32, gid: Option<i32>, home: &std::path::Path) -> io::Result<()> {
    let _guard = PrivilegeGuard::escalate()?;
    let mut cmd = std::process::Command::new("useradd");
    cmd.arg("-u").arg(uid.to_string()).arg("-M").arg("-d").arg(home);
    if let Some(gid) = gid {
        cmd.arg("-g").arg(gid.to_string());
    }
    cmd.arg(name);
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "useradd {} failed: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    tracing::info!(user = %name, uid, "created frame user");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalate_restores_identity() {
        // SAFETY: id getters have no preconditions.
        let before = unsafe { (libc::geteuid(), libc::getegid()) };
        {
            let _guard = PrivilegeGuard::escalate().unwrap();
        }
        let after = unsafe { (libc::geteuid(), libc::getegid()) };
        assert_eq!(before, after);
    }

    #[test]
    fn test_root_exists() {
        assert!(user_exists("root"));
        assert!(!user_exists("rqd-test-no-such-user"));
        assert!(!user_exists("bad\0name"));
    }
}
