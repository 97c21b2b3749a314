//! Per-frame `.rqlog` files.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;

const RULE: &str = "===========================================================";

/// Move an existing log aside to the lowest unused numeric suffix.
///
/// Returns the new path of the old log, or `None` if there was nothing to
/// rotate. Free suffixes are never overwritten; once all `cap` are taken
/// the old log replaces `.cap`. With a cap of zero the old log is removed.
pub fn rotate(path: &Path, cap: u32) -> io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    if cap == 0 {
        std::fs::remove_file(path)?;
        return Ok(None);
    }
    let target = (1..=cap)
        .map(|i| suffixed(path, i))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| suffixed(path, cap));
    std::fs::rename(path, &target)?;
    Ok(Some(target))
}

fn suffixed(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// Exit summary appended after the child's output.
#[derive(Debug, Clone, Default)]
pub struct Footer {
    pub exit_status: i32,
    pub exit_signal: i32,
    pub kill_message: Option<String>,
    pub start_time: u64,
    pub end_time: u64,
    /// KiB.
    pub max_rss: u64,
    pub utime: Option<f64>,
    pub stime: Option<f64>,
    pub hostname: String,
}

/// An open frame log.
pub struct FrameLog {
    writer: LineWriter<File>,
}

impl FrameLog {
    /// Rotate any previous log and open a fresh one.
    ///
    /// `owner` hands the file to the frame's user when the agent can.
    pub fn create(path: &Path, max_rotations: u32, owner: Option<(u32, u32)>) -> io::Result<Self> {
        if let Some(old) = rotate(path, max_rotations)? {
            tracing::debug!(from = %path.display(), to = %old.display(), "rotated frame log");
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o666)
            .open(path)?;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
            tracing::debug!(path = %path.display(), error = %e, "could not make log world readable");
        }
        if let Some((uid, gid)) = owner {
            if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
                tracing::debug!(path = %path.display(), error = %e, "could not chown log");
            }
        }
        Ok(Self {
            writer: LineWriter::new(file),
        })
    }

    /// Handles for the child's stdout and stderr.
    pub fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        let out = self.writer.get_ref().try_clone()?;
        let err = self.writer.get_ref().try_clone()?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }

    pub fn write_header(
        &mut self,
        fields: &[(&str, String)],
        environment: &BTreeMap<String, String>,
    ) -> io::Result<()> {
        writeln!(self.writer, "{}", RULE)?;
        writeln!(self.writer, "RenderQ JobSpec      {}", crate::util::format_epoch(crate::util::epoch_secs()))?;
        writeln!(self.writer)?;
        for (key, value) in fields {
            writeln!(self.writer, "{}: {}", key, value)?;
        }
        writeln!(self.writer)?;
        writeln!(self.writer, "environment:")?;
        for (key, value) in environment {
            writeln!(self.writer, "  {}={}", key, value)?;
        }
        writeln!(self.writer, "{}", RULE)?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    pub fn write_footer(&mut self, footer: &Footer) -> io::Result<()> {
        writeln!(self.writer)?;
        writeln!(self.writer, "{}", RULE)?;
        writeln!(self.writer, "RenderQ Job Complete")?;
        writeln!(self.writer)?;
        writeln!(self.writer, "exitStatus: {}", footer.exit_status)?;
        writeln!(self.writer, "exitSignal: {}", footer.exit_signal)?;
        if let Some(message) = &footer.kill_message {
            writeln!(self.writer, "killMessage: {}", message)?;
        }
        writeln!(self.writer, "startTime: {}", crate::util::format_epoch(footer.start_time))?;
        writeln!(self.writer, "endTime: {}", crate::util::format_epoch(footer.end_time))?;
        writeln!(self.writer, "maxrss: {}", footer.max_rss)?;
        if let Some(utime) = footer.utime {
            writeln!(self.writer, "utime: {:.2}", utime)?;
        }
        if let Some(stime) = footer.stime {
            writeln!(self.writer, "stime: {:.2}", stime)?;
        }
        writeln!(self.writer, "renderhost: {}", footer.hostname)?;
        writeln!(self.writer, "{}", RULE)?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(rotate(&dir.path().join("a.rqlog"), 3).unwrap(), None);
    }

    #[test]
    fn test_rotate_uses_lowest_free_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("job.frame.rqlog");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(suffixed(&base, 1), "one").unwrap();
        std::fs::write(suffixed(&base, 3), "three").unwrap();

        let moved = rotate(&base, 5).unwrap().unwrap();
        assert_eq!(moved, suffixed(&base, 2));
        assert_eq!(std::fs::read_to_string(&moved).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(suffixed(&base, 1)).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(suffixed(&base, 3)).unwrap(), "three");
        assert!(!base.exists());
    }

    #[test]
    fn test_rotate_when_full_replaces_last_slot() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("job.frame.rqlog");
        std::fs::write(&base, "current").unwrap();
        for i in 1..=3 {
            std::fs::write(suffixed(&base, i), format!("{}", i)).unwrap();
        }

        let moved = rotate(&base, 3).unwrap().unwrap();
        assert_eq!(moved, suffixed(&base, 3));
        assert_eq!(std::fs::read_to_string(&moved).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(suffixed(&base, 1)).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(suffixed(&base, 2)).unwrap(), "2");
        assert!(!base.exists());

        // The frame can keep relaunching with every slot taken.
        std::fs::write(&base, "again").unwrap();
        let log = FrameLog::create(&base, 3, None).unwrap();
        drop(log);
        assert_eq!(std::fs::read_to_string(suffixed(&base, 3)).unwrap(), "again");
        assert_eq!(std::fs::read_to_string(&base).unwrap(), "");
    }

    #[test]
    fn test_rotate_without_slots_removes_old_log() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("job.frame.rqlog");
        std::fs::write(&base, "current").unwrap();
        assert_eq!(rotate(&base, 0).unwrap(), None);
        assert!(!base.exists());
    }

    #[test]
    fn test_header_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.frame.rqlog");
        std::fs::write(&path, "previous run").unwrap();

        let mut log = FrameLog::create(&path, 3, None).unwrap();
        let env = BTreeMap::from([("CUE_THREADS".to_string(), "4".to_string())]);
        log.write_header(
            &[("command", "echo hi".into()), ("uid", "1000".into())],
            &env,
        )
        .unwrap();
        log.write_footer(&Footer {
            exit_status: 0,
            kill_message: Some("user request".into()),
            hostname: "render01".into(),
            ..Default::default()
        })
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(RULE));
        assert!(content.contains("command: echo hi\n"));
        assert!(content.contains("uid: 1000\n"));
        assert!(content.contains("  CUE_THREADS=4\n"));
        assert!(content.contains("exitStatus: 0\n"));
        assert!(content.contains("killMessage: user request\n"));
        assert!(content.contains("renderhost: render01\n"));
        assert_eq!(std::fs::read_to_string(suffixed(&path, 1)).unwrap(), "previous run");
    }
}
