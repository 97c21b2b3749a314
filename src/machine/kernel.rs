//! Parsers for the kernel's text tables (meminfo, loadavg, stat, vmstat).

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Memory figures from `/proc/meminfo`, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemInfo {
    pub total_mem: u64,
    /// Free plus page cache.
    pub free_mem: u64,
    pub total_swap: u64,
    pub free_swap: u64,
}

/// Parse `/proc/meminfo`.
pub fn parse_meminfo(content: &str) -> Result<MemInfo> {
    let fields: HashMap<&str, u64> = content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim(), value))
        })
        .collect();

    let get = |key: &str| {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| Error::rqd(format!("meminfo is missing {}", key)))
    };

    Ok(MemInfo {
        total_mem: get("MemTotal")?,
        free_mem: get("MemFree")? + fields.get("Cached").copied().unwrap_or(0),
        total_swap: fields.get("SwapTotal").copied().unwrap_or(0),
        free_swap: fields.get("SwapFree").copied().unwrap_or(0),
    })
}

/// One-minute load average from `/proc/loadavg`.
pub fn parse_loadavg(content: &str) -> Result<f64> {
    content
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::rqd("malformed loadavg"))
}

/// Boot epoch from the `btime` line of `/proc/stat`.
pub fn parse_boot_time(content: &str) -> Result<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime"))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::rqd("stat has no btime"))
}

/// Cumulative page-out counter from `/proc/vmstat`.
pub fn parse_pgpgout(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == "pgpgout" {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}

/// Read a kernel table, labelling failures with the path.
pub fn read_table(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::op(&format!("read {}", path.display()), e))
}

/// Free and total space of the filesystem holding `path`, in KiB.
pub fn disk_space(path: &Path) -> Result<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::rqd("path contains a NUL byte"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let block = stat.f_frsize as u64;
    let free = stat.f_bavail as u64 * block / 1024;
    let total = stat.f_blocks as u64 * block / 1024;
    Ok((free, total))
}
