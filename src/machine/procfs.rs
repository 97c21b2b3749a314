//! Process table snapshots from `/proc`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Fields of `/proc/<pid>/stat` the agent cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcStat {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    /// Clock ticks.
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    /// Clock ticks after boot.
    pub start_ticks: u64,
    /// Bytes.
    pub vsize: u64,
    /// Pages.
    pub rss: u64,
}

impl ProcStat {
    /// CPU time of the process and its reaped children, in ticks.
    pub fn total_time(&self) -> u64 {
        self.utime + self.stime + self.cutime + self.cstime
    }
}

/// One process of a table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcEntry {
    pub stat: ProcStat,
    /// KiB.
    pub swap: u64,
    pub cmdline: String,
}

/// Parse `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are
/// located relative to the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let name = content[open + 1..close].to_string();
    // Fields after the name start at field 3 (state).
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let field = |n: usize| -> Option<u64> { rest.get(n - 3)?.parse().ok() };
    Some(ProcStat {
        pid,
        ppid: field(4)? as u32,
        name,
        utime: field(14)?,
        stime: field(15)?,
        cutime: field(16).unwrap_or(0),
        cstime: field(17).unwrap_or(0),
        start_ticks: field(22)?,
        vsize: field(23)?,
        rss: rest.get(24 - 3)?.parse::<i64>().ok()?.max(0) as u64,
    })
}

/// `VmSwap` from `/proc/<pid>/status`, in KiB.
pub fn parse_status_swap(content: &str) -> u64 {
    content
        .lines()
        .find_map(|line| line.strip_prefix("VmSwap:"))
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Snapshot of every readable process.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    pub procs: HashMap<u32, ProcEntry>,
}

impl ProcessTable {
    /// Walk `proc_root`. Processes that vanish mid-walk are skipped.
    pub fn read(proc_root: &Path) -> std::io::Result<Self> {
        let mut procs = HashMap::new();
        for entry in std::fs::read_dir(proc_root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(proc_entry) = read_process(&entry.path()) {
                procs.insert(pid, proc_entry);
            }
        }
        Ok(Self { procs })
    }

    /// Build a table from entries, mostly for tests.
    pub fn from_entries(entries: impl IntoIterator<Item = ProcEntry>) -> Self {
        Self {
            procs: entries.into_iter().map(|e| (e.stat.pid, e)).collect(),
        }
    }

    /// `root` and its transitive descendants, root first.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        if !self.procs.contains_key(&root) {
            return Vec::new();
        }
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in self.procs.values() {
            if entry.stat.pid != entry.stat.ppid {
                children.entry(entry.stat.ppid).or_default().push(entry.stat.pid);
            }
        }
        let mut seen = HashSet::from([root]);
        let mut order = vec![root];
        let mut i = 0;
        while i < order.len() {
            if let Some(kids) = children.get(&order[i]) {
                for &kid in kids {
                    if seen.insert(kid) {
                        order.push(kid);
                    }
                }
            }
            i += 1;
        }
        order
    }

    pub fn get(&self, pid: u32) -> Option<&ProcEntry> {
        self.procs.get(&pid)
    }
}

fn read_process(dir: &Path) -> Option<ProcEntry> {
    let stat = parse_stat(&std::fs::read_to_string(dir.join("stat")).ok()?)?;
    let swap = std::fs::read_to_string(dir.join("status"))
        .map(|s| parse_status_swap(&s))
        .unwrap_or(0);
    let cmdline = std::fs::read(dir.join("cmdline"))
        .map(|raw| {
            raw.split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    Some(ProcEntry {
        stat,
        swap,
        cmdline,
    })
}

/// Page size in KiB.
pub fn page_size_kib() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64 / 1024
    } else {
        4
    }
}

/// Clock ticks per second.
pub fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (weird) proc) S 4200 4242 4242 0 -1 4194560 500 0 0 0 \
                        150 50 10 5 20 0 3 0 123456 104857600 2560 18446744073709551615 \
                        1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn test_parse_stat() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.ppid, 4200);
        assert_eq!(stat.name, "my (weird) proc");
        assert_eq!(stat.utime, 150);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.cutime, 10);
        assert_eq!(stat.cstime, 5);
        assert_eq!(stat.total_time(), 215);
        assert_eq!(stat.start_ticks, 123456);
        assert_eq!(stat.vsize, 104857600);
        assert_eq!(stat.rss, 2560);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("1 (init) S 0 1").is_none());
        assert!(parse_stat("").is_none());
    }

    #[test]
    fn test_parse_status_swap() {
        let status = "Name:\tbash\nVmRSS:\t  5000 kB\nVmSwap:\t  1234 kB\n";
        assert_eq!(parse_status_swap(status), 1234);
        assert_eq!(parse_status_swap("Name:\tkthreadd\n"), 0);
    }

    fn entry(pid: u32, ppid: u32) -> ProcEntry {
        ProcEntry {
            stat: ProcStat {
                pid,
                ppid,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_descendants() {
        let table = ProcessTable::from_entries([
            entry(1, 0),
            entry(100, 1),
            entry(101, 100),
            entry(102, 100),
            entry(200, 101),
            entry(300, 1),
        ]);
        let mut tree = table.descendants(100);
        assert_eq!(tree[0], 100);
        tree.sort();
        assert_eq!(tree, vec![100, 101, 102, 200]);
        assert!(table.descendants(999).is_empty());
        assert_eq!(table.descendants(300), vec![300]);
    }

    #[test]
    fn test_read_own_process() {
        let table = ProcessTable::read(Path::new("/proc")).unwrap();
        let me = std::process::id();
        let entry = table.get(me).expect("own process in table");
        assert!(entry.stat.rss > 0);
        assert!(table.descendants(me).contains(&me));
    }
}
