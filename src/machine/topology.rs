//! CPU topology: which logical threads belong to which physical core and socket.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable cross-index of the host's CPU layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuTopology {
    /// `cpu_id -> core_id -> thread ids`.
    pub threads_by_cpu_and_core: BTreeMap<u32, BTreeMap<u32, BTreeSet<u32>>>,
    /// `thread_id -> (cpu_id, core_id)`.
    pub cpu_and_core_by_thread: BTreeMap<u32, (u32, u32)>,
}

impl CpuTopology {
    /// Build the indices from `(cpu_id, core_id, thread_id)` triples.
    pub fn from_triples(triples: impl IntoIterator<Item = (u32, u32, u32)>) -> Self {
        let mut topology = Self::default();
        for (cpu, core, thread) in triples {
            topology
                .threads_by_cpu_and_core
                .entry(cpu)
                .or_default()
                .entry(core)
                .or_default()
                .insert(thread);
            topology.cpu_and_core_by_thread.insert(thread, (cpu, core));
        }
        topology
    }

    /// Parse the kernel's `/proc/cpuinfo` table.
    ///
    /// Entries without `physical id`/`core id` (common on VMs and ARM) are
    /// treated as single-threaded cores on socket 0.
    pub fn parse_cpuinfo(content: &str) -> Result<Self> {
        let mut triples = Vec::new();
        for block in content.split("\n\n") {
            let mut processor = None;
            let mut physical_id = None;
            let mut core_id = None;
            for line in block.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "processor" => processor = value.parse::<u32>().ok(),
                    "physical id" => physical_id = value.parse::<u32>().ok(),
                    "core id" => core_id = value.parse::<u32>().ok(),
                    _ => {}
                }
            }
            if let Some(thread) = processor {
                let cpu = physical_id.unwrap_or(0);
                let core = core_id.unwrap_or(thread);
                triples.push((cpu, core, thread));
            }
        }
        if triples.is_empty() {
            return Err(Error::rqd("cpuinfo lists no processors"));
        }
        Ok(Self::from_triples(triples))
    }

    /// Synthesize a uniform layout for operator overrides.
    ///
    /// Thread ids are numbered socket by socket, core by core.
    pub fn uniform(num_procs: u32, cores_per_proc: u32, threads_per_proc: u32) -> Self {
        let threads_per_core = (threads_per_proc / cores_per_proc.max(1)).max(1);
        let mut triples = Vec::new();
        for cpu in 0..num_procs {
            for core in 0..cores_per_proc {
                for t in 0..threads_per_core {
                    let thread = cpu * cores_per_proc * threads_per_core + core * threads_per_core + t;
                    triples.push((cpu, core, thread));
                }
            }
        }
        Self::from_triples(triples)
    }

    /// Number of physical sockets.
    pub fn num_procs(&self) -> u32 {
        self.threads_by_cpu_and_core.len() as u32
    }

    /// Number of physical cores across all sockets.
    pub fn num_cores(&self) -> u32 {
        self.threads_by_cpu_and_core
            .values()
            .map(|cores| cores.len() as u32)
            .sum()
    }

    /// Number of logical threads across all sockets.
    pub fn num_threads(&self) -> u32 {
        self.cpu_and_core_by_thread.len() as u32
    }

    /// Physical cores per socket.
    pub fn cores_per_proc(&self) -> u32 {
        self.num_cores() / self.num_procs().max(1)
    }

    /// Logical threads per socket.
    pub fn threads_per_proc(&self) -> u32 {
        self.num_threads() / self.num_procs().max(1)
    }

    /// Threads per physical core, averaged over the host.
    pub fn smt_multiplier(&self) -> f64 {
        let cores = self.cores_per_proc();
        if cores == 0 {
            return 1.0;
        }
        self.threads_per_proc() as f64 / cores as f64
    }

    /// Thread ids of one physical core.
    pub fn threads_of(&self, cpu: u32, core: u32) -> Option<&BTreeSet<u32>> {
        self.threads_by_cpu_and_core.get(&cpu)?.get(&core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUINFO_2X2X2: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
physical id\t: 0
core id\t\t: 0

processor\t: 1
physical id\t: 0
core id\t\t: 1

processor\t: 2
physical id\t: 1
core id\t\t: 0

processor\t: 3
physical id\t: 1
core id\t\t: 1

processor\t: 4
physical id\t: 0
core id\t\t: 0

processor\t: 5
physical id\t: 0
core id\t\t: 1

processor\t: 6
physical id\t: 1
core id\t\t: 0

processor\t: 7
physical id\t: 1
core id\t\t: 1
";

    #[test]
    fn test_parse_cpuinfo_smt() {
        let topo = CpuTopology::parse_cpuinfo(CPUINFO_2X2X2).unwrap();
        assert_eq!(topo.num_procs(), 2);
        assert_eq!(topo.cores_per_proc(), 2);
        assert_eq!(topo.threads_per_proc(), 4);
        assert_eq!(topo.smt_multiplier(), 2.0);

        let siblings: Vec<u32> = topo.threads_of(0, 1).unwrap().iter().copied().collect();
        assert_eq!(siblings, vec![1, 5]);
        assert_eq!(topo.cpu_and_core_by_thread[&6], (1, 0));
    }

    #[test]
    fn test_parse_cpuinfo_without_physical_ids() {
        let topo =
            CpuTopology::parse_cpuinfo("processor : 0\nBogoMIPS : 48.00\n\nprocessor : 1\n")
                .unwrap();
        assert_eq!(topo.num_procs(), 1);
        assert_eq!(topo.num_cores(), 2);
        assert_eq!(topo.smt_multiplier(), 1.0);
    }

    #[test]
    fn test_parse_cpuinfo_empty() {
        assert!(CpuTopology::parse_cpuinfo("").is_err());
    }

    #[test]
    fn test_uniform_layout() {
        let topo = CpuTopology::uniform(2, 4, 8);
        assert_eq!(topo.num_threads(), 16);
        assert_eq!(topo.num_cores(), 8);
        assert_eq!(topo.smt_multiplier(), 2.0);
        let t: Vec<u32> = topo.threads_of(1, 0).unwrap().iter().copied().collect();
        assert_eq!(t, vec![8, 9]);
    }
}
