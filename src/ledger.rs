//! Core ledger.
//!
//! Authoritative tally of the host's cores and GPUs. Cores are counted in
//! core units (100 per logical thread). Every mutation happens under one
//! lock and never performs I/O while holding it.
//!
//! Locking a core that is currently booked cannot take effect until the frame
//! holding it releases. Such locks are recorded as pending and settle on
//! release, so `idle + locked + booked <= total` holds at every point.

use crate::machine::CpuTopology;
use parking_lot::Mutex;
use rqd_protocol::{CoreDetail, CORE_UNITS};
use std::collections::{BTreeMap, BTreeSet};

/// Reasons a reservation can be refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("requested {requested} core units but only {idle} are idle")]
    InsufficientCores { requested: i32, idle: i32 },

    #[error("requested {requested} threads but only {available} are unreserved")]
    InsufficientThreads { requested: u32, available: u32 },

    #[error("requested {requested} GPUs but only {free} are free")]
    InsufficientGpus { requested: u32, free: u32 },

    #[error("invalid core request: {0}")]
    InvalidRequest(i32),
}

/// What a successful reservation handed out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reservation {
    /// Core units booked.
    pub cores: i32,
    /// Comma-separated logical thread ids, when pinned.
    pub taskset: Option<String>,
    /// Comma-separated GPU ordinals, when GPUs were requested.
    pub gpuset: Option<String>,
}

impl Reservation {
    /// Number of threads in the taskset.
    pub fn thread_count(&self) -> usize {
        self.taskset
            .as_deref()
            .map(|t| t.split(',').filter(|s| !s.is_empty()).count())
            .unwrap_or(0)
    }

    /// GPU ordinals in the gpuset.
    pub fn gpu_ids(&self) -> Vec<u32> {
        parse_id_list(self.gpuset.as_deref())
    }
}

#[derive(Debug, Clone)]
struct LedgerState {
    total_cores: i32,
    idle_cores: i32,
    locked_cores: i32,
    booked_cores: i32,
    /// Locks waiting on booked cores to be released.
    pending_lock: i32,
    total_threads: u32,
    reserved: BTreeMap<u32, BTreeSet<u32>>,
    free_gpus: BTreeSet<u32>,
    nimby_held: bool,
}

/// The host's core and GPU bookkeeping.
#[derive(Debug)]
pub struct CoreLedger {
    topology: CpuTopology,
    state: Mutex<LedgerState>,
}

impl CoreLedger {
    /// Create a ledger with every core idle and every GPU free.
    pub fn new(topology: CpuTopology, num_gpus: u32) -> Self {
        let total_threads = topology.num_threads();
        let total_cores = total_threads as i32 * CORE_UNITS;
        Self {
            topology,
            state: Mutex::new(LedgerState {
                total_cores,
                idle_cores: total_cores,
                locked_cores: 0,
                booked_cores: 0,
                pending_lock: 0,
                total_threads,
                reserved: BTreeMap::new(),
                free_gpus: (0..num_gpus).collect(),
                nimby_held: false,
            }),
        }
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    /// Book `cores` units, optionally pinning whole physical cores and GPUs.
    ///
    /// A thread set is only allocated when `want_threadset` is set and the
    /// request is a whole number of threads. Nothing is mutated on failure.
    pub fn reserve(
        &self,
        cores: i32,
        want_threadset: bool,
        gpus: u32,
    ) -> Result<Reservation, LedgerError> {
        if cores <= 0 {
            return Err(LedgerError::InvalidRequest(cores));
        }
        let mut state = self.state.lock();
        if state.idle_cores < cores {
            return Err(LedgerError::InsufficientCores {
                requested: cores,
                idle: state.idle_cores,
            });
        }
        if (state.free_gpus.len() as u32) < gpus {
            return Err(LedgerError::InsufficientGpus {
                requested: gpus,
                free: state.free_gpus.len() as u32,
            });
        }

        let taskset = if want_threadset && cores % CORE_UNITS == 0 {
            let threads = allocate_threads(
                &self.topology,
                &mut state.reserved,
                (cores / CORE_UNITS) as u32,
            )?;
            Some(join_ids(&threads))
        } else {
            None
        };

        let gpuset = if gpus > 0 {
            let chosen: Vec<u32> = state.free_gpus.iter().take(gpus as usize).copied().collect();
            for id in &chosen {
                state.free_gpus.remove(id);
            }
            Some(join_ids(&chosen))
        } else {
            None
        };

        state.idle_cores -= cores;
        state.booked_cores += cores;

        Ok(Reservation {
            cores,
            taskset,
            gpuset,
        })
    }

    /// Return a reservation's cores, threads and GPUs.
    ///
    /// Idle is credited by at most what the totals leave room for, so a
    /// repeated release cannot inflate the idle count.
    pub fn release(&self, cores: i32, taskset: Option<&str>, gpuset: Option<&str>) {
        let mut state = self.state.lock();
        let cores = cores.max(0);
        if cores > state.booked_cores {
            tracing::warn!(
                cores,
                booked = state.booked_cores,
                "release exceeds booked cores"
            );
        }
        state.booked_cores = (state.booked_cores - cores).max(0);

        let settle = cores.min(state.pending_lock);
        state.pending_lock -= settle;
        state.locked_cores += settle;

        let room = state.total_cores - state.locked_cores - state.idle_cores - state.booked_cores;
        state.idle_cores += (cores - settle).min(room).max(0);

        for thread in parse_id_list(taskset) {
            if let Some(&(cpu, core)) = self.topology.cpu_and_core_by_thread.get(&thread) {
                if let Some(cores) = state.reserved.get_mut(&cpu) {
                    cores.remove(&core);
                    if cores.is_empty() {
                        state.reserved.remove(&cpu);
                    }
                }
            }
        }
        for gpu in parse_id_list(gpuset) {
            state.free_gpus.insert(gpu);
        }
    }

    /// Release everything a [`Reservation`] holds.
    pub fn release_reservation(&self, reservation: &Reservation) {
        self.release(
            reservation.cores,
            reservation.taskset.as_deref(),
            reservation.gpuset.as_deref(),
        );
    }

    /// Withhold up to `cores` units from booking.
    pub fn lock(&self, cores: i32) {
        let mut state = self.state.lock();
        Self::lock_locked(&mut state, cores);
    }

    /// Withhold every core, including those booked right now.
    pub fn lock_all(&self) {
        let mut state = self.state.lock();
        let total = state.total_cores;
        Self::lock_locked(&mut state, total);
    }

    /// Return up to `cores` locked units to idle.
    ///
    /// Ignored while NIMBY holds the host.
    pub fn unlock(&self, cores: i32) {
        let mut state = self.state.lock();
        if state.nimby_held {
            tracing::debug!(cores, "ignoring unlock while nimby holds the host");
            return;
        }
        Self::unlock_locked(&mut state, cores);
    }

    /// Return every locked unit to idle.
    ///
    /// Ignored while NIMBY holds the host.
    pub fn unlock_all(&self) {
        let mut state = self.state.lock();
        if state.nimby_held {
            tracing::debug!("ignoring unlock_all while nimby holds the host");
            return;
        }
        let total = state.total_cores;
        Self::unlock_locked(&mut state, total);
    }

    /// Lock everything on behalf of NIMBY.
    pub fn nimby_lock(&self) {
        let mut state = self.state.lock();
        state.nimby_held = true;
        let total = state.total_cores;
        Self::lock_locked(&mut state, total);
    }

    /// Drop NIMBY's hold and unlock everything.
    pub fn nimby_unlock(&self) {
        let mut state = self.state.lock();
        state.nimby_held = false;
        let total = state.total_cores;
        Self::unlock_locked(&mut state, total);
    }

    pub fn is_nimby_held(&self) -> bool {
        self.state.lock().nimby_held
    }

    /// Whether every core is locked or waiting to be.
    pub fn is_fully_locked(&self) -> bool {
        let state = self.state.lock();
        state.total_cores > 0 && state.locked_cores + state.pending_lock >= state.total_cores
    }

    pub fn idle_cores(&self) -> i32 {
        self.state.lock().idle_cores
    }

    /// Snapshot for reports.
    pub fn snapshot(&self) -> CoreDetail {
        let state = self.state.lock();
        CoreDetail {
            total_cores: state.total_cores,
            idle_cores: state.idle_cores,
            locked_cores: state.locked_cores,
            booked_cores: state.booked_cores,
            total_threads: state.total_threads,
            reserved_cores: state.reserved.clone(),
        }
    }

    fn lock_locked(state: &mut LedgerState, cores: i32) {
        let cores = cores.max(0);
        let from_idle = cores.min(state.idle_cores);
        state.idle_cores -= from_idle;
        state.locked_cores += from_idle;

        let owed = (cores - from_idle).min(state.booked_cores - state.pending_lock);
        state.pending_lock += owed.max(0);
    }

    fn unlock_locked(state: &mut LedgerState, cores: i32) {
        let cores = cores.max(0);
        let cancelled = cores.min(state.pending_lock);
        state.pending_lock -= cancelled;

        let freed = (cores - cancelled).min(state.locked_cores);
        state.locked_cores -= freed;
        state.idle_cores += freed;
    }
}

/// Allocate `requested` logical threads as whole physical cores.
///
/// Sockets are visited most-idle first so different frames spread across
/// sockets while one frame stays on as few as possible. Within a socket a
/// core is chosen whose thread count fits what is still needed, preferring
/// the closest fit; if none fits, the core with the most threads is taken
/// and the request overshoots rather than splitting a core.
pub fn allocate_threads(
    topology: &CpuTopology,
    reserved: &mut BTreeMap<u32, BTreeSet<u32>>,
    requested: u32,
) -> Result<Vec<u32>, LedgerError> {
    let mut avail: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    let mut avail_threads = 0u32;
    for (&cpu, cores) in &topology.threads_by_cpu_and_core {
        let taken = reserved.get(&cpu);
        for (&core, threads) in cores {
            if taken.map(|t| t.contains(&core)).unwrap_or(false) {
                continue;
            }
            avail.entry(cpu).or_default().insert(core);
            avail_threads += threads.len() as u32;
        }
    }
    if avail_threads < requested {
        return Err(LedgerError::InsufficientThreads {
            requested,
            available: avail_threads,
        });
    }

    let mut cpus: Vec<u32> = avail.keys().copied().collect();
    // Stable sort keeps lower cpu ids first among equally idle sockets.
    cpus.sort_by_key(|cpu| std::cmp::Reverse(avail[cpu].len()));

    let mut remaining = requested as i64;
    let mut result = Vec::with_capacity(requested as usize);
    for cpu in cpus {
        if remaining <= 0 {
            break;
        }
        let Some(cores) = avail.get_mut(&cpu) else {
            continue;
        };
        while remaining > 0 && !cores.is_empty() {
            let size = |core: &u32| {
                topology
                    .threads_of(cpu, *core)
                    .map(|t| t.len() as i64)
                    .unwrap_or(0)
            };
            let fitting = cores
                .iter()
                .filter(|c| size(c) <= remaining)
                .max_by_key(|c| (size(c), std::cmp::Reverse(**c)))
                .copied();
            let chosen = match fitting {
                Some(core) => core,
                None => match cores
                    .iter()
                    .max_by_key(|c| (size(c), std::cmp::Reverse(**c)))
                    .copied()
                {
                    Some(core) => core,
                    None => break,
                },
            };
            cores.remove(&chosen);
            if let Some(threads) = topology.threads_of(cpu, chosen) {
                result.extend(threads.iter().copied());
                remaining -= threads.len() as i64;
            }
            reserved.entry(cpu).or_default().insert(chosen);
        }
    }
    Ok(result)
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_id_list(list: Option<&str>) -> Vec<u32> {
    list.map(|l| {
        l.split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(procs: u32, cores: u32, threads: u32, gpus: u32) -> CoreLedger {
        CoreLedger::new(CpuTopology::uniform(procs, cores, threads), gpus)
    }

    fn assert_settled(ledger: &CoreLedger) {
        let s = ledger.snapshot();
        assert!(s.idle_cores + s.locked_cores + s.booked_cores <= s.total_cores, "{:?}", s);
        assert!(s.idle_cores <= s.total_cores);
        assert!(s.idle_cores >= 0 && s.locked_cores >= 0 && s.booked_cores >= 0);
    }

    fn sockets_of(ledger: &CoreLedger, taskset: &str) -> BTreeSet<u32> {
        parse_id_list(Some(taskset))
            .into_iter()
            .map(|t| ledger.topology().cpu_and_core_by_thread[&t].0)
            .collect()
    }

    #[test]
    fn test_basic_reserve_release() {
        let ledger = ledger(1, 8, 8, 0);
        assert_eq!(ledger.snapshot().total_cores, 800);

        let r = ledger.reserve(400, false, 0).unwrap();
        assert_eq!(r.taskset, None);
        let s = ledger.snapshot();
        assert_eq!((s.idle_cores, s.booked_cores), (400, 400));

        ledger.release_reservation(&r);
        let s = ledger.snapshot();
        assert_eq!((s.idle_cores, s.booked_cores), (800, 0));
    }

    #[test]
    fn test_reserve_rejects_bad_requests() {
        let ledger = ledger(1, 8, 8, 1);
        assert_eq!(ledger.reserve(0, false, 0), Err(LedgerError::InvalidRequest(0)));
        assert_eq!(
            ledger.reserve(801, false, 0),
            Err(LedgerError::InsufficientCores {
                requested: 801,
                idle: 800
            })
        );
        assert_eq!(
            ledger.reserve(100, false, 2),
            Err(LedgerError::InsufficientGpus {
                requested: 2,
                free: 1
            })
        );
        // Nothing moved.
        assert_eq!(ledger.snapshot().idle_cores, 800);
    }

    #[test]
    fn test_threadsets_spread_across_sockets() {
        // 2 sockets x 4 cores x 2 threads.
        let ledger = ledger(2, 4, 8, 0);
        assert_eq!(ledger.snapshot().total_cores, 1600);

        let a = ledger.reserve(400, true, 0).unwrap();
        let a_set = a.taskset.clone().unwrap();
        assert_eq!(a.thread_count(), 4);
        assert_eq!(sockets_of(&ledger, &a_set).len(), 1);

        let b = ledger.reserve(600, true, 0).unwrap();
        let b_set = b.taskset.clone().unwrap();
        assert_eq!(b.thread_count(), 6);
        assert_eq!(sockets_of(&ledger, &b_set).len(), 1);
        assert_ne!(sockets_of(&ledger, &a_set), sockets_of(&ledger, &b_set));

        // Two whole cores on socket A, three on socket B.
        let reserved = ledger.snapshot().reserved_cores;
        let sizes: BTreeSet<usize> = reserved.values().map(|c| c.len()).collect();
        assert_eq!(sizes, BTreeSet::from([2, 3]));

        ledger.release_reservation(&a);
        ledger.release_reservation(&b);
        assert!(ledger.snapshot().reserved_cores.is_empty());
        assert_eq!(ledger.snapshot().idle_cores, 1600);
    }

    #[test]
    fn test_fractional_request_is_not_pinned() {
        let ledger = ledger(1, 4, 8, 0);
        let r = ledger.reserve(150, true, 0).unwrap();
        assert_eq!(r.taskset, None);
        assert!(ledger.snapshot().reserved_cores.is_empty());
    }

    #[test]
    fn test_hybrid_cores_pack_by_fit() {
        // Socket 0: two P-cores with 2 threads, two E-cores with 1 thread.
        let topology = CpuTopology::from_triples([
            (0, 0, 0),
            (0, 0, 1),
            (0, 1, 2),
            (0, 1, 3),
            (0, 2, 4),
            (0, 3, 5),
        ]);
        let mut reserved = BTreeMap::new();

        // One thread: an E-core fits exactly, so no P-core is wasted.
        let one = allocate_threads(&topology, &mut reserved, 1).unwrap();
        assert_eq!(one.len(), 1);
        assert!(one[0] >= 4);

        // Three threads: a P-core then the remaining E-core.
        let three = allocate_threads(&topology, &mut reserved, 3).unwrap();
        assert_eq!(three.len(), 3);

        // One thread left to ask for but only a 2-thread P-core remains: overshoot.
        let last = allocate_threads(&topology, &mut reserved, 1).unwrap();
        assert_eq!(last.len(), 2);

        assert!(matches!(
            allocate_threads(&topology, &mut reserved, 1),
            Err(LedgerError::InsufficientThreads { .. })
        ));
    }

    #[test]
    fn test_insufficient_threads_leaves_ledger_untouched() {
        // One core with two threads: a single-thread request takes the whole core.
        let ledger = ledger(1, 1, 2, 0);
        let held = ledger.reserve(100, true, 0).unwrap();
        assert_eq!(held.thread_count(), 2);

        let before = ledger.snapshot();
        assert_eq!((before.idle_cores, before.booked_cores), (100, 100));
        assert!(matches!(
            ledger.reserve(100, true, 0),
            Err(LedgerError::InsufficientThreads { available: 0, .. })
        ));
        assert_eq!(ledger.snapshot(), before);
        assert_settled(&ledger);
    }

    #[test]
    fn test_gpus_are_handed_out_and_returned() {
        let ledger = ledger(1, 4, 4, 3);
        let r = ledger.reserve(100, false, 2).unwrap();
        assert_eq!(r.gpuset.as_deref(), Some("0,1"));
        assert_eq!(r.gpu_ids(), vec![0, 1]);
        let r2 = ledger.reserve(100, false, 1).unwrap();
        assert_eq!(r2.gpuset.as_deref(), Some("2"));
        assert!(ledger.reserve(100, false, 1).is_err());
        ledger.release_reservation(&r);
        assert_eq!(ledger.reserve(100, false, 2).unwrap().gpuset.as_deref(), Some("0,1"));
    }

    #[test]
    fn test_double_release_is_clamped() {
        let ledger = ledger(1, 8, 8, 0);
        let r = ledger.reserve(300, false, 0).unwrap();
        ledger.release_reservation(&r);
        ledger.release_reservation(&r);
        let s = ledger.snapshot();
        assert_eq!((s.idle_cores, s.booked_cores), (800, 0));
        assert_settled(&ledger);
    }

    #[test]
    fn test_lock_unlock_round_trip() {
        let ledger = ledger(1, 8, 8, 0);
        let _r = ledger.reserve(200, false, 0).unwrap();
        ledger.lock(300);
        let s = ledger.snapshot();
        assert_eq!((s.idle_cores, s.locked_cores), (300, 300));
        ledger.unlock(300);
        let s = ledger.snapshot();
        assert_eq!((s.idle_cores, s.locked_cores), (600, 0));
    }

    #[test]
    fn test_lock_all_settles_on_release() {
        let ledger = ledger(1, 8, 8, 0);
        let r = ledger.reserve(300, false, 0).unwrap();
        ledger.lock_all();
        let s = ledger.snapshot();
        assert_eq!((s.idle_cores, s.locked_cores, s.booked_cores), (0, 500, 300));
        assert!(ledger.is_fully_locked());

        ledger.release_reservation(&r);
        let s = ledger.snapshot();
        assert_eq!((s.idle_cores, s.locked_cores, s.booked_cores), (0, 800, 0));

        ledger.unlock_all();
        assert_eq!(ledger.snapshot().idle_cores, 800);
        assert!(!ledger.is_fully_locked());
    }

    #[test]
    fn test_unlock_all_does_not_override_nimby() {
        let ledger = ledger(1, 8, 8, 0);
        ledger.nimby_lock();
        ledger.unlock_all();
        ledger.unlock(100);
        assert_eq!(ledger.snapshot().idle_cores, 0);
        assert!(ledger.is_nimby_held());

        ledger.nimby_unlock();
        assert_eq!(ledger.snapshot().idle_cores, 800);
        assert!(!ledger.is_nimby_held());
    }
}
