//! The render-host agent.
//!
//! [`Agent`] owns every subsystem: host probe, core ledger, frame cache,
//! RSS walker, NIMBY controller and the dispatcher client. It implements the
//! control-plane operations and runs the periodic report timer.

use crate::config::RqdConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::frame::{FrameCache, RunningFrame};
use crate::ledger::CoreLedger;
use crate::machine::Machine;
use crate::nimby::{InputSource, Nimby, NimbyHooks};
use crate::privileges::PrivilegeGuard;
use crate::process::ExitOutcome;
use crate::rss::RssWalker;
use crate::supervisor;
use crate::timer::{spawn_periodic, Deadline, ShutdownSignal};
use parking_lot::Mutex;
use rand::Rng;
use rqd_protocol::{
    BootReport, FrameCompleteReport, HardwareState, HostReport, LockState, RenderHost, RunFrame,
    RunningFrameInfo, PROTOCOL_VERSION,
};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often the report timer rechecks the shutdown flag.
const REPORT_POLL: Duration = Duration::from_millis(250);

/// How long an immediate shutdown waits for killed frames to report.
const KILL_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// What the agent does once it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Shutdown,
    Reboot,
    Restart,
}

#[derive(Debug)]
struct HostState {
    hardware: HardwareState,
    /// Deferred until the host is idle.
    pending: Option<IdleAction>,
    /// Chosen when the agent stopped.
    exit_action: Option<IdleAction>,
}

/// The agent root.
pub struct Agent {
    config: Arc<RqdConfig>,
    machine: Machine,
    ledger: CoreLedger,
    frames: FrameCache,
    rss: RssWalker,
    dispatcher: Arc<dyn Dispatcher>,
    nimby: Option<Arc<Nimby>>,
    state: Mutex<HostState>,
    shutdown: Arc<ShutdownSignal>,
    report_deadline: Deadline,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Probe the host and assemble the agent. Nothing runs until [`Agent::start`].
    pub fn new(config: Arc<RqdConfig>, dispatcher: Arc<dyn Dispatcher>) -> Result<Arc<Self>> {
        let machine = Machine::new(Arc::clone(&config))?;
        let info = machine.static_info();
        let nimby_enabled = config.overrides.nimby.unwrap_or(info.is_desktop);
        let num_gpus = machine.gpu().totals().count;
        let ledger = CoreLedger::new(info.topology.clone(), num_gpus);
        let rss = RssWalker::new(config.paths.proc_root.clone(), info.boot_time);
        let shutdown = Arc::new(ShutdownSignal::new());

        let agent = Arc::new_cyclic(|weak: &Weak<Agent>| {
            let nimby = nimby_enabled.then(|| {
                let hooks: Weak<dyn NimbyHooks> = weak.clone();
                Arc::new(Nimby::new(
                    config.nimby.clone(),
                    InputSource::from_config(&config.nimby),
                    hooks,
                    Arc::clone(&shutdown),
                ))
            });
            Agent {
                config,
                machine,
                ledger,
                frames: FrameCache::new(),
                rss,
                dispatcher,
                nimby,
                state: Mutex::new(HostState {
                    hardware: HardwareState::Up,
                    pending: None,
                    exit_action: None,
                }),
                shutdown,
                report_deadline: Deadline::new(Instant::now()),
                threads: Mutex::new(Vec::new()),
            }
        });
        tracing::info!(
            total_cores = agent.ledger.snapshot().total_cores,
            gpus = num_gpus,
            nimby = nimby_enabled,
            "agent ready"
        );
        Ok(agent)
    }

    /// Start background work: boot report, status reports, RSS walker,
    /// swap sampler and NIMBY.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = Vec::new();

        threads.push(self.machine.swap_sampler().spawn(
            self.config.paths.vmstat.clone(),
            Arc::clone(&self.shutdown),
        )?);

        let weak = Arc::downgrade(self);
        threads.push(spawn_periodic(
            "rqd-rss",
            self.config.report.rss_update_interval,
            Arc::clone(&self.shutdown),
            move || {
                if let Some(agent) = weak.upgrade() {
                    agent.update_rss();
                }
            },
        )?);

        let weak = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        threads.push(
            std::thread::Builder::new()
                .name("rqd-report".into())
                .spawn(move || report_loop(weak, shutdown))?,
        );

        if let Some(nimby) = &self.nimby {
            threads.extend(nimby.start()?);
        }

        self.threads.lock().extend(threads);
        Ok(())
    }

    pub fn config(&self) -> &RqdConfig {
        &self.config
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn ledger(&self) -> &CoreLedger {
        &self.ledger
    }

    pub fn frames(&self) -> &FrameCache {
        &self.frames
    }

    pub fn nimby(&self) -> Option<&Arc<Nimby>> {
        self.nimby.as_ref()
    }

    pub fn is_nimby_locked(&self) -> bool {
        self.nimby.as_ref().map(|n| n.is_locked()).unwrap_or(false)
    }

    pub fn hardware_state(&self) -> HardwareState {
        self.state.lock().hardware
    }

    pub fn is_waiting_for_idle(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// The action chosen when the agent stopped, if any.
    pub fn exit_action(&self) -> Option<IdleAction> {
        self.state.lock().exit_action
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Validate and reserve for `request`, then hand it to a supervisor thread.
    ///
    /// Returns once the reservation is made; refusals leave nothing booked.
    pub fn launch_frame(self: &Arc<Self>, request: RunFrame) -> Result<()> {
        {
            let state = self.state.lock();
            if state.hardware != HardwareState::Up {
                return Err(Error::CoreReservationFailure(format!(
                    "host is {}",
                    state.hardware
                )));
            }
            if state.pending.is_some() {
                return Err(Error::CoreReservationFailure(
                    "host is waiting for idle".into(),
                ));
            }
        }
        if self.is_nimby_locked() && !request.ignore_nimby {
            return Err(Error::NimbyLocked);
        }
        if self.frames.contains(&request.frame_id) {
            return Err(Error::DuplicateFrameViolation(request.frame_id));
        }
        if request.uid <= 0 {
            return Err(Error::InvalidUser(request.uid));
        }
        if request.num_cores <= 0 {
            return Err(Error::CoreReservationFailure(format!(
                "invalid core request {}",
                request.num_cores
            )));
        }

        let reservation =
            self.ledger
                .reserve(request.num_cores, request.is_threadable(), request.num_gpus)?;
        let frame = Arc::new(RunningFrame::new(request, reservation));
        if let Err(e) = self.frames.insert(Arc::clone(&frame)) {
            self.ledger.release_reservation(&frame.reservation);
            return Err(e);
        }

        let agent = Arc::clone(self);
        let supervised = Arc::clone(&frame);
        let spawned = std::thread::Builder::new()
            .name(format!("rqd-frame-{}", frame.frame_id()))
            .spawn(move || supervisor::supervise(&agent, supervised));
        if let Err(e) = spawned {
            self.frames.remove(frame.frame_id());
            self.ledger.release_reservation(&frame.reservation);
            return Err(Error::op("start frame supervisor", e));
        }

        tracing::info!(
            frame_id = %frame.frame_id(),
            cores = frame.reservation.cores,
            taskset = ?frame.reservation.taskset,
            gpus = ?frame.reservation.gpuset,
            "frame accepted"
        );
        Ok(())
    }

    /// Release a finished frame and report it.
    pub(crate) fn complete_frame(&self, frame: &RunningFrame, exit: ExitOutcome, run_time: Duration) {
        let report = FrameCompleteReport {
            host: self.render_host(),
            frame: frame.info(),
            exit_status: exit.status,
            exit_signal: exit.signal,
            run_time: run_time.as_secs(),
        };
        self.ledger.release_reservation(&frame.reservation);
        self.frames.remove(frame.frame_id());

        if let Err(e) = self.dispatcher.report_frame_completion(&report) {
            tracing::error!(frame_id = %frame.frame_id(), error = %e, "failed to report frame completion");
        }
        if self.report_deadline.pull_in(self.config.report.vacancy_delay) {
            tracing::debug!("status report pulled in after frame completion");
        }
    }

    /// Kill a running frame. Unknown ids are ignored.
    pub fn kill_frame(&self, frame_id: &str, reason: &str) -> Result<()> {
        match self.frames.get(frame_id) {
            Some(frame) => {
                frame.kill(reason, self.config.launch.kill_signal);
            }
            None => {
                tracing::warn!(frame_id = %frame_id, reason = %reason, "kill for unknown frame ignored");
            }
        }
        Ok(())
    }

    pub fn get_running_frame_status(&self, frame_id: &str) -> Result<RunningFrameInfo> {
        self.frames
            .get(frame_id)
            .map(|f| f.info())
            .ok_or_else(|| Error::FrameNotFound(frame_id.to_string()))
    }

    fn kill_all(&self, reason: &str, spare_ignore_nimby: bool) {
        for frame in self.frames.snapshot() {
            if spare_ignore_nimby && frame.request.ignore_nimby {
                continue;
            }
            frame.kill(reason, self.config.launch.kill_signal);
        }
    }

    fn update_rss(&self) {
        let frames = self.frames.snapshot();
        for frame in self.rss.walk(&frames, self.machine.gpu()) {
            frame.kill("frame exceeded its hard memory limit", self.config.launch.kill_signal);
        }
    }

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    /// The host descriptor with live lock and hardware state.
    pub fn render_host(&self) -> RenderHost {
        let dynamic = self.machine.dynamic_info().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to sample host");
            Default::default()
        });
        let mut host = self.machine.render_host(&dynamic);
        host.state = self.hardware_state();
        host.nimby_enabled = self.nimby.as_ref().map(|n| n.is_active()).unwrap_or(false);
        host.nimby_locked = self.is_nimby_locked();
        host.lock_state = if host.nimby_locked {
            LockState::NimbyLocked
        } else if self.ledger.is_fully_locked() {
            LockState::Locked
        } else {
            LockState::Open
        };
        host
    }

    pub fn status(&self) -> HostReport {
        HostReport {
            host: self.render_host(),
            frames: self.frames.snapshot().iter().map(|f| f.info()).collect(),
            core_info: self.ledger.snapshot(),
        }
    }

    pub fn send_status_report(&self) {
        if let Err(e) = self.dispatcher.report_status(&self.status()) {
            tracing::warn!(error = %e, "failed to send status report");
        }
    }

    fn send_boot_report(&self) -> Result<()> {
        let report = BootReport {
            protocol_version: PROTOCOL_VERSION,
            host: self.render_host(),
            core_info: self.ledger.snapshot(),
        };
        self.dispatcher.report_startup(&report)
    }

    fn next_report_interval(&self) -> Duration {
        let min = self.config.report.min_interval;
        let max = self.config.report.max_interval.max(min);
        rand::thread_rng().gen_range(min..=max)
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub fn lock(&self, cores: i32) {
        self.ledger.lock(cores);
        self.report_deadline.pull_in(self.config.report.vacancy_delay);
    }

    pub fn lock_all(&self) {
        self.ledger.lock_all();
        self.report_deadline.pull_in(self.config.report.vacancy_delay);
    }

    pub fn unlock(&self, cores: i32) {
        self.ledger.unlock(cores);
        self.report_deadline.pull_in(self.config.report.vacancy_delay);
    }

    pub fn unlock_all(&self) {
        self.ledger.unlock_all();
        self.report_deadline.pull_in(self.config.report.vacancy_delay);
    }

    pub fn nimby_on(&self) -> Result<()> {
        let nimby = self
            .nimby
            .as_ref()
            .ok_or_else(|| Error::rqd("nimby is not enabled on this host"))?;
        nimby.set_active(true);
        Ok(())
    }

    pub fn nimby_off(&self) -> Result<()> {
        let nimby = self
            .nimby
            .as_ref()
            .ok_or_else(|| Error::rqd("nimby is not enabled on this host"))?;
        nimby.set_active(false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown, reboot, restart
    // ------------------------------------------------------------------

    pub fn shutdown_now(&self) -> Result<()> {
        self.act_now(IdleAction::Shutdown)
    }

    pub fn shutdown_when_idle(&self) -> Result<()> {
        self.act_when_idle(IdleAction::Shutdown)
    }

    pub fn reboot_now(&self) -> Result<()> {
        self.act_now(IdleAction::Reboot)
    }

    pub fn reboot_when_idle(&self) -> Result<()> {
        self.act_when_idle(IdleAction::Reboot)
    }

    pub fn restart_now(&self) -> Result<()> {
        self.act_now(IdleAction::Restart)
    }

    pub fn restart_when_idle(&self) -> Result<()> {
        self.act_when_idle(IdleAction::Restart)
    }

    fn act_now(&self, action: IdleAction) -> Result<()> {
        tracing::info!(?action, "acting now");
        self.ledger.lock_all();
        self.kill_all(&format!("host {:?} requested", action).to_lowercase(), false);
        if !self.wait_for_frames_to_drain(KILL_DRAIN_TIMEOUT) {
            tracing::warn!(
                remaining = self.frames.len(),
                "frames still running after kill, proceeding"
            );
        }
        self.perform(action)
    }

    fn act_when_idle(&self, action: IdleAction) -> Result<()> {
        tracing::info!(?action, "acting when idle");
        self.ledger.lock_all();
        {
            let mut state = self.state.lock();
            state.pending = Some(action);
            if action == IdleAction::Reboot {
                state.hardware = HardwareState::RebootWhenIdle;
            }
        }
        self.check_idle_action();
        Ok(())
    }

    /// Poll until the frame cache is empty or `timeout` passes.
    ///
    /// Returns true if every frame finished.
    fn wait_for_frames_to_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.frames.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(DRAIN_POLL);
        }
        true
    }

    /// Perform a deferred action once no frames run and nobody is logged in.
    fn check_idle_action(&self) {
        let Some(action) = self.state.lock().pending else {
            return;
        };
        if !self.frames.is_empty() {
            return;
        }
        if self.machine.static_info().is_desktop && self.machine.is_user_logged_in() {
            tracing::debug!(?action, "user logged in, deferring");
            return;
        }
        if let Err(e) = self.perform(action) {
            tracing::error!(?action, error = %e, "deferred action failed");
        }
    }

    fn perform(&self, action: IdleAction) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.pending = None;
            state.exit_action = Some(action);
            state.hardware = match action {
                IdleAction::Reboot => HardwareState::Rebooting,
                IdleAction::Shutdown | IdleAction::Restart => HardwareState::Down,
            };
        }
        if action == IdleAction::Reboot {
            self.reboot_host()?;
        }
        self.send_status_report();
        self.stop();
        Ok(())
    }

    fn reboot_host(&self) -> Result<()> {
        let Some((program, args)) = self.config.launch.reboot_command.split_first() else {
            return Err(Error::Config("launch.reboot_command is empty".into()));
        };
        let _guard = PrivilegeGuard::escalate()?;
        let status = std::process::Command::new(program)
            .args(args)
            .status()
            .map_err(|e| Error::op(&format!("run {}", program), e))?;
        if !status.success() {
            return Err(Error::rqd(format!("{} exited with {}", program, status)));
        }
        Ok(())
    }

    /// Signal every background thread to stop.
    pub fn stop(&self) {
        if !self.shutdown.is_triggered() {
            tracing::info!("agent stopping");
        }
        self.shutdown.trigger();
    }

    /// Block until the agent stops, then join its background threads.
    pub fn wait(&self) {
        self.shutdown.wait();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "background thread panicked");
            }
        }
    }
}

impl NimbyHooks for Agent {
    // Reports are sent by the report thread.
    fn on_nimby_lock(&self) {
        self.ledger.nimby_lock();
        self.kill_all("NIMBY locked the host", true);
        self.report_deadline.pull_in(Duration::ZERO);
    }

    fn on_nimby_unlock(&self, idle_since: u64) {
        tracing::info!(idle_since = %crate::util::format_epoch(idle_since), "nimby released host");
        self.ledger.nimby_unlock();
        self.report_deadline.pull_in(Duration::ZERO);
    }

    fn is_safe_to_run_jobs(&self) -> bool {
        match self.machine.dynamic_info() {
            Ok(dynamic) => self.machine.is_nimby_safe_to_run_jobs(&dynamic),
            Err(e) => {
                tracing::debug!(error = %e, "failed to sample host");
                true
            }
        }
    }

    fn is_safe_to_unlock(&self) -> bool {
        match self.machine.dynamic_info() {
            Ok(dynamic) => self.machine.is_nimby_safe_to_unlock(&dynamic),
            Err(e) => {
                tracing::debug!(error = %e, "failed to sample host");
                false
            }
        }
    }
}

/// Boot report with retries, then status reports at randomised intervals.
fn report_loop(agent: Weak<Agent>, shutdown: Arc<ShutdownSignal>) {
    loop {
        let Some(a) = agent.upgrade() else { return };
        match a.send_boot_report() {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(error = %e, "boot report failed");
                let delay = a.config.report.startup_retry_delay;
                drop(a);
                if shutdown.wait_timeout(delay) {
                    return;
                }
            }
        }
    }
    if let Some(a) = agent.upgrade() {
        a.report_deadline.set(Instant::now() + a.next_report_interval());
    }

    loop {
        let deadline_passed = match agent.upgrade() {
            Some(a) => !a.report_deadline.wait(&shutdown, REPORT_POLL),
            None => return,
        };
        if !deadline_passed {
            return;
        }
        let Some(a) = agent.upgrade() else { return };
        a.send_status_report();
        a.check_idle_action();
        a.report_deadline.set(Instant::now() + a.next_report_interval());
    }
}
