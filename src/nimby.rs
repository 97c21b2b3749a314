//! NIMBY: a workstation's owner always wins over render work.
//!
//! While unlocked, any keyboard or mouse input (or memory pressure) locks the
//! host and evicts frames. While locked, the host is handed back once input
//! has been quiet for `minimum_idle` and resources have recovered.

use crate::config::{InputSourceKind, NimbyConfig};
use crate::timer::ShutdownSignal;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll timeout of the device listener, bounding shutdown latency.
const DEVICE_POLL: Duration = Duration::from_millis(500);

/// Callbacks into the owning agent.
pub trait NimbyHooks: Send + Sync {
    fn on_nimby_lock(&self);
    fn on_nimby_unlock(&self, idle_since: u64);
    fn is_safe_to_run_jobs(&self) -> bool;
    fn is_safe_to_unlock(&self) -> bool;
}

/// How input activity is observed.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Poll the event devices in a directory.
    Select { dir: PathBuf },
    /// Ask a display-server helper for the idle time in milliseconds.
    Library { command: String },
    /// Activity only arrives through [`Nimby::record_input`].
    None,
}

impl InputSource {
    pub fn from_config(config: &NimbyConfig) -> Self {
        match config.input_source {
            InputSourceKind::Select => InputSource::Select {
                dir: config.input_dir.clone(),
            },
            InputSourceKind::Library => InputSource::Library {
                command: config.idle_command.clone(),
            },
            InputSourceKind::None => InputSource::None,
        }
    }
}

/// The NIMBY state machine.
pub struct Nimby {
    config: NimbyConfig,
    source: InputSource,
    hooks: Weak<dyn NimbyHooks>,
    shutdown: Arc<ShutdownSignal>,
    active: AtomicBool,
    locked: AtomicBool,
    /// Epoch seconds of the last observed input.
    last_activity: AtomicU64,
}

impl Nimby {
    pub fn new(
        config: NimbyConfig,
        source: InputSource,
        hooks: Weak<dyn NimbyHooks>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            config,
            source,
            hooks,
            shutdown,
            active: AtomicBool::new(true),
            locked: AtomicBool::new(false),
            last_activity: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    /// Turn NIMBY on or off. Turning it off releases a held lock.
    pub fn set_active(&self, active: bool) {
        let was = self.active.swap(active, Ordering::SeqCst);
        if was != active {
            tracing::info!(active, "nimby toggled");
        }
        if !active && self.is_locked() {
            self.unlock();
        }
    }

    /// Note human input; locks the host if it is open.
    pub fn record_input(&self) {
        self.last_activity
            .store(crate::util::epoch_secs(), Ordering::SeqCst);
        if self.is_active() && !self.is_locked() {
            tracing::info!("input detected, locking host");
            self.lock();
        }
    }

    /// Lock the host and evict frames.
    pub fn lock(&self) {
        if self.locked.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_nimby_lock();
        }
    }

    /// Hand the host back to the farm.
    pub fn unlock(&self) {
        if !self.locked.swap(false, Ordering::SeqCst) {
            return;
        }
        let idle_since = self.last_activity();
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_nimby_unlock(idle_since);
        }
    }

    /// Seconds without input, per the configured source.
    fn idle_secs(&self) -> u64 {
        if let InputSource::Library { command } = &self.source {
            match query_idle(command) {
                Some(idle) => {
                    let now = crate::util::epoch_secs();
                    let last = now.saturating_sub(idle.as_secs());
                    self.last_activity.fetch_max(last, Ordering::SeqCst);
                }
                None => tracing::debug!(command = %command, "idle query failed"),
            }
        }
        crate::util::epoch_secs().saturating_sub(self.last_activity())
    }

    /// One step of the state machine.
    pub fn check(&self) {
        if !self.is_active() {
            return;
        }
        let Some(hooks) = self.hooks.upgrade() else {
            return;
        };
        let idle = self.idle_secs();
        if self.is_locked() {
            if idle >= self.config.minimum_idle.as_secs() && hooks.is_safe_to_unlock() {
                tracing::info!(idle_secs = idle, "host idle, unlocking");
                drop(hooks);
                self.unlock();
            }
        } else if idle < self.config.check_interval_unlocked.as_secs().max(1)
            && matches!(self.source, InputSource::Library { .. })
        {
            tracing::info!(idle_secs = idle, "input detected, locking host");
            drop(hooks);
            self.lock();
        } else if !hooks.is_safe_to_run_jobs() {
            tracing::warn!("host short on memory, locking");
            drop(hooks);
            self.lock();
        }
    }

    fn interval(&self) -> Duration {
        if self.is_locked() {
            self.config.check_interval_locked
        } else {
            self.config.check_interval_unlocked
        }
    }

    /// Start the checker and, for device polling, the input listener.
    pub fn start(self: &Arc<Self>) -> std::io::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        let nimby = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        handles.push(
            std::thread::Builder::new()
                .name("rqd-nimby".into())
                .spawn(move || loop {
                    let interval = match nimby.upgrade() {
                        Some(n) => n.interval(),
                        None => break,
                    };
                    if shutdown.wait_timeout(interval) {
                        break;
                    }
                    match nimby.upgrade() {
                        Some(n) => n.check(),
                        None => break,
                    }
                })?,
        );

        if let InputSource::Select { dir } = &self.source {
            let devices = open_input_devices(dir);
            if devices.is_empty() {
                tracing::warn!(dir = %dir.display(), "no readable input devices, nimby sees no input");
            } else {
                let nimby = Arc::downgrade(self);
                let shutdown = Arc::clone(&self.shutdown);
                handles.push(
                    std::thread::Builder::new()
                        .name("rqd-nimby-input".into())
                        .spawn(move || listen(devices, nimby, shutdown))?,
                );
            }
        }
        tracing::info!(source = ?self.source, "nimby started");
        Ok(handles)
    }
}

/// Run the idle helper and parse its millisecond output.
fn query_idle(command: &str) -> Option<Duration> {
    let output = std::process::Command::new(command).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let millis = String::from_utf8_lossy(&output.stdout).trim().parse::<u64>().ok()?;
    Some(Duration::from_millis(millis))
}

fn open_input_devices(dir: &Path) -> Vec<std::fs::File> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("event"))
        .filter_map(|e| {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(e.path())
                .ok()
        })
        .collect()
}

/// Poll the devices until shutdown, reporting any readable event as input.
fn listen(devices: Vec<std::fs::File>, nimby: Weak<Nimby>, shutdown: Arc<ShutdownSignal>) {
    let mut fds: Vec<libc::pollfd> = devices
        .iter()
        .map(|d| libc::pollfd {
            fd: d.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let mut buf = [0u8; 4096];
    while !shutdown.is_triggered() {
        // SAFETY: fds points to fds.len() initialised pollfd structs whose
        // descriptors stay open for the lifetime of `devices`.
        let ready = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                DEVICE_POLL.as_millis() as libc::c_int,
            )
        };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(error = %err, "input poll failed, stopping listener");
            return;
        }
        if ready == 0 {
            continue;
        }
        for pfd in fds.iter_mut().filter(|p| p.revents & libc::POLLIN != 0) {
            // Drain; the content is irrelevant.
            // SAFETY: buf is writable for its full length.
            while unsafe { libc::read(pfd.fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
            pfd.revents = 0;
        }
        match nimby.upgrade() {
            Some(n) => n.record_input(),
            None => return,
        }
    }
}
