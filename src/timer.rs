//! Self-rescheduling background timers and the shared shutdown flag.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Process-wide shutdown flag that sleeping timers can wait on.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn trigger(&self) {
        let mut triggered = self.triggered.lock();
        *triggered = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Sleep for `timeout` unless shutdown arrives first.
    ///
    /// Returns true if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.triggered.lock();
        while !*triggered {
            if self.cond.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }
        *triggered
    }

    /// Block until shutdown is triggered.
    pub fn wait(&self) {
        let mut triggered = self.triggered.lock();
        while !*triggered {
            self.cond.wait(&mut triggered);
        }
    }
}

/// Run `tick` every `interval` on a named thread until shutdown.
///
/// The shutdown flag is checked before each reschedule.
pub fn spawn_periodic<F>(
    name: &str,
    interval: Duration,
    shutdown: Arc<ShutdownSignal>,
    mut tick: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
        tracing::debug!(timer = %thread_name, "timer started");
        while !shutdown.wait_timeout(interval) {
            tick();
        }
        tracing::debug!(timer = %thread_name, "timer stopped");
    })
}

/// A timer deadline that other threads can pull forward.
#[derive(Debug)]
pub struct Deadline {
    next: Mutex<Instant>,
    cond: Condvar,
}

impl Deadline {
    pub fn new(next: Instant) -> Self {
        Self {
            next: Mutex::new(next),
            cond: Condvar::new(),
        }
    }

    /// Replace the deadline.
    pub fn set(&self, next: Instant) {
        *self.next.lock() = next;
        self.cond.notify_all();
    }

    /// Move the deadline to `now + within` if it currently lies further out.
    ///
    /// Returns true if the deadline moved.
    pub fn pull_in(&self, within: Duration) -> bool {
        let target = Instant::now() + within;
        let mut next = self.next.lock();
        if *next > target {
            *next = target;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    pub fn next(&self) -> Instant {
        *self.next.lock()
    }

    /// Block until the deadline passes or shutdown is triggered.
    ///
    /// Wakes at least every `poll` to observe the shutdown flag. Returns true
    /// if shutdown was triggered.
    pub fn wait(&self, shutdown: &ShutdownSignal, poll: Duration) -> bool {
        loop {
            if shutdown.is_triggered() {
                return true;
            }
            let mut next = self.next.lock();
            let now = Instant::now();
            if now >= *next {
                return false;
            }
            let until = (*next).min(now + poll);
            self.cond.wait_until(&mut next, until);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_shutdown_wakes_waiter() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait_timeout(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();
        assert!(waiter.join().unwrap());
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_periodic_timer_stops_on_shutdown() {
        let signal = Arc::new(ShutdownSignal::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = {
            let ticks = ticks.clone();
            spawn_periodic("test-timer", Duration::from_millis(5), signal.clone(), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        std::thread::sleep(Duration::from_millis(60));
        signal.trigger();
        handle.join().unwrap();
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_deadline_pull_in() {
        let deadline = Deadline::new(Instant::now() + Duration::from_secs(60));
        assert!(deadline.pull_in(Duration::from_millis(10)));
        // Already closer than the requested window.
        assert!(!deadline.pull_in(Duration::from_secs(30)));

        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!deadline.wait(&signal, Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
