//! Admission control for native spawns.
//!
//! A counting semaphore over a mutex and condition variable. Waiters
//! re-check at the poll interval even without a wakeup, so a limit raised
//! through [`AdmissionController::set_limit`] or a missed notification never
//! strands a reaping worker.

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Default cap on in-flight native children.
pub const DEFAULT_MAX_PROCESSES: usize = 64;

/// Default re-check interval while waiting for a slot.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

lazy_static! {
    static ref GLOBAL_ADMISSION: Arc<AdmissionController> = Arc::new(
        AdmissionController::new(DEFAULT_MAX_PROCESSES, DEFAULT_POLL_INTERVAL)
    );
}

/// The process-wide controller shared by every [`crate::UnixBackend::new`].
pub fn global() -> Arc<AdmissionController> {
    Arc::clone(&GLOBAL_ADMISSION)
}

/// Reconfigure the process-wide controller. Slots already held are kept.
pub fn configure_global(max_processes: usize, poll_interval: Duration) {
    GLOBAL_ADMISSION.set_limit(max_processes);
    GLOBAL_ADMISSION.set_poll_interval(poll_interval);
}

#[derive(Debug)]
struct Counters {
    running: usize,
    limit: usize,
    peak: usize,
    poll_interval: Duration,
}

/// Bounds the number of concurrently in-flight native children.
#[derive(Debug)]
pub struct AdmissionController {
    state: Mutex<Counters>,
    slot_freed: Condvar,
}

impl AdmissionController {
    pub fn new(max_processes: usize, poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(Counters {
                running: 0,
                limit: max_processes.max(1),
                peak: 0,
                poll_interval,
            }),
            slot_freed: Condvar::new(),
        }
    }

    /// Block until a slot is free, then take it.
    pub fn acquire(self: &Arc<Self>) -> AdmissionPermit {
        let mut state = self.state.lock();
        if state.running >= state.limit {
            debug!(
                "Admission full ({}/{}), waiting for a slot",
                state.running, state.limit
            );
        }
        while state.running >= state.limit {
            let interval = state.poll_interval;
            self.slot_freed.wait_for(&mut state, interval);
        }
        self.take_slot(&mut state)
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut state = self.state.lock();
        if state.running >= state.limit {
            return None;
        }
        Some(self.take_slot(&mut state))
    }

    fn take_slot(self: &Arc<Self>, state: &mut Counters) -> AdmissionPermit {
        state.running += 1;
        state.peak = state.peak.max(state.running);
        AdmissionPermit {
            controller: Arc::clone(self),
            released: false,
        }
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        match state.running.checked_sub(1) {
            Some(running) => state.running = running,
            None => warn!("Admission release without a matching acquire"),
        }
        drop(state);
        self.slot_freed.notify_one();
    }

    /// Children currently holding a slot.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Change the cap. Values below 1 are raised to 1.
    pub fn set_limit(&self, max_processes: usize) {
        self.state.lock().limit = max_processes.max(1);
        self.slot_freed.notify_all();
    }

    pub fn poll_interval(&self) -> Duration {
        self.state.lock().poll_interval
    }

    pub fn set_poll_interval(&self, poll_interval: Duration) {
        self.state.lock().poll_interval = poll_interval;
    }

    /// Highest `running` value observed since creation.
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }
}

/// One held admission slot. Released exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    released: bool,
}

impl AdmissionPermit {
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release_slot();
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn controller(limit: usize) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(limit, Duration::from_millis(10)))
    }

    #[test]
    fn test_acquire_and_release() {
        let admission = controller(2);
        let first = admission.acquire();
        let second = admission.acquire();
        assert_eq!(admission.running(), 2);
        assert!(admission.try_acquire().is_none());

        first.release();
        assert_eq!(admission.running(), 1);
        let third = admission.try_acquire().unwrap();

        drop(second);
        drop(third);
        assert_eq!(admission.running(), 0);
        assert_eq!(admission.peak(), 2);
    }

    #[test]
    fn test_waiter_is_admitted_after_release() {
        let admission = controller(1);
        let held = admission.acquire();

        let waiter = {
            let admission = Arc::clone(&admission);
            thread::spawn(move || {
                let start = Instant::now();
                let permit = admission.acquire();
                drop(permit);
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        held.release();
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
        assert_eq!(admission.running(), 0);
    }

    #[test]
    fn test_cap_holds_under_contention() {
        let admission = controller(3);
        let workers: Vec<_> = (0..24)
            .map(|_| {
                let admission = Arc::clone(&admission);
                thread::spawn(move || {
                    let permit = admission.acquire();
                    assert!(admission.running() <= 3);
                    thread::sleep(Duration::from_millis(5));
                    drop(permit);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(admission.running(), 0);
        assert!(admission.peak() <= 3);
        assert!(admission.peak() >= 1);
    }

    #[test]
    fn test_raising_limit_wakes_waiters() {
        let admission = controller(1);
        let _held = admission.acquire();

        let waiter = {
            let admission = Arc::clone(&admission);
            thread::spawn(move || admission.acquire().release())
        };

        thread::sleep(Duration::from_millis(20));
        admission.set_limit(2);
        waiter.join().unwrap();
        assert_eq!(admission.limit(), 2);
    }

    #[test]
    fn test_zero_limit_is_raised_to_one() {
        let admission = controller(0);
        assert_eq!(admission.limit(), 1);
        assert!(admission.try_acquire().is_some());
    }
}
