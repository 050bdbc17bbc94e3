//! Vertical blanking notifications.
//!
//! A dedicated thread sleeps until the next phase-aligned vsync instant
//! and invokes the registered listener. Timestamps stay locked to the
//! phase of the first observed vsync, so enabling and disabling the
//! worker does not drift the reported timeline. Requests arriving within
//! the same period coalesce into a single tick.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

/// Callback invoked on every vsync with the vsync timestamp
pub type VsyncListener = Box<dyn FnMut(Instant) + Send>;

#[derive(Debug)]
struct State {
    enabled: bool,
    period: Duration,
    last: Option<Instant>,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    // separate lock so the listener runs without blocking control calls
    listener: Mutex<Option<VsyncListener>>,
}

/// Software vsync source for one display.
///
/// The worker thread is parked while notifications are disabled and shut
/// down on drop.
pub struct VsyncWorker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for VsyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("VsyncWorker")
            .field("enabled", &state.enabled)
            .field("period", &state.period)
            .finish_non_exhaustive()
    }
}

impl VsyncWorker {
    /// Spawn the worker for a display with the given vsync period.
    ///
    /// Notifications start disabled.
    pub fn new(period: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                enabled: false,
                period,
                last: None,
                stop: false,
            }),
            cond: Condvar::new(),
            listener: Mutex::new(None),
        });
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("vsync".into())
            .spawn(move || run(thread_shared))
            .map_err(|err| warn!("failed to spawn vsync worker: {err}"))
            .ok();
        VsyncWorker { shared, thread }
    }

    /// Install the listener invoked on each vsync
    pub fn set_listener(&self, listener: VsyncListener) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }

    /// Change the vsync period, e.g. after a config change.
    ///
    /// The phase is re-anchored at the next tick.
    pub fn set_period(&self, period: Duration) {
        let mut state = self.shared.state.lock().unwrap();
        if state.period != period {
            state.period = period;
            state.last = None;
            self.shared.cond.notify_all();
        }
    }

    /// Enable or disable vsync notifications
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock().unwrap();
        if state.enabled != enabled {
            trace!(enabled, "vsync notifications toggled");
            state.enabled = enabled;
            self.shared.cond.notify_all();
        }
    }

    /// Whether notifications are currently enabled
    pub fn enabled(&self) -> bool {
        self.shared.state.lock().unwrap().enabled
    }

    /// Timestamp of the most recent vsync, if one was delivered
    pub fn last_timestamp(&self) -> Option<Instant> {
        self.shared.state.lock().unwrap().last
    }
}

impl Drop for VsyncWorker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        while !state.stop && !state.enabled {
            state = shared.cond.wait(state).unwrap();
        }
        if state.stop {
            return;
        }

        let period = state.period;
        let target = next_vsync(state.last, Instant::now(), period);

        // sleep until the target, waking early on control changes
        loop {
            if state.stop || !state.enabled || state.period != period {
                break;
            }
            let now = Instant::now();
            if now >= target {
                state.last = Some(target);
                drop(state);
                let mut listener = shared.listener.lock().unwrap();
                if let Some(listener) = listener.as_mut() {
                    listener(target);
                }
                drop(listener);
                state = shared.state.lock().unwrap();
                break;
            }
            let (next, _) = shared.cond.wait_timeout(state, target - now).unwrap();
            state = next;
        }
    }
}

/// The next vsync instant, phase-locked to `last`.
///
/// All reported timestamps are `last + k * period` for integer `k`, so
/// a listener re-enabling notifications mid-period lands on the same
/// timeline it left.
fn next_vsync(last: Option<Instant>, now: Instant, period: Duration) -> Instant {
    match last {
        Some(last) if last <= now => {
            let periods = (now - last).as_nanos() / period.as_nanos().max(1) + 1;
            last + period * periods as u32
        }
        Some(last) => last,
        None => now + period,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn ticks_are_phase_aligned() {
        let period = Duration::from_millis(16);
        let base = Instant::now();
        let next = next_vsync(Some(base), base + Duration::from_millis(40), period);

        // two full periods elapsed, the third tick is due
        assert_eq!(next, base + period * 3);

        // re-anchoring without history lands one period out
        let fresh = next_vsync(None, base, period);
        assert_eq!(fresh, base + period);
    }

    #[test]
    fn skipped_periods_do_not_accumulate() {
        let period = Duration::from_millis(10);
        let base = Instant::now();
        // the listener went away for a long time
        let next = next_vsync(Some(base), base + Duration::from_millis(995), period);
        assert_eq!(next, base + period * 100);
        assert!(next > base + Duration::from_millis(995));
    }

    #[test]
    fn listener_receives_ticks_while_enabled() {
        let worker = VsyncWorker::new(Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        worker.set_listener(Box::new(move |ts| {
            let _ = tx.send(ts);
        }));

        worker.set_enabled(true);
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(second > first);
        assert!(worker.last_timestamp().is_some());

        worker.set_enabled(false);
        // drain anything already in flight, then expect silence
        while rx.recv_timeout(Duration::from_millis(50)).is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn drop_joins_the_worker_thread() {
        let worker = VsyncWorker::new(Duration::from_millis(5));
        worker.set_enabled(true);
        drop(worker);
    }
}
