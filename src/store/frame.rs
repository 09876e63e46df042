//! Frame ticker thread.
//!
//! One ticker per page wakes on a fixed interval while the page is visible
//! and asks the main context to run a batch pass. The ticker never touches
//! store state itself: its callback only posts a message, and the main
//! context reports back with [`FrameTicker::complete`] once the pass ran.
//!
//! # Architecture
//!
//! ```text
//!           arm() ─────────┐          disarm()
//!                          ▼              │
//!   ┌──────── parked (Condvar) ◄──────────┘
//!   │              │ armed && !in_flight
//!   │              ▼
//!   │        wait interval ── disarmed? ──► parked
//!   │              │
//!   │              ▼
//!   │     in_flight = true, on_tick() ───► main context: PageStore::on_tick
//!   │              │                                  │
//!   └──────────────┴──────── complete() ◄─────────────┘
//! ```
//!
//! The `in_flight` slot is a single permit: a tick is only requested once
//! the previous pass completed, so two batch passes never overlap and a
//! slow main context sees ticks coalesce instead of piling up.

use crate::domain::{CanopyError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TickerState {
    armed: bool,
    in_flight: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TickerState>,
    wake: Condvar,
}

/// Periodic tick source for one page.
#[derive(Debug)]
pub struct FrameTicker {
    name: String,
    interval: Duration,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FrameTicker {
    /// Spawns a parked ticker thread.
    ///
    /// `on_tick` runs on the ticker thread; returning `false` stops the
    /// thread (the main context is gone).
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Io`] if the thread cannot be spawned.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, on_tick: F) -> Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("canopy-ticker-{name}"))
            .spawn(move || run(&thread_shared, interval, &on_tick))
            .map_err(CanopyError::Io)?;

        tracing::debug!(ticker = %name, interval_ms = interval.as_millis() as u64, "frame ticker spawned");
        Ok(Self {
            name,
            interval,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the tick interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Releases the ticker. Returns `false` if it was already armed.
    pub fn arm(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.armed || state.shutdown {
            return false;
        }
        state.armed = true;
        drop(state);
        self.shared.wake.notify_one();
        tracing::trace!(ticker = %self.name, "armed");
        true
    }

    /// Parks the ticker after the current wait, dropping any pending tick.
    pub fn disarm(&self) {
        let mut state = self.shared.state.lock();
        if !state.armed {
            return;
        }
        state.armed = false;
        drop(state);
        self.shared.wake.notify_one();
        tracing::trace!(ticker = %self.name, "disarmed");
    }

    /// Returns `true` while armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().armed
    }

    /// Returns `true` while a requested pass has not completed.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.shared.state.lock().in_flight
    }

    /// Reports that the main context finished the requested pass.
    pub fn complete(&self) {
        let mut state = self.shared.state.lock();
        if state.in_flight {
            state.in_flight = false;
            drop(state);
            self.shared.wake.notify_one();
        }
    }

    /// Stops and joins the ticker thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.armed = false;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!(ticker = %self.name, "ticker thread panicked");
            }
        }
        tracing::debug!(ticker = %self.name, "frame ticker stopped");
    }
}

impl Drop for FrameTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared, interval: Duration, on_tick: &dyn Fn() -> bool) {
    let mut state = shared.state.lock();
    loop {
        while !state.shutdown && (!state.armed || state.in_flight) {
            shared.wake.wait(&mut state);
        }
        if state.shutdown {
            return;
        }

        let deadline = Instant::now() + interval;
        while !state.shutdown && state.armed && Instant::now() < deadline {
            let _ = shared.wake.wait_until(&mut state, deadline);
        }
        if state.shutdown {
            return;
        }
        if !state.armed || state.in_flight {
            continue;
        }

        state.in_flight = true;
        drop(state);
        let keep_going = on_tick();
        state = shared.state.lock();
        if !keep_going {
            state.armed = false;
            state.in_flight = false;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_ticker(interval: Duration) -> (FrameTicker, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        let ticker = FrameTicker::spawn("test", interval, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();
        (ticker, ticks)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn parked_until_armed() {
        let (ticker, ticks) = counting_ticker(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        assert!(ticker.arm());
        assert!(!ticker.arm());
        assert!(wait_for(|| ticks.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn no_second_tick_before_complete() {
        let (ticker, ticks) = counting_ticker(Duration::from_millis(1));
        ticker.arm();
        assert!(wait_for(|| ticker.is_in_flight()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        ticker.complete();
        assert!(wait_for(|| ticks.load(Ordering::SeqCst) >= 2));
    }

    #[test]
    fn disarm_parks_and_shutdown_joins() {
        let (ticker, ticks) = counting_ticker(Duration::from_millis(50));
        ticker.arm();
        ticker.disarm();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert!(!ticker.is_armed());

        ticker.shutdown();
        assert!(!ticker.arm());
    }
}
