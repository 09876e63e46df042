//! The process-wide context owning the main thread's task queue.
//!
//! A [`Runtime`] lives on the main context. It owns the application bus that
//! every page bus hangs from, the detection worker pool, and the receiving
//! end of the [`MainTask`] channel that workers and frame tickers post to.
//! Nothing posted to that channel takes effect until the main context pumps
//! it:
//!
//! ```text
//!  detection worker ──┐
//!  frame ticker A ────┼──► MainTask channel ──► Runtime::pump ──► Page
//!  frame ticker B ────┘
//! ```

use super::platform::Platform;
use crate::bus::DispatchBus;
use crate::component::page::{PageId, PageShared};
use crate::domain::Result;
use crate::worker::{DetectionJob, DetectionWorker, MainTask};
use crate::Config;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Upper bound for one blocking wait inside [`Runtime::run_until`].
const POLL_SLICE: Duration = Duration::from_millis(5);

/// Main-context runtime shared by every page.
pub struct Runtime {
    config: Config,
    platform: Platform,
    app_bus: DispatchBus,
    main_tx: Sender<MainTask>,
    main_rx: Receiver<MainTask>,
    detector: RefCell<Option<DetectionWorker>>,
    pages: RefCell<IndexMap<PageId, Weak<PageShared>>>,
}

impl Runtime {
    /// Creates a runtime without a platform handle.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Io`](crate::CanopyError::Io) if the detection
    /// workers cannot be spawned.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_platform(config, Platform::none())
    }

    /// Creates a runtime handing `platform` to every component context.
    ///
    /// Detection workers are only spawned when asynchronous installs are
    /// enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Io`](crate::CanopyError::Io) if the detection
    /// workers cannot be spawned.
    pub fn with_platform(config: Config, platform: Platform) -> Result<Self> {
        let (main_tx, main_rx) = unbounded();
        let detector = if config.async_install && config.detection_workers > 0 {
            Some(DetectionWorker::spawn(config.detection_workers, &main_tx)?)
        } else {
            None
        };
        tracing::info!(
            workers = detector.as_ref().map_or(0, DetectionWorker::threads),
            frame_ticker = config.frame_ticker,
            tick_ms = config.tick_interval.as_millis() as u64,
            "runtime started"
        );
        Ok(Self {
            config,
            platform,
            app_bus: DispatchBus::new("app"),
            main_tx,
            main_rx,
            detector: RefCell::new(detector),
            pages: RefCell::new(IndexMap::new()),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the platform handle.
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Returns the application bus, root of every page bus.
    #[must_use]
    pub const fn app_bus(&self) -> &DispatchBus {
        &self.app_bus
    }

    /// Returns the number of live pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages
            .borrow()
            .values()
            .filter(|page| page.upgrade().is_some_and(|page| !page.is_destroyed()))
            .count()
    }

    pub(crate) fn main_sender(&self) -> Sender<MainTask> {
        self.main_tx.clone()
    }

    pub(crate) fn detector_sender(&self) -> Option<Sender<DetectionJob>> {
        self.detector.borrow().as_ref().and_then(DetectionWorker::sender)
    }

    pub(crate) fn register_page(&self, page: &Rc<PageShared>) {
        let mut pages = self.pages.borrow_mut();
        pages.retain(|_, page| page.strong_count() > 0);
        pages.insert(page.id(), Rc::downgrade(page));
    }

    /// Runs every task already posted, without blocking.
    ///
    /// Returns the number of tasks handled.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        while let Ok(task) = self.main_rx.try_recv() {
            self.handle(task);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for a first task, then drains the queue.
    ///
    /// Returns the number of tasks handled.
    pub fn pump_for(&self, timeout: Duration) -> usize {
        match self.main_rx.recv_timeout(timeout) {
            Ok(task) => {
                self.handle(task);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Pumps tasks until `done` holds or `timeout` elapses.
    ///
    /// Returns whether `done` held.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.pump_for(POLL_SLICE.min(deadline - now));
        }
    }

    fn handle(&self, task: MainTask) {
        match task {
            MainTask::Tick(id) => {
                let Some(page) = self.live_page(id) else {
                    return;
                };
                page.store().on_tick();
            }
            MainTask::Detected { page, node, outcome } => {
                let Some(page) = self.live_page(page) else {
                    tracing::debug!(page = %page, node = %node, "detection result for a gone page");
                    return;
                };
                page.complete_detection(node, outcome);
            }
        }
    }

    fn live_page(&self, id: PageId) -> Option<Rc<PageShared>> {
        self.pages
            .borrow()
            .get(&id)
            .and_then(Weak::upgrade)
            .filter(|page| !page.is_destroyed())
    }

    /// Destroys every page, detaches the application bus and joins the
    /// detection workers. Idempotent.
    pub fn shutdown(&self) {
        let pages: Vec<Rc<PageShared>> = self
            .pages
            .borrow_mut()
            .drain(..)
            .filter_map(|(_, page)| page.upgrade())
            .collect();
        for page in pages {
            page.destroy();
        }
        self.app_bus.detach();
        if let Some(mut detector) = self.detector.borrow_mut().take() {
            detector.shutdown();
            tracing::info!("runtime stopped");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("pages", &self.pages.borrow().len())
            .field("detector", &self.detector.borrow().is_some())
            .finish_non_exhaustive()
    }
}
