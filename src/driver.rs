use std::{
    fmt::{self, Debug},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{self as chan, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{
    DEFAULT_QUEUE_CAPACITY,
    task::{CallbackResult, TaskId, TaskOptions},
    ticker::{IntervalTicker, TickSource},
    wheel::{Wheel, WheelError},
};

/// Observer for ticks whose roll failed.
pub type ErrorHook = Arc<dyn Fn(&WheelError) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to spawn driver thread")]
    Spawn(#[from] io::Error),

    #[error("tick queue full (capacity {capacity}): scheduler cannot keep up")]
    Backpressure { capacity: usize },

    #[error(transparent)]
    Wheel(#[from] WheelError),
}

#[derive(Clone)]
pub struct DriverConfig {
    queue_capacity: usize,
    error_hook: Option<ErrorHook>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            error_hook: None,
        }
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks allowed to wait for the scheduler. At least one.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WheelError) + Send + Sync + 'static,
    {
        self.error_hook = Some(Arc::new(hook));
        self
    }
}

impl Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("queue_capacity", &self.queue_capacity)
            .field("error_hook", &self.error_hook.is_some())
            .finish()
    }
}

/// State shared with the driver threads.
struct Shared {
    wheel: Arc<Wheel>,
    // One roll at a time, whether from the scheduler or `roll_once`.
    roll_lock: Mutex<()>,
    started: AtomicBool,
    failed_ticks: AtomicU64,
    backpressure: AtomicBool,
    error_hook: Option<ErrorHook>,
}

impl Shared {
    fn roll(&self) -> Result<usize, WheelError> {
        let _guard = self.roll_lock.lock();
        self.wheel.roll().inspect_err(|e| {
            self.failed_ticks.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "tick failed");
            if let Some(hook) = &self.error_hook {
                hook(e);
            }
        })
    }
}

struct Running {
    stop_tx: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

/// Clock-driven owner of the base [`Wheel`].
///
/// Two threads run while started. The producer forwards pulses from the
/// [`TickSource`] into a bounded queue, and the scheduler pulls them off and
/// rolls the wheel once per pulse. A full queue is fatal: the producer
/// records [`DriverError::Backpressure`] and both threads wind down. The
/// driver then reports not running and may be started again.
///
/// Stopping closes the stop signal and joins both threads, so a callback
/// that is running finishes before [`TimeWheel::stop`] returns.
pub struct TimeWheel {
    shared: Arc<Shared>,
    source: Box<dyn TickSource>,
    queue_capacity: usize,
    running: Mutex<Option<Running>>,
}

impl TimeWheel {
    pub fn new<S>(wheel: Wheel, source: S, config: DriverConfig) -> Self
    where
        S: TickSource + 'static,
    {
        let DriverConfig {
            queue_capacity,
            error_hook,
        } = config;

        Self {
            shared: Arc::new(Shared {
                wheel: Arc::new(wheel),
                roll_lock: Mutex::new(()),
                started: AtomicBool::new(false),
                failed_ticks: AtomicU64::new(0),
                backpressure: AtomicBool::new(false),
                error_hook,
            }),
            source: Box::new(source),
            queue_capacity: queue_capacity.max(1),
            running: Mutex::new(None),
        }
    }

    /// Driver pulsing at the wheel's own tick with default settings.
    pub fn from_wheel(wheel: Wheel) -> Self {
        let ticker = IntervalTicker::new(wheel.tick());
        Self::new(wheel, ticker, DriverConfig::default())
    }

    /// Begin consuming ticks. Calls after the first are no-ops until
    /// [`TimeWheel::stop`] or a backpressure fault.
    ///
    /// Restarting after a fault joins the old threads and clears the fault.
    pub fn start(&self) -> Result<(), DriverError> {
        let mut running = self.running.lock();
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(Running { stop_tx, threads }) = running.take() {
            drop(stop_tx);
            join_all(threads);
        }
        self.shared.backpressure.store(false, Ordering::Release);

        let (stop_tx, stop_rx) = chan::bounded::<()>(0);
        let (queue_tx, queue_rx) = chan::bounded::<Instant>(self.queue_capacity);
        let mut threads = Vec::with_capacity(2);

        let shared = Arc::clone(&self.shared);
        let stop = stop_rx.clone();
        let scheduler = thread::Builder::new()
            .name("timewheel-scheduler".into())
            .spawn(move || schedule_loop(&shared, queue_rx, stop));

        match scheduler {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                self.shared.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        let shared = Arc::clone(&self.shared);
        let ticks = self.source.subscribe();
        let capacity = self.queue_capacity;
        let producer = thread::Builder::new()
            .name("timewheel-ticker".into())
            .spawn(move || produce_loop(&shared, ticks, queue_tx, stop_rx, capacity));

        match producer {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                drop(stop_tx);
                join_all(threads);
                self.shared.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        debug!(queue_capacity = capacity, period = ?self.source.period(), "driver started");
        *running = Some(Running { stop_tx, threads });
        Ok(())
    }

    /// Stop consuming ticks and wait for the threads to exit.
    ///
    /// Safe to call any number of times. Must not be called from inside a
    /// task callback; the scheduler thread is never joined from itself.
    pub fn stop(&self) {
        let Some(Running { stop_tx, threads }) = self.running.lock().take() else {
            return;
        };

        drop(stop_tx);
        join_all(threads);
        self.shared.started.store(false, Ordering::Release);
        debug!("driver stopped");
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Schedule a one-shot task `delay` from now.
    pub fn add_task<F>(
        &self,
        delay: Duration,
        callback: F,
        options: TaskOptions,
    ) -> Result<TaskId, WheelError>
    where
        F: Fn() -> CallbackResult + Send + Sync + 'static,
    {
        self.shared
            .wheel
            .create_task(delay, options.callback(callback))
    }

    /// Schedule a task that fires every `delay` until cancelled.
    pub fn add_cycle_task<F>(
        &self,
        delay: Duration,
        callback: F,
        options: TaskOptions,
    ) -> Result<TaskId, WheelError>
    where
        F: Fn() -> CallbackResult + Send + Sync + 'static,
    {
        self.shared
            .wheel
            .create_task(delay, options.callback(callback).cycle())
    }

    /// Remove a scheduled task. Returns false if it already fired or was
    /// never scheduled.
    pub fn cancel(&self, id: &TaskId) -> bool {
        self.shared.wheel.remove_task(id)
    }

    /// Roll the wheel once on the calling thread.
    ///
    /// Serialized with the scheduler thread. Must not be called from a
    /// callback.
    pub fn roll_once(&self) -> Result<usize, DriverError> {
        Ok(self.shared.roll()?)
    }

    /// Fatal condition that stopped tick forwarding, if any.
    pub fn fault(&self) -> Option<DriverError> {
        self.shared
            .backpressure
            .load(Ordering::Acquire)
            .then_some(DriverError::Backpressure {
                capacity: self.queue_capacity,
            })
    }

    /// Ticks whose roll returned an error.
    #[inline(always)]
    pub fn failed_ticks(&self) -> u64 {
        self.shared.failed_ticks.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn wheel(&self) -> &Arc<Wheel> {
        &self.shared.wheel
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Debug for TimeWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWheel")
            .field("wheel", &self.shared.wheel)
            .field("source", &self.source)
            .field("queue_capacity", &self.queue_capacity)
            .field("running", &self.is_running())
            .field("failed_ticks", &self.failed_ticks())
            .finish()
    }
}

fn produce_loop(
    shared: &Shared,
    ticks: Receiver<Instant>,
    queue: Sender<Instant>,
    stop: Receiver<()>,
    capacity: usize,
) {
    loop {
        chan::select! {
            recv(ticks) -> tick => {
                let Ok(at) = tick else {
                    warn!("tick source disconnected");
                    return;
                };
                match queue.try_send(at) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        shared.backpressure.store(true, Ordering::Release);
                        shared.started.store(false, Ordering::Release);
                        error!(capacity, "tick queue full, halting tick forwarding");
                        return;
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            recv(stop) -> _ => return,
        }
    }
}

fn schedule_loop(shared: &Shared, queue: Receiver<Instant>, stop: Receiver<()>) {
    loop {
        chan::select! {
            recv(queue) -> tick => {
                if tick.is_err() {
                    return;
                }
                // Stop wins over ticks that were already queued.
                if let Err(TryRecvError::Disconnected) = stop.try_recv() {
                    return;
                }
                let _ = shared.roll();
            }
            recv(stop) -> _ => return,
        }
    }
}

fn join_all(threads: Vec<JoinHandle<()>>) {
    let current = thread::current().id();
    for handle in threads {
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() {
            error!("driver thread panicked");
        }
    }
}
