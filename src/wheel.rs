use std::{
    convert::Infallible,
    fmt::{self, Debug},
    num::NonZeroUsize,
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::{
    DEFAULT_BUCKETS_NUM, DEFAULT_RETRY_BACKOFF, DEFAULT_TICK, MIN_TICK,
    group::TaskGroup,
    slot::Slot,
    task::{IdGenerator, Task, TaskError, TaskId, TaskOptions, UuidGenerator},
};

#[derive(Debug, thiserror::Error)]
pub enum WheelError {
    #[error("illegal tick {0:?}: must be at least {min:?}", min = MIN_TICK)]
    IllegalTick(Duration),

    #[error("illegal buckets num {0}: must be positive")]
    IllegalBucketsNum(usize),

    #[error("illegal delay time {0:?}: exceeds the span of every wheel level")]
    IllegalDelayTime(Duration),

    #[error("illegal superior wheel: its tick {superior:?} must equal this level's span {span:?}")]
    IllegalSuperiorWheel { span: Duration, superior: Duration },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("failed to reschedule task {id}")]
    Reschedule {
        id: TaskId,
        #[source]
        source: Box<WheelError>,
    },
}

/// Construction parameters for one wheel level.
#[derive(Clone)]
pub struct WheelConfig {
    tick: Duration,
    buckets_num: usize,
    superior: Option<Arc<Wheel>>,
    retry_backoff: Duration,
    max_workers: usize,
    id_generator: Arc<dyn IdGenerator>,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            buckets_num: DEFAULT_BUCKETS_NUM,
            superior: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            id_generator: Arc::new(UuidGenerator),
        }
    }
}

impl WheelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration of one bucket. At least [`MIN_TICK`].
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn buckets_num(mut self, buckets_num: usize) -> Self {
        self.buckets_num = buckets_num;
        self
    }

    /// Coarser level that takes delays beyond this level's span.
    ///
    /// Its tick must equal `tick * buckets_num` of this level.
    pub fn superior(mut self, superior: Arc<Wheel>) -> Self {
        self.superior = Some(superior);
        self
    }

    /// Delay before a failed one-shot task is attempted again.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Upper bound on threads used to run one bucket.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }
}

impl Debug for WheelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WheelConfig")
            .field("tick", &self.tick)
            .field("buckets_num", &self.buckets_num)
            .field("superior", &self.superior.as_ref().map(|s| s.tick))
            .field("retry_backoff", &self.retry_backoff)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

/// One level of the hierarchy.
///
/// The pointer names the bucket drained by the most recent roll. A task
/// placed `k` ticks ahead lands in bucket `(pointer + k) % buckets_num` and
/// fires on the `k`-th following roll.
///
/// Delays beyond this level's span escalate to the superior wheel. The
/// offset handed up is measured from the start of the superior's current
/// tick and whatever the superior cannot express stays on the task as a
/// remainder, so demotion lands in the exact finer bucket.
///
/// # Locking
///
/// Callers placing tasks hold the clock for reading; the roll thread takes
/// it for writing only to advance the pointer, pull tasks down from the
/// superior and empty the current bucket. Locks are always taken from the
/// finest level upward. Buckets are created lazily and each [`Slot`]
/// synchronizes itself.
pub struct Wheel {
    tick: Duration,
    tick_nanos: u128,
    buckets_num: usize,
    clock: RwLock<usize>,
    buckets: Box<[OnceLock<Slot>]>,
    superior: Option<Arc<Wheel>>,
    retry_backoff: Duration,
    group: TaskGroup,
    ids: Arc<dyn IdGenerator>,
}

impl Wheel {
    pub fn new(config: WheelConfig) -> Result<Self, WheelError> {
        let WheelConfig {
            tick,
            buckets_num,
            superior,
            retry_backoff,
            max_workers,
            id_generator,
        } = config;

        if tick < MIN_TICK {
            return Err(WheelError::IllegalTick(tick));
        }
        if buckets_num == 0 {
            return Err(WheelError::IllegalBucketsNum(buckets_num));
        }

        let tick_nanos = tick.as_nanos();
        let span_nanos = tick_nanos * buckets_num as u128;

        if let Some(superior) = &superior {
            if superior.tick_nanos != span_nanos {
                return Err(WheelError::IllegalSuperiorWheel {
                    span: nanos_to_duration(span_nanos),
                    superior: superior.tick,
                });
            }
        }

        Ok(Self {
            tick,
            tick_nanos,
            buckets_num,
            clock: RwLock::new(0),
            buckets: (0..buckets_num).map(|_| OnceLock::new()).collect(),
            superior,
            retry_backoff,
            group: TaskGroup::new(max_workers),
            ids: id_generator,
        })
    }

    #[inline(always)]
    pub fn tick(&self) -> Duration {
        self.tick
    }

    #[inline(always)]
    pub fn buckets_num(&self) -> usize {
        self.buckets_num
    }

    /// `tick * buckets_num`.
    #[inline(always)]
    pub fn span(&self) -> Duration {
        nanos_to_duration(self.tick_nanos * self.buckets_num as u128)
    }

    #[inline(always)]
    pub fn pointer(&self) -> usize {
        *self.clock.read()
    }

    #[inline(always)]
    pub fn superior(&self) -> Option<&Arc<Wheel>> {
        self.superior.as_ref()
    }

    #[inline(always)]
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Schedule a task `delay` from now.
    ///
    /// The delay is floored to whole ticks and never less than one tick.
    /// An explicit `interval_ticks` option takes precedence over
    /// `target_at`, which takes precedence over `delay`.
    pub fn create_task(&self, delay: Duration, options: TaskOptions) -> Result<TaskId, WheelError> {
        let now = Instant::now();
        let (ticks, requested) =
            match (options.interval_ticks_override(), options.target_at_override()) {
                (Some(ticks), _) => (ticks, nanos_to_duration(ticks as u128 * self.tick_nanos)),
                (None, Some(at)) => {
                    let requested = at.saturating_duration_since(now);
                    (self.ticks_for(requested), requested)
                }
                (None, None) => (self.ticks_for(delay), delay),
            };
        let ticks = ticks.max(1);
        self.offset_within_horizon(ticks, requested)?;

        let mut options = options.interval_ticks(ticks);
        if options.target_at_override().is_none() {
            let target = self
                .span_of(ticks)
                .and_then(|d| now.checked_add(d))
                .ok_or(WheelError::IllegalDelayTime(requested))?;
            options = options.target_at(target);
        }

        let mut task = Task::create_with(options, self.ids.as_ref())?;
        task.set_unit(self.tick);
        self.schedule(task, ticks, requested)
    }

    /// Advance one tick and run everything that became due.
    ///
    /// Blocks until the whole bucket has been executed. Callback failures
    /// are handled by the retry policy and never reported here; an error
    /// means a task could not be put back on the wheel. Returns the number
    /// of tasks dispatched.
    pub fn roll(&self) -> Result<usize, WheelError> {
        let (bucket, due) = {
            let mut clock = self.clock.write();
            let due = self.advance(&mut clock);
            (*clock, due)
        };

        if due.is_empty() {
            return Ok(0);
        }

        let fired = due.len();
        let result = self.group.run(due, |task| self.execute(task));
        debug!(bucket, fired, level_tick = ?self.tick, "rolled bucket");
        result
    }

    /// Remove every scheduled entry with this id from this level and each
    /// superior. A failed cyclic task has two: the next cycle and its retry.
    pub fn remove_task(&self, id: &TaskId) -> bool {
        let _clock = self.clock.read();
        let mut removed = self
            .buckets
            .iter()
            .filter_map(OnceLock::get)
            .fold(false, |removed, slot| slot.delete(id) | removed);

        if let Some(superior) = &self.superior {
            removed |= superior.remove_task(id);
        }
        removed
    }

    /// Snapshot of scheduled tasks, this level first in firing order, then
    /// each superior.
    pub fn pending(&self) -> Vec<Task> {
        let mut out = Vec::new();
        {
            let clock = self.clock.read();
            for step in 1..=self.buckets_num {
                let bucket = (*clock + step) % self.buckets_num;
                if let Some(slot) = self.buckets[bucket].get() {
                    let _ = slot.traverse(|task| {
                        out.push(task.clone());
                        Ok::<_, Infallible>(())
                    });
                }
            }
        }

        if let Some(superior) = &self.superior {
            out.extend(superior.pending());
        }
        out
    }

    /// Tasks held by this level and every superior.
    pub fn len(&self) -> usize {
        self.level_len() + self.superior.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks held by this level only.
    pub fn level_len(&self) -> usize {
        self.buckets
            .iter()
            .filter_map(OnceLock::get)
            .map(Slot::len)
            .sum()
    }

    /// Longest delay accepted by this level and its superiors.
    pub fn horizon(&self) -> Duration {
        nanos_to_duration(self.horizon_nanos())
    }

    fn horizon_nanos(&self) -> u128 {
        match &self.superior {
            Some(superior) => superior.horizon_nanos(),
            None => self.tick_nanos * self.buckets_num as u128,
        }
    }

    /// `ticks` in nanoseconds, if the hierarchy can hold it from any
    /// pointer position.
    fn offset_within_horizon(&self, ticks: u64, requested: Duration) -> Result<u128, WheelError> {
        let offset = ticks as u128 * self.tick_nanos;
        if offset > self.horizon_nanos() {
            return Err(WheelError::IllegalDelayTime(requested));
        }
        Ok(offset)
    }

    fn schedule(&self, task: Task, ticks: u64, requested: Duration) -> Result<TaskId, WheelError> {
        let offset = self.offset_within_horizon(ticks, requested)?;
        self.place(task, offset, requested)
    }

    /// Place `task` `offset` nanoseconds past the start of the current tick.
    fn place(&self, mut task: Task, offset: u128, requested: Duration) -> Result<TaskId, WheelError> {
        let clock = self.clock.read();
        let ticks = offset / self.tick_nanos;

        if ticks <= self.buckets_num as u128 {
            task.set_remainder(nanos_to_duration(offset % self.tick_nanos));
            let bucket = (*clock + ticks as usize) % self.buckets_num;
            let id = self.slot(bucket).add(task);
            trace!(task_id = %id, bucket, level_tick = ?self.tick, "task placed");
            return Ok(id);
        }

        match &self.superior {
            Some(superior) => {
                superior.place(task, offset + *clock as u128 * self.tick_nanos, requested)
            }
            None => Err(WheelError::IllegalDelayTime(requested)),
        }
    }

    /// Move the pointer one bucket and empty it. Runs under the write lock.
    ///
    /// On wrap the superior advances first and its due bucket is spread over
    /// this level, so tasks landing in the new current bucket are returned
    /// in the same pass.
    fn advance(&self, clock: &mut usize) -> Vec<Task> {
        *clock = (*clock + 1) % self.buckets_num;

        if *clock == 0 {
            if let Some(superior) = &self.superior {
                let demoted = {
                    let mut superior_clock = superior.clock.write();
                    superior.advance(&mut superior_clock)
                };

                if !demoted.is_empty() {
                    trace!(count = demoted.len(), level_tick = ?self.tick, "demoting tasks");
                }
                for task in demoted {
                    self.demote(*clock, task);
                }
            }
        }

        self.buckets[*clock].get().map(Slot::drain).unwrap_or_default()
    }

    fn demote(&self, pointer: usize, mut task: Task) {
        let offset = task.remainder().as_nanos();
        let ticks = offset / self.tick_nanos;
        debug_assert!(
            ticks < self.buckets_num as u128,
            "remainder {:?} exceeds level span",
            task.remainder()
        );

        task.set_remainder(nanos_to_duration(offset % self.tick_nanos));
        let bucket = (pointer + ticks as usize) % self.buckets_num;
        self.slot(bucket).add(task);
    }

    fn execute(&self, task: Task) -> Result<(), WheelError> {
        let mut outcome = Ok(());

        // Armed before the callback so a slow callback cannot delay it.
        if task.is_cycle() {
            if let Err(e) = self.rearm(&task) {
                error!(task_id = %task.id(), error = %e, "failed to re-arm cyclic task");
                outcome = Err(WheelError::Reschedule {
                    id: task.id().clone(),
                    source: Box::new(e),
                });
            }
        }

        match task.invoke() {
            Ok(()) => trace!(task_id = %task.id(), "task executed"),
            Err(e) => {
                warn!(
                    task_id = %task.id(),
                    cycle = task.is_cycle(),
                    retry = task.retry_count() + 1,
                    backoff = ?self.retry_backoff,
                    error = %e,
                    "task failed, scheduling retry"
                );
                if let Err(e) = self.retry(&task) {
                    error!(task_id = %task.id(), error = %e, "failed to schedule retry");
                    if outcome.is_ok() {
                        outcome = Err(WheelError::Reschedule {
                            id: task.id().clone(),
                            source: Box::new(e),
                        });
                    }
                }
            }
        }

        outcome
    }

    fn rearm(&self, task: &Task) -> Result<TaskId, WheelError> {
        let unit = match task.unit().as_nanos() {
            0 => self.tick_nanos,
            n => n,
        };
        let period = task.interval_ticks() as u128 * unit;
        let ticks = self.ticks_for_nanos(period).max(1);

        let target = self.target_after(ticks)?;
        let next = task.copy_with_overlay(TaskOptions::new().bump_executions().target_at(target))?;
        self.schedule(next, ticks, nanos_to_duration(period))
    }

    /// One-shot copy of `task` due after the backoff. The copy of a cyclic
    /// task does not cycle; the re-armed original already does.
    fn retry(&self, task: &Task) -> Result<TaskId, WheelError> {
        let ticks = self.ticks_for(self.retry_backoff).max(1);
        let now = Instant::now();
        let target = self.target_after(ticks)?;

        let mut next = task.copy_with_overlay(
            TaskOptions::new()
                .retry()
                .retry_at(now)
                .interval_ticks(ticks)
                .target_at(target),
        )?;
        next.set_unit(self.tick);
        next.clear_cycle();
        self.schedule(next, ticks, self.retry_backoff)
    }

    fn target_after(&self, ticks: u64) -> Result<Instant, WheelError> {
        let delay = self.span_of(ticks).ok_or(WheelError::IllegalDelayTime(Duration::MAX))?;
        Instant::now()
            .checked_add(delay)
            .ok_or(WheelError::IllegalDelayTime(delay))
    }

    #[inline(always)]
    fn slot(&self, bucket: usize) -> &Slot {
        self.buckets[bucket].get_or_init(Slot::new)
    }

    #[inline(always)]
    fn ticks_for(&self, delay: Duration) -> u64 {
        self.ticks_for_nanos(delay.as_nanos())
    }

    #[inline(always)]
    fn ticks_for_nanos(&self, nanos: u128) -> u64 {
        u64::try_from(nanos / self.tick_nanos).unwrap_or(u64::MAX)
    }

    #[inline(always)]
    fn span_of(&self, ticks: u64) -> Option<Duration> {
        let nanos = u64::try_from(ticks as u128 * self.tick_nanos).ok()?;
        Some(Duration::from_nanos(nanos))
    }
}

impl Debug for Wheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wheel")
            .field("tick", &self.tick)
            .field("buckets_num", &self.buckets_num)
            .field("pointer", &self.pointer())
            .field("level_len", &self.level_len())
            .field("superior", &self.superior)
            .finish_non_exhaustive()
    }
}

#[inline(always)]
fn nanos_to_duration(nanos: u128) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
