use std::{
    any::Any,
    fmt::{self, Debug, Display},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

/// Error returned by a failing callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type CallbackResult = Result<(), CallbackError>;

/// Caller-owned unit of work. Zero arguments in, success or failure out.
pub type Callback = Arc<dyn Fn() -> CallbackResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task has no callback")]
    MissingCallback,
}

/// Raised in place of a callback result when the callback panics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("callback panicked: {0}")]
pub struct CallbackPanic(String);

impl CallbackPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown payload".to_string()
        };
        Self(msg)
    }
}

/// Opaque task identifier. Stable across reschedules of the same entry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[inline(always)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Source of fresh task identifiers.
///
/// Every call must return an id that is unique for the lifetime of the
/// process. The wheel never checks for collisions.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> TaskId;
}

/// Random (v4) UUID ids. The default generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> TaskId {
        TaskId::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Recognized task options.
///
/// Used both to build a task and as an overlay on an existing one. When
/// overlaid, set fields replace, markers are sticky, and bumps accumulate.
#[derive(Clone, Default)]
pub struct TaskOptions {
    id: Option<TaskId>,
    interval_ticks: Option<u64>,
    target_at: Option<Instant>,
    callback: Option<Callback>,
    cycle: bool,
    retries: u32,
    retry_at: Option<Instant>,
    executions: u64,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the generated id.
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the delay-to-tick conversion.
    pub fn interval_ticks(mut self, ticks: u64) -> Self {
        self.interval_ticks = Some(ticks);
        self
    }

    /// Absolute fire time; the delay is derived from it.
    pub fn target_at(mut self, at: Instant) -> Self {
        self.target_at = Some(at);
        self
    }

    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn() -> CallbackResult + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(f));
        self
    }

    pub fn shared_callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Mark the task as self re-arming.
    pub fn cycle(mut self) -> Self {
        self.cycle = true;
        self
    }

    /// Mark the task as a reschedule after failure. Each call adds one retry.
    pub fn retry(mut self) -> Self {
        self.retries += 1;
        self
    }

    pub fn retry_at(mut self, at: Instant) -> Self {
        self.retry_at = Some(at);
        self
    }

    /// Bump the cyclic fire counter by one.
    pub fn bump_executions(mut self) -> Self {
        self.executions += 1;
        self
    }

    /// Apply `other` on top of `self`.
    pub fn overlay(mut self, other: TaskOptions) -> Self {
        if other.id.is_some() {
            self.id = other.id;
        }
        if other.interval_ticks.is_some() {
            self.interval_ticks = other.interval_ticks;
        }
        if other.target_at.is_some() {
            self.target_at = other.target_at;
        }
        if other.callback.is_some() {
            self.callback = other.callback;
        }
        if other.retry_at.is_some() {
            self.retry_at = other.retry_at;
        }
        self.cycle |= other.cycle;
        self.retries += other.retries;
        self.executions += other.executions;
        self
    }

    #[inline(always)]
    pub(crate) fn interval_ticks_override(&self) -> Option<u64> {
        self.interval_ticks
    }

    #[inline(always)]
    pub(crate) fn target_at_override(&self) -> Option<Instant> {
        self.target_at
    }
}

impl Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("id", &self.id)
            .field("interval_ticks", &self.interval_ticks)
            .field("target_at", &self.target_at)
            .field("callback", &self.callback.is_some())
            .field("cycle", &self.cycle)
            .field("retries", &self.retries)
            .field("retry_at", &self.retry_at)
            .field("executions", &self.executions)
            .finish()
    }
}

/// A scheduled entry.
///
/// Immutable once built: rescheduling goes through
/// [`Task::copy_with_overlay`], which produces an independent value and
/// leaves `self` usable by anyone still holding it.
#[derive(Clone)]
pub struct Task {
    id: TaskId,
    created_at: Instant,
    target_at: Instant,
    interval_ticks: u64,
    cycle: bool,
    execution_count: u64,
    retry_count: u32,
    last_retry_at: Option<Instant>,
    callback: Callback,
    // Tick duration `interval_ticks` is counted in. Zero until a wheel
    // stamps it.
    unit: Duration,
    // Sub-level offset still to be resolved when the task is demoted to a
    // finer wheel. Always zero at the finest level.
    remainder: Duration,
}

impl Task {
    pub fn create(options: TaskOptions) -> Result<Self, TaskError> {
        Self::create_with(options, &UuidGenerator)
    }

    pub fn create_with(options: TaskOptions, ids: &dyn IdGenerator) -> Result<Self, TaskError> {
        let TaskOptions {
            id,
            interval_ticks,
            target_at,
            callback,
            cycle,
            retries,
            retry_at,
            executions,
        } = options;

        let callback = callback.ok_or(TaskError::MissingCallback)?;
        let created_at = Instant::now();

        Ok(Self {
            id: id.unwrap_or_else(|| ids.generate()),
            created_at,
            target_at: target_at.unwrap_or(created_at),
            interval_ticks: interval_ticks.unwrap_or(0),
            cycle,
            execution_count: executions,
            retry_count: retries,
            last_retry_at: retry_at,
            callback,
            unit: Duration::ZERO,
            remainder: Duration::ZERO,
        })
    }

    /// Build the next incarnation of this schedule entry.
    ///
    /// The overlay is applied to a fresh option set derived from `self`; the
    /// id is kept unless the overlay replaces it.
    pub fn copy_with_overlay(&self, overlay: TaskOptions) -> Result<Self, TaskError> {
        let mut base = TaskOptions::new()
            .id(self.id.clone())
            .interval_ticks(self.interval_ticks)
            .target_at(self.target_at)
            .shared_callback(Arc::clone(&self.callback));
        base.cycle = self.cycle;
        base.retries = self.retry_count;
        base.retry_at = self.last_retry_at;
        base.executions = self.execution_count;

        let mut task = Self::create(base.overlay(overlay))?;
        task.unit = self.unit;
        Ok(task)
    }

    #[inline(always)]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// `target_at - created_at`, zero if the target is in the past.
    #[inline(always)]
    pub fn delay(&self) -> Duration {
        self.target_at.saturating_duration_since(self.created_at)
    }

    #[inline(always)]
    pub fn is_cycle(&self) -> bool {
        self.cycle
    }

    /// Delay in ticks of the level that created the task, see
    /// [`Task::unit`]. A task that escalated to a coarser level keeps this
    /// count, so its cyclic period survives the trip.
    #[inline(always)]
    pub fn interval_ticks(&self) -> u64 {
        self.interval_ticks
    }

    #[inline(always)]
    pub fn execute_fn(&self) -> &Callback {
        &self.callback
    }

    #[inline(always)]
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    #[inline(always)]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[inline(always)]
    pub fn last_retry_at(&self) -> Option<Instant> {
        self.last_retry_at
    }

    #[inline(always)]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[inline(always)]
    pub fn target_at(&self) -> Instant {
        self.target_at
    }

    /// Run the callback. A panic is reported as a failure.
    pub(crate) fn invoke(&self) -> CallbackResult {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.callback)())) {
            Ok(result) => result,
            Err(payload) => Err(CallbackPanic::from_payload(payload).into()),
        }
    }

    /// Tick of the level `interval_ticks` is counted in. Zero until the
    /// task is placed on a wheel.
    #[inline(always)]
    pub fn unit(&self) -> Duration {
        self.unit
    }

    #[inline(always)]
    pub(crate) fn clear_cycle(&mut self) {
        self.cycle = false;
    }

    #[inline(always)]
    pub(crate) fn set_unit(&mut self, unit: Duration) {
        self.unit = unit;
    }

    #[inline(always)]
    pub(crate) fn remainder(&self) -> Duration {
        self.remainder
    }

    #[inline(always)]
    pub(crate) fn set_remainder(&mut self, remainder: Duration) {
        self.remainder = remainder;
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("delay", &self.delay())
            .field("interval_ticks", &self.interval_ticks)
            .field("cycle", &self.cycle)
            .field("execution_count", &self.execution_count)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> TaskOptions {
        TaskOptions::new().callback(|| Ok(()))
    }

    // ==================== Construction ====================

    #[test]
    fn test_create_requires_callback() {
        let err = Task::create(TaskOptions::new().interval_ticks(3)).unwrap_err();
        assert_eq!(err, TaskError::MissingCallback);
    }

    #[test]
    fn test_create_defaults() {
        let task = Task::create(noop()).unwrap();

        assert!(!task.id().as_str().is_empty());
        assert!(!task.is_cycle());
        assert_eq!(task.interval_ticks(), 0);
        assert_eq!(task.execution_count(), 0);
        assert_eq!(task.retry_count(), 0);
        assert!(task.last_retry_at().is_none());
        assert_eq!(task.delay(), Duration::ZERO);
    }

    #[test]
    fn test_generated_ids_unique() {
        let a = Task::create(noop()).unwrap();
        let b = Task::create(noop()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_explicit_id() {
        let task = Task::create(noop().id("order-42")).unwrap();
        assert_eq!(task.id().as_str(), "order-42");
        assert_eq!(task.id().to_string(), "order-42");
    }

    #[test]
    fn test_custom_generator() {
        struct Fixed;
        impl IdGenerator for Fixed {
            fn generate(&self) -> TaskId {
                TaskId::from("fixed")
            }
        }

        let task = Task::create_with(noop(), &Fixed).unwrap();
        assert_eq!(task.id().as_str(), "fixed");
    }

    #[test]
    fn test_delay_from_target() {
        let target = Instant::now() + Duration::from_secs(5);
        let task = Task::create(noop().target_at(target)).unwrap();

        assert!(task.delay() <= Duration::from_secs(5));
        assert!(task.delay() > Duration::from_secs(4));
    }

    #[test]
    fn test_delay_past_target_is_zero() {
        let target = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        let task = Task::create(noop().target_at(target)).unwrap();
        assert_eq!(task.delay(), Duration::ZERO);
    }

    #[test]
    fn test_markers_and_bumps() {
        let at = Instant::now();
        let task = Task::create(
            noop()
                .cycle()
                .retry()
                .retry()
                .retry_at(at)
                .bump_executions()
                .interval_ticks(7),
        )
        .unwrap();

        assert!(task.is_cycle());
        assert_eq!(task.retry_count(), 2);
        assert_eq!(task.last_retry_at(), Some(at));
        assert_eq!(task.execution_count(), 1);
        assert_eq!(task.interval_ticks(), 7);
    }

    // ==================== Overlay ====================

    #[test]
    fn test_overlay_rules() {
        let base = TaskOptions::new().interval_ticks(1).retry().cycle();
        let merged = base.overlay(TaskOptions::new().interval_ticks(9).retry());

        assert_eq!(merged.interval_ticks_override(), Some(9));
        assert_eq!(merged.retries, 2);
        assert!(merged.cycle);
        assert!(merged.id.is_none());
    }

    #[test]
    fn test_copy_keeps_id_and_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let task = Task::create(TaskOptions::new().callback(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        let copy = task.copy_with_overlay(TaskOptions::new()).unwrap();
        assert_eq!(copy.id(), task.id());

        copy.invoke().unwrap();
        task.invoke().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_copy_does_not_touch_original() {
        let task = Task::create(noop().cycle().interval_ticks(4)).unwrap();
        let at = Instant::now();

        let copy = task
            .copy_with_overlay(TaskOptions::new().retry().retry_at(at).bump_executions())
            .unwrap();

        assert_eq!(copy.retry_count(), 1);
        assert_eq!(copy.last_retry_at(), Some(at));
        assert_eq!(copy.execution_count(), 1);
        assert_eq!(copy.interval_ticks(), 4);
        assert!(copy.is_cycle());

        assert_eq!(task.retry_count(), 0);
        assert!(task.last_retry_at().is_none());
        assert_eq!(task.execution_count(), 0);
    }

    #[test]
    fn test_copy_chain_accumulates() {
        let mut task = Task::create(noop().cycle()).unwrap();
        for _ in 0..5 {
            task = task
                .copy_with_overlay(TaskOptions::new().bump_executions())
                .unwrap();
        }
        assert_eq!(task.execution_count(), 5);
    }

    #[test]
    fn test_copy_resets_remainder_keeps_unit() {
        let mut task = Task::create(noop()).unwrap();
        task.set_remainder(Duration::from_secs(3));
        task.set_unit(Duration::from_secs(1));

        let copy = task.copy_with_overlay(TaskOptions::new()).unwrap();
        assert_eq!(copy.remainder(), Duration::ZERO);
        assert_eq!(copy.unit(), Duration::from_secs(1));
        assert_eq!(task.remainder(), Duration::from_secs(3));
    }

    // ==================== Invoke ====================

    #[test]
    fn test_invoke_failure() {
        let task = Task::create(TaskOptions::new().callback(|| Err("boom".into()))).unwrap();
        let err = task.invoke().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_invoke_catches_panic() {
        let task = Task::create(TaskOptions::new().callback(|| panic!("kaboom"))).unwrap();
        let err = task.invoke().unwrap_err();
        assert_eq!(err.to_string(), "callback panicked: kaboom");
    }
}
