//! Hierarchical timing-wheel scheduler for deferred and periodic tasks.
//!
//! A [`Wheel`] is one level of a hierarchy: `buckets_num` buckets of `tick`
//! each. Delays past a level's span escalate to its superior, whose tick
//! equals that span, and are pulled back down as the finer level wraps.
//! [`TimeWheel`] drives the finest level from a [`TickSource`].
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use timewheel::{TaskOptions, TimeWheel, Wheel, WheelConfig};
//!
//! let minutes = Arc::new(
//!     Wheel::new(WheelConfig::new().tick(Duration::from_secs(60)).buckets_num(60)).unwrap(),
//! );
//! let seconds = Wheel::new(WheelConfig::new().superior(minutes)).unwrap();
//!
//! let driver = TimeWheel::from_wheel(seconds);
//! driver.start().unwrap();
//! driver
//!     .add_task(Duration::from_secs(90), || Ok(()), TaskOptions::new())
//!     .unwrap();
//! ```

use std::time::Duration;

mod driver;
mod group;
mod slot;
mod task;
mod ticker;
mod wheel;

pub use driver::{DriverConfig, DriverError, ErrorHook, TimeWheel};
pub use group::TaskGroup;
pub use slot::Slot;
pub use task::{
    Callback, CallbackError, CallbackPanic, CallbackResult, IdGenerator, Task, TaskError, TaskId,
    TaskOptions, UuidGenerator,
};
pub use ticker::{IntervalTicker, ManualTicker, TickSource};
pub use wheel::{Wheel, WheelConfig, WheelError};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_BUCKETS_NUM: usize = 60;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Smallest accepted wheel tick.
pub const MIN_TICK: Duration = Duration::from_micros(1);
