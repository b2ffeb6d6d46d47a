use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use crossbeam_channel::{self as chan, Receiver, Sender};

use crate::MIN_TICK;

/// Source of clock pulses for a [`TimeWheel`](crate::TimeWheel).
///
/// Each received value is one tick. The driver stops consuming once it is
/// stopped or the channel disconnects.
pub trait TickSource: Send + Sync + Debug {
    fn subscribe(&self) -> Receiver<Instant>;

    /// Nominal spacing between pulses, if known.
    fn period(&self) -> Option<Duration> {
        None
    }
}

/// Wall-clock pulses every `period`.
#[derive(Debug, Clone, Copy)]
pub struct IntervalTicker {
    period: Duration,
}

impl IntervalTicker {
    /// Periods below [`MIN_TICK`] are raised to it.
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(MIN_TICK),
        }
    }
}

impl TickSource for IntervalTicker {
    fn subscribe(&self) -> Receiver<Instant> {
        chan::tick(self.period)
    }

    #[inline(always)]
    fn period(&self) -> Option<Duration> {
        Some(self.period)
    }
}

/// Pulses on demand. Used to step a driver deterministically.
#[derive(Debug, Clone)]
pub struct ManualTicker {
    tx: Sender<Instant>,
    rx: Receiver<Instant>,
}

impl Default for ManualTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTicker {
    pub fn new() -> Self {
        let (tx, rx) = chan::unbounded();
        Self { tx, rx }
    }

    /// Emit one pulse. Returns false once nothing can receive it.
    pub fn tick(&self) -> bool {
        self.tx.try_send(Instant::now()).is_ok()
    }

    pub fn tick_n(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.tick()).count()
    }

    /// Pulses emitted but not yet consumed.
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }
}

impl TickSource for ManualTicker {
    fn subscribe(&self) -> Receiver<Instant> {
        self.rx.clone()
    }
}
