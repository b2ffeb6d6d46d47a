use std::thread;

use crossbeam_channel as chan;
use parking_lot::Mutex;

/// Fan-out helper for one bucket's worth of work.
///
/// Items are pushed onto a channel and pulled by up to `max_workers` scoped
/// threads, the calling thread included. [`TaskGroup::run`] only returns once
/// every item has been processed and every worker has been joined.
#[derive(Debug, Clone, Copy)]
pub struct TaskGroup {
    max_workers: usize,
}

impl TaskGroup {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    #[inline(always)]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `f` once per item and wait for the whole batch.
    ///
    /// A failing item does not stop the others. The first error observed is
    /// returned after the batch has been joined; otherwise the item count.
    pub fn run<T, E, F>(&self, items: Vec<T>, f: F) -> Result<usize, E>
    where
        T: Send,
        E: Send,
        F: Fn(T) -> Result<(), E> + Sync,
    {
        let len = items.len();
        if len == 0 {
            return Ok(0);
        }

        let first_err: Mutex<Option<E>> = Mutex::new(None);
        let work = |rx: chan::Receiver<T>| {
            for item in rx.iter() {
                if let Err(e) = f(item) {
                    let mut slot = first_err.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            }
        };

        let (tx, rx) = chan::bounded(len);
        for item in items {
            // Capacity equals the batch size and the receiver is alive.
            let _ = tx.send(item);
        }
        drop(tx);

        let helpers = self.max_workers.min(len) - 1;

        thread::scope(|s| {
            for worker_id in 0..helpers {
                let rx = rx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("timewheel-worker-{worker_id}"))
                    .spawn_scoped(s, || work(rx));

                if let Err(e) = spawned {
                    tracing::warn!(error = %e, "failed to spawn worker, running inline");
                    break;
                }
            }

            work(rx);
        });

        match first_err.into_inner() {
            Some(e) => Err(e),
            None => Ok(len),
        }
    }
}
