//! Deferred callbacks
//!
//! A thin pool over the runtime timer wheel: `add_timer` arms a one-shot
//! callback, `cancel` disarms it by handle. A zero duration runs the thunk
//! inline and never registers anything.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::aid::Aid;

/// Handle returned by [`TimerTools::add_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    id: u64,
}

impl Timer {
    /// Handle of a thunk that ran inline; cancelling it is a no-op.
    pub const INLINE: Timer = Timer { id: 0 };
}

#[derive(Default)]
struct TimerPool {
    timers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct TimerTools {
    pool: Arc<TimerPool>,
}

impl TimerTools {
    pub fn initialize() -> Self {
        Self::default()
    }

    /// Arms `thunk` to run once after `after`. The `aid` identifies the
    /// target actor in logs only.
    pub fn add_timer<F>(&self, after: Duration, aid: &Aid, thunk: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        if after.is_zero() {
            thunk();
            return Timer::INLINE;
        }
        let id = self.pool.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(timer = id, aid = %aid, ?after, "timer armed");
        let pool = self.pool.clone();
        let mut timers = self.pool.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // deregister first so a racing cancel after expiry reports false
            pool.timers.lock().remove(&id);
            thunk();
        });
        timers.insert(id, handle);
        Timer { id }
    }

    /// Disarms a pending timer. Returns whether anything was removed.
    pub fn cancel(&self, timer: Timer) -> bool {
        if timer.id == 0 {
            return false;
        }
        match self.pool.timers.lock().remove(&timer.id) {
            Some(handle) => {
                handle.abort();
                debug!(timer = timer.id, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.pool.timers.lock().len()
    }

    /// Disarms everything. Idempotent.
    pub fn finalize(&self) {
        let timers = std::mem::take(&mut *self.pool.timers.lock());
        for (_, handle) in timers {
            handle.abort();
        }
    }
}
