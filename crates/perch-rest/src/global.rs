//! Global request quota
//!
//! One synchronized owner for the requests-per-second ceiling shared by
//! every bucket. This is the single point of contention between otherwise
//! independent buckets.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct QuotaState {
    remaining: u32,
    reset_at: Option<Instant>,
}

/// Shared requests-per-second window.
#[derive(Debug)]
pub struct GlobalQuota {
    ceiling: u32,
    state: Mutex<QuotaState>,
}

impl GlobalQuota {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            state: Mutex::new(QuotaState {
                remaining: ceiling,
                reset_at: None,
            }),
        }
    }

    /// How long until the window reopens, if the quota is exhausted.
    pub fn exhausted_for(&self) -> Option<Duration> {
        let state = self.state.lock().expect("global quota lock poisoned");
        match state.reset_at {
            Some(reset_at) if state.remaining == 0 => {
                let now = Instant::now();
                (now < reset_at).then(|| reset_at - now)
            }
            _ => None,
        }
    }

    /// Consume one slot, or report how long until the window reopens.
    ///
    /// The elapsed-window reset, the check and the decrement all happen
    /// under one lock acquisition, so parallel buckets can never admit more
    /// than the ceiling within a window.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("global quota lock poisoned");
        let now = Instant::now();
        if state.reset_at.is_none_or(|t| t <= now) {
            state.reset_at = Some(now + Duration::from_secs(1));
            state.remaining = self.ceiling;
        }
        if state.remaining > 0 {
            state.remaining -= 1;
            return Ok(());
        }
        Err(state.reset_at.expect("window just initialized") - now)
    }

    pub fn remaining(&self) -> u32 {
        self.state
            .lock()
            .expect("global quota lock poisoned")
            .remaining
    }
}
