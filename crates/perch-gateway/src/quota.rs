//! Outbound send quota
//!
//! One synchronized window for every outbound gateway command. Exhausted
//! senders suspend until the window reopens; nothing is dropped. Independent
//! of the REST quotas.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct WindowState {
    remaining: u32,
    reset_at: Option<Instant>,
}

/// Sliding-window limiter for outbound gateway commands.
#[derive(Debug)]
pub struct SendQuota {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl SendQuota {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                remaining: limit,
                reset_at: None,
            }),
        }
    }

    /// Take one send slot, waiting out the window when it is exhausted.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("send quota lock poisoned");
                let now = Instant::now();
                if state.reset_at.is_none_or(|t| t <= now) {
                    state.reset_at = Some(now + self.window);
                    state.remaining = self.limit;
                }
                if state.remaining > 0 {
                    state.remaining -= 1;
                    return;
                }
                state.reset_at.expect("window just initialized") - now
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub fn remaining(&self) -> u32 {
        self.state
            .lock()
            .expect("send quota lock poisoned")
            .remaining
    }
}
