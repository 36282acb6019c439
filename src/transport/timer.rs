//! Throttled flush timer for the send loop.

use std::time::Duration;

use tokio::time::{self, Instant};

/// Coalesces flush requests: the first `set` arms a deadline, later calls
/// leave it untouched until the timer fires and is `unset`.
#[derive(Debug)]
pub(crate) struct ThrottleTimer {
    dur: Duration,
    deadline: Option<Instant>,
}

impl ThrottleTimer {
    pub(crate) fn new(dur: Duration) -> Self {
        Self {
            dur,
            deadline: None,
        }
    }

    pub(crate) fn set(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.dur);
        }
    }

    pub(crate) fn unset(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sleep until `deadline`, or forever if there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
