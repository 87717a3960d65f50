//! Timer facade for scheduling one-shot work and the per-session update
//! tick.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::Session;

/// One-shot task scheduler backed by the tokio timer. Cloning shares the
/// same cancellation scope; `stop` cancels everything still pending.
#[derive(Clone)]
pub struct TimingWheel {
    token: CancellationToken,
}

impl TimingWheel {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Run `task` after `delay`, unless the wheel is stopped first.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task(),
                _ = token.cancelled() => {}
            }
        });
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Default for TimingWheel {
    fn default() -> Self {
        Self::new()
    }
}

/// Arm the recurring update tick for a session.
///
/// Each firing submits `Session::update` onto the session's executor and
/// re-arms at `session.interval()`. The chain stops when the session closes
/// or its executor goes away; a dead executor also closes the session.
pub fn schedule_update(wheel: &TimingWheel, session: Arc<Session>) {
    let delay = session.interval();
    let wheel_next = wheel.clone();
    wheel.schedule(delay, move || {
        if session.is_closed() {
            debug!(conv = session.conv(), "session closed, stopping update tick");
            return;
        }
        let exec = session.executor().clone();
        if !exec.is_active() {
            session.close(false);
            return;
        }
        let tick_session = session.clone();
        if exec.submit(move || tick_session.update()).is_err() {
            session.close(false);
            return;
        }
        schedule_update(&wheel_next, session);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn scheduled_task_fires() {
        let wheel = TimingWheel::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        wheel.schedule(Duration::from_millis(5), move || {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stopped_wheel_drops_pending_tasks() {
        let wheel = TimingWheel::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        wheel.schedule(Duration::from_millis(20), move || {
            flag.store(true, Ordering::SeqCst);
        });
        wheel.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
