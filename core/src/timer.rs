//! Countdown Timer
//!
//! Cancellable single-shot delayed callbacks used for connect, close,
//! retry and ping timeouts.

use std::time::Duration;
use tokio::task::JoinHandle;

/// Callback run when a countdown elapses
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait CountdownTimer: Send {
    /// Schedule `on_timeout` after `delay`, replacing any armed countdown
    fn start(&mut self, delay: Duration, on_timeout: TimeoutCallback);

    /// Cancel the armed countdown. A no-op when nothing is armed.
    fn abort(&mut self);

    fn is_armed(&self) -> bool;
}

/// Creates timers for the connection manager
pub trait TimerFactory: Send + Sync {
    fn create(&self, name: &'static str) -> Box<dyn CountdownTimer>;
}

/// Countdown backed by a spawned tokio task
pub struct TokioCountdownTimer {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TokioCountdownTimer {
    pub fn new(name: &'static str) -> Self {
        TokioCountdownTimer { name, handle: None }
    }
}

impl CountdownTimer for TokioCountdownTimer {
    fn start(&mut self, delay: Duration, on_timeout: TimeoutCallback) {
        self.abort();
        let name = self.name;
        tracing::trace!("Timer {} armed for {:?}", name, delay);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::trace!("Timer {} elapsed", name);
            on_timeout();
        }));
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                tracing::trace!("Timer {} aborted", self.name);
            }
            handle.abort();
        }
    }

    fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TokioCountdownTimer {
    fn drop(&mut self) {
        self.abort();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimerFactory;

impl TimerFactory for TokioTimerFactory {
    fn create(&self, name: &'static str) -> Box<dyn CountdownTimer> {
        Box::new(TokioCountdownTimer::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> TimeoutCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = TokioCountdownTimer::new("test");
        timer.start(Duration::from_secs(5), counter_callback(&fired));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_prevents_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = TokioCountdownTimer::new("test");
        timer.start(Duration::from_secs(1), counter_callback(&fired));
        timer.abort();
        timer.abort();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_schedule() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = TokioCountdownTimer::new("test");
        timer.start(Duration::from_secs(1), counter_callback(&fired));
        timer.start(Duration::from_secs(3), counter_callback(&fired));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_without_start_is_noop() {
        let mut timer = TokioCountdownTimer::new("idle");
        timer.abort();
        assert!(!timer.is_armed());
    }
}
