//! Cancellable delayed restart
//!
//! After a successful update the device may restart after a grace period, so
//! an operator can still back out. The restart is a deadline polled by
//! [`RestartScheduler::tick`] (or awaited with [`RestartScheduler::run`]) and
//! can be cancelled through its [`RestartHandle`] until it fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use crate::config::OtaConfig;

/// Default grace period before a scheduled restart.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Platform restart action
pub trait Restart {
    /// Restart the device.
    fn restart(&mut self);
}

impl<T: FnMut()> Restart for T {
    fn restart(&mut self) {
        self()
    }
}

#[derive(Debug, Default)]
struct HandleInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellation handle for a scheduled restart
#[derive(Debug, Clone, Default)]
pub struct RestartHandle {
    inner: Arc<HandleInner>,
}

impl RestartHandle {
    /// Cancel the restart. Has no effect once it has fired.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            info!("Scheduled restart cancelled");
        }
        self.inner.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

/// Scheduler for a single delayed restart
#[derive(Debug)]
pub struct RestartScheduler {
    deadline: Instant,
    handle: RestartHandle,
    fired: bool,
}

impl RestartScheduler {
    /// Schedule a restart `delay` from now.
    pub fn schedule(delay: Duration) -> (Self, RestartHandle) {
        Self::schedule_at(Instant::now(), delay)
    }

    /// Schedule a restart `delay` after `now`.
    pub fn schedule_at(now: Instant, delay: Duration) -> (Self, RestartHandle) {
        let handle = RestartHandle::default();
        info!(delay_secs = delay.as_secs_f64(), "Restart scheduled");
        let scheduler = Self {
            deadline: now + delay,
            handle: handle.clone(),
            fired: false,
        };
        (scheduler, handle)
    }

    /// Schedule the post-close restart if the configuration asks for one.
    pub fn after_close(config: &OtaConfig) -> Option<(Self, RestartHandle)> {
        config
            .restart_on_close
            .then(|| Self::schedule(config.restart_delay()))
    }

    /// When the restart fires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Whether the restart can still fire.
    pub fn is_armed(&self) -> bool {
        !self.fired && !self.handle.is_cancelled()
    }

    /// Fire the restart if the deadline has passed and it was not cancelled.
    ///
    /// Returns `true` exactly once, on the tick that fires.
    pub fn tick(&mut self, now: Instant, restart: &mut impl Restart) -> bool {
        if !self.is_armed() || now < self.deadline {
            return false;
        }
        self.fired = true;
        info!("Restarting");
        restart.restart();
        true
    }

    /// Wait for the deadline, then fire. Returns early with `false` when the
    /// restart is cancelled.
    pub async fn run(mut self, mut restart: impl Restart) -> bool {
        let handle = self.handle.clone();
        let cancelled = handle.inner.notify.notified();
        tokio::pin!(cancelled);
        if !self.is_armed() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep_until(self.deadline) => {}
            () = &mut cancelled => return false,
        }
        self.tick(Instant::now(), &mut restart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_fires_once_after_deadline() {
        let start = Instant::now();
        let (mut scheduler, _handle) = RestartScheduler::schedule_at(start, Duration::from_secs(10));
        let mut count = 0;
        let mut restart = || count += 1;

        assert!(!scheduler.tick(start + Duration::from_secs(9), &mut restart));
        assert!(scheduler.tick(start + Duration::from_secs(10), &mut restart));
        assert!(!scheduler.tick(start + Duration::from_secs(11), &mut restart));
        assert!(!scheduler.is_armed());
        assert_eq!(count, 1);
    }

    #[test]
    fn test_cancelled_restart_is_inert() {
        let start = Instant::now();
        let (mut scheduler, handle) = RestartScheduler::schedule_at(start, Duration::from_secs(1));
        let mut fired = false;
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(!scheduler.tick(start + Duration::from_secs(5), &mut || fired = true));
        assert!(!fired);
    }

    #[test]
    fn test_after_close_follows_config() {
        assert!(RestartScheduler::after_close(&OtaConfig::default()).is_none());
        let config = OtaConfig {
            restart_on_close: true,
            restart_delay_ms: 2_000,
            ..OtaConfig::default()
        };
        let scheduled = RestartScheduler::after_close(&config);
        assert!(scheduled.is_some_and(|(s, _)| s.remaining(Instant::now()) <= Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_after_delay() {
        let (scheduler, _handle) = RestartScheduler::schedule(DEFAULT_RESTART_DELAY);
        let start = Instant::now();
        let mut fired = 0;
        let result = scheduler.run(|| fired += 1).await;
        assert!(result);
        assert_eq!(fired, 1);
        assert!(start.elapsed() >= DEFAULT_RESTART_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_zero_delay_fires_once() {
        let (scheduler, handle) = RestartScheduler::schedule(Duration::ZERO);
        let mut fired = 0;
        assert!(scheduler.run(|| fired += 1).await);
        assert_eq!(fired, 1);
        // Cancelling after the restart fired changes nothing.
        handle.cancel();
        assert_eq!(fired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_when_cancelled() {
        let (scheduler, handle) = RestartScheduler::schedule(DEFAULT_RESTART_DELAY);
        let task = tokio::spawn(scheduler.run(|| {}));
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.cancel();
        let fired = task.await;
        assert!(matches!(fired, Ok(false)));
    }
}
