// src/core/bgp/timers.rs

//! Soft-restartable BGP session timers. Each timer is a `tokio::time::Sleep`
//! stored in an `Option` and replaced wholesale on reset, matching
//! `reactor.callLater(...).cancel()`'s "drop and re-arm" semantics rather
//! than an external cancellation-token scheme.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

pub const DEFAULT_CONNECT_RETRY_SECS: u64 = 30;
pub const DEFAULT_HOLD_SECS: u64 = 180;
pub const DEFAULT_LARGE_HOLD_SECS: u64 = 240;
pub const DEFAULT_DELAY_OPEN_SECS: u64 = 30;
pub const DEFAULT_IDLE_HOLD_SECS: u64 = 30;

/// A single cancel/re-arm timer slot.
#[derive(Default)]
pub struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn arm(&mut self, duration: Duration) {
        self.sleep = Some(Box::pin(sleep(duration)));
    }

    pub fn arm_at(&mut self, deadline: Instant) {
        self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline)));
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }
}

impl Future for Timer {
    type Output = ();

    /// Pending forever while disarmed, so this can sit inside a `tokio::select!`
    /// branch unconditionally without an extra `if self.is_armed()` guard at
    /// every call site.
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.sleep.as_mut() {
            Some(s) => {
                let poll = s.as_mut().poll(cx);
                if poll.is_ready() {
                    self.sleep = None;
                }
                poll
            }
            None => Poll::Pending,
        }
    }
}

/// The full timer set for one BGP FSM instance.
#[derive(Default)]
pub struct TimerSet {
    pub connect_retry: Timer,
    pub hold: Timer,
    pub keepalive: Timer,
    pub delay_open: Timer,
    pub idle_hold: Timer,

    pub connect_retry_time: Duration,
    pub hold_time: Duration,
    pub keepalive_time: Duration,
    pub delay_open_time: Duration,
    pub idle_hold_time: Duration,
}

impl TimerSet {
    pub fn with_defaults() -> Self {
        Self {
            connect_retry_time: Duration::from_secs(DEFAULT_CONNECT_RETRY_SECS),
            hold_time: Duration::from_secs(DEFAULT_HOLD_SECS),
            keepalive_time: Duration::from_secs(DEFAULT_HOLD_SECS / 3),
            delay_open_time: Duration::from_secs(DEFAULT_DELAY_OPEN_SECS),
            idle_hold_time: Duration::from_secs(DEFAULT_IDLE_HOLD_SECS),
            ..Default::default()
        }
    }

    /// Applies a negotiated hold time, deriving keepalive = holdTime/3 and
    /// arming both, or disarming both when holdTime is 0 (hold disabled).
    pub fn negotiate_hold_time(&mut self, negotiated: u16) {
        self.hold_time = Duration::from_secs(negotiated as u64);
        if negotiated == 0 {
            self.hold.cancel();
            self.keepalive.cancel();
            return;
        }
        self.keepalive_time = Duration::from_secs(negotiated as u64 / 3);
        self.hold.arm(self.hold_time);
        self.keepalive.arm(self.keepalive_time);
    }

    pub fn cancel_all(&mut self) {
        self.connect_retry.cancel();
        self.hold.cancel();
        self.keepalive.cancel();
        self.delay_open.cancel();
        self.idle_hold.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disarmed_timer_never_resolves_when_raced_against_a_sleep() {
        let mut t = Timer::default();
        assert!(!t.is_armed());
        tokio::select! {
            _ = &mut t => panic!("disarmed timer must not fire"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test]
    async fn armed_timer_fires_and_then_reports_disarmed() {
        let mut t = Timer::default();
        t.arm(Duration::from_millis(5));
        (&mut t).await;
        assert!(!t.is_armed());
    }

    #[tokio::test]
    async fn negotiate_hold_time_zero_disarms_both_timers() {
        let mut timers = TimerSet::with_defaults();
        timers.hold.arm(Duration::from_secs(1));
        timers.negotiate_hold_time(0);
        assert!(!timers.hold.is_armed());
        assert!(!timers.keepalive.is_armed());
    }

    #[tokio::test]
    async fn negotiate_hold_time_derives_keepalive_as_a_third() {
        let mut timers = TimerSet::with_defaults();
        timers.negotiate_hold_time(90);
        assert_eq!(timers.keepalive_time, Duration::from_secs(30));
    }
}
