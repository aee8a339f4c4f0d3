//! Debounce timer for the pending save queue.

use std::time::Duration;
use tokio::time::Instant;

/// Trailing-edge debounce: each touch pushes the deadline out by `delay`.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Restart the timer after a mutation.
    pub fn touch(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Fire after `delay` unless already due sooner.
    pub fn schedule_in(&mut self, delay: Duration) {
        let at = Instant::now() + delay;
        self.deadline = Some(self.deadline.map_or(at, |current| current.min(at)));
    }

    /// Make the timer due immediately.
    pub fn fire_now(&mut self) {
        self.deadline = Some(Instant::now());
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sleep until `deadline`; never completes without one.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_pushes_deadline() {
        let mut debounce = Debounce::new(Duration::from_millis(16));
        assert!(debounce.deadline().is_none());

        debounce.touch();
        let first = debounce.deadline().unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        debounce.touch();
        assert!(debounce.deadline().unwrap() > first);

        debounce.clear();
        assert!(debounce.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_in_keeps_earlier_deadline() {
        let mut debounce = Debounce::new(Duration::from_millis(16));
        debounce.touch();
        let touched = debounce.deadline().unwrap();

        debounce.schedule_in(Duration::from_secs(5));
        assert_eq!(debounce.deadline(), Some(touched));

        debounce.fire_now();
        assert!(debounce.deadline().unwrap() <= Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_elapses() {
        let mut debounce = Debounce::new(Duration::from_millis(16));
        debounce.touch();
        sleep_until(debounce.deadline()).await;
        assert!(Instant::now() >= touched_deadline(&debounce));

        let never = tokio::time::timeout(Duration::from_secs(1), sleep_until(None)).await;
        assert!(never.is_err());
    }

    fn touched_deadline(debounce: &Debounce) -> Instant {
        debounce.deadline().unwrap_or_else(Instant::now)
    }
}
