//! Bounded retry policy with linearly increasing delays.

use futures::future::{AbortRegistration, Abortable};
use std::time::Duration;

use crate::error::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
  /// Delay before the first retry; retry `n` waits `n * base_delay`.
  pub base_delay: Duration,
  /// Retries after the initial attempt.
  pub max_retries: u32,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_millis(500),
      max_retries: 3,
    }
  }
}

impl BackoffPolicy {
  pub fn new(base_delay: Duration, max_retries: u32) -> Self {
    Self {
      base_delay,
      max_retries,
    }
  }

  /// Total attempts including the first one.
  pub fn max_attempts(&self) -> u32 {
    self.max_retries + 1
  }

  /// Delay before retry number `retry` (1-based). `None` once retries are
  /// exhausted.
  pub fn delay_for(&self, retry: u32) -> Option<Duration> {
    if retry == 0 || retry > self.max_retries {
      return None;
    }
    Some(self.base_delay * retry)
  }

  /// Sleep before retry `retry`, returning early with
  /// [`LoadError::Cancelled`] if `abort` fires.
  pub async fn sleep(&self, retry: u32, abort: AbortRegistration) -> Result<(), LoadError> {
    let delay = self
      .delay_for(retry)
      .ok_or(LoadError::SignatureFatal {
        attempts: self.max_attempts(),
      })?;

    Abortable::new(tokio::time::sleep(delay), abort)
      .await
      .map_err(|_| LoadError::Cancelled)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::future::AbortHandle;

  #[test]
  fn test_linear_delays() {
    let policy = BackoffPolicy::new(Duration::from_millis(100), 3);
    assert_eq!(policy.delay_for(0), None);
    assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
    assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
    assert_eq!(policy.delay_for(3), Some(Duration::from_millis(300)));
    assert_eq!(policy.delay_for(4), None);
    assert_eq!(policy.max_attempts(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sleep_waits_the_scaled_delay() {
    let policy = BackoffPolicy::new(Duration::from_secs(1), 3);
    let (_handle, registration) = AbortHandle::new_pair();
    let start = tokio::time::Instant::now();

    policy.sleep(2, registration).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_secs(3));
  }

  #[tokio::test(start_paused = true)]
  async fn test_sleep_is_cancellable() {
    let policy = BackoffPolicy::new(Duration::from_secs(10), 3);
    let (handle, registration) = AbortHandle::new_pair();
    handle.abort();

    assert_eq!(policy.sleep(1, registration).await, Err(LoadError::Cancelled));
  }
}
