//! Semaphore limiting parallel in-flight async operations.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::LoadError;

/// Grants at most `max_concurrent` holders at a time; waiters are served in
/// FIFO order.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
  semaphore: Arc<Semaphore>,
  max_concurrent: usize,
  max_waiters: Option<usize>,
  waiting: Arc<AtomicUsize>,
}

/// A granted slot. Dropping it returns the slot to the gate.
#[derive(Debug)]
pub struct GatePermit {
  _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
  pub fn new(max_concurrent: usize) -> Self {
    Self {
      semaphore: Arc::new(Semaphore::new(max_concurrent)),
      max_concurrent,
      max_waiters: None,
      waiting: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Fail fast with [`LoadError::QueueFull`] instead of queueing more than
  /// `max_waiters` callers.
  pub fn with_max_waiters(mut self, max_waiters: usize) -> Self {
    self.max_waiters = Some(max_waiters);
    self
  }

  pub fn max_concurrent(&self) -> usize {
    self.max_concurrent
  }

  /// Slots currently free.
  pub fn available(&self) -> usize {
    self.semaphore.available_permits()
  }

  /// Callers queued behind the held slots.
  pub fn waiting(&self) -> usize {
    self.waiting.load(Ordering::SeqCst)
  }

  /// Wait for a free slot.
  pub async fn acquire(&self) -> Result<GatePermit, LoadError> {
    if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
      return Ok(GatePermit { _permit: permit });
    }

    if let Some(max) = self.max_waiters {
      if self.waiting() >= max {
        debug!(max, "gate queue full");
        return Err(LoadError::QueueFull);
      }
    }

    let _waiter = WaiterGuard::enter(&self.waiting);
    let permit = Arc::clone(&self.semaphore)
      .acquire_owned()
      .await
      .map_err(|_| LoadError::Cancelled)?;

    Ok(GatePermit { _permit: permit })
  }

  /// Run `fut` while holding a slot. The slot is released when `fut`
  /// finishes, fails, or is dropped.
  pub async fn run<F, T>(&self, fut: F) -> Result<T, LoadError>
  where
    F: Future<Output = T>,
  {
    let _permit = self.acquire().await?;
    Ok(fut.await)
  }
}

/// Keeps the waiter count honest when an acquire is cancelled mid-wait.
struct WaiterGuard<'a> {
  waiting: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
  fn enter(waiting: &'a AtomicUsize) -> Self {
    waiting.fetch_add(1, Ordering::SeqCst);
    Self { waiting }
  }
}

impl Drop for WaiterGuard<'_> {
  fn drop(&mut self) {
    self.waiting.fetch_sub(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_never_exceeds_max_concurrent() {
    let gate = ConcurrencyGate::new(2);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
      let gate = gate.clone();
      let active = active.clone();
      let peak = peak.clone();
      handles.push(tokio::spawn(async move {
        gate
          .run(async {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            active.fetch_sub(1, Ordering::SeqCst);
          })
          .await
      }));
    }
    for handle in handles {
      handle.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(gate.available(), 2);
  }

  #[tokio::test]
  async fn test_slot_released_when_guarded_call_fails() {
    let gate = ConcurrencyGate::new(1);
    let result: Result<Result<(), String>, LoadError> =
      gate.run(async { Err("boom".to_string()) }).await;

    assert_eq!(result, Ok(Err("boom".to_string())));
    assert_eq!(gate.available(), 1);
  }

  #[tokio::test]
  async fn test_slot_released_when_guarded_call_is_dropped() {
    let gate = ConcurrencyGate::new(1);
    let pending = gate.run(tokio::time::sleep(Duration::from_secs(60)));
    tokio::select! {
      _ = pending => unreachable!("sleeps for a minute"),
      _ = tokio::time::sleep(Duration::from_millis(5)) => {}
    }
    assert_eq!(gate.available(), 1);
  }

  #[tokio::test]
  async fn test_waiters_are_served_in_order() {
    let gate = ConcurrencyGate::new(1);
    let held = gate.acquire().await.unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..3 {
      let gate = gate.clone();
      let order = order.clone();
      handles.push(tokio::spawn(async move {
        let _permit = gate.acquire().await.unwrap();
        order.lock().unwrap().push(i);
      }));
      // Let each task enqueue before spawning the next.
      tokio::task::yield_now().await;
    }

    assert_eq!(gate.waiting(), 3);
    drop(held);
    for handle in handles {
      handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
  }

  #[tokio::test]
  async fn test_queue_cap_fails_fast() {
    let gate = ConcurrencyGate::new(1).with_max_waiters(1);
    let _held = gate.acquire().await.unwrap();

    let queued = {
      let gate = gate.clone();
      tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
    };
    tokio::task::yield_now().await;
    assert_eq!(gate.waiting(), 1);

    assert_eq!(gate.acquire().await.err(), Some(LoadError::QueueFull));
    queued.abort();
  }
}
