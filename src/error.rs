//! Error taxonomy shared by the loaders.
//!
//! Loader results travel through single-flight futures and are handed to every
//! waiting caller, so [`LoadError`] is `Clone` and carries rendered messages
//! instead of boxed sources.

use thiserror::Error;

use crate::feed::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
  /// No active user; loaders treat this as a no-op.
  #[error("no active user")]
  NotAuthenticated,

  #[error("network request failed: {0}")]
  Network(String),

  /// One of several merged sources failed.
  #[error("source {source_name} failed: {message}")]
  PartialSource {
    source_name: &'static str,
    message: String,
  },

  /// The signing service echoed the unsigned URL back.
  #[error("signing service returned the unsigned url")]
  SignatureTransient,

  #[error("signing gave up after {attempts} attempts")]
  SignatureFatal { attempts: u32 },

  #[error("persisting snapshot failed: {0}")]
  CacheWrite(String),

  #[error("concurrency gate queue is full")]
  QueueFull,

  #[error("request was cancelled")]
  Cancelled,

  #[error("cannot start {requested:?} while {phase:?}")]
  Busy { phase: Phase, requested: Phase },
}

impl LoadError {
  /// Wrap any displayable failure as a network error.
  pub fn network(err: impl std::fmt::Display) -> Self {
    Self::Network(err.to_string())
  }

  /// Whether the caller should show stale content and carry on.
  pub fn is_degradable(&self) -> bool {
    matches!(
      self,
      Self::Network(_) | Self::PartialSource { .. } | Self::CacheWrite(_) | Self::Cancelled
    )
  }
}
