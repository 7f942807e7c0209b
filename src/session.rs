//! The active user. Authentication happens elsewhere; loaders only need to
//! know who is signed in.

use std::sync::{Arc, RwLock};

use crate::error::LoadError;

#[derive(Debug, Clone, Default)]
pub struct Session {
  user_id: Arc<RwLock<Option<String>>>,
}

impl Session {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn signed_in(user_id: impl Into<String>) -> Self {
    let session = Self::new();
    session.sign_in(user_id);
    session
  }

  pub fn sign_in(&self, user_id: impl Into<String>) {
    let mut current = self
      .user_id
      .write()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    *current = Some(user_id.into());
  }

  pub fn sign_out(&self) {
    let mut current = self
      .user_id
      .write()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    *current = None;
  }

  /// Current user id, or [`LoadError::NotAuthenticated`].
  pub fn user_id(&self) -> Result<String, LoadError> {
    self
      .user_id
      .read()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
      .clone()
      .ok_or(LoadError::NotAuthenticated)
  }
}
