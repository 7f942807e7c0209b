//! The feed paginator.
//!
//! A [`FeedPager`] owns the visible entry list for the signed-in user and
//! moves through [`Phase`]s: `Idle -> Hydrating -> Hydrated`, and from
//! `Hydrated` into one of `Refreshing`, `Prefetching` or `LoadingMore` and
//! back. A transition that conflicts with the current phase is rejected with
//! [`LoadError::Busy`]; one that would do nothing useful returns `Ok(())`.
//!
//! Reads ahead one page: after every load-more the next page is fetched into
//! a buffer, and the following `fetch_more` consumes it without a round trip.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{FeedEntry, Projections};
use super::page::{FeedPage, PageFetcher};
use super::Phase;
use crate::backend::{InterestSource, RecordSource};
use crate::cache::{Namespace, RequestMemoizer, SnapshotCache};
use crate::config::FeedConfig;
use crate::error::LoadError;
use crate::session::Session;

/// Cursor, page size and generation of a page request.
type PageKey = (Option<DateTime<Utc>>, usize, u64);

/// Read-only view for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedView {
  pub entries: Vec<FeedEntry>,
  pub has_more: bool,
  pub phase: Phase,
  /// A user-visible refresh is running (silent refreshes don't count)
  pub refreshing: bool,
}

#[derive(Debug)]
struct PagerState {
  phase: Phase,
  /// A snapshot or a refresh has populated the list at least once
  hydrated: bool,
  silent: bool,
  entries: Vec<FeedEntry>,
  ids: HashSet<String>,
  cursor: Option<DateTime<Utc>>,
  has_more: bool,
  prefetched: Option<FeedPage>,
  /// Bumped whenever the list is replaced; keys page requests
  generation: u64,
  /// Bumped whenever an operation starts; only the latest may apply results
  ticket: u64,
  network_enabled: bool,
}

impl PagerState {
  fn new(network_enabled: bool) -> Self {
    Self {
      phase: Phase::Idle,
      hydrated: false,
      silent: false,
      entries: Vec::new(),
      ids: HashSet::new(),
      cursor: None,
      has_more: false,
      prefetched: None,
      generation: 0,
      ticket: 0,
      network_enabled,
    }
  }

  fn begin(&mut self, phase: Phase) -> u64 {
    self.phase = phase;
    self.ticket += 1;
    self.ticket
  }

  fn owns(&self, ticket: u64) -> bool {
    self.ticket == ticket
  }

  fn settle(&mut self) {
    self.phase = if self.hydrated {
      Phase::Hydrated
    } else {
      Phase::Idle
    };
    self.silent = false;
  }

  /// Move the read-ahead buffer onto the list, unless a refresh or a
  /// load-more is about to change what follows the cursor.
  fn consume_prefetched(&mut self) -> bool {
    if !matches!(self.phase, Phase::Hydrated | Phase::Prefetching) {
      return false;
    }
    match self.prefetched.take() {
      Some(page) if !page.entries.is_empty() => {
        self.cursor = page.cursor;
        self.has_more = page.has_more;
        self.append(page.entries);
        true
      }
      _ => false,
    }
  }

  /// Append entries not already visible; returns how many were added.
  fn append(&mut self, entries: Vec<FeedEntry>) -> usize {
    let before = self.entries.len();
    for entry in entries {
      if self.ids.insert(entry.id().to_string()) {
        self.entries.push(entry);
      }
    }
    self.entries.len() - before
  }

  fn replace(&mut self, page: FeedPage) {
    self.entries.clear();
    self.ids.clear();
    self.prefetched = None;
    self.cursor = page.cursor;
    self.has_more = page.has_more;
    self.append(page.entries);
  }

  fn snapshot(&self) -> FeedPage {
    FeedPage {
      entries: self.entries.clone(),
      cursor: self.cursor,
      has_more: self.has_more,
    }
  }

  /// Forget everything and orphan any running operation.
  fn reset(&mut self) {
    let network_enabled = self.network_enabled;
    let generation = self.generation + 1;
    let ticket = self.ticket + 1;
    *self = Self::new(network_enabled);
    self.generation = generation;
    self.ticket = ticket;
  }
}

/// Puts the pager back to rest if an operation is dropped mid-flight.
/// Only while the operation still owns the current ticket.
struct PhaseGuard<'a> {
  pager: &'a FeedPager,
  ticket: u64,
  armed: bool,
}

impl<'a> PhaseGuard<'a> {
  fn new(pager: &'a FeedPager, ticket: u64) -> Self {
    Self {
      pager,
      ticket,
      armed: true,
    }
  }

  /// The operation reached its own settling code.
  fn disarm(mut self) {
    self.armed = false;
  }
}

impl Drop for PhaseGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut state = self.pager.state();
    if state.owns(self.ticket) {
      debug!(phase = ?state.phase, "feed operation dropped, settling");
      state.settle();
    }
  }
}

struct Inner {
  fetcher: PageFetcher,
  projections: Arc<Mutex<Projections>>,
  pages: RequestMemoizer<PageKey, Result<FeedPage, LoadError>>,
  snapshots: SnapshotCache,
  session: Session,
  page_size: usize,
  state: Mutex<PagerState>,
}

/// Cursor-based feed paginator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FeedPager {
  inner: Arc<Inner>,
}

impl FeedPager {
  pub fn new(
    records: Arc<dyn RecordSource>,
    interests: Option<Arc<dyn InterestSource>>,
    snapshots: SnapshotCache,
    session: Session,
    config: &FeedConfig,
  ) -> Self {
    let projections = Arc::new(Mutex::new(Projections::new()));
    let mut fetcher = PageFetcher::new(records, Arc::clone(&projections));
    if config.include_interest_joins {
      if let Some(interests) = interests {
        fetcher = fetcher.with_interests(interests);
      }
    }

    Self {
      inner: Arc::new(Inner {
        fetcher,
        projections,
        pages: RequestMemoizer::new(),
        snapshots,
        session,
        page_size: config.page_size.max(1),
        state: Mutex::new(PagerState::new(config.network_enabled)),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, PagerState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn projections(&self) -> MutexGuard<'_, Projections> {
    self
      .inner
      .projections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn view(&self) -> FeedView {
    let state = self.state();
    FeedView {
      entries: state.entries.clone(),
      has_more: state.has_more,
      phase: state.phase,
      refreshing: state.phase == Phase::Refreshing && !state.silent,
    }
  }

  pub fn phase(&self) -> Phase {
    self.state().phase
  }

  pub fn cursor(&self) -> Option<DateTime<Utc>> {
    self.state().cursor
  }

  /// Entries held in the read-ahead buffer.
  pub fn prefetched_len(&self) -> usize {
    self
      .state()
      .prefetched
      .as_ref()
      .map_or(0, |page| page.entries.len())
  }

  /// Allow network fetches. Until then only the persisted snapshot shows.
  pub fn enable_network(&self) {
    self.state().network_enabled = true;
  }

  /// Show the last persisted feed for the signed-in user.
  ///
  /// With `refresh` set, a found snapshot is revalidated in the background;
  /// without a snapshot the first page is fetched before returning.
  pub async fn ensure_hydrated(&self, refresh: bool) -> Result<(), LoadError> {
    let user_id = match self.inner.session.user_id() {
      Ok(id) => id,
      Err(_) => return Ok(()),
    };

    let ticket = {
      let mut state = self.state();
      match state.phase {
        Phase::Hydrating => return Ok(()),
        _ if state.hydrated && !state.entries.is_empty() => return Ok(()),
        Phase::Idle | Phase::Hydrated => {}
        phase => {
          return Err(LoadError::Busy {
            phase,
            requested: Phase::Hydrating,
          })
        }
      }
      state.begin(Phase::Hydrating)
    };

    let snapshot: Option<FeedPage> = self
      .inner
      .snapshots
      .get(Namespace::FeedEntries, &user_id);

    let found = {
      let mut state = self.state();
      if !state.owns(ticket) {
        return Ok(());
      }
      state.hydrated = true;
      state.settle();
      match snapshot {
        Some(page) => {
          let mut projections = self.projections();
          projections.clear();
          projections.absorb(&page.entries);
          state.replace(page);
          true
        }
        None => false,
      }
    };
    debug!(found, "feed hydrated");

    if refresh {
      if found {
        self.spawn_refresh(true, true);
      } else {
        self.refresh(false, false).await?;
      }
    }
    Ok(())
  }

  /// Replace the visible list with the newest page.
  ///
  /// Already refreshing is a no-op unless `force`, which also preempts a
  /// running prefetch. `silent` keeps the refresh out of [`FeedView`].
  pub async fn refresh(&self, force: bool, silent: bool) -> Result<(), LoadError> {
    let user_id = match self.inner.session.user_id() {
      Ok(id) => id,
      Err(_) => return Ok(()),
    };

    let (ticket, generation) = {
      let mut state = self.state();
      if !state.network_enabled {
        debug!("feed network disabled, skipping refresh");
        return Ok(());
      }
      match state.phase {
        Phase::Idle | Phase::Hydrated => {}
        Phase::Refreshing if !force => return Ok(()),
        Phase::Refreshing | Phase::Prefetching if force => {}
        phase => {
          return Err(LoadError::Busy {
            phase,
            requested: Phase::Refreshing,
          })
        }
      }
      state.generation += 1;
      let ticket = state.begin(Phase::Refreshing);
      state.silent = silent;
      (ticket, state.generation)
    };

    let guard = PhaseGuard::new(self, ticket);
    let result = self.fetch(None, generation).await;
    guard.disarm();

    let snapshot = {
      let mut state = self.state();
      if !state.owns(ticket) {
        debug!("refresh superseded");
        return Ok(());
      }
      let page = match result {
        Ok(page) => page,
        Err(err) => {
          state.settle();
          warn!(error = %err, "feed refresh failed, keeping current entries");
          return Err(err);
        }
      };
      state.hydrated = true;
      state.settle();
      {
        let mut projections = self.projections();
        projections.clear();
        projections.absorb(&page.entries);
      }
      state.replace(page);
      state.snapshot()
    };

    info!(
      entries = snapshot.entries.len(),
      has_more = snapshot.has_more,
      "feed refreshed"
    );
    self
      .inner
      .snapshots
      .persist(Namespace::FeedEntries, &user_id, &snapshot);
    Ok(())
  }

  /// Fetch the page after the cursor into the read-ahead buffer without
  /// touching the visible list.
  pub async fn prefetch_next_page(&self) -> Result<(), LoadError> {
    if self.inner.session.user_id().is_err() {
      return Ok(());
    }

    let (ticket, cursor, generation) = {
      let mut state = self.state();
      if !state.network_enabled || !state.has_more || state.prefetched.is_some() {
        return Ok(());
      }
      match state.phase {
        Phase::Hydrated => {}
        Phase::Prefetching | Phase::LoadingMore => return Ok(()),
        phase => {
          return Err(LoadError::Busy {
            phase,
            requested: Phase::Prefetching,
          })
        }
      }
      (
        state.begin(Phase::Prefetching),
        state.cursor,
        state.generation,
      )
    };

    let guard = PhaseGuard::new(self, ticket);
    let result = self.fetch(cursor, generation).await;
    guard.disarm();

    let mut state = self.state();
    if !state.owns(ticket) {
      debug!("prefetch superseded");
      return Ok(());
    }
    state.settle();
    let mut page = result?;
    page.entries.retain(|entry| !state.ids.contains(entry.id()));
    if page.entries.is_empty() {
      state.cursor = page.cursor;
      state.has_more = page.has_more;
    } else {
      debug!(entries = page.entries.len(), "prefetched feed page");
      state.prefetched = Some(page);
    }
    Ok(())
  }

  /// Move the read-ahead buffer onto the visible list. Returns whether
  /// anything was consumed; nothing is while refreshing or loading more.
  pub fn consume_prefetched_page(&self) -> bool {
    self.state().consume_prefetched()
  }

  /// Show the next page: from the read-ahead buffer when ready, otherwise
  /// from the network. Either way the page after it is prefetched.
  ///
  /// A running prefetch is taken over; both share the same request.
  pub async fn fetch_more(&self) -> Result<(), LoadError> {
    if self.consume_prefetched_page() {
      self.spawn_prefetch();
      return Ok(());
    }
    if self.inner.session.user_id().is_err() {
      return Ok(());
    }

    let (ticket, cursor, generation) = {
      let mut state = self.state();
      if !state.network_enabled || !state.has_more {
        return Ok(());
      }
      match state.phase {
        Phase::Hydrated | Phase::Prefetching => {}
        Phase::LoadingMore => return Ok(()),
        phase => {
          return Err(LoadError::Busy {
            phase,
            requested: Phase::LoadingMore,
          })
        }
      }
      (
        state.begin(Phase::LoadingMore),
        state.cursor,
        state.generation,
      )
    };

    let guard = PhaseGuard::new(self, ticket);
    let result = self.fetch(cursor, generation).await;
    guard.disarm();

    let appended = {
      let mut state = self.state();
      if !state.owns(ticket) {
        debug!("load-more superseded");
        return Ok(());
      }
      state.settle();
      let page = result?;
      state.cursor = page.cursor;
      state.has_more = page.has_more;
      state.append(page.entries)
    };

    if appended > 0 {
      self.spawn_prefetch();
    }
    Ok(())
  }

  /// Drop all in-memory state and the persisted feed snapshot.
  pub fn invalidate_cache(&self) {
    self.reset();
    if let Ok(user_id) = self.inner.session.user_id() {
      if let Err(err) = self.inner.snapshots.remove(Namespace::FeedEntries, &user_id) {
        warn!(error = %err, "failed to clear feed snapshot");
      }
    }
  }

  /// Return to `Idle` with nothing loaded, keeping the persisted snapshot.
  pub fn reset(&self) {
    self.state().reset();
    self.projections().clear();
    self.inner.pages.clear();
  }

  pub fn spawn_refresh(&self, force: bool, silent: bool) -> JoinHandle<()> {
    let pager = self.clone();
    tokio::spawn(async move {
      if let Err(err) = pager.refresh(force, silent).await {
        debug!(error = %err, "background refresh did not complete");
      }
    })
  }

  pub fn spawn_prefetch(&self) -> JoinHandle<()> {
    let pager = self.clone();
    tokio::spawn(async move {
      if let Err(err) = pager.prefetch_next_page().await {
        debug!(error = %err, "background prefetch did not complete");
      }
    })
  }

  async fn fetch(
    &self,
    before: Option<DateTime<Utc>>,
    generation: u64,
  ) -> Result<FeedPage, LoadError> {
    let fetcher = self.inner.fetcher.clone();
    let limit = self.inner.page_size;
    self
      .inner
      .pages
      .acquire_detached(
        (before, limit, generation),
        move || async move { fetcher.fetch_page(before, limit).await },
        || Err(LoadError::Cancelled),
      )
      .await
  }
}
