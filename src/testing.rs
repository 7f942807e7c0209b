//! Scripted fakes for the external collaborators, shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{
  InterestSource, ItemExpand, ItemQuery, ItemRecord, ListPage, ProfileRecord, RecordSource,
  RefRecord, SignedUrl, SubscriptionRow, UrlSigner,
};

/// Fixed epoch offset so test timestamps read as seconds.
pub fn ts(secs: i64) -> DateTime<Utc> {
  Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn profile(id: &str, user_name: &str) -> ProfileRecord {
  ProfileRecord {
    id: id.into(),
    user_name: user_name.into(),
    first_name: None,
    last_name: None,
    name: None,
    image: None,
    avatar_url: None,
  }
}

pub fn ref_record(id: &str, title: &str) -> RefRecord {
  RefRecord {
    id: id.into(),
    title: Some(title.into()),
    image: None,
  }
}

/// A feed-eligible item with `creator` and `ref` expanded.
pub fn feed_item(id: &str, creator: &str, ref_id: &str, created: DateTime<Utc>) -> ItemRecord {
  ItemRecord {
    id: id.into(),
    created,
    creator: Some(creator.into()),
    ref_id: Some(ref_id.into()),
    backlog: false,
    list: false,
    parent: None,
    image: None,
    text: None,
    expand: ItemExpand {
      creator: Some(profile(creator, &format!("user_{creator}"))),
      ref_record: Some(ref_record(ref_id, &format!("Ref {ref_id}"))),
    },
  }
}

/// `count` items, newest first, one second apart ending at `newest`.
pub fn feed_items(prefix: &str, count: usize, newest: i64) -> Vec<ItemRecord> {
  (0..count)
    .map(|i| {
      feed_item(
        &format!("{prefix}{i}"),
        "u1",
        &format!("r{i}"),
        ts(newest - i as i64),
      )
    })
    .collect()
}

/// In-memory record store. `list_items` evaluates the query against the
/// stored items unless a scripted response is queued.
#[derive(Default)]
pub struct FakeRecordSource {
  items: Mutex<Vec<ItemRecord>>,
  profiles: Mutex<Vec<ProfileRecord>>,
  refs: Mutex<Vec<RefRecord>>,
  scripted: Mutex<VecDeque<Result<ListPage<ItemRecord>>>>,
  delay: Mutex<Option<Duration>>,
  fail_items: AtomicBool,
  pub list_calls: AtomicUsize,
  pub profile_calls: AtomicUsize,
  pub lookup_calls: AtomicUsize,
  pub queries: Mutex<Vec<ItemQuery>>,
}

impl FakeRecordSource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_items(self, items: Vec<ItemRecord>) -> Self {
    *self.items.lock().unwrap() = items;
    self
  }

  pub fn with_profiles(self, profiles: Vec<ProfileRecord>) -> Self {
    *self.profiles.lock().unwrap() = profiles;
    self
  }

  pub fn with_refs(self, refs: Vec<RefRecord>) -> Self {
    *self.refs.lock().unwrap() = refs;
    self
  }

  /// Sleep this long inside every call.
  pub fn with_delay(self, delay: Duration) -> Self {
    *self.delay.lock().unwrap() = Some(delay);
    self
  }

  pub fn set_delay(&self, delay: Option<Duration>) {
    *self.delay.lock().unwrap() = delay;
  }

  pub fn set_items(&self, items: Vec<ItemRecord>) {
    *self.items.lock().unwrap() = items;
  }

  pub fn push_item(&self, item: ItemRecord) {
    self.items.lock().unwrap().push(item);
  }

  /// Queue a canned `list_items` response.
  pub fn script(&self, page: Result<ListPage<ItemRecord>>) {
    self.scripted.lock().unwrap().push_back(page);
  }

  pub fn fail_items(&self, fail: bool) {
    self.fail_items.store(fail, Ordering::SeqCst);
  }

  pub fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub fn profile_calls(&self) -> usize {
    self.profile_calls.load(Ordering::SeqCst)
  }

  async fn pause(&self) {
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
  }
}

#[async_trait]
impl RecordSource for FakeRecordSource {
  async fn list_items(&self, query: &ItemQuery) -> Result<ListPage<ItemRecord>> {
    self.list_calls.fetch_add(1, Ordering::SeqCst);
    self.queries.lock().unwrap().push(query.clone());
    self.pause().await;

    if let Some(scripted) = self.scripted.lock().unwrap().pop_front() {
      return scripted;
    }
    if self.fail_items.load(Ordering::SeqCst) {
      return Err(eyre!("record store unavailable"));
    }

    let mut matching: Vec<ItemRecord> = self
      .items
      .lock()
      .unwrap()
      .iter()
      .filter(|item| query.filter.matches(item))
      .cloned()
      .collect();
    matching.sort_by(|a, b| b.created.cmp(&a.created));

    let per_page = query.per_page as usize;
    let skip = (query.page as usize - 1) * per_page;
    let total_items = matching.len() as u64;
    Ok(ListPage {
      items: matching.into_iter().skip(skip).take(per_page).collect(),
      page: query.page,
      per_page: query.per_page,
      total_items,
    })
  }

  async fn profile_by_user_name(&self, user_name: &str) -> Result<ProfileRecord> {
    self.profile_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    self
      .profiles
      .lock()
      .unwrap()
      .iter()
      .find(|p| p.user_name == user_name)
      .cloned()
      .ok_or_else(|| eyre!("profile not found: {}", user_name))
  }

  async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<ProfileRecord>> {
    self.lookup_calls.fetch_add(1, Ordering::SeqCst);
    Ok(
      self
        .profiles
        .lock()
        .unwrap()
        .iter()
        .filter(|p| ids.contains(&p.id))
        .cloned()
        .collect(),
    )
  }

  async fn refs_by_ids(&self, ids: &[String]) -> Result<Vec<RefRecord>> {
    self.lookup_calls.fetch_add(1, Ordering::SeqCst);
    Ok(
      self
        .refs
        .lock()
        .unwrap()
        .iter()
        .filter(|r| ids.contains(&r.id))
        .cloned()
        .collect(),
    )
  }
}

/// Interest-join rows, newest first.
#[derive(Default)]
pub struct FakeInterests {
  rows: Mutex<Vec<SubscriptionRow>>,
  fail: AtomicBool,
  pub calls: AtomicUsize,
  /// `limit` of every call, in order
  pub limits: Mutex<Vec<usize>>,
}

impl FakeInterests {
  pub fn new(rows: Vec<SubscriptionRow>) -> Self {
    Self {
      rows: Mutex::new(rows),
      ..Self::default()
    }
  }

  pub fn fail(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }
}

pub fn subscription(id: &str, user_id: &str, ref_id: &str, at: DateTime<Utc>) -> SubscriptionRow {
  SubscriptionRow {
    id: id.into(),
    ref_id: ref_id.into(),
    user_id: user_id.into(),
    community: Some(format!("{ref_id}-community")),
    inserted_at: Some(at),
  }
}

#[async_trait]
impl InterestSource for FakeInterests {
  async fn list_subscriptions(
    &self,
    before: Option<DateTime<Utc>>,
    limit: usize,
  ) -> Result<Vec<SubscriptionRow>> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.limits.lock().unwrap().push(limit);
    if self.fail.load(Ordering::SeqCst) {
      return Err(eyre!("interest source unavailable"));
    }
    let mut rows: Vec<SubscriptionRow> = self
      .rows
      .lock()
      .unwrap()
      .iter()
      .filter(|row| match (before, row.inserted_at) {
        (Some(before), Some(at)) => at < before,
        _ => true,
      })
      .cloned()
      .collect();
    rows.sort_by(|a, b| b.inserted_at.cmp(&a.inserted_at));
    rows.truncate(limit);
    Ok(rows)
  }
}

/// Scripted signing-service reply.
#[derive(Debug, Clone)]
pub enum SignReply {
  /// Service hands the unsigned URL back
  Echo,
  Signed(String),
  Fail,
}

/// Signing service that replays a script, then signs normally.
#[derive(Default)]
pub struct FakeSigner {
  script: Mutex<VecDeque<SignReply>>,
  delay: Mutex<Option<Duration>>,
  active: AtomicUsize,
  pub peak: AtomicUsize,
  pub calls: AtomicUsize,
  pub urls: Mutex<Vec<String>>,
}

impl FakeSigner {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_script(self, replies: Vec<SignReply>) -> Self {
    *self.script.lock().unwrap() = replies.into();
    self
  }

  pub fn with_delay(self, delay: Duration) -> Self {
    *self.delay.lock().unwrap() = Some(delay);
    self
  }

  pub fn push_script(&self, replies: Vec<SignReply>) {
    self.script.lock().unwrap().extend(replies);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn signed(url: &str) -> String {
    format!("{url}&X-Signature=ok")
  }
}

#[async_trait]
impl UrlSigner for FakeSigner {
  async fn sign_url(&self, url: &str) -> Result<SignedUrl> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.urls.lock().unwrap().push(url.to_string());
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self.active.fetch_sub(1, Ordering::SeqCst);

    let reply = self.script.lock().unwrap().pop_front();
    let signed_url = match reply {
      Some(SignReply::Echo) => url.to_string(),
      Some(SignReply::Signed(signed)) => signed,
      Some(SignReply::Fail) => return Err(eyre!("signing service error")),
      None => Self::signed(url),
    };
    Ok(SignedUrl {
      signed_url,
      expires: 500_000,
      date: Utc::now().timestamp_millis(),
    })
  }
}
