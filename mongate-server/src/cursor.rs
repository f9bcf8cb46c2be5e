//! Cursor cache.
//!
//! Maps a backend cursor id to state that has to survive across the separate
//! round-trips of one cursor: the number of documents already streamed (for
//! the legacy `startingFrom` field) and free-form sidecar state that stages
//! use to stay consistent across `getMore` calls.
//!
//! Entries expire on a sliding TTL. Expired entries are handed back to the
//! gateway by [`run_reaper`], which issues a `killCursors` for them through
//! the full pipeline so abandoned backend cursors are released.

use crate::command::{as_i64, is_ok, Command};
use crate::plugins::Extensions;
use bson::Document;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cursor id meaning "no more results". Never cached.
pub const EXHAUSTED_CURSOR_ID: i64 = 0;

/// Per-cursor state.
#[derive(Debug)]
pub struct CursorCacheEntry {
    pub id: i64,
    /// Documents already streamed for this cursor.
    pub consumed: usize,
    /// Stage-owned state keyed by stage-defined names.
    pub sidecar: Extensions,
}

impl CursorCacheEntry {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            consumed: 0,
            sidecar: Extensions::default(),
        }
    }
}

/// Shared handle to a cache entry. Always lock it for the shortest time
/// possible and never hold it across an await point.
pub type CursorHandle = Arc<Mutex<CursorCacheEntry>>;

/// Cursor cache as seen by stages.
pub trait CursorCache: Send + Sync {
    /// Returns the entry for `id`, creating it if needed. Idempotent.
    fn create(&self, id: i64) -> CursorHandle;

    /// Returns the entry for `id`.
    ///
    /// A miss auto-vivifies an empty entry rather than failing: a stage that
    /// needs sidecar state must check for it and report `CursorNotFound`
    /// itself.
    fn get(&self, id: i64) -> CursorHandle;

    /// Returns whether `id` is currently cached, without touching it.
    fn contains(&self, id: i64) -> bool;

    /// Removes `id` immediately. Closing a missing id is a no-op.
    fn close(&self, id: i64);
}

struct Slot {
    handle: CursorHandle,
    touched: Instant,
}

/// Sliding-TTL cursor cache backed by a concurrent map.
pub struct TtlCursorCache {
    entries: DashMap<i64, Slot>,
    ttl: Duration,
}

impl TtlCursorCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch_or_insert(&self, id: i64) -> CursorHandle {
        if id == EXHAUSTED_CURSOR_ID {
            return Arc::new(Mutex::new(CursorCacheEntry::new(id)));
        }
        let mut slot = self.entries.entry(id).or_insert_with(|| Slot {
            handle: Arc::new(Mutex::new(CursorCacheEntry::new(id))),
            touched: Instant::now(),
        });
        slot.touched = Instant::now();
        slot.handle.clone()
    }

    /// Removes and returns the ids of entries idle longer than the TTL.
    ///
    /// Each candidate is re-checked under the map's shard lock, so an entry
    /// touched or closed concurrently is never reported.
    pub fn reap_expired(&self) -> Vec<i64> {
        let now = Instant::now();
        let candidates: Vec<i64> = self
            .entries
            .iter()
            .filter(|slot| now.duration_since(slot.touched) >= self.ttl)
            .map(|slot| *slot.key())
            .collect();

        candidates
            .into_iter()
            .filter(|id| {
                self.entries
                    .remove_if(id, |_, slot| slot.touched.elapsed() >= self.ttl)
                    .is_some()
            })
            .collect()
    }

    /// Drops every entry without reporting it as expired.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl CursorCache for TtlCursorCache {
    fn create(&self, id: i64) -> CursorHandle {
        self.touch_or_insert(id)
    }

    fn get(&self, id: i64) -> CursorHandle {
        self.touch_or_insert(id)
    }

    fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    fn close(&self, id: i64) {
        if self.entries.remove(&id).is_some() {
            tracing::trace!("Closed cursor {}", id);
        }
    }
}

/// Updates `cache` from the response to `command`.
///
/// A successful response naming a non-zero `cursor.id` creates or touches
/// that entry; a `getMore` answered with id 0 closes the requested cursor; a
/// successful `killCursors` closes every listed id. Returns the id of a
/// cursor this response newly added.
pub fn track_response(cache: &dyn CursorCache, command: &Command, response: &Document) -> Option<i64> {
    if !is_ok(response) {
        return None;
    }

    if let Command::KillCursors(_) = command {
        for id in command.cursor_ids() {
            cache.close(id);
        }
        return None;
    }

    let id = response
        .get_document("cursor")
        .ok()
        .and_then(|cursor| cursor.get("id"))
        .and_then(as_i64)?;

    if id == EXHAUSTED_CURSOR_ID {
        if let Some(cursor_id) = command.cursor_id() {
            cache.close(cursor_id);
        }
        return None;
    }

    let opened = !cache.contains(id);
    cache.create(id);
    opened.then_some(id)
}

/// Scans `cache` every `interval` and passes each batch of expired ids to
/// `on_expire`. Runs until `shutdown` is cancelled.
pub async fn run_reaper<F, Fut>(
    cache: Arc<TtlCursorCache>,
    interval: Duration,
    shutdown: CancellationToken,
    mut on_expire: F,
) where
    F: FnMut(Vec<i64>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = cache.reap_expired();
                if !expired.is_empty() {
                    tracing::debug!("Expired {} idle cursors", expired.len());
                    on_expire(expired).await;
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!("Cursor reaper stopping");
                break;
            }
        }
    }
}
