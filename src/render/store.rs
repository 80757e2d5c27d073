//! Per-asset store of pending and rendered entries.
//!
//! Each asset maps to an insertion-ordered list (first-seen order, not sorted by size).
//! Lists are created lazily on first mutation and never torn down; entries are evicted
//! individually. All access goes through a [`StoreGuard`] so that a lookup and the
//! mutation that follows it happen under one lock.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::{AssetId, RenderKey, RenderedFrame, SourceHandle};

/// Continuation of a caller suspended on a pending entry. `None` means the source vanished.
pub(crate) type Waiter = oneshot::Sender<Option<RenderedFrame>>;

enum EntryState {
    Pending { attempt: u64, waiters: Vec<Waiter> },
    Rendered {
        frame: RenderedFrame,
        source: Option<SourceHandle>,
    },
}

/// One pending or completed render for an `(asset, width, height, timestamp)` key.
///
/// Pending entries carry the requested size; rendered entries the decoded size.
pub struct RenderEntry {
    key: RenderKey,
    state: EntryState,
}

impl RenderEntry {
    pub(crate) fn pending(key: RenderKey, attempt: u64) -> Self {
        Self {
            key,
            state: EntryState::Pending {
                attempt,
                waiters: Vec::new(),
            },
        }
    }

    pub fn rendered(frame: RenderedFrame, source: Option<SourceHandle>) -> Self {
        Self {
            key: frame.key(),
            state: EntryState::Rendered { frame, source },
        }
    }

    pub fn key(&self) -> RenderKey {
        self.key
    }

    pub fn width(&self) -> u32 {
        self.key.width
    }

    pub fn height(&self) -> u32 {
        self.key.height
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.key.timestamp_ms
    }

    pub fn is_rendered(&self) -> bool {
        matches!(self.state, EntryState::Rendered { .. })
    }

    pub fn frame(&self) -> Option<&RenderedFrame> {
        match &self.state {
            EntryState::Rendered { frame, .. } => Some(frame),
            EntryState::Pending { .. } => None,
        }
    }

    pub fn waiter_count(&self) -> usize {
        match &self.state {
            EntryState::Pending { waiters, .. } => waiters.len(),
            EntryState::Rendered { .. } => 0,
        }
    }

    pub fn has_source(&self) -> bool {
        matches!(
            self.state,
            EntryState::Rendered {
                source: Some(_),
                ..
            }
        )
    }

    pub(crate) fn attempt(&self) -> Option<u64> {
        match self.state {
            EntryState::Pending { attempt, .. } => Some(attempt),
            EntryState::Rendered { .. } => None,
        }
    }

    /// Registers a waiter. Hands it back if the entry is already rendered.
    pub(crate) fn add_waiter(&mut self, waiter: Waiter) -> Result<(), Waiter> {
        match &mut self.state {
            EntryState::Pending { waiters, .. } => {
                waiters.push(waiter);
                Ok(())
            }
            EntryState::Rendered { .. } => Err(waiter),
        }
    }

    /// Waiters in registration order; empty for rendered entries.
    pub(crate) fn into_waiters(self) -> Vec<Waiter> {
        match self.state {
            EntryState::Pending { waiters, .. } => waiters,
            EntryState::Rendered { .. } => Vec::new(),
        }
    }

    fn summary(&self) -> EntrySummary {
        EntrySummary {
            width: self.key.width,
            height: self.key.height,
            timestamp_ms: self.key.timestamp_ms,
            rendered: self.is_rendered(),
            waiter_count: self.waiter_count(),
            has_source: self.has_source(),
        }
    }
}

/// Serializable view of one entry, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    pub rendered: bool,
    pub waiter_count: usize,
    pub has_source: bool,
}

type AssetMap = HashMap<AssetId, Vec<RenderEntry>>;

#[derive(Default)]
pub struct AssetStore {
    assets: Mutex<AssetMap>,
}

static GLOBAL_STORE: OnceLock<Arc<AssetStore>> = OnceLock::new();

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide store, created on first access.
    pub fn global() -> Arc<AssetStore> {
        Arc::clone(GLOBAL_STORE.get_or_init(|| Arc::new(AssetStore::new())))
    }

    /// Locks the whole mapping. Do not hold the guard across an `.await`.
    pub fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            assets: self.assets.lock(),
        }
    }

    pub fn snapshot(&self, asset: &AssetId) -> Vec<EntrySummary> {
        self.lock()
            .get(asset)
            .map(|entries| entries.iter().map(RenderEntry::summary).collect())
            .unwrap_or_default()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.lock().len()
    }
}

pub struct StoreGuard<'a> {
    assets: MutexGuard<'a, AssetMap>,
}

impl StoreGuard<'_> {
    /// Read-only lookup; does not create.
    pub fn get(&self, asset: &AssetId) -> Option<&[RenderEntry]> {
        self.assets.get(asset).map(Vec::as_slice)
    }

    /// Existing list for `asset`, or a new empty one.
    pub fn ensure(&mut self, asset: &AssetId) -> &mut Vec<RenderEntry> {
        self.assets.entry(asset.clone()).or_default()
    }

    /// `0x0` returns the most recently inserted entry regardless of size and timestamp.
    /// Otherwise the first entry, in insertion order, that is at least `width x height`
    /// at exactly `timestamp_ms`.
    pub fn find_best(
        &mut self,
        asset: &AssetId,
        width: u32,
        height: u32,
        timestamp_ms: u64,
    ) -> Option<&mut RenderEntry> {
        let entries = self.assets.get_mut(asset)?;
        if width == 0 && height == 0 {
            return entries.last_mut();
        }
        entries.iter_mut().find(|e| {
            e.key.width >= width && e.key.height >= height && e.key.timestamp_ms == timestamp_ms
        })
    }

    /// Overwrites the first entry matching `predicate` in place, or appends `entry`.
    /// Returns the overwritten entry.
    pub fn replace(
        &mut self,
        asset: &AssetId,
        predicate: impl Fn(&RenderEntry) -> bool,
        entry: RenderEntry,
    ) -> Option<RenderEntry> {
        let key = entry.key;
        let entries = self.ensure(asset);
        match entries.iter().position(|e| predicate(e)) {
            Some(idx) => {
                log::trace!(
                    target: "frame_preview::store",
                    "replacing entry {} of asset={} at position {}",
                    entries[idx].key,
                    asset,
                    idx
                );
                Some(std::mem::replace(&mut entries[idx], entry))
            }
            None => {
                log::trace!(
                    target: "frame_preview::store",
                    "appending entry {} to asset={}",
                    key,
                    asset
                );
                entries.push(entry);
                None
            }
        }
    }

    /// Removes every entry at exactly `width x height` and `timestamp_ms`.
    pub fn evict(
        &mut self,
        asset: &AssetId,
        width: u32,
        height: u32,
        timestamp_ms: u64,
    ) -> Vec<RenderEntry> {
        let key = RenderKey::new(width, height, timestamp_ms);
        let removed = self.remove_where(asset, |e| e.key == key);
        if !removed.is_empty() {
            log::trace!(
                target: "frame_preview::store",
                "evicted {} entr{} at {} from asset={}",
                removed.len(),
                if removed.len() == 1 { "y" } else { "ies" },
                key,
                asset
            );
        }
        removed
    }

    /// Removes matching entries, preserving the order of the rest.
    pub fn remove_where(
        &mut self,
        asset: &AssetId,
        predicate: impl Fn(&RenderEntry) -> bool,
    ) -> Vec<RenderEntry> {
        let Some(entries) = self.assets.get_mut(asset) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        let mut idx = 0;
        while idx < entries.len() {
            if predicate(&entries[idx]) {
                removed.push(entries.remove(idx));
            } else {
                idx += 1;
            }
        }
        removed
    }

    /// Rendered frame stored at exactly `key`, if any.
    pub fn rendered_at(&self, asset: &AssetId, key: RenderKey) -> Option<&RenderedFrame> {
        self.get(asset)?
            .iter()
            .filter(|e| e.key == key)
            .find_map(RenderEntry::frame)
    }

    pub(crate) fn holds_attempt(&self, asset: &AssetId, attempt: u64) -> bool {
        self.get(asset)
            .is_some_and(|entries| entries.iter().any(|e| e.attempt() == Some(attempt)))
    }
}
