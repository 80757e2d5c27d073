//! Render attempts: dedup against the store, decode with bounded retries, publish.
//!
//! The first caller for a key claims a pending slot and spawns the attempt as its own task;
//! callers that find the slot pending register a waiter on it instead. Dropping a `render`
//! future detaches from the attempt without stopping it, so other waiters still get the
//! frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use url::Url;

use super::store::{RenderEntry, Waiter};
use super::{
    AssetId, AssetStore, Decoder, DecoderFactory, RenderKey, RenderedFrame, SourceHandle,
    SourceResolver,
};
use crate::config::RenderConfig;
use crate::error::{DecodeError, RenderError};

/// How one spawned attempt ended.
#[derive(Debug)]
enum AttemptOutcome {
    Rendered(RenderedFrame),
    NoSource,
    Superseded(RenderedFrame),
    GaveUp,
}

enum Claim {
    Ready(RenderedFrame),
    Wait(oneshot::Receiver<Option<RenderedFrame>>),
    Owner(u64),
}

/// Releases the decoder on drop unless it is kept as a [`SourceHandle`].
struct DecoderLease {
    decoder: Option<Box<dyn Decoder>>,
}

impl DecoderLease {
    fn new(decoder: Box<dyn Decoder>) -> Self {
        Self {
            decoder: Some(decoder),
        }
    }

    async fn wait_ready(&mut self) -> Result<(), DecodeError> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.wait_ready().await,
            None => Err(DecodeError::Released),
        }
    }

    fn extract_frame(&mut self) -> Option<super::Frame> {
        self.decoder.as_mut().map(|d| d.extract_frame())
    }

    fn keep(mut self) -> Option<SourceHandle> {
        self.decoder.take().map(SourceHandle::new)
    }
}

impl Drop for DecoderLease {
    fn drop(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.release();
        }
    }
}

/// Owns an attempt's pending slot. Clears it on drop if the attempt ended without
/// settling it (panicking collaborator, runtime shutdown), so the key is not blocked.
struct PendingSlot {
    store: Arc<AssetStore>,
    asset: AssetId,
    attempt: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let attempt = self.attempt;
        let orphaned = self
            .store
            .lock()
            .remove_where(&self.asset, |e| e.attempt() == Some(attempt));
        if orphaned.is_empty() {
            return;
        }
        log::warn!(
            target: "frame_preview::render",
            "attempt {} for asset={} ended without a result; clearing its slot",
            attempt,
            self.asset
        );
        notify(orphaned.into_iter().flat_map(RenderEntry::into_waiters), None);
    }
}

#[derive(Clone)]
pub struct FrameRenderer {
    store: Arc<AssetStore>,
    resolver: Arc<dyn SourceResolver>,
    decoders: Arc<dyn DecoderFactory>,
    config: RenderConfig,
    next_attempt: Arc<AtomicU64>,
}

impl FrameRenderer {
    pub fn new(
        store: Arc<AssetStore>,
        resolver: Arc<dyn SourceResolver>,
        decoders: Arc<dyn DecoderFactory>,
        config: RenderConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            decoders,
            config,
            next_attempt: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn SourceResolver> {
        &self.resolver
    }

    /// Renders `asset` at `width x height` (`0x0` = default size) sampled at `timestamp_ms`.
    ///
    /// - `Ok(Some(frame))`: a frame at least the requested size, possibly shared with
    ///   concurrent callers or taken from the store.
    /// - `Ok(None)`: no source exists for this size.
    /// - `Err(RenderError::Superseded)`: a concurrent render at the same decoded size won.
    ///
    /// When decoding keeps failing past the retry bound the returned future never resolves;
    /// callers that need a bound must apply their own timeout.
    pub async fn render(
        &self,
        asset: &AssetId,
        width: u32,
        height: u32,
        save_source: bool,
        timestamp_ms: u64,
    ) -> Result<Option<RenderedFrame>, RenderError> {
        let key = RenderKey::new(width, height, timestamp_ms);
        match self.claim(asset, key) {
            Claim::Ready(frame) => {
                log::trace!(
                    target: "frame_preview::render",
                    "render: cache hit for asset={} {}",
                    asset,
                    key
                );
                Ok(Some(frame))
            }
            Claim::Wait(rx) => {
                log::debug!(
                    target: "frame_preview::render",
                    "render: joining pending attempt for asset={} {}",
                    asset,
                    key
                );
                match rx.await {
                    Ok(result) => Ok(result),
                    // Slot evicted after the retry bound; nothing will ever arrive.
                    Err(_) => std::future::pending().await,
                }
            }
            Claim::Owner(attempt) => {
                let job = RenderJob {
                    renderer: self.clone(),
                    asset: asset.clone(),
                    key,
                    save_source,
                    attempt,
                    _slot: PendingSlot {
                        store: Arc::clone(&self.store),
                        asset: asset.clone(),
                        attempt,
                    },
                };
                match tokio::spawn(job.run()).await? {
                    AttemptOutcome::Rendered(frame) => Ok(Some(frame)),
                    AttemptOutcome::NoSource => Ok(None),
                    AttemptOutcome::Superseded(winner) => {
                        Err(RenderError::superseded(winner.width, winner.height))
                    }
                    AttemptOutcome::GaveUp => std::future::pending().await,
                }
            }
        }
    }

    /// Dedup check and slot claim in one critical section.
    fn claim(&self, asset: &AssetId, key: RenderKey) -> Claim {
        let mut guard = self.store.lock();
        if let Some(entry) = guard.find_best(asset, key.width, key.height, key.timestamp_ms) {
            if let Some(frame) = entry.frame() {
                return Claim::Ready(frame.clone());
            }
            let (tx, rx) = oneshot::channel();
            if entry.add_waiter(tx).is_ok() {
                return Claim::Wait(rx);
            }
        }
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        guard.ensure(asset).push(RenderEntry::pending(key, attempt));
        Claim::Owner(attempt)
    }
}

struct RenderJob {
    renderer: FrameRenderer,
    asset: AssetId,
    key: RenderKey,
    save_source: bool,
    attempt: u64,
    _slot: PendingSlot,
}

impl RenderJob {
    async fn run(self) -> AttemptOutcome {
        let Some(mut url) = self.resolve(false).await else {
            log::debug!(
                target: "frame_preview::render",
                "no source for asset={} {}",
                self.asset,
                self.key
            );
            self.abandon();
            return AttemptOutcome::NoSource;
        };

        let max_tries = self.renderer.config.effective_max_tries();
        let mut failures = 0u32;
        loop {
            let mut lease = DecoderLease::new(
                self.renderer
                    .decoders
                    .create_decoder(&url, self.key.timestamp_ms),
            );
            log::debug!(
                target: "frame_preview::render",
                "attempt {} for asset={} {}: decoding {}",
                failures + 1,
                self.asset,
                self.key,
                url
            );

            let ready = lease.wait_ready().await;
            let err = match ready {
                Ok(()) => match lease.extract_frame() {
                    Some(frame) => {
                        let frame = RenderedFrame::new(frame, self.key.timestamp_ms);
                        return self.publish(frame, lease);
                    }
                    None => DecodeError::Released,
                },
                Err(err) => err,
            };
            drop(lease);

            failures += 1;
            log::warn!(
                target: "frame_preview::render",
                "decode failed for asset={} {} (failure {}/{}): {}",
                self.asset,
                self.key,
                failures,
                max_tries,
                err
            );
            if failures > max_tries {
                self.give_up(failures);
                return AttemptOutcome::GaveUp;
            }

            match self.resolve(true).await {
                Some(fresh) => url = fresh,
                None => {
                    log::debug!(
                        target: "frame_preview::render",
                        "source vanished on refresh for asset={} {}",
                        self.asset,
                        self.key
                    );
                    self.abandon();
                    return AttemptOutcome::NoSource;
                }
            }
        }
    }

    async fn resolve(&self, force_refresh: bool) -> Option<Url> {
        self.renderer
            .resolver
            .resolve_source(&self.asset, self.key.width, self.key.height, force_refresh)
            .await
    }

    fn publish(&self, frame: RenderedFrame, lease: DecoderLease) -> AttemptOutcome {
        let decoded = frame.key();
        let attempt = self.attempt;
        let mut guard = self.renderer.store.lock();

        if let Some(winner) = guard.rendered_at(&self.asset, decoded).cloned() {
            let mine = guard.remove_where(&self.asset, |e| e.attempt() == Some(attempt));
            drop(guard);
            drop(lease);
            log::debug!(
                target: "frame_preview::render",
                "attempt for asset={} {} superseded by existing {}",
                self.asset,
                self.key,
                decoded
            );
            notify(mine.into_iter().flat_map(RenderEntry::into_waiters), Some(winner.clone()));
            return AttemptOutcome::Superseded(winner);
        }

        let source = if self.save_source { lease.keep() } else { None };
        let replaced = guard.replace(
            &self.asset,
            |e| e.key() == decoded || e.attempt() == Some(attempt),
            RenderEntry::rendered(frame.clone(), source),
        );
        // A pending entry at the decoded size, or our own slot if the replace landed on the
        // other one, would otherwise duplicate the key.
        let merged = guard.remove_where(&self.asset, |e| {
            e.attempt() == Some(attempt) || (e.key() == decoded && !e.is_rendered())
        });
        drop(guard);

        log::info!(
            target: "frame_preview::render",
            "rendered asset={} {} as {}",
            self.asset,
            self.key,
            decoded
        );
        let waiters = replaced
            .into_iter()
            .chain(merged)
            .flat_map(RenderEntry::into_waiters);
        notify(waiters, Some(frame.clone()));
        AttemptOutcome::Rendered(frame)
    }

    /// Drops the pending slot and tells its waiters there is no source.
    fn abandon(&self) {
        let attempt = self.attempt;
        let mine = self
            .renderer
            .store
            .lock()
            .remove_where(&self.asset, |e| e.attempt() == Some(attempt));
        notify(mine.into_iter().flat_map(RenderEntry::into_waiters), None);
    }

    fn give_up(&self, failures: u32) {
        let mut guard = self.renderer.store.lock();
        // Another render may already have replaced the slot in place with a frame.
        if guard.holds_attempt(&self.asset, self.attempt) {
            let evicted = guard.evict(
                &self.asset,
                self.key.width,
                self.key.height,
                self.key.timestamp_ms,
            );
            drop(guard);
            drop(evicted);
        }
        log::error!(
            target: "frame_preview::render",
            "giving up on asset={} {} after {} failed decodes",
            self.asset,
            self.key,
            failures
        );
    }
}

/// Resumes waiters in registration order, each exactly once.
fn notify(waiters: impl Iterator<Item = Waiter>, result: Option<RenderedFrame>) {
    for waiter in waiters {
        // A waiter whose caller went away is simply skipped.
        let _ = waiter.send(result.clone());
    }
}
