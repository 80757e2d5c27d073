//! Progressive preview: a cheap default-size frame first, the full-resolution frame after
//! a delay, both composed onto the same output surface.

use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::compose::{Compositor, Rect, fit_to_height};
use crate::error::RenderError;
use crate::render::{AssetId, FrameRenderer, RenderedFrame, TimestampSelector};

/// What the surface currently shows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposedFrame {
    pub rect: Rect,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Why a render issued by the orchestrator produced nothing to compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeDiscard {
    NoSource,
    Superseded,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Pending,
    Upgraded,
    Discarded(UpgradeDiscard),
}

struct SurfaceInner {
    width: u32,
    height: u32,
    canvas: Mutex<RgbaImage>,
    composed: watch::Sender<Option<ComposedFrame>>,
    upgrade: Mutex<UpgradeState>,
}

/// Shared handle to a `width x height` output canvas.
#[derive(Clone)]
pub struct OutputSurface {
    inner: Arc<SurfaceInner>,
}

impl OutputSurface {
    pub fn new(width: u32, height: u32) -> Self {
        let (composed, _) = watch::channel(None);
        Self {
            inner: Arc::new(SurfaceInner {
                width,
                height,
                canvas: Mutex::new(RgbaImage::new(width, height)),
                composed,
                upgrade: Mutex::new(UpgradeState::Pending),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn composed(&self) -> Option<ComposedFrame> {
        *self.inner.composed.borrow()
    }

    /// Notified on every composition.
    pub fn subscribe(&self) -> watch::Receiver<Option<ComposedFrame>> {
        self.inner.composed.subscribe()
    }

    pub fn upgrade_state(&self) -> UpgradeState {
        *self.inner.upgrade.lock()
    }

    pub fn with_canvas<R>(&self, f: impl FnOnce(&RgbaImage) -> R) -> R {
        f(&self.inner.canvas.lock())
    }

    fn compose(&self, compositor: &dyn Compositor, frame: &RenderedFrame) -> ComposedFrame {
        let rect = fit_to_height(frame.width, frame.height, self.width(), self.height());
        compositor.compose(&mut self.inner.canvas.lock(), rect, &frame.frame);
        let composed = ComposedFrame {
            rect,
            frame_width: frame.width,
            frame_height: frame.height,
        };
        self.inner.composed.send_replace(Some(composed));
        composed
    }

    fn set_upgrade_state(&self, state: UpgradeState) {
        *self.inner.upgrade.lock() = state;
    }
}

impl std::fmt::Debug for OutputSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSurface")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("composed", &self.composed())
            .field("upgrade", &self.upgrade_state())
            .finish()
    }
}

type UpgradeCallback = Box<dyn FnOnce(&OutputSurface) + Send>;

/// `onUpgraded`, fired at most once.
struct UpgradeSignal {
    callback: Mutex<Option<UpgradeCallback>>,
}

impl UpgradeSignal {
    fn new(callback: impl FnOnce(&OutputSurface) + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    fn fire(&self, surface: &OutputSurface) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback(surface);
                true
            }
            None => false,
        }
    }
}

/// Discard policy for the delayed full-resolution render: its failure is recorded on the
/// surface and logged, never reported to the caller of `present`. The surface keeps
/// whatever it already shows.
pub fn discard_upgrade_failure(asset: &AssetId, surface: &OutputSurface, reason: UpgradeDiscard) {
    log::debug!(
        target: "frame_preview::preview",
        "discarding full-resolution upgrade for asset={}: {:?}",
        asset,
        reason
    );
    surface.set_upgrade_state(UpgradeState::Discarded(reason));
}

pub struct ProgressiveOrchestrator {
    renderer: FrameRenderer,
    timestamps: Arc<dyn TimestampSelector>,
    compositor: Arc<dyn Compositor>,
}

impl ProgressiveOrchestrator {
    pub fn new(
        renderer: FrameRenderer,
        timestamps: Arc<dyn TimestampSelector>,
        compositor: Arc<dyn Compositor>,
    ) -> Self {
        Self {
            renderer,
            timestamps,
            compositor,
        }
    }

    pub fn renderer(&self) -> &FrameRenderer {
        &self.renderer
    }

    /// Creates a `target_width x target_height` surface for `asset` and fills it in the
    /// background: the default-size frame as soon as it renders, then the full-resolution
    /// frame after the configured upgrade delay.
    ///
    /// Returns `None`, without creating a surface, when the asset has no source at the
    /// target size. `on_upgraded` runs at most once, after a frame meeting the target size
    /// has been composed.
    pub async fn present(
        &self,
        asset: &AssetId,
        target_width: u32,
        target_height: u32,
        save_source: bool,
        on_upgraded: impl FnOnce(&OutputSurface) + Send + 'static,
    ) -> Option<OutputSurface> {
        let source = self
            .renderer
            .resolver()
            .resolve_source(asset, target_width, target_height, false)
            .await;
        if source.is_none() {
            log::debug!(
                target: "frame_preview::preview",
                "present: no source for asset={} at {}x{}",
                asset,
                target_width,
                target_height
            );
            return None;
        }

        let timestamp_ms = self.timestamps.select_timestamp(asset);
        let surface = OutputSurface::new(target_width, target_height);
        log::debug!(
            target: "frame_preview::preview",
            "present: asset={} target={}x{} timestamp_ms={}",
            asset,
            target_width,
            target_height,
            timestamp_ms
        );

        let task = ProgressiveTask {
            renderer: self.renderer.clone(),
            compositor: Arc::clone(&self.compositor),
            asset: asset.clone(),
            surface: surface.clone(),
            save_source,
            timestamp_ms,
            signal: UpgradeSignal::new(on_upgraded),
        };
        tokio::spawn(task.run());
        Some(surface)
    }
}

struct ProgressiveTask {
    renderer: FrameRenderer,
    compositor: Arc<dyn Compositor>,
    asset: AssetId,
    surface: OutputSurface,
    save_source: bool,
    timestamp_ms: u64,
    signal: UpgradeSignal,
}

impl ProgressiveTask {
    async fn run(self) {
        let (target_width, target_height) = (self.surface.width(), self.surface.height());

        match self.render(0, 0).await {
            Ok(frame) => {
                self.surface.compose(self.compositor.as_ref(), &frame);
                if frame.meets(target_width, target_height) {
                    self.upgraded();
                    return;
                }
            }
            Err(reason) => {
                log::debug!(
                    target: "frame_preview::preview",
                    "default-size frame unavailable for asset={}: {:?}",
                    self.asset,
                    reason
                );
            }
        }

        tokio::time::sleep(self.renderer.config().effective_upgrade_delay()).await;

        match self.render(target_width, target_height).await {
            Ok(frame) => {
                self.surface.compose(self.compositor.as_ref(), &frame);
                self.upgraded();
            }
            Err(reason) => discard_upgrade_failure(&self.asset, &self.surface, reason),
        }
    }

    async fn render(&self, width: u32, height: u32) -> Result<RenderedFrame, UpgradeDiscard> {
        let render = self.renderer.render(
            &self.asset,
            width,
            height,
            self.save_source,
            self.timestamp_ms,
        );
        let result = match self.renderer.config().effective_render_timeout() {
            Some(limit) => tokio::time::timeout(limit, render)
                .await
                .map_err(|_| UpgradeDiscard::TimedOut)?,
            None => render.await,
        };
        match result {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(UpgradeDiscard::NoSource),
            Err(RenderError::Superseded { .. }) => Err(UpgradeDiscard::Superseded),
            Err(err) => {
                log::warn!(
                    target: "frame_preview::preview",
                    "render failed for asset={} at {}x{}: {}",
                    self.asset,
                    width,
                    height,
                    err
                );
                Err(UpgradeDiscard::Failed)
            }
        }
    }

    fn upgraded(&self) {
        self.surface.set_upgrade_state(UpgradeState::Upgraded);
        if self.signal.fire(&self.surface) {
            log::info!(
                target: "frame_preview::preview",
                "asset={} upgraded to {:?}",
                self.asset,
                self.surface.composed()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::config::RenderConfig;
    use crate::render::AssetStore;
    use crate::test_support::{
        DecoderScript, FixedTimestamp, RecordingCompositor, ScriptedDecoderFactory,
        ScriptedResolver,
    };

    struct Harness {
        orchestrator: ProgressiveOrchestrator,
        decoders: Arc<ScriptedDecoderFactory>,
        compositor: Arc<RecordingCompositor>,
        upgrades: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(resolver: ScriptedResolver, decoders: ScriptedDecoderFactory) -> Self {
            Self::with_config(resolver, decoders, RenderConfig::default())
        }

        fn with_config(
            resolver: ScriptedResolver,
            decoders: ScriptedDecoderFactory,
            config: RenderConfig,
        ) -> Self {
            let decoders = Arc::new(decoders);
            let compositor = Arc::new(RecordingCompositor::default());
            let renderer = FrameRenderer::new(
                Arc::new(AssetStore::new()),
                Arc::new(resolver),
                decoders.clone(),
                config,
            );
            Self {
                orchestrator: ProgressiveOrchestrator::new(
                    renderer,
                    Arc::new(FixedTimestamp(1500)),
                    compositor.clone(),
                ),
                decoders,
                compositor,
                upgrades: Arc::new(AtomicUsize::new(0)),
            }
        }

        async fn present(&self, width: u32, height: u32) -> Option<OutputSurface> {
            let upgrades = Arc::clone(&self.upgrades);
            self.orchestrator
                .present(&"abc".into(), width, height, false, move |_: &OutputSurface| {
                    upgrades.fetch_add(1, Ordering::SeqCst);
                })
                .await
        }

        fn upgrades(&self) -> usize {
            self.upgrades.load(Ordering::SeqCst)
        }
    }

    fn default_then_full() -> ScriptedDecoderFactory {
        ScriptedDecoderFactory::by_requested_size(|width, _| {
            if width == 0 {
                DecoderScript::ready(256, 144)
            } else {
                DecoderScript::ready(720, 404)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn small_frame_then_full_resolution_upgrade() {
        let harness = Harness::new(ScriptedResolver::new(), default_then_full());
        let started = Instant::now();
        let surface = harness.present(720, 404).await.unwrap();
        let mut changes = surface.subscribe();

        let first = *changes.wait_for(Option::is_some).await.unwrap();
        let first = first.unwrap();
        assert_eq!((first.frame_width, first.frame_height), (256, 144));
        assert!((first.rect.width - 404.0 * 256.0 / 144.0).abs() < 1e-9);
        assert!((first.rect.x - (720.0 - first.rect.width) / 2.0).abs() < 1e-9);
        assert_eq!(first.rect.height, 404.0);
        assert_eq!(harness.upgrades(), 0);
        assert_eq!(surface.upgrade_state(), UpgradeState::Pending);

        let second = *changes
            .wait_for(|c| c.is_some_and(|c| c.frame_width == 720))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(6000));
        assert_eq!(
            second.unwrap().rect,
            Rect {
                x: 0.0,
                y: 0.0,
                width: 720.0,
                height: 404.0
            }
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(harness.upgrades(), 1);
        assert_eq!(surface.upgrade_state(), UpgradeState::Upgraded);
        assert_eq!(harness.compositor.calls().len(), 2);
        assert_eq!(harness.decoders.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_default_source_still_upgrades_once() {
        let harness = Harness::new(
            ScriptedResolver::new().without_size(0, 0),
            default_then_full(),
        );
        let surface = harness.present(720, 404).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5900)).await;
        assert!(surface.composed().is_none());
        assert_eq!(harness.upgrades(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let composed = surface.composed().unwrap();
        assert_eq!((composed.frame_width, composed.frame_height), (720, 404));
        assert_eq!(harness.upgrades(), 1);
        assert_eq!(harness.compositor.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_source_at_target_creates_no_surface() {
        let harness = Harness::new(
            ScriptedResolver::new().without_size(720, 404),
            default_then_full(),
        );
        assert!(harness.present(720, 404).await.is_none());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(harness.decoders.created(), 0);
        assert_eq!(harness.upgrades(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_frame_meeting_target_finishes_immediately() {
        let harness = Harness::new(
            ScriptedResolver::new(),
            ScriptedDecoderFactory::constant(DecoderScript::ready(1280, 720)),
        );
        let surface = harness.present(720, 404).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(harness.upgrades(), 1);
        assert_eq!(harness.decoders.created(), 1);
        assert_eq!(harness.compositor.calls().len(), 1);
        assert_eq!(surface.upgrade_state(), UpgradeState::Upgraded);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upgrade_is_discarded_and_small_frame_kept() {
        let harness = Harness::new(
            ScriptedResolver::new().refresh_fails(),
            ScriptedDecoderFactory::by_requested_size(|width, _| {
                if width == 0 {
                    DecoderScript::ready(256, 144)
                } else {
                    DecoderScript::error("segment 404")
                }
            }),
        );
        let surface = harness.present(720, 404).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            surface.upgrade_state(),
            UpgradeState::Discarded(UpgradeDiscard::NoSource)
        );
        assert_eq!(surface.composed().unwrap().frame_width, 256);
        assert_eq!(harness.upgrades(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_that_gives_up_is_timed_out() {
        let harness = Harness::with_config(
            ScriptedResolver::new(),
            ScriptedDecoderFactory::by_requested_size(|width, _| {
                if width == 0 {
                    DecoderScript::ready(256, 144)
                } else {
                    DecoderScript::error_after(Duration::from_millis(100), "decode stalled")
                }
            }),
            RenderConfig {
                render_timeout_ms: Some(5000),
                ..RenderConfig::default()
            },
        );
        let surface = harness.present(720, 404).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            surface.upgrade_state(),
            UpgradeState::Discarded(UpgradeDiscard::TimedOut)
        );
        assert_eq!(harness.decoders.created(), 1 + 6);
        assert_eq!(harness.upgrades(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_render_that_gives_up_still_schedules_the_upgrade() {
        let harness = Harness::with_config(
            ScriptedResolver::new(),
            ScriptedDecoderFactory::by_requested_size(|width, _| {
                if width == 0 {
                    DecoderScript::error("corrupt keyframe")
                } else {
                    DecoderScript::ready(720, 404)
                }
            }),
            RenderConfig {
                render_timeout_ms: Some(10_000),
                ..RenderConfig::default()
            },
        );
        let surface = harness.present(720, 404).await.unwrap();

        tokio::time::sleep(Duration::from_millis(15_900)).await;
        assert!(surface.composed().is_none());
        assert_eq!(harness.decoders.created(), 6);
        assert_eq!(harness.upgrades(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let composed = surface.composed().unwrap();
        assert_eq!((composed.frame_width, composed.frame_height), (720, 404));
        assert_eq!(surface.upgrade_state(), UpgradeState::Upgraded);
        assert_eq!(harness.upgrades(), 1);
        assert_eq!(harness.compositor.calls().len(), 1);
        assert_eq!(harness.decoders.created(), 7);
    }

    #[test]
    fn upgrade_signal_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let signal = UpgradeSignal::new(move |_: &OutputSurface| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let surface = OutputSurface::new(4, 4);
        assert!(signal.fire(&surface));
        assert!(!signal.fire(&surface));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn discard_policy_records_reason() {
        let surface = OutputSurface::new(4, 4);
        discard_upgrade_failure(&"abc".into(), &surface, UpgradeDiscard::Superseded);
        assert_eq!(
            surface.upgrade_state(),
            UpgradeState::Discarded(UpgradeDiscard::Superseded)
        );
    }
}
