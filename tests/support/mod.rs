#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use frame_preview::test_support::{
    FixedTimestamp, RecordingCompositor, ScriptedDecoderFactory, ScriptedResolver,
};
use frame_preview::{AssetStore, FrameRenderer, ProgressiveOrchestrator, RenderConfig};

pub const TIMESTAMP_MS: u64 = 1500;

/// Runs `future` on a current-thread runtime with paused time, so upgrade delays and
/// decoder scripts complete instantly.
pub fn block_on<T>(future: impl std::future::Future<Output = T>) -> T {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("create tokio runtime");
    runtime.block_on(future)
}

pub struct RenderEnv {
    pub resolver: Arc<ScriptedResolver>,
    pub decoders: Arc<ScriptedDecoderFactory>,
    pub renderer: FrameRenderer,
}

impl RenderEnv {
    pub fn new(resolver: ScriptedResolver, decoders: ScriptedDecoderFactory) -> Self {
        Self::with_config(resolver, decoders, RenderConfig::default())
    }

    pub fn with_config(
        resolver: ScriptedResolver,
        decoders: ScriptedDecoderFactory,
        config: RenderConfig,
    ) -> Self {
        let resolver = Arc::new(resolver);
        let decoders = Arc::new(decoders);
        let renderer = FrameRenderer::new(
            Arc::new(AssetStore::new()),
            resolver.clone(),
            decoders.clone(),
            config,
        );
        Self {
            resolver,
            decoders,
            renderer,
        }
    }
}

pub struct PreviewEnv {
    pub render: RenderEnv,
    pub compositor: Arc<RecordingCompositor>,
    pub orchestrator: ProgressiveOrchestrator,
}

impl PreviewEnv {
    pub fn new(resolver: ScriptedResolver, decoders: ScriptedDecoderFactory) -> Self {
        let render = RenderEnv::new(resolver, decoders);
        let compositor = Arc::new(RecordingCompositor::default());
        let orchestrator = ProgressiveOrchestrator::new(
            render.renderer.clone(),
            Arc::new(FixedTimestamp(TIMESTAMP_MS)),
            compositor.clone(),
        );
        Self {
            render,
            compositor,
            orchestrator,
        }
    }
}

/// Counts `onUpgraded` invocations.
#[derive(Clone, Default)]
pub struct UpgradeCounter(Arc<AtomicUsize>);

impl UpgradeCounter {
    pub fn callback(&self) -> impl FnOnce(&frame_preview::OutputSurface) + Send + 'static {
        let count = Arc::clone(&self.0);
        move |_: &frame_preview::OutputSurface| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
