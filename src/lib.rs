mod compose;
pub mod config;
pub mod error;
pub mod logging;
mod preview;
pub mod render;
#[cfg(any(test, feature = "integration-test-api"))]
pub mod test_support;

pub use compose::{Compositor, ImageCompositor, Rect, fit_to_height};
pub use config::RenderConfig;
pub use error::{DecodeError, RenderError};
pub use preview::{
    ComposedFrame, OutputSurface, ProgressiveOrchestrator, UpgradeDiscard, UpgradeState,
    discard_upgrade_failure,
};
pub use render::{
    AssetId, AssetStore, Decoder, DecoderFactory, EntrySummary, Frame, FrameRenderer,
    RenderEntry, RenderKey, RenderedFrame, SourceHandle, SourceResolver, StoreGuard,
    TimestampSelector,
};
