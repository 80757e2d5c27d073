//! Render data model and the collaborators the render engine depends on.
//!
//! Source resolution, decoding and timestamp selection live outside this crate; they are
//! injected through the traits below.

mod renderer;
mod store;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::DecodeError;

pub use renderer::FrameRenderer;
pub use store::{AssetStore, EntrySummary, RenderEntry, StoreGuard};

/// Decoded raster image. Immutable once published.
pub type Frame = Arc<image::RgbaImage>;

/// Opaque identifier of a remote video asset, compared by equality.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(Arc<str>);

impl AssetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({:?})", &*self.0)
    }
}

/// Size and sample point of one render within an asset.
///
/// `0x0` is the "smallest/default" request and does not take part in size matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderKey {
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
}

impl RenderKey {
    pub fn new(width: u32, height: u32, timestamp_ms: u64) -> Self {
        Self {
            width,
            height,
            timestamp_ms,
        }
    }

    pub fn is_default_size(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

impl fmt::Display for RenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}ms", self.width, self.height, self.timestamp_ms)
    }
}

/// A completed render: actual decoded dimensions plus the frame.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    pub frame: Frame,
}

impl RenderedFrame {
    pub fn new(frame: Frame, timestamp_ms: u64) -> Self {
        let (width, height) = frame.dimensions();
        Self {
            width,
            height,
            timestamp_ms,
            frame,
        }
    }

    pub fn key(&self) -> RenderKey {
        RenderKey::new(self.width, self.height, self.timestamp_ms)
    }

    /// True when the frame is at least `width x height`.
    pub fn meets(&self, width: u32, height: u32) -> bool {
        self.width >= width && self.height >= height
    }

    pub fn same_frame(&self, other: &RenderedFrame) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }
}

/// `resolveSource`: a fetchable media URL sized to at least the request.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// `force_refresh` asks for a fresh URL bypassing any upstream cache.
    async fn resolve_source(
        &self,
        asset: &AssetId,
        width: u32,
        height: u32,
        force_refresh: bool,
    ) -> Option<Url>;
}

/// `selectTimestamp`: deterministic per-asset sample point.
pub trait TimestampSelector: Send + Sync {
    fn select_timestamp(&self, asset: &AssetId) -> u64;
}

/// `createDecoder`: a muted, paused decoder seeked to `timestamp_ms`.
pub trait DecoderFactory: Send + Sync {
    fn create_decoder(&self, url: &Url, timestamp_ms: u64) -> Box<dyn Decoder>;
}

#[async_trait]
pub trait Decoder: Send {
    /// Resolves on the decoder's single `dataReady` or `error` signal.
    async fn wait_ready(&mut self) -> Result<(), DecodeError>;

    /// Snapshot of the current visual state. Only valid after `wait_ready` succeeded.
    fn extract_frame(&mut self) -> Frame;

    /// Idempotent teardown.
    fn release(&mut self);
}

/// A decoder retained after a successful render (`save_source`). Released on drop.
pub struct SourceHandle {
    decoder: Box<dyn Decoder>,
}

impl SourceHandle {
    pub(crate) fn new(decoder: Box<dyn Decoder>) -> Self {
        Self { decoder }
    }

    pub fn decoder_mut(&mut self) -> &mut dyn Decoder {
        self.decoder.as_mut()
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.decoder.release();
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SourceHandle")
    }
}
