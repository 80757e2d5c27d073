//! Scripted collaborators for unit tests and integration test targets.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use url::Url;

use crate::compose::{Compositor, Rect};
use crate::error::DecodeError;
use crate::render::{AssetId, Decoder, DecoderFactory, Frame, SourceResolver, TimestampSelector};

const FRAME_COLOR: Rgba<u8> = Rgba([32, 96, 160, 255]);

/// Resolves every asset to `https://media.test/{asset}/{w}x{h}?v={n}`, where `n` counts
/// calls, unless the size was removed with [`ScriptedResolver::without_size`].
#[derive(Debug, Default)]
pub struct ScriptedResolver {
    missing: HashSet<(u32, u32)>,
    refresh_fails: bool,
    calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_size(mut self, width: u32, height: u32) -> Self {
        self.missing.insert((width, height));
        self
    }

    /// Forced refreshes find nothing.
    pub fn refresh_fails(mut self) -> Self {
        self.refresh_fails = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceResolver for ScriptedResolver {
    async fn resolve_source(
        &self,
        asset: &AssetId,
        width: u32,
        height: u32,
        force_refresh: bool,
    ) -> Option<Url> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if force_refresh {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.refresh_fails {
                return None;
            }
        }
        if self.missing.contains(&(width, height)) {
            return None;
        }
        Url::parse(&format!(
            "https://media.test/{}/{}x{}?v={}",
            asset, width, height, n
        ))
        .ok()
    }
}

/// How one scripted decoder behaves once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderScript {
    Ready {
        delay: Duration,
        width: u32,
        height: u32,
    },
    Error {
        delay: Duration,
        message: String,
    },
    /// `wait_ready` panics, as a crashing decoder backend would.
    Panic { delay: Duration, message: String },
}

impl DecoderScript {
    pub fn ready(width: u32, height: u32) -> Self {
        Self::ready_after(Duration::ZERO, width, height)
    }

    pub fn ready_after(delay: Duration, width: u32, height: u32) -> Self {
        Self::Ready {
            delay,
            width,
            height,
        }
    }

    pub fn error(message: &str) -> Self {
        Self::error_after(Duration::ZERO, message)
    }

    pub fn error_after(delay: Duration, message: &str) -> Self {
        Self::Error {
            delay,
            message: message.to_string(),
        }
    }

    pub fn panic(message: &str) -> Self {
        Self::panic_after(Duration::ZERO, message)
    }

    pub fn panic_after(delay: Duration, message: &str) -> Self {
        Self::Panic {
            delay,
            message: message.to_string(),
        }
    }

    fn delay(&self) -> Duration {
        match self {
            Self::Ready { delay, .. } | Self::Error { delay, .. } | Self::Panic { delay, .. } => {
                *delay
            }
        }
    }
}

type ScriptFn = dyn Fn(&Url, usize) -> DecoderScript + Send + Sync;

/// Creates decoders that follow a [`DecoderScript`] and counts creations and releases.
pub struct ScriptedDecoderFactory {
    script: Box<ScriptFn>,
    created: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl ScriptedDecoderFactory {
    /// `script` gets the source URL and the zero-based creation index.
    pub fn from_fn(script: impl Fn(&Url, usize) -> DecoderScript + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            created: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn constant(script: DecoderScript) -> Self {
        Self::from_fn(move |_, _| script.clone())
    }

    /// Plays `scripts` in creation order, then `then` for every later decoder.
    pub fn sequence(scripts: Vec<DecoderScript>, then: DecoderScript) -> Self {
        Self::from_fn(move |_, index| scripts.get(index).cloned().unwrap_or_else(|| then.clone()))
    }

    /// Picks a script from the `WxH` the source was resolved for.
    pub fn by_requested_size(
        script: impl Fn(u32, u32) -> DecoderScript + Send + Sync + 'static,
    ) -> Self {
        Self::from_fn(move |url, _| {
            let (width, height) = requested_size(url).unwrap_or((0, 0));
            script(width, height)
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

fn requested_size(url: &Url) -> Option<(u32, u32)> {
    let segment = url.path_segments()?.next_back()?;
    let (width, height) = segment.split_once('x')?;
    Some((width.parse().ok()?, height.parse().ok()?))
}

impl DecoderFactory for ScriptedDecoderFactory {
    fn create_decoder(&self, url: &Url, _timestamp_ms: u64) -> Box<dyn Decoder> {
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedDecoder {
            script: (self.script)(url, index),
            released: Arc::clone(&self.released),
            is_released: false,
        })
    }
}

struct ScriptedDecoder {
    script: DecoderScript,
    released: Arc<AtomicUsize>,
    is_released: bool,
}

#[async_trait]
impl Decoder for ScriptedDecoder {
    async fn wait_ready(&mut self) -> Result<(), DecodeError> {
        let delay = self.script.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match &self.script {
            DecoderScript::Ready { .. } => Ok(()),
            DecoderScript::Error { message, .. } => Err(DecodeError::Failed(message.clone())),
            DecoderScript::Panic { message, .. } => panic!("{message}"),
        }
    }

    fn extract_frame(&mut self) -> Frame {
        let (width, height) = match self.script {
            DecoderScript::Ready { width, height, .. } => (width, height),
            DecoderScript::Error { .. } | DecoderScript::Panic { .. } => (0, 0),
        };
        Arc::new(RgbaImage::from_pixel(width, height, FRAME_COLOR))
    }

    fn release(&mut self) {
        if !self.is_released {
            self.is_released = true;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Samples every asset at the same timestamp.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimestamp(pub u64);

impl TimestampSelector for FixedTimestamp {
    fn select_timestamp(&self, _asset: &AssetId) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Composition {
    pub rect: Rect,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Records compositions instead of drawing.
#[derive(Debug, Default)]
pub struct RecordingCompositor {
    calls: Mutex<Vec<Composition>>,
}

impl RecordingCompositor {
    pub fn calls(&self) -> Vec<Composition> {
        self.calls.lock().clone()
    }
}

impl Compositor for RecordingCompositor {
    fn compose(&self, _canvas: &mut RgbaImage, rect: Rect, raster: &RgbaImage) {
        self.calls.lock().push(Composition {
            rect,
            frame_width: raster.width(),
            frame_height: raster.height(),
        });
    }
}
