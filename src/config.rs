//! Render and upgrade tuning. Every field is optional; `effective_*` applies defaults.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_MAX_TRIES: u32 = 5;
pub const DEFAULT_UPGRADE_DELAY_MS: u64 = 6000;
pub const DEFAULT_RENDER_TIMEOUT_MS: u64 = 60_000;

const ENV_MAX_TRIES: &str = "FRAME_PREVIEW_MAX_TRIES";
const ENV_UPGRADE_DELAY_MS: &str = "FRAME_PREVIEW_UPGRADE_DELAY_MS";
const ENV_RENDER_TIMEOUT_MS: &str = "FRAME_PREVIEW_RENDER_TIMEOUT_MS";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    /// A key gives up once its decode failure count exceeds this.
    pub max_tries: Option<u32>,
    /// Delay before the full-resolution render is issued.
    pub upgrade_delay_ms: Option<u64>,
    /// Timeout the orchestrator applies to each render it issues. 0 disables; a default-size
    /// render that gives up then never resolves, so the full-resolution upgrade is never issued.
    pub render_timeout_ms: Option<u64>,
}

impl RenderConfig {
    pub fn effective_max_tries(&self) -> u32 {
        self.max_tries.unwrap_or(DEFAULT_MAX_TRIES)
    }

    pub fn effective_upgrade_delay(&self) -> Duration {
        Duration::from_millis(self.upgrade_delay_ms.unwrap_or(DEFAULT_UPGRADE_DELAY_MS))
    }

    pub fn effective_render_timeout(&self) -> Option<Duration> {
        match self.render_timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Reads overrides from `FRAME_PREVIEW_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            max_tries: parse_var(&lookup, ENV_MAX_TRIES),
            upgrade_delay_ms: parse_var(&lookup, ENV_UPGRADE_DELAY_MS),
            render_timeout_ms: parse_var(&lookup, ENV_RENDER_TIMEOUT_MS),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(
                target: "frame_preview::config",
                "ignoring {}: not a valid number ({:?})",
                key,
                raw
            );
            None
        }
    }
}
