//! env_logger setup: compact layout, local target stripping.

use std::io::Write;

/// Builder with the crate's layout. `RUST_LOG` overrides the default level.
pub fn builder() -> env_logger::Builder {
    let default_level = if cfg!(debug_assertions) { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    builder.format(|buf, record| {
        let target = record
            .target()
            .strip_prefix("frame_preview::")
            .unwrap_or(record.target());
        writeln!(
            buf,
            "{}  {:5}  {:5}  {}",
            buf.timestamp_seconds(),
            record.level(),
            target,
            record.args()
        )
    });
    builder
}

/// Installs the logger once; later calls are no-ops.
pub fn init() {
    let _ = builder().is_test(cfg!(test)).try_init();
}
