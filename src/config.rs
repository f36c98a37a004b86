//! Runtime-configurable engine behavior.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `HALOEX_`) or by constructing a custom `HaloConfig`.

use crate::types::MethodFlags;

/// Tuning parameters consumed at engine construction.
#[derive(Debug, Clone)]
pub struct HaloConfig {
    /// Run the stabilizing barriers at the start and end of `exchange()`.
    /// The closing barrier also guards shared-host staging reuse across
    /// steps, so disable it only for single-rank runs.
    pub exchange_barriers: bool,

    /// Methods enabled before any `set_methods` call.
    pub default_methods: MethodFlags,
}

impl Default for HaloConfig {
    fn default() -> Self {
        Self {
            exchange_barriers: true,
            default_methods: MethodFlags::ALL,
        }
    }
}

impl HaloConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `HALOEX_EXCHANGE_BARRIERS` (`0` or `1`)
    /// - `HALOEX_METHODS` (comma list of `kernel`, `peer`, `colocated`,
    ///   `remote`, `all`, `none`)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HALOEX_EXCHANGE_BARRIERS") {
            if let Ok(n) = v.parse::<u8>() {
                cfg.exchange_barriers = n != 0;
            }
        }
        if let Ok(v) = std::env::var("HALOEX_METHODS") {
            if let Some(flags) = parse_methods(&v) {
                cfg.default_methods = flags;
            }
        }

        cfg
    }
}

fn parse_methods(s: &str) -> Option<MethodFlags> {
    let mut flags = MethodFlags::NONE;
    for part in s.split(',') {
        match part.trim().to_ascii_lowercase().as_str() {
            "kernel" => flags |= MethodFlags::KERNEL,
            "peer" => flags |= MethodFlags::PEER_COPY,
            "colocated" => flags |= MethodFlags::COLOCATED,
            "remote" => flags |= MethodFlags::REMOTE,
            "all" => flags |= MethodFlags::ALL,
            "none" | "" => {}
            _ => return None,
        }
    }
    Some(flags)
}
