//! Centralized configuration for peerdrop.
//!
//! Defaults for every externally tunable parameter live here; the resolved
//! [`Settings`] struct is what the workers actually carry around. Wire-format
//! constants (frame prefix bytes, control-frame tags) stay in their modules.

use std::time::Duration;

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default listen address for the rendezvous relay.
pub const DEFAULT_RELAY_LISTEN: &str = "0.0.0.0:3000";

/// Default relay endpoint a peer connects to.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000";

/// Global admission cap: sessions admitted across *all* rooms at once.
/// A server-wide load-shedding policy, not a per-room limit.
pub const DEFAULT_ADMISSION_CAP: usize = 10;

// ── ICE ──────────────────────────────────────────────────────────────────────

/// Default STUN server when none is configured.
pub const DEFAULT_ICE_URL: &str = "stun:stun.l.google.com:19302";

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default data-frame budget in bytes, sequence prefix included.
///
/// The chunk payload is this minus the 2-byte sequence prefix, so a whole
/// frame never exceeds 256 KiB on the wire.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Fallback low-buffer watermark (64 KiB) used when the remote side does not
/// advertise a max message size during negotiation.
pub const DEFAULT_LOW_WATERMARK: usize = 64 * 1024;

/// Watermark derived from a negotiated max message size: `size × 16`.
pub const WATERMARK_SCALE: usize = 16;

/// Frames the disk reader keeps queued ahead of the flow-controlled sender.
pub const READ_AHEAD_FRAMES: usize = 8;

// ── Connection ───────────────────────────────────────────────────────────────

/// Label of the single negotiated data channel.
pub const DATA_CHANNEL_LABEL: &str = "dc";

/// Deadline for a negotiation attempt (offer sent / offer received until the
/// transport reports connected). Expiry is fatal to the attempt.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

// ── Stats ────────────────────────────────────────────────────────────────────

/// Bandwidth sampling interval.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

// ── Resolved settings ────────────────────────────────────────────────────────

/// ICE server coordinates, supplied externally (flags or TOML).
#[derive(Debug, Clone)]
pub struct IceSettings {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_ICE_URL.to_string(),
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Fully resolved peer-side configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub relay_url: String,
    pub ice: IceSettings,
    /// Data-frame budget in bytes, sequence prefix included.
    pub chunk_size: usize,
    /// Fallback low-buffer watermark in bytes.
    pub watermark: usize,
    pub stats_interval: Duration,
    pub negotiation_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice: IceSettings::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            watermark: DEFAULT_LOW_WATERMARK,
            stats_interval: DEFAULT_STATS_INTERVAL,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}
