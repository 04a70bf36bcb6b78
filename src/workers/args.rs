//! Command-line arguments and the optional TOML file they merge with.
//!
//! Every operational parameter is configurable: CLI values override file
//! values, file values override the built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::warn;

use crate::core::config::{
    self, IceSettings, Settings, DEFAULT_ADMISSION_CAP, DEFAULT_RELAY_LISTEN,
};
use crate::core::pipeline::frame::SEQ_PREFIX_LEN;

/// peerdrop — room-paired WebRTC file drop.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// TOML file with defaults for the tunables. Without this flag,
    /// `peerdrop.toml` in the working directory is used when present.
    #[clap(long)]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the rendezvous relay.
    Relay {
        /// Listen address (host:port).
        #[clap(long)]
        listen: Option<String>,
        /// Global admission cap across all rooms.
        #[clap(long)]
        cap: Option<usize>,
    },
    /// Join a room and send a file to the paired peer.
    Send {
        /// File to send.
        file: PathBuf,
        /// Room code to rendezvous in.
        #[clap(long)]
        room: String,
        #[command(flatten)]
        opts: PeerOpts,
    },
    /// Join a room and save every received file.
    Recv {
        /// Room code to rendezvous in.
        #[clap(long)]
        room: String,
        /// Directory received files are saved into.
        #[clap(long, default_value = ".")]
        output: PathBuf,
        #[command(flatten)]
        opts: PeerOpts,
    },
}

/// Peer-side tunables shared by `send` and `recv`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct PeerOpts {
    /// Relay endpoint, e.g. ws://relay.example:3000.
    #[clap(long)]
    pub relay: Option<String>,

    /// ICE server URL (stun: or turn:).
    #[clap(long)]
    pub ice_url: Option<String>,

    #[clap(long)]
    pub ice_username: Option<String>,

    #[clap(long)]
    pub ice_credential: Option<String>,

    /// Data-frame budget in bytes, sequence prefix included.
    #[clap(long)]
    pub chunk_size: Option<usize>,

    /// Fallback low-buffer watermark in bytes.
    #[clap(long)]
    pub watermark: Option<usize>,

    /// Bandwidth sample interval in milliseconds.
    #[clap(long)]
    pub stats_interval_ms: Option<u64>,

    /// Negotiation deadline in seconds.
    #[clap(long)]
    pub negotiation_timeout_secs: Option<u64>,
}

impl Args {
    pub fn load() -> Self {
        Args::parse()
    }
}

/// The TOML shape: every key optional, same names as the flags.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub cap: Option<usize>,
    pub relay: Option<String>,
    pub ice_url: Option<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
    pub chunk_size: Option<usize>,
    pub watermark: Option<usize>,
    pub stats_interval_ms: Option<u64>,
    pub negotiation_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Load from `path`, or from `peerdrop.toml` when no path was given.
    /// Missing or unparseable files fall back to empty defaults with a log
    /// line rather than aborting startup.
    pub fn load(path: Option<&Path>) -> Self {
        let default_path = Path::new("peerdrop.toml");
        let path = path.unwrap_or(default_path);
        if !path.exists() {
            return Self::default();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(event = "config_read_failed", path = %path.display(), error = %e);
                return Self::default();
            }
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(event = "config_parse_failed", path = %path.display(), error = %e);
                Self::default()
            }
        }
    }
}

/// Merge flags, file, and defaults into peer [`Settings`].
pub fn resolve_settings(opts: &PeerOpts, file: &FileConfig) -> Settings {
    let defaults = Settings::default();
    let chunk_size = opts
        .chunk_size
        .or(file.chunk_size)
        .unwrap_or(defaults.chunk_size);
    let chunk_size = if chunk_size <= SEQ_PREFIX_LEN {
        warn!(
            event = "chunk_size_too_small",
            chunk_size,
            fallback = defaults.chunk_size
        );
        defaults.chunk_size
    } else {
        chunk_size
    };

    Settings {
        relay_url: opts
            .relay
            .clone()
            .or_else(|| file.relay.clone())
            .unwrap_or(defaults.relay_url),
        ice: IceSettings {
            url: opts
                .ice_url
                .clone()
                .or_else(|| file.ice_url.clone())
                .unwrap_or_else(|| config::DEFAULT_ICE_URL.to_string()),
            username: opts
                .ice_username
                .clone()
                .or_else(|| file.ice_username.clone())
                .unwrap_or_default(),
            credential: opts
                .ice_credential
                .clone()
                .or_else(|| file.ice_credential.clone())
                .unwrap_or_default(),
        },
        chunk_size,
        watermark: opts
            .watermark
            .or(file.watermark)
            .unwrap_or(defaults.watermark),
        stats_interval: opts
            .stats_interval_ms
            .or(file.stats_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.stats_interval),
        negotiation_timeout: opts
            .negotiation_timeout_secs
            .or(file.negotiation_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.negotiation_timeout),
    }
}

/// Merge flags, file, and defaults into relay settings.
pub fn resolve_relay(listen: Option<&str>, cap: Option<usize>, file: &FileConfig) -> (String, usize) {
    let listen = listen
        .map(str::to_string)
        .or_else(|| file.listen.clone())
        .unwrap_or_else(|| DEFAULT_RELAY_LISTEN.to_string());
    let cap = cap.or(file.cap).unwrap_or(DEFAULT_ADMISSION_CAP);
    (listen, cap)
}
