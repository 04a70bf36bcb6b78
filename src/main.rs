mod core;
mod utils;
mod workers;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::signaling::server::RelayServer;
use crate::utils::stop::StopSignal;
use workers::args::{self, Args, Command, FileConfig};
use workers::peer::{self, Role};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::load();

    // Note: webrtc_ice warns about late-arriving STUN responses ("unknown
    // TransactionID"), which are normal. Keep them out of the default levels.
    let filter = match args.verbose {
        0 => "warn,peerdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let stop = StopSignal::new();

    // Ctrl+C handler
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl_c_stop.stop();
    });

    let file = FileConfig::load(args.conf.as_deref());

    match args.command {
        Command::Relay { listen, cap } => {
            let (listen, cap) = args::resolve_relay(listen.as_deref(), cap, &file);
            RelayServer::bind(&listen, cap).await?.run(stop).await
        }
        Command::Send {
            file: path,
            room,
            opts,
        } => {
            let settings = args::resolve_settings(&opts, &file);
            peer::run(settings, room, Role::Send { file: path }, stop).await
        }
        Command::Recv { room, output, opts } => {
            let settings = args::resolve_settings(&opts, &file);
            peer::run(settings, room, Role::Recv { output }, stop).await
        }
    }
}
