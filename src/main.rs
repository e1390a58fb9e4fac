#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hashi
//!
//! Tunnel Discord rich presence from a machine without Discord (the remote
//! side, e.g. an RDP or VM guest) to the machine running it (the home side).
//!
//! ## Subcommands
//!
//! - `hashi client` — remote side: fake `discord-ipc-N` endpoints + tunnel client
//! - `hashi server` — home side: tunnel relay + bridge to the real Discord
//! - `hashi config show|set-client-ip|set-port` — inspect or edit `hashi.toml`
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, startup, shutdown wiring
//! config.rs        — TOML + env-var configuration
//! protocol.rs      — tunnel envelopes (JSON over WS text frames)
//! frame.rs         — Discord IPC SET_ACTIVITY presence-clear frame
//! ipc/             — Unix socket / named pipe endpoints
//! mux.rs           — remote side: fake endpoints, fan-out of responses
//! bridge.rs        — home side: per-session connections to Discord
//! reaper.rs        — home side: idle connection eviction
//! shutdown.rs      — signal handling, presence-clear handshake
//! tunnel/
//!   mod.rs         — session state machine, outbound queue
//!   client.rs      — outbound WS, heartbeat, reconnect
//!   relay.rs       — WS server, admission, grace + liveness sweep
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hashi::config::Config;
use hashi::ipc::IpcEndpoints;
use hashi::shutdown::{wait_for_signal, HomeShutdown, RemoteShutdown};
use hashi::tunnel::{self, relay::RelayState};
use hashi::{reaper, Multiplexer, TunnelLink};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Tunnel Discord rich presence between two machines.
#[derive(Parser)]
#[command(name = "hashi", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the remote side (the machine without Discord).
    Client {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the home side (the machine running Discord).
    Server {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Show or edit the configuration file.
    Config {
        /// Path to TOML config file.
        #[arg(long, global = true)]
        config: Option<String>,
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration.
    Show,
    /// Set the home machine's address used by `hashi client`.
    SetClientIp { ip: String },
    /// Set the tunnel port for both sides.
    SetPort { port: u16 },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Client { config } => run_client(config.as_deref()).await,
        Commands::Server { config } => run_server(config.as_deref()).await,
        Commands::Config { config, action } => run_config(config.as_deref(), action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("hashi: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing from `RUST_LOG`, falling back to the configured level.
fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    std::panic::set_hook(Box::new(|info| {
        error!("panic: {info}");
    }));
}

async fn run_client(config_path: Option<&str>) -> Result<(), BoxError> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    info!("hashi v{} starting (client)", env!("CARGO_PKG_VERSION"));
    if config.client.targets_localhost() {
        warn!(
            "main_pc_ip is {}; the tunnel will only reach this machine. \
             Set MAIN_PC_IP or run `hashi config set-client-ip <ip>`",
            config.client.main_pc_ip
        );
    }

    let endpoints = IpcEndpoints::resolve()?;
    info!("Fake Discord IPC endpoints at {}N", endpoints.base());

    let link = TunnelLink::new();
    let mux = Multiplexer::new(endpoints, link.clone());
    mux.start().await;

    let timers = CancellationToken::new();
    let mut client = tunnel::client::spawn(config.client.clone(), mux.clone(), link.clone(), timers.clone());
    let shutdown = RemoteShutdown::new(timers, link, mux);

    let client_finished = tokio::select! {
        () = wait_for_signal() => false,
        res = &mut client => {
            warn!("Tunnel client stopped unexpectedly: {res:?}");
            true
        }
    };

    shutdown.run().await;
    // Let the client loop write its close frame and exit.
    if !client_finished && tokio::time::timeout(Duration::from_secs(1), &mut client).await.is_err() {
        client.abort();
    }
    Ok(())
}

async fn run_server(config_path: Option<&str>) -> Result<(), BoxError> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    info!("hashi v{} starting (server)", env!("CARGO_PKG_VERSION"));

    let endpoints = IpcEndpoints::resolve()?;
    let available = endpoints.available();
    if available.is_empty() {
        warn!("No Discord IPC endpoints found at {}N; is Discord running?", endpoints.base());
    } else {
        let list: Vec<String> = available.iter().map(ToString::to_string).collect();
        info!("Discord IPC endpoints available: {}", list.join(", "));
    }

    let relay = RelayState::new(config.server.max_clients, endpoints);
    let listener = TcpListener::bind(("0.0.0.0", config.server.port)).await?;
    info!(
        "Listening on 0.0.0.0:{} (max {} clients)",
        config.server.port, config.server.max_clients
    );

    let timers = CancellationToken::new();
    let sweeper = tunnel::relay::spawn_sweeper(relay.clone(), timers.clone());
    let reaper = reaper::spawn(relay.clone(), timers.clone());
    let shutdown = HomeShutdown::new(timers, relay.clone());

    let on_signal = {
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.run().await;
        }
    };
    let result = tunnel::relay::serve(listener, relay, on_signal).await;

    // Also covers the server stopping on its own.
    shutdown.run().await;
    sweeper.abort();
    reaper.abort();
    result.map_err(Into::into)
}

fn run_config(config_path: Option<&str>, action: ConfigAction) -> Result<(), BoxError> {
    match action {
        ConfigAction::Show => {
            let config = Config::load(config_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::SetClientIp { ip } => {
            let path = Config::file_path(config_path);
            let mut config = Config::read_or_create(&path)?;
            config.client.main_pc_ip.clone_from(&ip);
            config.save(&path)?;
            println!("Main PC IP set to {ip} in {}", path.display());
        }
        ConfigAction::SetPort { port } => {
            let path = Config::file_path(config_path);
            let mut config = Config::read_or_create(&path)?;
            config.client.main_pc_port = port;
            config.server.port = port;
            config.save(&path)?;
            println!("Port set to {port} in {}", path.display());
        }
    }
    Ok(())
}
