#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! hashi library: the building blocks of both tunnel ends.
//!
//! - `protocol` — tunnel envelopes and their JSON codec
//! - `frame` — the Discord IPC presence-clear frame
//! - `ipc` — local Discord IPC endpoints (Unix sockets / named pipes)
//! - `mux` — fake Discord endpoints on the remote side
//! - `bridge` — connections to the real Discord on the home side
//! - `tunnel` — WebSocket client (remote) and relay (home)
//! - `reaper` — idle connection eviction on the home side
//! - `shutdown` — signal handling and graceful teardown
//! - `config` — configuration loading

pub mod bridge;
pub mod config;
pub mod frame;
pub mod ipc;
pub mod mux;
pub mod protocol;
pub mod reaper;
pub mod shutdown;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use bridge::Bridge;
pub use config::Config;
pub use mux::Multiplexer;
pub use protocol::{ChannelId, Envelope};
pub use tunnel::relay::RelayState;
pub use tunnel::TunnelLink;
