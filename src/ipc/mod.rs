//! Local IPC endpoints addressed as `<base><channel>`.
//!
//! Discord listens on `discord-ipc-0` .. `discord-ipc-9`. The base resolves per
//! platform:
//!
//! | Platform | Base                                         |
//! |----------|----------------------------------------------|
//! | Windows  | `\\?\pipe\discord-ipc-` (named pipe)         |
//! | macOS    | `$TMPDIR/discord-ipc-` (Unix socket)         |
//! | Linux    | `$XDG_RUNTIME_DIR/discord-ipc-`, else tmpdir |
//!
//! The remote side listens on these addresses, the home side connects to them.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{connect, endpoint_exists, remove_endpoint, LocalListener, LocalServerStream, LocalStream};
#[cfg(windows)]
pub use windows::{connect, endpoint_exists, remove_endpoint, LocalListener, LocalServerStream, LocalStream};

use std::io;
use std::time::Duration;

use crate::protocol::ChannelId;

/// File/pipe name prefix shared by every Discord IPC slot.
const ENDPOINT_PREFIX: &str = "discord-ipc-";

/// How long a connect keeps retrying an endpoint that reports busy.
pub const BUSY_RETRY_LIMIT: Duration = Duration::from_secs(2);
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),
}

/// Address template for the local IPC endpoints of one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcEndpoints {
    base: String,
}

impl IpcEndpoints {
    /// Resolve the platform's Discord IPC base path.
    pub fn resolve() -> Result<Self, IpcError> {
        Self::resolve_for(std::env::consts::OS, |key| std::env::var(key).ok())
    }

    fn resolve_for(os: &'static str, var: impl Fn(&str) -> Option<String>) -> Result<Self, IpcError> {
        let temp = || std::env::temp_dir().to_string_lossy().into_owned();
        let dir = match os {
            "windows" => return Ok(Self::with_base(format!(r"\\?\pipe\{ENDPOINT_PREFIX}"))),
            "macos" => temp(),
            "linux" => var("XDG_RUNTIME_DIR")
                .filter(|d| !d.is_empty())
                .unwrap_or_else(temp),
            other => return Err(IpcError::UnsupportedPlatform(other)),
        };
        let base = std::path::Path::new(&dir).join(ENDPOINT_PREFIX);
        Ok(Self::with_base(base.to_string_lossy().into_owned()))
    }

    /// Use an explicit base instead of the platform default.
    pub fn with_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full address of one channel's endpoint.
    pub fn path(&self, channel: ChannelId) -> String {
        format!("{}{}", self.base, channel)
    }

    /// Channels whose endpoint currently exists (someone is listening).
    pub fn available(&self) -> Vec<ChannelId> {
        ChannelId::all()
            .filter(|&ch| endpoint_exists(&self.path(ch)))
            .collect()
    }
}

/// Call `open` until it succeeds or fails with something `is_busy` rejects.
/// Busy endpoints are retried for at most [`BUSY_RETRY_LIMIT`], then the
/// attempt fails with `TimedOut`.
#[cfg_attr(unix, allow(dead_code))]
pub(crate) async fn open_with_retry<T>(
    mut open: impl FnMut() -> io::Result<T>,
    is_busy: impl Fn(&io::Error) -> bool,
) -> io::Result<T> {
    let deadline = tokio::time::Instant::now() + BUSY_RETRY_LIMIT;
    loop {
        match open() {
            Err(e) if is_busy(&e) => {
                if tokio::time::Instant::now() + BUSY_RETRY_DELAY > deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("endpoint still busy after {}s", BUSY_RETRY_LIMIT.as_secs()),
                    ));
                }
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}
