//! Discord IPC over Windows named pipes (`\\?\pipe\discord-ipc-<n>`).

use std::io;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

use super::open_with_retry;

/// `ERROR_PIPE_BUSY`: every instance of the pipe is serving another client.
const ERROR_PIPE_BUSY: i32 = 231;

/// Home side: our connection to Discord's pipe.
pub type LocalStream = NamedPipeClient;

/// Remote side: one app attached to a fake Discord pipe.
pub type LocalServerStream = NamedPipeServer;

fn is_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(ERROR_PIPE_BUSY)
}

/// A fake Discord pipe. A pipe instance serves a single client, so one spare
/// instance is always waiting for the next app.
pub struct LocalListener {
    name: String,
    spare: NamedPipeServer,
}

impl LocalListener {
    /// Create the first instance of `name`. Pipes leave nothing on disk, so
    /// unlike sockets there is no stale file to clear.
    pub fn bind(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let spare = ServerOptions::new().create(&name)?;
        Ok(Self { name, spare })
    }

    /// Wait for an app, then put a fresh spare in its place.
    pub async fn accept(&mut self) -> io::Result<LocalServerStream> {
        self.spare.connect().await?;
        let fresh = ServerOptions::new().create(&self.name)?;
        Ok(std::mem::replace(&mut self.spare, fresh))
    }

    pub fn path(&self) -> &str {
        &self.name
    }
}

/// Open Discord's pipe, waiting a bounded time while it is busy.
pub async fn connect(name: impl AsRef<str>) -> io::Result<LocalStream> {
    let name = name.as_ref();
    open_with_retry(|| ClientOptions::new().open(name), is_busy).await
}

/// A busy pipe still exists; only a missing one is reported as absent.
pub fn endpoint_exists(name: impl AsRef<str>) -> bool {
    match ClientOptions::new().open(name.as_ref()) {
        Ok(_) => true,
        Err(e) => is_busy(&e),
    }
}

/// Pipes disappear with their last handle.
pub fn remove_endpoint(_name: impl AsRef<str>) -> io::Result<()> {
    Ok(())
}
