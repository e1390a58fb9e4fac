//! Unix domain socket implementation for local IPC.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::warn;

/// A local IPC stream (client end of a Unix socket).
pub type LocalStream = UnixStream;

/// The accepted end of a local IPC connection.
pub type LocalServerStream = UnixStream;

/// A local IPC listener bound to a socket file.
pub struct LocalListener {
    inner: UnixListener,
    path: PathBuf,
}

impl LocalListener {
    /// Bind to the given socket path.
    ///
    /// A socket file left behind by a previous run is removed first. Failure to
    /// remove it is logged and the bind is attempted anyway.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), "Could not remove stale socket: {e}");
            }
        }
        let inner = UnixListener::bind(path)?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    /// Accept a new connection.
    pub async fn accept(&mut self) -> io::Result<LocalServerStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Connect to a local IPC endpoint.
pub async fn connect(path: impl AsRef<Path>) -> io::Result<LocalStream> {
    UnixStream::connect(path).await
}

/// Check whether a socket file exists at `path`.
pub fn endpoint_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

/// Remove the socket file at `path`. A missing file is not an error.
pub fn remove_endpoint(path: impl AsRef<Path>) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discord-ipc-0");
        std::fs::write(&path, b"stale").unwrap();

        let mut listener = LocalListener::bind(&path).unwrap();
        let mut client = connect(&path).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn remove_missing_endpoint_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_endpoint(dir.path().join("nope")).is_ok());
    }
}
