//! Named local endpoint for the control channel
//!
//! Unix builds serve a Unix-domain socket, Windows builds a message-mode
//! named pipe. Both are wrapped in [`PlatformListener`], which hands out
//! [`Incoming`] clients. Admitting one yields a [`Connection`], a plain
//! async byte stream.

pub mod acl;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use self::unix::{Incoming, PlatformListener};
#[cfg(windows)]
pub use self::windows::{Incoming, PlatformListener};

pub use acl::AccessControl;

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const SOCKET_DIR: &str = "/var/run";
const PIPE_PREFIX: &str = r"\\.\pipe\";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Endpoint {0} is already in use")]
    InUse(String),
    #[error("Unknown principal: {0}")]
    UnknownPrincipal(String),
    #[error("Access control setup failed: {0}")]
    Acl(String),
    #[error("Failed to create endpoint {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// Name of the control channel endpoint.
///
/// A bare name such as `mystpipe` maps to `/var/run/mystpipe.sock` on Unix
/// and `\\.\pipe\mystpipe` on Windows. Full paths are used unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.name);
        if path.is_absolute() {
            path
        } else {
            PathBuf::from(SOCKET_DIR).join(format!("{}.sock", self.name))
        }
    }

    pub fn pipe_name(&self) -> String {
        if self.name.starts_with(PIPE_PREFIX) {
            self.name.clone()
        } else {
            format!("{}{}", PIPE_PREFIX, self.name)
        }
    }

    /// Address in the form used by this platform.
    pub fn address(&self) -> String {
        #[cfg(windows)]
        {
            self.pipe_name()
        }

        #[cfg(not(windows))]
        {
            self.socket_path().display().to_string()
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address())
    }
}

enum Stream {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(windows)]
    Pipe(tokio::net::windows::named_pipe::NamedPipeServer),
}

/// One accepted client connection.
///
/// Dropping the connection closes it.
pub struct Connection {
    stream: Stream,
    peer: String,
}

impl Connection {
    #[cfg(unix)]
    pub(crate) fn unix(stream: tokio::net::UnixStream, peer: String) -> Self {
        Self {
            stream: Stream::Unix(stream),
            peer,
        }
    }

    #[cfg(windows)]
    pub(crate) fn pipe(
        stream: tokio::net::windows::named_pipe::NamedPipeServer,
        peer: String,
    ) -> Self {
        Self {
            stream: Stream::Pipe(stream),
            peer,
        }
    }

    /// Human-readable description of the client, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
