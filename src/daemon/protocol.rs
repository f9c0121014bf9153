//! Line-delimited JSON commands spoken by the default handler
//!
//! One request per line, one response line per request:
//!
//! ```text
//! {"command":"exclude-route","ip":"203.0.113.7"}
//! {"ok":true,"data":"192.168.1.1"}
//! ```

use crate::vpn::subnet::Subnet;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted request line, newline included.
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Request exceeds {0} bytes")]
    TooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    Ping,
    Version,
    AssignIp {
        interface: String,
        subnet: Subnet,
    },
    ExcludeRoute {
        ip: IpAddr,
    },
    DefaultRoute {
        interface: String,
    },
    RemoveExcludedRoute {
        ip: IpAddr,
    },
    RestoreDefaultRoute {
        interface: String,
    },
    SplitTunnel {
        interface: String,
        subnet: Subnet,
        server: IpAddr,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Response {
    pub fn success(data: Option<String>) -> Self {
        Self {
            ok: true,
            error: None,
            data,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

/// Read the next request. `Ok(None)` means the client hung up.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        // Bytes, not a String: the cut-off may land inside a UTF-8 sequence.
        let n = (&mut *reader)
            .take(MAX_REQUEST_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_REQUEST_LEN {
            return Err(ProtocolError::TooLong(MAX_REQUEST_LEN));
        }
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_slice(trimmed)?));
    }
}

pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
