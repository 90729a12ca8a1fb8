use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Line-oriented JSON-RPC 2.0 client for a remote/containerized executor.
///
/// The TCP connection is established lazily, reused across calls, and
/// dropped on any transport error so the next call reconnects.
pub struct RpcClient {
    host: String,
    port: u16,
    stream: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: RpcParams<'a>,
    id: u64,
}

#[derive(Serialize)]
struct RpcParams<'a> {
    command: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<RpcResult>,
    error: Option<serde_json::Value>,
}

/// Captured output of a remotely-executed command.
#[derive(Debug, Deserialize)]
pub struct RpcResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl RpcClient {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Executes `command` on the remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or when the server reports a
    /// JSON-RPC error object.
    pub fn execute(
        &self,
        command: &[String],
        stdin: Option<&str>,
        cwd: Option<&str>,
    ) -> Result<RpcResult> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: "execute",
            params: RpcParams {
                command,
                stdin,
                cwd,
            },
            id,
        };
        let payload = serde_json::to_string(&request).context("failed to encode RPC request")?;

        let mut guard = self
            .stream
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => {
                debug!(
                    "connecting to the remote executor at {}:{}",
                    self.host, self.port
                );
                TcpStream::connect((self.host.as_str(), self.port))
                    .with_context(|| format!("failed to reach {}:{}", self.host, self.port))?
            }
        };

        match Self::round_trip(&mut stream, &payload) {
            Ok(line) => {
                *guard = Some(stream);
                Self::parse_response(&line)
            }
            // The broken connection stays dropped; the next call reconnects.
            Err(err) => Err(err),
        }
    }

    fn round_trip(stream: &mut TcpStream, payload: &str) -> Result<String> {
        stream
            .write_all(payload.as_bytes())
            .and_then(|()| stream.write_all(b"\n"))
            .context("failed to send the RPC request")?;
        let mut reader = BufReader::new(
            stream
                .try_clone()
                .context("failed to clone the RPC stream")?,
        );
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .context("failed to read the RPC response")?;
        if read == 0 {
            return Err(anyhow!("the remote executor closed the connection"));
        }
        Ok(line)
    }

    fn parse_response(line: &str) -> Result<RpcResult> {
        let response: RpcResponse =
            serde_json::from_str(line).context("malformed RPC response")?;
        if let Some(error) = response.error {
            return Err(anyhow!("remote execution failed: {error}"));
        }
        response
            .result
            .ok_or_else(|| anyhow!("RPC response carried neither result nor error"))
    }
}
