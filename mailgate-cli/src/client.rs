//! Daemon client for communicating with mailgated.
//!
//! This module provides a client for connecting to the mailgate daemon
//! over a Unix socket using line-delimited JSON-RPC.

use anyhow::{Context, Result};
use mailgate_daemon::api::{OperationErrorData, PerformResponse, StatusResponse};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// A JSON-RPC error returned by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<OperationErrorData>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(data) => write!(
                f,
                "{} failed [{}] ({}): {}",
                data.operation, data.correlation_id, data.kind, self.message
            ),
            None => write!(f, "RPC error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for RpcError {}

/// Client for communicating with the mailgate daemon.
pub struct DaemonClient {
    stream: Option<UnixStream>,
    socket_path: PathBuf,
    next_id: u64,
}

impl DaemonClient {
    /// Attempt to connect to the daemon at the given socket path.
    ///
    /// A missing or refusing socket yields a disconnected client rather than
    /// an error; check [`is_connected`](Self::is_connected).
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        debug!("Attempting to connect to daemon at {:?}", socket_path);

        let stream = if !socket_path.exists() {
            debug!("Socket does not exist at {:?}", socket_path);
            None
        } else {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    debug!("Successfully connected to daemon");
                    Some(stream)
                }
                Err(e) => {
                    warn!("Failed to connect to daemon: {}", e);
                    None
                }
            }
        };

        Ok(Self {
            stream,
            socket_path: socket_path.to_path_buf(),
            next_id: 1,
        })
    }

    /// Check if the client is connected to the daemon.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a JSON-RPC request and receive a response.
    ///
    /// Request bodies are not logged since they may carry message content.
    async fn send_request<T: for<'de> Deserialize<'de>>(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected to daemon"))?;

        let id = self.next_id;
        self.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        debug!(method, id, "Sending request");

        let request_str = serde_json::to_string(&request)?;
        stream.write_all(request_str.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut response_str = String::new();
        reader.read_line(&mut response_str).await?;
        if response_str.is_empty() {
            anyhow::bail!("Daemon closed the connection");
        }

        let response: serde_json::Value =
            serde_json::from_str(&response_str).context("Malformed response from daemon")?;

        if let Some(error) = response.get("error") {
            let error: RpcError = serde_json::from_value(error.clone())
                .context("Malformed error object from daemon")?;
            return Err(error.into());
        }

        let result = response
            .get("result")
            .ok_or_else(|| anyhow::anyhow!("No result in response"))?;

        Ok(serde_json::from_value(result.clone())?)
    }

    /// Perform a mail operation through the daemon's guard.
    pub async fn perform(&mut self, operation: &str, args: serde_json::Value) -> Result<PerformResponse> {
        self.send_request("perform", json!([operation, args])).await
    }

    /// Query the daemon's authentication state.
    pub async fn status(&mut self) -> Result<StatusResponse> {
        self.send_request("status", json!([])).await
    }

    /// Clear the daemon's cached credentials and any sticky rejection.
    pub async fn reset(&mut self) -> Result<StatusResponse> {
        self.send_request("reset", json!([])).await
    }
}
