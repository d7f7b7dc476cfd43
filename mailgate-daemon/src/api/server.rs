//! Line-delimited JSON-RPC over a Unix socket.
//!
//! Each request and response is a single JSON document terminated by a
//! newline. The socket is the only transport; nothing listens on a network
//! interface, and the socket file is created owner-only.

use super::handlers::{ApiState, MailgateApiImpl, MailgateApiServer};
use anyhow::{Context, Result};
use jsonrpsee::types::{ErrorCode, ErrorObject};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running RPC server.
///
/// Stopping closes the listener and every open connection.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// Stop the server. Calling this more than once is harmless.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        if let Some(task) = self.accept_task.lock().await.take() {
            task.await.context("Accept loop panicked")?;
        }
        Ok(())
    }
}

/// Start the JSON-RPC server on a Unix socket.
///
/// A stale socket file at `socket_path` is replaced.
pub async fn start_server(socket_path: &Path, state: ApiState) -> Result<ServerHandle> {
    let listener = bind_socket(socket_path)?;
    let api = Arc::new(MailgateApiImpl::new(state));
    let (shutdown, signal) = watch::channel(false);

    let accept_task = tokio::spawn(accept_loop(listener, api, signal));
    info!("JSON-RPC server listening on {:?}", socket_path);

    Ok(ServerHandle {
        shutdown,
        accept_task: Mutex::new(Some(accept_task)),
    })
}

fn bind_socket(socket_path: &Path) -> Result<UnixListener> {
    if socket_path.exists() {
        warn!("Replacing stale socket at {:?}", socket_path);
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove stale socket at {:?}", socket_path))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {:?}", socket_path))?;
    }
    Ok(listener)
}

async fn accept_loop(listener: UnixListener, api: Arc<MailgateApiImpl>, mut signal: watch::Receiver<bool>) {
    let connection_signal = signal.clone();
    loop {
        tokio::select! {
            _ = signal.changed() => {
                debug!("Accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let api = api.clone();
                    let signal = connection_signal.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, api, signal).await {
                            warn!("Connection closed with error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    api: Arc<MailgateApiImpl>,
    mut signal: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = signal.changed() => return Ok(()),
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => handle_request(&request, &api).await,
            Err(e) => error_response(
                Value::Null,
                &ErrorObject::owned(ErrorCode::ParseError.code(), format!("Parse error: {}", e), None::<()>),
            ),
        };

        let mut out = response.to_string();
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
}

/// Dispatch one request object. Bodies are never logged since operation
/// arguments may carry message content.
async fn handle_request(request: &Value, api: &MailgateApiImpl) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return error_response(
            id,
            &ErrorObject::owned(
                ErrorCode::InvalidRequest.code(),
                "Invalid Request: missing method",
                None::<()>,
            ),
        );
    };
    debug!(method, "Dispatching request");

    let params = request.get("params").cloned().unwrap_or(Value::Null);
    match dispatch(method, params, api).await {
        Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
        Err(error) => error_response(id, &error),
    }
}

async fn dispatch(method: &str, params: Value, api: &MailgateApiImpl) -> Result<Value, ErrorObject<'static>> {
    match method {
        "perform" => {
            let (operation, args) = perform_params(params)?;
            let response = api.perform(operation, args).await?;
            to_value(&response)
        }
        "status" => to_value(&api.status().await?),
        "reset" => to_value(&api.reset().await?),
        _ => Err(ErrorObject::owned(
            ErrorCode::MethodNotFound.code(),
            format!("Method not found: {}", method),
            None::<()>,
        )),
    }
}

/// Accept `[operation, args?]` or `{"operation": ..., "args": ...}`.
fn perform_params(params: Value) -> Result<(String, Option<Value>), ErrorObject<'static>> {
    let (operation, args) = match params {
        Value::Array(mut items) => {
            let args = if items.len() > 1 { Some(items.swap_remove(1)) } else { None };
            (items.into_iter().next(), args)
        }
        Value::Object(mut map) => (map.remove("operation"), map.remove("args")),
        _ => (None, None),
    };

    match operation {
        Some(Value::String(operation)) if !operation.is_empty() => Ok((operation, args)),
        _ => Err(ErrorObject::owned(
            ErrorCode::InvalidParams.code(),
            "Invalid params: expected [operation, args]",
            None::<()>,
        )),
    }
}

fn error_response(id: Value, error: &ErrorObject<'_>) -> Value {
    let mut body = json!({ "code": error.code(), "message": error.message() });
    if let Some(data) = error.data().and_then(|raw| serde_json::from_str::<Value>(raw.get()).ok()) {
        body["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "error": body, "id": id })
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ErrorObject<'static>> {
    serde_json::to_value(value).map_err(|e| {
        ErrorObject::owned(
            ErrorCode::InternalError.code(),
            format!("Failed to serialize response: {}", e),
            None::<()>,
        )
    })
}
