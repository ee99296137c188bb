//! Stdio transport for MCP tool providers.
//!
//! A single background task owns the read half and dispatches every incoming
//! line: responses complete the matching pending request through a `oneshot`,
//! server-initiated requests get an immediate reply, notifications are logged.
//! Writes are serialized through a mutex, so any number of callers may have
//! requests in flight at once.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::error::{McpError, Result};
use super::protocol::{
    classify_message, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseOut,
    MessageKind, METHOD_NOT_FOUND,
};

type Writer = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Pending request table plus the closed flag, guarded together so a
/// request can never be registered after the reader has drained the table.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
}

type PendingTable = Arc<StdMutex<Pending>>;

/// Launch description for a tool provider process
#[derive(Clone, Debug)]
pub struct SpawnSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
}

/// Bidirectional JSON-RPC channel to one tool provider
pub struct Transport {
    writer: Writer,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    child: StdMutex<Option<Child>>,
    reader_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl Transport {
    /// Spawn the provider process and wire its stdio
    pub fn spawn(spec: &SpawnSpec<'_>) -> Result<Self> {
        debug!(program = spec.program, args = spec.args.len(), "Spawning tool provider");

        let spawn_error = |source: std::io::Error| McpError::Spawn {
            program: spec.program.to_string(),
            source,
        };

        let mut child = Command::new(spec.program)
            .args(spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("Failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("Failed to capture stdout")))?;

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "mcp_provider", "{}", line);
                }
            })
        });

        info!(pid = ?child.id(), "Tool provider process started");

        let mut transport = Self::start(stdout, stdin, Some(child));
        transport.stderr_handle = stderr_handle;
        Ok(transport)
    }

    /// Use an existing byte stream pair (in-process servers, tests)
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(reader, writer, None)
    }

    fn start<R, W>(reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Writer = Arc::new(Mutex::new(Box::new(writer)));
        let pending: PendingTable = Arc::new(StdMutex::new(Pending::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_handle = tokio::spawn(Self::reader_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
            Arc::clone(&writer),
        ));

        Self {
            writer,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            child: StdMutex::new(child),
            reader_handle,
            stderr_handle: None,
        }
    }

    /// Background reader loop, single owner of the read half.
    ///
    /// When it ends (EOF, read error, or abort on close) every pending
    /// request is failed by dropping its sender.
    async fn reader_loop<R>(reader: R, pending: PendingTable, closed: Arc<AtomicBool>, writer: Writer)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Tool provider closed its output stream");
                    break;
                }
                Err(e) => {
                    warn!("Reader loop: read error: {}", e);
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            trace!("MCP received: {}", trimmed);

            let json: serde_json::Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Reader loop: ignoring non-JSON line ({}): {}", e, trimmed);
                    continue;
                }
            };

            match classify_message(&json) {
                MessageKind::Response => {
                    let response: JsonRpcResponse = match serde_json::from_value(json) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("Reader loop: failed to parse response: {}", e);
                            continue;
                        }
                    };
                    let Some(id) = response.id.as_ref().and_then(serde_json::Value::as_u64) else {
                        debug!("Reader loop: response with non-numeric id {:?}", response.id);
                        continue;
                    };
                    let waiter = lock(&pending).waiters.remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!("Reader loop: no pending request for id={}", id),
                    }
                }

                MessageKind::IncomingRequest => {
                    let id = json.get("id").cloned().unwrap_or(serde_json::Value::Null);
                    let method = json.get("method").and_then(|m| m.as_str()).unwrap_or_default();
                    let reply = if method == "ping" {
                        JsonRpcResponseOut::result(id, serde_json::json!({}))
                    } else {
                        debug!("Reader loop: rejecting server request '{}'", method);
                        JsonRpcResponseOut::error(id, METHOD_NOT_FOUND, format!("Method not supported: {}", method))
                    };
                    if let Err(e) = write_line(&writer, &reply).await {
                        warn!("Reader loop: failed to answer server request: {}", e);
                    }
                }

                MessageKind::Notification => {
                    match serde_json::from_value::<JsonRpcNotification>(json) {
                        Ok(n) => debug!(method = %n.method, "Tool provider notification"),
                        Err(e) => debug!("Reader loop: unparseable notification: {}", e),
                    }
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        let mut table = lock(&pending);
        table.closed = true;
        table.waiters.clear();
    }

    /// Send a request and wait for its response, failing after `timeout`.
    ///
    /// Returns the `result` payload; a JSON-RPC error object becomes
    /// [`McpError::Rpc`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = lock(&self.pending);
            if table.closed {
                return Err(McpError::Closed);
            }
            table.waiters.insert(id, tx);
        }

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = write_line(&self.writer, &request).await {
            lock(&self.pending).waiters.remove(&id);
            return Err(if self.is_closed() { McpError::Closed } else { e });
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(McpError::Closed),
            Err(_) => {
                lock(&self.pending).waiters.remove(&id);
                return Err(McpError::Timeout { method: method.to_string(), after: timeout });
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::Rpc { code: error.code, message: error.message });
        }

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str) -> Result<()> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        write_line(&self.writer, &JsonRpcNotification::new(method)).await
    }

    /// Whether the transport has been closed or lost its peer
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Terminate the provider and fail everything still in flight.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut table = lock(&self.pending);
            table.closed = true;
            table.waiters.clear();
        }

        self.reader_handle.abort();
        if let Some(handle) = &self.stderr_handle {
            handle.abort();
        }

        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            debug!(pid = ?child.id(), "Killing tool provider process");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tool provider: {}", e);
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader_handle.abort();
        if let Some(handle) = &self.stderr_handle {
            handle.abort();
        }
        if let Some(child) = lock(&self.child).as_mut() {
            debug!("Transport dropping, killing tool provider process");
            let _ = child.start_kill();
        }
    }
}

/// Serialize `message` as one line and flush it
async fn write_line<T: serde::Serialize>(writer: &Writer, message: &T) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    trace!("MCP sending: {}", line);
    line.push('\n');

    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Lock a std mutex, recovering from poisoning
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    /// Answers every request with `{"echo": <method>}` except `fail`, which gets an error
    fn spawn_echo_server(stream: tokio::io::DuplexStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = split(stream);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = msg.get("id").cloned() else { continue };
                let method = msg["method"].as_str().unwrap_or_default().to_string();
                let reply = if method == "fail" {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000, "message": "boom"}})
                } else if method == "hang" {
                    continue;
                } else {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"echo": method}})
                };
                let mut out = reply.to_string();
                out.push('\n');
                write.write_all(out.as_bytes()).await.unwrap();
            }
        })
    }

    fn connected() -> Transport {
        let (client, server) = duplex(4096);
        spawn_echo_server(server);
        let (read, write) = split(client);
        Transport::from_io(read, write)
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let transport = connected();
        let (a, b) = tokio::join!(
            transport.request("alpha", None, Duration::from_secs(5)),
            transport.request("beta", None, Duration::from_secs(5)),
        );
        assert_eq!(a.unwrap()["echo"], "alpha");
        assert_eq!(b.unwrap()["echo"], "beta");
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        let transport = connected();
        let err = transport.request("fail", None, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32000, .. }));
    }

    #[tokio::test]
    async fn request_times_out() {
        let transport = connected();
        let err = transport.request("hang", None, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
    }

    #[tokio::test]
    async fn request_after_close_fails_fast() {
        let transport = connected();
        transport.close().await;
        transport.close().await;

        assert!(transport.is_closed());
        let err = transport.request("alpha", None, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, McpError::Closed));
    }

    #[tokio::test]
    async fn close_fails_in_flight_requests() {
        let transport = Arc::new(connected());
        let in_flight = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("hang", None, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.close().await;

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Closed));
    }

    #[tokio::test]
    async fn peer_exit_marks_transport_closed() {
        let (client, server) = duplex(1024);
        drop(server);
        let (read, write) = split(client);
        let transport = Transport::from_io(read, write);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn spawn_missing_program_is_spawn_error() {
        let args = Vec::new();
        let spec = SpawnSpec { program: "definitely-not-an-mcp-server-binary", args: &args };
        let err = Transport::spawn(&spec).err().unwrap();
        assert!(matches!(err, McpError::Spawn { .. }));
    }
}
