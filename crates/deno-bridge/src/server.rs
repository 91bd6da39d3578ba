//! The VM server bridge.
//!
//! [`VmServer`] owns a child process hosting the script-execution engine
//! and multiplexes many VM sessions over its stdio using newline-delimited
//! JSON. One background task (the reader loop) owns the child's stdout and
//! routes every inbound frame: responses resolve the per-request channel
//! registered by [`VmServer::communicate`], console events are fanned out
//! to the owning session's queue. Correlation is solely by id, so the
//! engine is free to answer out of order.

use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{Action, Event, EventName, Incoming, Request, Response, Status};
use crate::vm::ConsoleMode;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Bridge lifecycle. `Closed` is terminal; a closed bridge cannot be
/// restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeState {
    Unstarted,
    Started,
    Closed,
}

/// Per-session routing entry. The event sender exists only in
/// [`ConsoleMode::Redirect`].
struct SessionEntry {
    console: ConsoleMode,
    events: Option<mpsc::UnboundedSender<Event>>,
}

struct ServerInner {
    config: ServerConfig,
    state: Mutex<BridgeState>,
    /// Serializes `close()` so a second close never races the first.
    close_lock: Mutex<()>,
    child: Mutex<Option<Child>>,
    /// Outbound write path. Distinct from the pending table lock so a
    /// slow response never blocks unrelated callers from sending.
    stdin: Mutex<Option<ChildStdin>>,
    /// In-flight requests awaiting their response.
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    /// Active sessions by VM id.
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    /// Correlation id counter. Ids start at 1 and never repeat.
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInner {
    /// Tear the bridge down: mark closed, drop the child's stdin, wait
    /// for the process to exit, and wake every pending waiter (their
    /// callers observe [`BridgeError::ServerClosed`]). Safe to call more
    /// than once; every step is a no-op the second time.
    async fn shutdown(&self) {
        // The reader loop and close() can both get here; every step
        // below is a no-op the second time through.
        *self.state.lock().await = BridgeState::Closed;

        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match child.wait().await {
                Ok(status) => tracing::debug!(?status, "VM server exited"),
                Err(error) => tracing::warn!(%error, "failed waiting for VM server exit"),
            }
        }

        let woken = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        if woken > 0 {
            tracing::debug!(woken, "cancelled pending calls on close");
        }
    }
}

/// Handle to a VM server process.
///
/// Cloning is cheap; all clones share the same child process, pending
/// table and session registry. Every method takes `&self` and is safe to
/// call from arbitrarily many concurrent tasks.
#[derive(Clone)]
pub struct VmServer {
    inner: Arc<ServerInner>,
}

impl Default for VmServer {
    fn default() -> Self {
        Self::new()
    }
}

impl VmServer {
    /// Create an unstarted server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create an unstarted server with the given configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                state: Mutex::new(BridgeState::Unstarted),
                close_lock: Mutex::new(()),
                child: Mutex::new(None),
                stdin: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                reader: Mutex::new(None),
            }),
        }
    }

    /// The configuration this server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Spawn the server process, launch the reader loop and perform the
    /// liveness handshake.
    ///
    /// Starting an already-started server is a no-op; starting a closed
    /// server fails with [`BridgeError::ServerClosed`].
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            match *state {
                BridgeState::Closed => return Err(BridgeError::ServerClosed),
                BridgeState::Started => return Ok(()),
                BridgeState::Unstarted => {}
            }

            self.inner.config.validate()?;
            let command = self.inner.config.resolve_command();
            let args = self.inner.config.launch_args()?;
            tracing::info!(command = %command, "starting VM server");
            tracing::debug!(?args, "VM server launch arguments");

            let mut child = Command::new(&command)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|error| {
                    if error.kind() == std::io::ErrorKind::NotFound {
                        BridgeError::ExecutableUnavailable { command }
                    } else {
                        BridgeError::Spawn(error)
                    }
                })?;

            let stdin = child.stdin.take().ok_or_else(|| {
                BridgeError::Spawn(std::io::Error::other("child stdin was not piped"))
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                BridgeError::Spawn(std::io::Error::other("child stdout was not piped"))
            })?;

            *self.inner.stdin.lock().await = Some(stdin);
            *self.inner.child.lock().await = Some(child);
            *state = BridgeState::Started;

            let handle = tokio::spawn(reader_loop(Arc::clone(&self.inner), stdout));
            *self.inner.reader.lock().await = Some(handle);
        }

        // Liveness handshake. A failure here aborts startup.
        match self.communicate(Request::new(Action::Ping, None)).await {
            Ok(_) => {
                tracing::info!("VM server ready");
                Ok(())
            }
            Err(BridgeError::Protocol(message)) => {
                tracing::error!(error = %message, "VM server handshake rejected");
                self.inner.shutdown().await;
                Err(BridgeError::Protocol(format!("Failed to start: {message}")))
            }
            Err(error) => {
                tracing::error!(%error, "VM server handshake failed");
                self.inner.shutdown().await;
                Err(error)
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// The request's correlation id is assigned here; any id set by the
    /// caller is overwritten. The matching response is delivered to this
    /// caller no matter how the engine orders its replies. There is no
    /// timeout at this layer; timeouts are an engine option surfaced back
    /// as a normal error response.
    ///
    /// Returns the response `value` on success, [`BridgeError::Protocol`]
    /// when the engine reports `status: "error"`, and
    /// [`BridgeError::ServerClosed`] when the bridge is not running or
    /// closes while the call is pending.
    pub async fn communicate(&self, request: Request) -> Result<Option<Value>> {
        let response = self.send_request(request).await?;
        match response.status {
            Status::Success => Ok(response.value),
            Status::Error => Err(BridgeError::Protocol(response.error.unwrap_or_default())),
        }
    }

    async fn send_request(&self, mut request: Request) -> Result<Response> {
        {
            let state = self.inner.state.lock().await;
            if *state != BridgeState::Started {
                return Err(BridgeError::ServerClosed);
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        tracing::debug!(id, action = %request.action, vm_id = ?request.vm_id, "sending request");
        tracing::trace!(request = %line.trim_end(), "request body");

        let (sender, receiver) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, sender);

        {
            let mut stdin = self.inner.stdin.lock().await;
            let Some(writer) = stdin.as_mut() else {
                self.inner.pending.lock().await.remove(&id);
                return Err(BridgeError::ServerClosed);
            };
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(error) = written {
                tracing::warn!(id, %error, "request write failed");
                self.inner.pending.lock().await.remove(&id);
                return Err(error.into());
            }
        }

        // The sender is either consumed by the reader loop or dropped
        // when the bridge closes; a dropped sender surfaces here.
        let response = receiver.await.map_err(|_| BridgeError::ServerClosed)?;
        tracing::debug!(id, status = ?response.status, "response received");
        Ok(response)
    }

    /// Close the server. Idempotent: closing an already-closed server
    /// returns without effect and sends nothing.
    ///
    /// The graceful path sends a `close` action (transport errors are
    /// swallowed since the process may already be gone), waits for the
    /// process to exit, then wakes every pending caller with
    /// [`BridgeError::ServerClosed`].
    pub async fn close(&self) -> Result<()> {
        let _guard = self.inner.close_lock.lock().await;
        {
            let mut state = self.inner.state.lock().await;
            match *state {
                BridgeState::Closed => return Ok(()),
                BridgeState::Unstarted => {
                    *state = BridgeState::Closed;
                    return Ok(());
                }
                BridgeState::Started => {}
            }
        }

        tracing::info!("closing VM server");
        match self.communicate(Request::new(Action::Close, None)).await {
            Ok(_) => {}
            Err(BridgeError::Protocol(message)) => {
                return Err(BridgeError::Protocol(format!("Failed to close: {message}")));
            }
            Err(error) => {
                // The process died under us; the goal is already met.
                tracing::debug!(%error, "close request failed, proceeding with shutdown");
            }
        }

        self.inner.shutdown().await;

        let reader = self.inner.reader.lock().await.take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }
        tracing::info!("VM server closed");
        Ok(())
    }

    /// Register a session in the registry. Returns the receiving end of
    /// the session's event queue when the console mode is `Redirect`.
    pub(crate) async fn register_vm(
        &self,
        vm_id: u64,
        console: ConsoleMode,
    ) -> Option<mpsc::UnboundedReceiver<Event>> {
        let (events, receiver) = match console {
            ConsoleMode::Redirect => {
                let (sender, receiver) = mpsc::unbounded_channel();
                (Some(sender), Some(receiver))
            }
            ConsoleMode::Off | ConsoleMode::Inherit => (None, None),
        };
        tracing::debug!(vm_id, ?console, "registering VM session");
        self.inner
            .sessions
            .lock()
            .await
            .insert(vm_id, SessionEntry { console, events });
        receiver
    }

    /// Remove a session from the registry. Events already in flight for
    /// this id are dropped silently from then on.
    pub(crate) async fn remove_vm(&self, vm_id: u64) {
        tracing::debug!(vm_id, "removing VM session");
        self.inner.sessions.lock().await.remove(&vm_id);
    }
}

/// The single background worker owning the child's stdout.
///
/// Reads one line at a time and dispatches it. Any parse failure or
/// unexpected end of stream is fatal: the bridge is forced closed and
/// every pending caller is woken. This is the sole abnormal-termination
/// trigger outside of an explicit `close()`.
async fn reader_loop(inner: Arc<ServerInner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("VM server stdout closed");
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "failed reading from VM server");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        tracing::trace!(frame = %trimmed, "inbound frame");

        match serde_json::from_str::<Incoming>(trimmed) {
            Ok(Incoming::Response(response)) => {
                let sender = inner.pending.lock().await.remove(&response.id);
                match sender {
                    Some(sender) => {
                        // Failure means the caller went away; nothing to do.
                        let _ = sender.send(response);
                    }
                    None => {
                        tracing::trace!(id = response.id, "response for unknown id dropped");
                    }
                }
            }
            Ok(Incoming::Event(event)) => {
                dispatch_event(&inner, event).await;
            }
            Err(error) => {
                let error = BridgeError::MalformedStream(error.to_string());
                tracing::warn!(%error, line = %trimmed, "closing bridge");
                break;
            }
        }
    }
    inner.shutdown().await;
}

/// Route one console event by session and console mode.
async fn dispatch_event(inner: &Arc<ServerInner>, event: Event) {
    let sessions = inner.sessions.lock().await;
    let Some(entry) = sessions.get(&event.vm_id) else {
        // The VM was destroyed; events race the destroy and are dropped.
        tracing::trace!(vm_id = event.vm_id, "event for unknown VM dropped");
        return;
    };
    match entry.console {
        ConsoleMode::Off => {}
        ConsoleMode::Redirect => {
            if let Some(sender) = &entry.events {
                // FIFO per session; the consumer drains at will.
                let _ = sender.send(event);
            }
        }
        ConsoleMode::Inherit => {
            let name = event.name;
            let mut text = event.value;
            drop(sessions);
            text.push('\n');
            match name {
                EventName::ConsoleLog => {
                    let mut stdout = tokio::io::stdout();
                    let _ = stdout.write_all(text.as_bytes()).await;
                    let _ = stdout.flush().await;
                }
                EventName::ConsoleError => {
                    let mut stderr = tokio::io::stderr();
                    let _ = stderr.write_all(text.as_bytes()).await;
                    let _ = stderr.flush().await;
                }
            }
        }
    }
}
