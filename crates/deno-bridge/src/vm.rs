//! VM session handle.
//!
//! A [`Vm`] is one logical execution context multiplexed over a shared
//! [`VmServer`] connection. It starts uninitialized, becomes usable after
//! [`Vm::create`] registers it with the server, and rejects everything
//! but `create` again after [`Vm::destroy`].

use crate::default::default_server;
use crate::error::{BridgeError, Result};
use crate::protocol::{Action, Event, Request};
use crate::server::VmServer;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

/// What happens to `console.log` / `console.error` events emitted by the
/// engine for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleMode {
    /// Console events are discarded.
    #[default]
    Off,
    /// Console events are queued on the session; drain them with
    /// [`Vm::recv_event`] or [`Vm::try_recv_event`].
    Redirect,
    /// Console events are written straight to this process's stdout or
    /// stderr from the bridge's reader task.
    Inherit,
}

/// Engine options attached to the `create` request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmOptions {
    /// Per-run timeout enforced by the engine, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Worker permissions: `"none"`, `"inherit"`, or a category map.
    /// Passed through opaquely; interpreting it is the engine's job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Value>,
}

/// Hook run on the `create` request before it is sent, in place of the
/// original subclass `before_create` override.
pub type CreateHook = Box<dyn Fn(&mut Request) + Send + Sync>;

/// One VM session.
pub struct Vm {
    server: VmServer,
    id: Option<u64>,
    console: ConsoleMode,
    options: VmOptions,
    initial_code: Option<String>,
    before_create: Option<CreateHook>,
    events: Option<UnboundedReceiver<Event>>,
}

impl Vm {
    /// An uninitialized VM on the given server, with console off and no
    /// options. Call [`Vm::create`] before anything else.
    pub fn new(server: VmServer) -> Self {
        Self {
            server,
            id: None,
            console: ConsoleMode::Off,
            options: VmOptions::default(),
            initial_code: None,
            before_create: None,
            events: None,
        }
    }

    /// Start building a VM.
    pub fn builder() -> VmBuilder {
        VmBuilder::default()
    }

    /// The session id, once created.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// The console mode this VM was built with.
    pub fn console(&self) -> ConsoleMode {
        self.console
    }

    /// Create the session on the server.
    ///
    /// On success the server's response supplies the session id and the
    /// session is registered for event routing; only then do console
    /// events reach this handle. Any configured initial code is run
    /// immediately afterwards.
    pub async fn create(&mut self) -> Result<()> {
        let mut request = Request::new(Action::Create, self.id);
        request.vm_type = Some("VM".to_string());
        request.options = Some(serde_json::to_value(&self.options)?);
        if let Some(hook) = &self.before_create {
            hook(&mut request);
        }

        let value = self.server.communicate(request).await?;
        let id = value
            .as_ref()
            .and_then(Value::as_u64)
            .ok_or_else(|| BridgeError::Protocol("create returned no VM id".to_string()))?;
        tracing::info!(vm_id = id, console = ?self.console, "VM created");

        self.id = Some(id);
        self.events = self.server.register_vm(id, self.console).await;

        if let Some(code) = self.initial_code.take() {
            self.run(&code).await?;
        }
        Ok(())
    }

    /// Evaluate code and return the result.
    pub async fn run(&self, code: &str) -> Result<Option<Value>> {
        tracing::debug!(vm_id = ?self.id, code_len = code.len(), "run");
        self.communicate(Request::run(None, code)).await
    }

    /// Call a function and return the result.
    ///
    /// `function_name` may contain `.` to call functions on an object.
    pub async fn call(&self, function_name: &str, args: Vec<Value>) -> Result<Option<Value>> {
        tracing::debug!(vm_id = ?self.id, function = %function_name, "call");
        self.communicate(Request::call(None, function_name, args))
            .await
    }

    /// Destroy the session.
    ///
    /// The session is removed from the server's registry, its id is
    /// cleared, and queued but undelivered console events are discarded.
    /// The handle behaves like an uninitialized VM afterwards.
    pub async fn destroy(&mut self) -> Result<()> {
        self.communicate(Request::new(Action::Destroy, None)).await?;
        let id = self.id.take();
        if let Some(id) = id {
            self.server.remove_vm(id).await;
            tracing::info!(vm_id = id, "VM destroyed");
        }
        self.events = None;
        Ok(())
    }

    /// Wait for the next queued console event. Only yields events in
    /// [`ConsoleMode::Redirect`]; returns `None` otherwise, or once the
    /// session is gone and the queue is drained.
    pub async fn recv_event(&mut self) -> Option<Event> {
        self.events.as_mut()?.recv().await
    }

    /// Take the next queued console event without waiting.
    pub fn try_recv_event(&mut self) -> Option<Event> {
        self.events.as_mut()?.try_recv().ok()
    }

    /// Stamp the session id on a request and send it. Fails with
    /// [`BridgeError::NotCreated`] before any I/O when the session does
    /// not exist (never created, or destroyed).
    async fn communicate(&self, mut request: Request) -> Result<Option<Value>> {
        if self.id.is_none() && request.action != Action::Create {
            return Err(BridgeError::NotCreated);
        }
        request.vm_id = self.id;
        self.server.communicate(request).await
    }
}

/// Fluent builder for [`Vm`].
#[derive(Default)]
pub struct VmBuilder {
    server: Option<VmServer>,
    console: ConsoleMode,
    options: VmOptions,
    initial_code: Option<String>,
    before_create: Option<CreateHook>,
}

impl VmBuilder {
    /// Put the VM on a specific server instead of the shared default.
    pub fn server(mut self, server: VmServer) -> Self {
        self.server = Some(server);
        self
    }

    /// Set the console mode.
    pub fn console(mut self, console: ConsoleMode) -> Self {
        self.console = console;
        self
    }

    /// Set the engine-side per-run timeout in milliseconds.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set worker permissions (`"none"`, `"inherit"`, or a category map).
    pub fn permissions(mut self, permissions: Value) -> Self {
        self.options.permissions = Some(permissions);
        self
    }

    /// Code to run right after a successful create. Useful to define
    /// functions for later [`Vm::call`]s.
    pub fn initial_code(mut self, code: impl Into<String>) -> Self {
        self.initial_code = Some(code.into());
        self
    }

    /// Install a hook that may extend the `create` request before it is
    /// sent.
    pub fn before_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        self.before_create = Some(Box::new(hook));
        self
    }

    /// Build the handle without creating the session.
    ///
    /// Requires a server set via [`VmBuilder::server`]; use
    /// [`VmBuilder::create`] to fall back to the shared default server.
    pub fn build(self, server: VmServer) -> Vm {
        Vm {
            server,
            id: None,
            console: self.console,
            options: self.options,
            initial_code: self.initial_code,
            before_create: self.before_create,
            events: None,
        }
    }

    /// Build the handle and create the session, starting the shared
    /// default server when no server was provided.
    pub async fn create(mut self) -> Result<Vm> {
        let server = match self.server.take() {
            Some(server) => server,
            None => default_server().await?,
        };
        let mut vm = self.build(server);
        vm.create().await?;
        Ok(vm)
    }
}
