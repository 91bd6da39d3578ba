//! Application-scoped default server.
//!
//! VMs that are not pinned to an explicit [`VmServer`] share one server
//! started on first use. There is no hidden teardown hook: the
//! application owns the lifecycle and calls [`shutdown_default`] when it
//! is done.

use crate::error::Result;
use crate::server::VmServer;
use crate::vm::Vm;
use serde_json::Value;
use tokio::sync::Mutex;

static DEFAULT: Mutex<Option<VmServer>> = Mutex::const_new(None);

/// Acquire the shared default server, starting it on first use.
///
/// Returns a cheap clone of the shared handle. When the previously
/// shared server has been shut down via [`shutdown_default`], the next
/// call starts a fresh one.
pub async fn default_server() -> Result<VmServer> {
    let mut guard = DEFAULT.lock().await;
    if let Some(server) = guard.as_ref() {
        return Ok(server.clone());
    }
    let server = VmServer::new();
    server.start().await?;
    *guard = Some(server.clone());
    Ok(server)
}

/// Shut the shared default server down, if one is running.
///
/// Subsequent [`default_server`] calls start a new one. A no-op when no
/// default server was ever acquired.
pub async fn shutdown_default() -> Result<()> {
    let server = DEFAULT.lock().await.take();
    match server {
        Some(server) => server.close().await,
        None => Ok(()),
    }
}

/// A shortcut to evaluate a piece of code.
///
/// Creates a throwaway VM on the shared default server, runs the code,
/// destroys the VM, and returns the result.
pub async fn eval(code: &str) -> Result<Option<Value>> {
    let server = default_server().await?;
    let mut vm = Vm::new(server);
    vm.create().await?;
    let result = vm.run(code).await;
    let destroyed = vm.destroy().await;
    let value = result?;
    destroyed?;
    Ok(value)
}
