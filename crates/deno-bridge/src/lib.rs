//! # deno-bridge
//!
//! Client-side bridge to a sandboxed Deno script-execution engine.
//!
//! The bridge owns one long-lived child process running the VM server
//! script and multiplexes any number of logical VM sessions over its
//! stdio using a line-delimited JSON protocol. Requests are correlated
//! to responses by a monotonically increasing id, so concurrent callers
//! get exactly the response that answers their own request even when the
//! engine replies out of order; console output flows back as out-of-band
//! events routed to the owning session.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     deno-bridge (host)                    │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │   caller ──▶ Vm::run / Vm::call                           │
//! │                  │                                        │
//! │                  ▼                                        │
//! │   ┌──────────────────────┐    ┌───────────────────────┐   │
//! │   │ VmServer::communicate│───▶│ pending: id → oneshot │   │
//! │   │  (assign id, write   │    └───────────▲───────────┘   │
//! │   │   one JSON line)     │                │               │
//! │   └──────────┬───────────┘    ┌───────────┴───────────┐   │
//! │              │ stdin          │ reader loop (1 task)  │   │
//! │              ▼                │  responses → waiters  │   │
//! │   ┌──────────────────────┐    │  events → sessions    │   │
//! │   │  deno run vm-server  │───▶│       stdout          │   │
//! │   └──────────────────────┘    └───────────────────────┘   │
//! │                                                           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use deno_bridge::{Vm, VmServer};
//!
//! # async fn example() -> deno_bridge::Result<()> {
//! // One-off evaluation on the shared default server.
//! let value = deno_bridge::eval("'foo' + 'bar'").await?;
//! assert_eq!(value, Some("foobar".into()));
//!
//! // Or manage the server and session explicitly.
//! let server = VmServer::new();
//! server.start().await?;
//!
//! let mut vm = Vm::builder()
//!     .server(server.clone())
//!     .initial_code("function greet(name) { return 'hi ' + name }")
//!     .create()
//!     .await?;
//! let value = vm.call("greet", vec!["deno".into()]).await?;
//! vm.destroy().await?;
//!
//! server.close().await?;
//! deno_bridge::shutdown_default().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Session Multiplexing**: many VMs share one engine process
//! - **Concurrent Callers**: correlation by id, order-independent
//! - **Console Routing**: per-session off / redirect / inherit modes
//! - **Permission Flags**: validated `--allow-<category>` launch flags
//! - **Clean Shutdown**: closing wakes every pending caller

mod config;
mod default;
mod error;
mod permissions;
mod protocol;
mod server;
mod vm;

pub use config::{ServerConfig, ServerConfigBuilder, DEFAULT_EXECUTABLE, DENO_EXECUTABLE_ENV};
pub use default::{default_server, eval, shutdown_default};
pub use error::{BridgeError, Result};
pub use permissions::{render_permission_flags, PERMISSION_CATEGORIES};
pub use protocol::{Action, Event, EventName, Incoming, Request, Response, Status};
pub use server::VmServer;
pub use vm::{ConsoleMode, CreateHook, Vm, VmBuilder, VmOptions};
