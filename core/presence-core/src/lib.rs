//! # presence-core
//!
//! Keeps a companion desktop application's "rich presence" status in sync
//! with what the user is doing in a text editor.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Two OS threads (heartbeat/reconnect and
//!   idle monitor) plus the host's own thread calling [`SessionController::update`].
//! - **One lock**: The shared activity and the IPC client sit behind a single
//!   mutex, so channel writes are totally ordered and strictly request/response.
//! - **Graceful degradation**: A missing or restarting peer is never fatal.
//!   Failures are returned as [`PresenceError`] and mirrored to an optional
//!   error callback; the controller reconnects on its own.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use presence_core::{PresenceAssembler, PresenceConfig, SessionController};
//!
//! let config = PresenceConfig::load(None);
//! let mut controller = SessionController::with_default_transport(&config);
//! controller.start()?;
//!
//! let mut assembler = PresenceAssembler::new(config);
//! controller.update(assembler.assemble(&status))?;
//! controller.close();
//! ```

pub mod assembler;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod format;
pub mod language;
pub mod stop;
pub mod transport;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use assembler::{EditorStatus, PresenceAssembler};
pub use client::{ConnectionState, ErrorCallback, PresenceClient};
pub use config::PresenceConfig;
pub use controller::{Lifecycle, SessionController, SessionSettings};
pub use error::{PresenceError, Result};
pub use presence_protocol::PresenceActivity;
pub use stop::StopSignal;
pub use transport::{Channel, Connector};

#[cfg(unix)]
pub use transport::UnixSocketConnector;
