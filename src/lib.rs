//! Cellular M2M gateway supervision and relay.
//!
//! The gateway keeps a modem and its PPP link alive, waits until its
//! configuration is complete, and relays a CRC-framed binary telemetry
//! protocol between a field device and a private or public network path.
//!
//! # Components
//!
//! - [`Watcher`]: start/stop/retry/ready state machine shared by every
//!   supervised resource, extended through the [`Resource`] trait.
//! - [`FramedLink`]: prefix/suffix delimited command/response link over a
//!   serial device or a TCP endpoint.
//! - [`ModemWatcher`]: AT-command modem reports, RSSI polling and the IMEI
//!   handshake.
//! - [`RouteWatcher`]: periodic PPP dial and route convergence.
//! - [`ConfigCheckpoint`]: polls the configuration hash until required fields
//!   are present.
//! - [`GatewayProxy`]: UDP relay with command/ack queueing and transmit
//!   bookkeeping.
//! - [`GatewayContext`]: owns all of the above and brings them up in order.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use m2m_gateway::{GatewayContext, GatewaySettings, MemoryStore, SystemShell};
//!
//! #[tokio::main]
//! async fn main() -> m2m_gateway::Result<()> {
//!     m2m_gateway::init_tracing();
//!
//!     let settings = GatewaySettings::load("/etc/m2m/gateway.yaml").await?;
//!     let mut gateway =
//!         GatewayContext::new(settings, Arc::new(MemoryStore::new()), Arc::new(SystemShell));
//!     gateway.start().await?;
//!     println!("{:?}", gateway.status().await);
//!     gateway.shutdown().await
//! }
//! ```

// Core types and error handling
mod error;
mod note;
#[cfg(test)]
mod test_utils;

// Lifecycle and transports
pub mod device;
pub mod shell;
pub mod watcher;

// Supervised components
pub mod checkpoint;
pub mod link;
pub mod modem;
pub mod route;

// Data plane
pub mod proxy;
pub mod store;
pub mod template;
pub mod wire;

pub mod context;

pub use error::*;
pub use note::Note;

pub use checkpoint::{CheckpointConfig, CheckpointEvent, ConfigCheckpoint};
pub use context::{GatewayContext, GatewaySettings, GatewayStatus, init_tracing};
pub use device::{SerialDevice, TelnetDevice, Transport, TransportStreams};
pub use link::{CommandResponse, FramedLink, FramingConfig};
pub use modem::{FlowReport, ModemConfig, ModemEvent, ModemWatcher};
pub use proxy::{
    GatewayConfig, GatewayProxy, InboundOutcome, Path, ProxyEvent, ProxySettings, ProxyStats,
};
pub use route::{PppConfig, RouteStatus, RouteWatcher};
pub use shell::{Shell, ShellOutput, SystemShell};
pub use store::{KeyValueStore, MemoryStore};
pub use template::{FieldSpec, HashTemplate};
pub use watcher::{Resource, Watcher, WatcherConfig, WatcherContext, WatcherState};
pub use wire::{Tuple, TupleValue, WireMessage};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
