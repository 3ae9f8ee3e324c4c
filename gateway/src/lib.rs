//! # Reverb Gateway
//!
//! Bridges one outbound, authenticated Reverb (Pusher protocol) channel
//! with LAN-local clients that have no internet access of their own.
//!
//! - [`cloud`] / [`supervisor`]: the broker session and its reconnect loop
//! - [`outbox`]: bounded, per-client fair queue of frames going up
//! - [`handlers`] / [`server`] / [`state`]: the LAN-facing WebSocket relay
//! - [`executor`]: runs untagged cloud commands on this machine

pub mod api;
pub mod auth;
pub mod cloud;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod outbox;
pub mod server;
pub mod state;
pub mod supervisor;

pub use cloud::{CloudSession, Phase, SessionEnd};
pub use config::{RelayConfig, ReverbClientConfig};
pub use error::{CloudError, ConfigError};
pub use executor::{CommandExecutor, CommandOutcome, CommandTable};
pub use outbox::{CloudForwarder, Outbox, OutboxItem, OutboxRejection};
pub use state::{CloudLink, RelayGateway};
