//! Async SeedLink client for seedlink-mux and other SeedLink v3/v4 servers.
//!
//! [`SeedLinkClient`] drives a single session command by command.
//! [`ClientEngine`] sits on top of it: it tracks a cursor per stream,
//! reconnects with backoff and resumes without duplicates or silent loss.

mod addr;
mod client;
mod connection;
mod engine;
pub mod error;
#[cfg(test)]
mod mock;
mod state;
mod stream;

pub use addr::DEFAULT_PORT;
pub use client::SeedLinkClient;
pub use engine::{ClientEngine, EngineConfig, GapPolicy, ReconnectConfig};
pub use error::{ClientError, Result};
pub use state::{ClientConfig, Cursor, CursorMap, Event, InfoResponse, ServerInfo};
pub use stream::{event_stream, record_stream};
