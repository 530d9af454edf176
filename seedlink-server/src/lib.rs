//! Async SeedLink v3/v4 server with per-station record logs and fan-out.
//!
//! Records pushed into the [`DataStore`] are appended to the station's
//! bounded log and handed to every session whose selection matches. Sessions
//! resume from a sequence number or a time, catch up from the log, then
//! switch to live delivery without duplicates or holes.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> seedlink_mux_server::Result<()> {
//! use seedlink_mux_server::SeedLinkServer;
//!
//! let server = SeedLinkServer::bind("0.0.0.0:18000").await?;
//! let store = server.store().clone();
//!
//! tokio::spawn(server.run());
//!
//! // Push miniSEED records from any source
//! # let payload = vec![0u8; 512];
//! store.push("IU", "ANMO", &payload)?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod connections;
pub mod error;
pub mod fanout;
pub(crate) mod handler;
pub(crate) mod info;
pub mod log;
pub mod store;

pub use error::{Result, ServerError};
pub use fanout::{BackpressurePolicy, Delivery, Subscription};
pub use log::{AppendOutcome, FetchFrom, LogConfig, RecordSource, SequencePolicy, StationLog};
pub use store::{DataStore, LogReader};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use connections::ConnectionRegistry;
use handler::{ClientHandler, HandlerConfig};
use info::Identity;
use seedlink_mux_protocol::Timestamp;
use seedlink_mux_protocol::command::MAX_COMMAND_LEN;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Configuration for [`SeedLinkServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Software name reported in HELLO response. Default: `"SeedLink"`.
    pub software: String,
    /// Version string reported in HELLO response. Default: `"v4.0"`.
    pub version: String,
    /// Organization reported in HELLO response. Default: `"seedlink-mux"`.
    pub organization: String,
    /// Retention and sequencing of each station log.
    pub log: LogConfig,
    /// How a subscriber that falls behind live delivery is handled.
    pub backpressure: BackpressurePolicy,
    /// Reject STATION requests that match no known station, and close the
    /// session.
    pub strict_stations: bool,
    /// Time from connect to committed selection. Default: 60 s.
    pub handshake_timeout: Duration,
    /// Close a streaming session with no traffic in either direction for
    /// this long. Default: disabled.
    pub idle_timeout: Option<Duration>,
    /// Drop a session whose peer accepts no data for this long. Default: 30 s.
    pub write_timeout: Duration,
    /// Longest command line accepted, excluding CRLF. Default: 255.
    pub max_command_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            software: "SeedLink".to_owned(),
            version: "v4.0".to_owned(),
            organization: "seedlink-mux".to_owned(),
            log: LogConfig::default(),
            backpressure: BackpressurePolicy::default(),
            strict_stations: false,
            handshake_timeout: Duration::from_secs(60),
            idle_timeout: None,
            write_timeout: Duration::from_secs(30),
            max_command_len: MAX_COMMAND_LEN,
        }
    }
}

/// Handle for triggering graceful server shutdown.
///
/// Obtained via [`SeedLinkServer::shutdown_handle()`]. Calling [`shutdown()`](Self::shutdown)
/// stops the accept loop and all active client handlers.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Async SeedLink v3/v4 server.
///
/// Binds to a TCP port, accepts client connections, and distributes
/// records from a shared [`DataStore`].
pub struct SeedLinkServer {
    listener: TcpListener,
    handler_config: Arc<HandlerConfig>,
    store: DataStore,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    connections: ConnectionRegistry,
}

impl SeedLinkServer {
    /// Bind to the given address with default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, ServerConfig::default()).await
    }

    /// Bind to the given address with custom configuration.
    pub async fn bind_with_config(addr: &str, config: ServerConfig) -> Result<Self> {
        let store = DataStore::new(config.log.clone(), config.backpressure);
        Self::bind_with_store(addr, config, store).await
    }

    /// Bind and serve an existing store, e.g. one shared by several
    /// listeners.
    pub async fn bind_with_store(addr: &str, config: ServerConfig, store: DataStore) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler_config = Arc::new(HandlerConfig {
            identity: Identity {
                software: config.software,
                version: config.version,
                organization: config.organization,
                started: Timestamp::now().to_display(),
            },
            strict_stations: config.strict_stations,
            handshake_timeout: config.handshake_timeout,
            idle_timeout: config.idle_timeout,
            write_timeout: config.write_timeout,
            max_command_len: config.max_command_len,
        });
        info!(addr, "server bound");
        Ok(Self {
            listener,
            handler_config,
            store,
            shutdown_tx,
            shutdown_rx,
            connections: ConnectionRegistry::new(),
        })
    }

    /// Returns the local address this server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    /// Returns a reference to the shared data store.
    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Returns a handle that can be used to trigger graceful shutdown.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the accept loop. Spawns a task per client connection.
    ///
    /// Returns when shutdown is signalled.
    pub async fn run(mut self) {
        loop {
            let (stream, addr) = tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                            continue;
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            };

            info!(%addr, "accepted connection");
            stream.set_nodelay(true).ok();

            let conn_id = self.connections.register(addr);
            let (read_half, write_half) = stream.into_split();
            let handler = ClientHandler::new(
                read_half,
                write_half,
                addr,
                self.store.clone(),
                Arc::clone(&self.handler_config),
                self.shutdown_rx.clone(),
                conn_id,
                self.connections.clone(),
            );
            tokio::spawn(handler.run());
        }
    }
}
