use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use seedlink_mux_protocol::select::StationPattern;
use seedlink_mux_protocol::{
    CapabilitySet, Codec, Command, Decoded, ErrorCode, InfoDocument, InfoLevel, Response,
    SeedlinkError, Selector, SelectorBuilder, Session, SessionState, StartPoint, Transition,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::connections::ConnectionRegistry;
use crate::error::{Result, ServerError};
use crate::fanout::{Delivery, Subscription};
use crate::info::{self, Identity};
use crate::store::DataStore;

/// Deliveries written per flush while the subscriber has a backlog.
const FLUSH_BATCH: usize = 64;

/// Server config values needed by the handler.
pub(crate) struct HandlerConfig {
    pub identity: Identity,
    pub strict_stations: bool,
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Duration,
    pub max_command_len: usize,
}

enum Input {
    Command(Command),
    Invalid(SeedlinkError),
    Closed,
}

enum Setup {
    Stream { selector: Selector, fetch: bool },
    Close,
}

/// Per-client connection handler, run as a spawned tokio task.
pub(crate) struct ClientHandler {
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
    codec: Codec,
    session: Session,
    selection: SelectorBuilder,
    store: DataStore,
    config: Arc<HandlerConfig>,
    shutdown_rx: watch::Receiver<bool>,
    conn_id: u64,
    connections: ConnectionRegistry,
    addr: SocketAddr,
}

impl ClientHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        addr: SocketAddr,
        store: DataStore,
        config: Arc<HandlerConfig>,
        shutdown_rx: watch::Receiver<bool>,
        conn_id: u64,
        connections: ConnectionRegistry,
    ) -> Self {
        let session = Session::new();
        Self {
            reader: read_half,
            writer: BufWriter::new(write_half),
            codec: Codec::with_max_line(config.max_command_len),
            selection: SelectorBuilder::new(session.version()),
            session,
            store,
            config,
            shutdown_rx,
            conn_id,
            connections,
            addr,
        }
    }

    pub async fn run(mut self) {
        info!(addr = %self.addr, "client connected");
        if let Err(e) = self.serve().await {
            self.session.fail();
            match e {
                ServerError::Io(e) => debug!(addr = %self.addr, error = %e, "connection lost"),
                ServerError::ShuttingDown => debug!(addr = %self.addr, "write abandoned on shutdown"),
                e => warn!(addr = %self.addr, error = %e, "session failed"),
            }
        }
        self.session.finish();
        self.connections.unregister(self.conn_id);
        info!(addr = %self.addr, "client disconnected");
    }

    async fn serve(&mut self) -> Result<()> {
        let setup = match tokio::time::timeout(self.config.handshake_timeout, self.setup()).await {
            Ok(setup) => setup?,
            Err(_) => {
                warn!(addr = %self.addr, timeout = ?self.config.handshake_timeout, "handshake timed out");
                self.session.fail();
                return Ok(());
            }
        };
        match setup {
            Setup::Close => Ok(()),
            Setup::Stream { selector, fetch } if fetch => self.dial_up(&selector).await,
            Setup::Stream { selector, .. } => self.stream(&selector).await,
        }
    }

    /// Next command line, decoded with the session's current framing.
    /// Cancel-safe: partial lines stay in the codec buffer.
    async fn next_input(&mut self) -> Result<Input> {
        loop {
            match self.codec.decode_command() {
                Ok(Decoded::Item(command)) => return Ok(Input::Command(command)),
                Ok(Decoded::NeedMoreData) => {}
                Err(e) => return Ok(Input::Invalid(e)),
            }
            let n = tokio::select! {
                result = self.reader.read_buf(self.codec.read_buf()) => result?,
                _ = self.shutdown_rx.changed() => {
                    debug!(addr = %self.addr, "shutdown received");
                    return Ok(Input::Closed);
                }
            };
            if n == 0 {
                return Ok(Input::Closed);
            }
        }
    }

    /// Handshake and selection, up to the committing END/ENDFETCH.
    async fn setup(&mut self) -> Result<Setup> {
        loop {
            let command = match self.next_input().await? {
                Input::Command(command) => command,
                Input::Closed => return Ok(Setup::Close),
                Input::Invalid(e) => {
                    debug!(addr = %self.addr, error = %e, "rejected command line");
                    self.reply_error(&e).await?;
                    if e.is_fatal() {
                        self.session.fail();
                        return Ok(Setup::Close);
                    }
                    continue;
                }
            };
            debug!(addr = %self.addr, command = command.name(), "received command");

            let transition = match self.session.apply(&command) {
                Ok(transition) => transition,
                Err(e) => {
                    self.reply_error(&e).await?;
                    if self.session.state() == SessionState::Errored {
                        return Ok(Setup::Close);
                    }
                    continue;
                }
            };

            match transition {
                Transition::Close => return Ok(Setup::Close),
                Transition::Negotiated(version) => {
                    if let Err(e) = self.codec.negotiate(version) {
                        self.reply_error(&e).await?;
                        self.session.fail();
                        return Ok(Setup::Close);
                    }
                    self.selection.set_version(version);
                    debug!(addr = %self.addr, %version, "protocol negotiated");
                    self.sync_registry();
                    self.reply(&Response::Ok).await?;
                }
                Transition::Commit { fetch } => match self.selection.build() {
                    Ok(selector) => {
                        self.codec.negotiate(self.session.version())?;
                        self.session.commit()?;
                        self.sync_registry();
                        return Ok(Setup::Stream { selector, fetch });
                    }
                    Err(e) => self.reply_error(&e).await?,
                },
                Transition::Continue => {
                    if !self.handle_command(command).await? {
                        return Ok(Setup::Close);
                    }
                }
            }
            self.sync_registry();
        }
    }

    /// Handle a command that does not change the session phase. Returns
    /// `false` if the connection should close.
    async fn handle_command(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Hello => {
                let identity = &self.config.identity;
                let response = Response::Hello {
                    software: identity.software.clone(),
                    version: identity.version.clone(),
                    capabilities: CapabilitySet::full(),
                    organization: identity.organization.clone(),
                };
                self.reply(&response).await?;
            }
            Command::Station { station, network } => {
                if self.config.strict_stations
                    && let Ok(pattern) = StationPattern::new(&network, &station)
                    && !self.store.has_station_matching(&pattern)
                {
                    warn!(addr = %self.addr, station = %pattern, "unknown station requested");
                    let response =
                        Response::error(ErrorCode::Arguments, format!("unknown station {pattern}"));
                    self.reply(&response).await?;
                    self.session.fail();
                    return Ok(false);
                }
                match self.selection.station(&network, &station) {
                    Ok(_) => self.reply_ok().await?,
                    Err(e) => self.reply_error(&e).await?,
                }
            }
            Command::Select { pattern } => match self.selection.select(&pattern) {
                Ok(()) => self.reply_ok().await?,
                Err(e) => self.reply_error(&e).await?,
            },
            Command::Data { sequence, start, end } => {
                self.selection.start(StartPoint::from_data_args(sequence, start, end));
                self.reply_ok().await?;
            }
            Command::Fetch { sequence, start } => {
                self.selection.start(StartPoint::from_data_args(sequence, start, None));
                self.reply_ok().await?;
            }
            Command::Time { start, end } => {
                self.selection.start(StartPoint::Time { start, end });
                self.reply_ok().await?;
            }
            Command::Batch => self.reply(&Response::Ok).await?,
            Command::Cat => {
                let mut out = String::new();
                for id in self.store.stations() {
                    out.push_str(&format!("{} {}\r\n", id.network, id.station));
                }
                out.push_str("END\r\n");
                self.send(out.as_bytes(), true).await?;
            }
            Command::Auth { .. } => {
                let response =
                    Response::error(ErrorCode::Unsupported, "authentication is not supported");
                self.reply(&response).await?;
            }
            Command::UserAgent { description } => {
                debug!(addr = %self.addr, useragent = %description, "user agent");
                self.connections
                    .update(self.conn_id, |info| info.user_agent = Some(description));
                self.reply(&Response::Ok).await?;
            }
            Command::Info { level } => self.send_info(level).await?,
            other => {
                let response = Response::error(
                    ErrorCode::Unexpected,
                    format!("{} not expected here", other.name()),
                );
                self.reply(&response).await?;
            }
        }
        Ok(true)
    }

    /// Dial-up delivery: the catch-up present at commit time, then END.
    async fn dial_up(&mut self, selector: &Selector) -> Result<()> {
        let version = self.session.version();
        info!(addr = %self.addr, stations = selector.stations.len(), %version, "dial-up started");
        let mut subscription = self.store.dial_up(selector, version);
        let mut written = 0;
        while let Some(delivery) = subscription.next_catchup() {
            self.write_delivery(&delivery).await?;
            written += 1;
            if written % FLUSH_BATCH == 0 {
                self.send(&[], true).await?;
            }
        }
        self.send(&Response::End.to_bytes(), true).await?;
        self.session.close();
        debug!(addr = %self.addr, records = written, "dial-up complete");
        Ok(())
    }

    /// Live delivery until END/BYE, disconnect, shutdown, or idle timeout.
    async fn stream(&mut self, selector: &Selector) -> Result<()> {
        let version = self.session.version();
        info!(addr = %self.addr, stations = selector.stations.len(), %version, "streaming started");
        let mut subscription = self.store.subscribe(selector, version);
        let idle = self.config.idle_timeout;
        let mut deadline = idle.map(|d| Instant::now() + d);

        loop {
            tokio::select! {
                delivery = subscription.next() => {
                    match delivery {
                        Ok(delivery) => self.write_backlog(delivery, &mut subscription).await?,
                        Err(ServerError::SlowConsumerDisconnected { lag }) => {
                            warn!(addr = %self.addr, lag, "disconnecting slow consumer");
                            let response = Response::error(ErrorCode::Limit, "slow consumer");
                            self.reply(&response).await?;
                            self.session.fail();
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                    deadline = idle.map(|d| Instant::now() + d);
                }
                input = self.next_input() => {
                    let command = match input? {
                        Input::Closed => return Ok(()),
                        Input::Command(command) => command,
                        Input::Invalid(e) => {
                            self.reply_error(&e).await?;
                            self.session.fail();
                            return Ok(());
                        }
                    };
                    debug!(addr = %self.addr, command = command.name(), "received command while streaming");
                    match self.session.apply(&command) {
                        Ok(Transition::Close) => {
                            self.reply(&Response::End).await?;
                            return Ok(());
                        }
                        Ok(_) => {
                            if let Command::Info { level } = command {
                                self.send_info(level).await?;
                            }
                        }
                        Err(e) => {
                            self.reply_error(&e).await?;
                            return Ok(());
                        }
                    }
                    deadline = idle.map(|d| Instant::now() + d);
                }
                _ = idle_expired(deadline) => {
                    info!(addr = %self.addr, "idle timeout");
                    self.session.close();
                    return Ok(());
                }
            }
        }
    }

    /// Write `first` plus whatever else is ready, then flush once.
    async fn write_backlog(&mut self, first: Delivery, subscription: &mut Subscription) -> Result<()> {
        self.write_delivery(&first).await?;
        for _ in 1..FLUSH_BATCH {
            match subscription.try_next() {
                Ok(Some(delivery)) => self.write_delivery(&delivery).await?,
                Ok(None) => break,
                // Reported by the next `next()` call
                Err(_) => break,
            }
        }
        self.send(&[], true).await
    }

    async fn write_delivery(&mut self, delivery: &Delivery) -> Result<()> {
        let frame = match delivery {
            Delivery::Record(record) => {
                trace!(station = %record.station(), sequence = %record.sequence, "frame sent");
                self.codec.encode_record(record)?
            }
            Delivery::Gap(gap) => {
                debug!(addr = %self.addr, %gap, "gap notice sent");
                self.codec.encode_gap(gap)?
            }
        };
        self.send(&frame, false).await
    }

    /// v3: XML over SLINFO packets. v4: one JSON frame, or an error frame
    /// for a level the version does not offer.
    async fn send_info(&mut self, level: InfoLevel) -> Result<()> {
        let store = &self.store;
        let connections = &self.connections;
        let identity = &self.config.identity;
        let version = self.session.version();

        let bytes = if version == seedlink_mux_protocol::ProtocolVersion::V4 {
            match info::document(level, identity, |s| store.station_summary(s), || connections.snapshot()) {
                Some(doc) => self.codec.encode_info(&doc.to_json()?, false)?,
                None => {
                    let doc = InfoDocument::error(
                        ErrorCode::Unsupported.as_str(),
                        format!("INFO {level} is not available in v4"),
                    );
                    self.codec.encode_info(&doc.to_json()?, true)?
                }
            }
        } else {
            match info::xml(level, identity, |s| store.station_summary(s), || connections.snapshot()) {
                Some(xml) => self.codec.encode_info(xml.as_bytes(), false)?,
                None => {
                    let response = Response::error(
                        ErrorCode::Unsupported,
                        format!("INFO {level} is not available in v3"),
                    );
                    response.to_bytes()
                }
            }
        };
        debug!(addr = %self.addr, %level, bytes = bytes.len(), "info sent");
        self.send(&bytes, true).await
    }

    /// OK, unless BATCH mode suppresses it.
    async fn reply_ok(&mut self) -> Result<()> {
        if self.session.batch() {
            return Ok(());
        }
        self.reply(&Response::Ok).await
    }

    async fn reply_error(&mut self, err: &SeedlinkError) -> Result<()> {
        let response = Response::error(ErrorCode::for_error(err), err.to_string());
        self.reply(&response).await
    }

    async fn reply(&mut self, response: &Response) -> Result<()> {
        self.send(&response.to_bytes(), true).await
    }

    /// Buffer `bytes` and optionally flush. A peer that stops reading
    /// blocks here, so the write gives way to shutdown and is bounded by
    /// the write timeout.
    async fn send(&mut self, bytes: &[u8], flush: bool) -> Result<()> {
        let limit = self.config.write_timeout;
        let writer = &mut self.writer;
        let io = async {
            writer.write_all(bytes).await?;
            if flush {
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::select! {
            result = tokio::time::timeout(limit, io) => match result {
                Ok(written) => Ok(written?),
                Err(_) => {
                    warn!(addr = %self.addr, timeout = ?limit, "peer stopped reading, dropping session");
                    Err(ServerError::WriteTimeout(limit))
                }
            },
            () = shutdown_signalled(&mut self.shutdown_rx) => Err(ServerError::ShuttingDown),
        }
    }

    fn sync_registry(&self) {
        let state = self.session.state();
        let version = self.session.version();
        self.connections.update(self.conn_id, |info| {
            info.state = state;
            info.protocol_version = version;
        });
    }
}

/// Resolves once shutdown is requested or the server is gone.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
