use std::time::Duration;

use futures_core::Stream;
use seedlink_mux_protocol::{
    Command, InfoDocument, InfoLevel, Packet, PayloadSubformat, ProtocolVersion, Record, Response,
    Selector, SequenceNumber, Session, SessionState, StationId, Timestamp, Transition,
};
use tracing::{debug, info, trace, warn};

use crate::addr::ServerAddr;
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::state::{ClientConfig, InfoResponse, ServerInfo};

/// Async SeedLink client driving one session against a server.
///
/// Every command is checked against a [`Session`] before it goes out, so
/// the client and server agree on the state:
/// `negotiated` → `selecting` → `streaming` → `closed`.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> seedlink_mux_client::Result<()> {
/// use seedlink_mux_client::SeedLinkClient;
///
/// let mut client = SeedLinkClient::connect("rtserve.iris.washington.edu:18000").await?;
/// client.station("ANMO", "IU").await?;
/// client.select("BHZ").await?;
/// client.data().await?;
/// client.end_stream().await?;
///
/// while let Some(record) = client.next_record().await? {
///     println!("{} seq={}", record.key, record.sequence);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SeedLinkClient {
    connection: Connection,
    session: Session,
    server_info: ServerInfo,
    config: ClientConfig,
}

impl SeedLinkClient {
    /// Connect with default configuration, switching to v4 when offered.
    ///
    /// `addr` is `host[:port]` or a `slink://host[:port]` URL; the port
    /// defaults to [`DEFAULT_PORT`](crate::DEFAULT_PORT). A `slinkv3://` URL
    /// keeps the session on v3.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    /// Connect, send HELLO and negotiate the protocol version.
    ///
    /// Any failure along the way is reported as
    /// [`ClientError::HandshakeFailed`] wrapping the cause.
    pub async fn connect_with_config(addr: &str, config: ClientConfig) -> Result<Self> {
        info!(addr, "connecting");
        let client = Self::handshake(addr, config).await.map_err(|e| {
            warn!(addr, error = %e, "handshake failed");
            ClientError::HandshakeFailed(Box::new(e))
        })?;
        info!(
            addr,
            version = %client.version(),
            software = %client.server_info.software,
            "connected"
        );
        Ok(client)
    }

    async fn handshake(addr: &str, mut config: ClientConfig) -> Result<Self> {
        let server = ServerAddr::parse(addr)?;
        if server.force_v3 {
            config.capabilities.prefer_v4 = false;
        }
        let mut connection =
            Connection::connect(&server.target, config.connect_timeout, config.read_timeout)
                .await?;
        let mut session = Session::new();

        session.apply(&Command::Hello)?;
        connection.send_command(&Command::Hello).await?;
        let line1 = connection.read_line().await?;
        let line2 = connection.read_line().await?;
        let Response::Hello {
            software,
            version,
            capabilities,
            organization,
        } = Response::parse_hello(&line1, &line2)?
        else {
            return Err(ClientError::UnexpectedResponse(
                "expected HELLO response".into(),
            ));
        };
        debug!(%software, %version, caps = %capabilities.to_tokens(), "HELLO");

        let mut negotiated = capabilities.negotiate(&config.capabilities)?;
        if negotiated == ProtocolVersion::V4 {
            let slproto = Command::SlProto {
                version: ProtocolVersion::V4,
            };
            connection
                .send_raw(&slproto.to_bytes(ProtocolVersion::V4)?)
                .await?;
            let line = connection.read_line().await?;
            match Response::parse_line(&line)? {
                Response::Ok => {
                    session.apply(&slproto)?;
                }
                Response::Error { description, .. } => {
                    warn!(%description, "v4 negotiation refused, falling back to v3");
                    let v3_only = seedlink_mux_protocol::CapabilityRequest {
                        prefer_v4: false,
                        ..config.capabilities.clone()
                    };
                    negotiated = capabilities.negotiate(&v3_only)?;
                    if negotiated != ProtocolVersion::V3 {
                        return Err(ClientError::ServerError(format!("SLPROTO: {description}")));
                    }
                }
                _ => {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "expected OK or ERROR for SLPROTO, got: {line:?}"
                    )));
                }
            }
        }
        connection.negotiate(negotiated)?;

        let mut client = Self {
            connection,
            session,
            server_info: ServerInfo {
                software,
                version,
                organization,
                capabilities,
            },
            config,
        };

        if negotiated == ProtocolVersion::V4
            && let Some(agent) = client.config.user_agent.clone()
        {
            let cmd = Command::UserAgent { description: agent };
            client.session.apply(&cmd)?;
            client.connection.send_command(&cmd).await?;
            if let Err(e) = client.read_ok("USERAGENT").await {
                warn!(error = %e, "USERAGENT rejected");
            }
        }
        Ok(client)
    }

    // -- Accessors --

    /// The negotiated protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.session.version()
    }

    /// Banner and capabilities from HELLO.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // -- Selection --

    /// `STATION`: start a selection entry. Later SELECT/DATA/TIME apply to it.
    pub async fn station(&mut self, station: &str, network: &str) -> Result<()> {
        debug!(station, network, "STATION");
        self.command(Command::Station {
            station: station.to_owned(),
            network: network.to_owned(),
        })
        .await
    }

    /// `SELECT`: add a stream pattern (`"BHZ"`, `"00BH?.D"`, `"00_B_H_Z"`, `"!LHZ"`).
    pub async fn select(&mut self, pattern: &str) -> Result<()> {
        debug!(pattern, "SELECT");
        self.command(Command::Select {
            pattern: pattern.to_owned(),
        })
        .await
    }

    /// `DATA` without arguments: live records only.
    pub async fn data(&mut self) -> Result<()> {
        self.start_data(None, None, None).await
    }

    /// `DATA ALL`: everything the server still holds, then live.
    pub async fn data_all(&mut self) -> Result<()> {
        self.start_data(Some(SequenceNumber::ALL_DATA), None, None).await
    }

    /// `DATA seq`: records after `sequence`.
    pub async fn data_from(&mut self, sequence: SequenceNumber) -> Result<()> {
        self.start_data(Some(sequence), None, None).await
    }

    /// `DATA seq time`: records after `sequence`, whose record started at
    /// `time`. The time lets the server place a 24-bit v3 sequence.
    pub async fn data_after(&mut self, sequence: SequenceNumber, time: Timestamp) -> Result<()> {
        self.start_data(Some(sequence), Some(time), None).await
    }

    /// Records whose start time lies in `[start, end]`.
    ///
    /// v3 sends `TIME`; v4 sends `DATA` with a time window.
    pub async fn time_window(&mut self, start: Timestamp, end: Option<Timestamp>) -> Result<()> {
        debug!(%start, ?end, "time window");
        match self.version() {
            ProtocolVersion::V3 => self.command(Command::Time { start, end }).await,
            ProtocolVersion::V4 => self.start_data(None, Some(start), end).await,
        }
    }

    /// `FETCH` (v3): dial-up mode from the current cursor.
    pub async fn fetch(&mut self) -> Result<()> {
        self.command(Command::Fetch {
            sequence: None,
            start: None,
        })
        .await
    }

    /// `FETCH ALL` (v3): dial-up mode over everything retained.
    pub async fn fetch_all(&mut self) -> Result<()> {
        self.command(Command::Fetch {
            sequence: Some(SequenceNumber::ALL_DATA),
            start: None,
        })
        .await
    }

    /// `FETCH seq` (v3): dial-up mode after `sequence`.
    pub async fn fetch_from(&mut self, sequence: SequenceNumber) -> Result<()> {
        self.command(Command::Fetch {
            sequence: Some(sequence),
            start: None,
        })
        .await
    }

    /// `BATCH` (v3): the server stops acknowledging selection commands.
    pub async fn batch(&mut self) -> Result<()> {
        self.command(Command::Batch).await
    }

    /// Send every selection command for `selector`, then `END`.
    pub async fn subscribe(&mut self, selector: &Selector) -> Result<()> {
        for cmd in selector.to_commands(self.version()) {
            self.command(cmd).await?;
        }
        self.end_stream().await
    }

    // -- Streaming --

    /// `END`: commit the selection and start streaming. No reply is read;
    /// a rejected selection arrives as an in-band `ERROR` packet.
    pub async fn end_stream(&mut self) -> Result<()> {
        self.commit(Command::End).await
    }

    /// `ENDFETCH` (v4): stream what is buffered, then the server closes.
    pub async fn end_fetch(&mut self) -> Result<()> {
        self.commit(Command::EndFetch).await
    }

    /// Read the next streamed packet.
    ///
    /// `Ok(None)` once the stream is over (server EOF, or an earlier `END`).
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        match self.session.state() {
            SessionState::Streaming => {}
            SessionState::Closed | SessionState::Errored => return Ok(None),
            other => {
                return Err(ClientError::InvalidState {
                    expected: "streaming",
                    actual: other.as_str(),
                });
            }
        }

        let packet = match self.connection.read_packet().await {
            Ok(p) => p,
            Err(e) => {
                self.session.fail();
                return Err(e);
            }
        };
        match &packet {
            None => {
                debug!("server closed the stream");
                self.session.finish();
            }
            Some(Packet::Data(record)) => {
                trace!(key = %record.key, sequence = %record.sequence, "record received");
            }
            Some(Packet::Gap(gap)) => {
                warn!(
                    station = %gap.station,
                    requested = %gap.requested,
                    earliest = %gap.earliest,
                    "gap notice"
                );
            }
            Some(Packet::End) => {
                debug!("END received");
                self.session.finish();
            }
            Some(Packet::Error(msg)) => {
                warn!(%msg, "in-band error");
                self.session.fail();
            }
            Some(Packet::Info { .. }) => trace!("INFO packet received"),
        }
        Ok(packet)
    }

    /// Read the next data record.
    ///
    /// A gap notice is returned as [`ClientError::GapDetected`]; the stream
    /// stays usable and the next call continues after the gap. INFO packets
    /// are skipped. `Ok(None)` at the end of the stream.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.next_packet().await? {
                Some(Packet::Data(record)) => return Ok(Some(record)),
                Some(Packet::Gap(gap)) => return Err(ClientError::GapDetected(gap)),
                Some(Packet::Info { .. }) => continue,
                Some(Packet::Error(msg)) => return Err(ClientError::ServerError(msg)),
                Some(Packet::End) | None => return Ok(None),
            }
        }
    }

    /// Consume this client and return a [`Stream`] of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> {
        crate::stream::record_stream(self)
    }

    // -- Utility --

    /// Request INFO at `level` and collect the whole reply.
    ///
    /// Not available while streaming; use [`send_info`](Self::send_info)
    /// and read the reply with [`next_packet`](Self::next_packet) instead.
    pub async fn info(&mut self, level: InfoLevel) -> Result<InfoResponse> {
        self.require_before_streaming()?;
        self.send_info(level).await?;

        match self.version() {
            ProtocolVersion::V3 => {
                let mut xml = Vec::new();
                loop {
                    match self.connection.read_packet().await? {
                        Some(Packet::Info { payload, more, .. }) => {
                            xml.extend_from_slice(&payload);
                            if !more {
                                break;
                            }
                        }
                        Some(Packet::Error(msg)) => {
                            return Err(ClientError::ServerError(format!("INFO: {msg}")));
                        }
                        None => return Err(ClientError::Disconnected),
                        Some(other) => {
                            return Err(ClientError::UnexpectedResponse(format!(
                                "expected INFO packet, got {other:?}"
                            )));
                        }
                    }
                }
                Ok(InfoResponse::Xml(String::from_utf8_lossy(&xml).into_owned()))
            }
            ProtocolVersion::V4 => match self.connection.read_packet().await? {
                Some(Packet::Info {
                    subformat, payload, ..
                }) => {
                    let doc = InfoDocument::from_json(&payload)?;
                    match (&doc.error, subformat) {
                        (Some(err), _) => Err(ClientError::ServerError(format!(
                            "INFO: {} {}",
                            err.code, err.message
                        ))),
                        (None, PayloadSubformat::InfoError) => {
                            Err(ClientError::ServerError("INFO: error".into()))
                        }
                        (None, _) => Ok(InfoResponse::Json(doc)),
                    }
                }
                Some(Packet::Error(msg)) => Err(ClientError::ServerError(format!("INFO: {msg}"))),
                None => Err(ClientError::Disconnected),
                Some(other) => Err(ClientError::UnexpectedResponse(format!(
                    "expected INFO frame, got {other:?}"
                ))),
            },
        }
    }

    /// Send `INFO` without waiting for the reply.
    pub async fn send_info(&mut self, level: InfoLevel) -> Result<()> {
        let cmd = Command::Info { level };
        self.session.apply(&cmd)?;
        debug!(level = level.as_str(), "INFO");
        self.connection.send_command(&cmd).await
    }

    /// `CAT` (v3): list the stations the server knows.
    pub async fn cat(&mut self) -> Result<Vec<StationId>> {
        self.require_before_streaming()?;
        let cmd = Command::Cat;
        self.session.apply(&cmd)?;
        self.connection.send_command(&cmd).await?;

        let mut stations = Vec::new();
        loop {
            let line = self.connection.read_line().await?;
            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case("END") {
                return Ok(stations);
            }
            if let Ok(Response::Error { description, .. }) = Response::parse_line(trimmed) {
                return Err(ClientError::ServerError(format!("CAT: {description}")));
            }
            match trimmed.split_once(char::is_whitespace) {
                Some((net, sta)) => stations.push(StationId::new(net, sta)),
                None => {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "bad CAT line: {line:?}"
                    )));
                }
            }
        }
    }

    /// Send `BYE` and close the connection.
    pub async fn bye(&mut self) -> Result<()> {
        if !self.session.state().is_terminal() {
            self.session.apply(&Command::Bye)?;
            self.connection.send_command(&Command::Bye).await?;
        }
        self.connection.shutdown().await.ok();
        self.session.finish();
        Ok(())
    }

    /// End a session gracefully: `END` while streaming, then drain until the
    /// server's `END` or EOF, giving up after `grace`.
    ///
    /// Returns the records that were still in flight.
    pub async fn close(&mut self, grace: Duration) -> Result<Vec<Record>> {
        let mut in_flight = Vec::new();
        match self.session.state() {
            SessionState::Streaming => {
                self.session.apply(&Command::End)?;
                self.connection.send_command(&Command::End).await?;
                let drain = async {
                    loop {
                        match self.connection.read_packet().await {
                            Ok(Some(Packet::Data(record))) => in_flight.push(record),
                            Ok(Some(Packet::End | Packet::Error(_)) | None) | Err(_) => break,
                            Ok(Some(_)) => {}
                        }
                    }
                };
                if tokio::time::timeout(grace, drain).await.is_err() {
                    warn!(?grace, "server did not end the stream in time");
                }
            }
            state if !state.is_terminal() => {
                self.session.apply(&Command::Bye)?;
                self.connection.send_command(&Command::Bye).await.ok();
            }
            _ => {}
        }
        self.connection.shutdown().await.ok();
        self.session.finish();
        Ok(in_flight)
    }

    // -- Private helpers --

    fn require_before_streaming(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Negotiated | SessionState::Selecting => Ok(()),
            other => Err(ClientError::InvalidState {
                expected: "negotiated|selecting",
                actual: other.as_str(),
            }),
        }
    }

    /// Send a selection command and read its `OK`, unless BATCH suppressed it.
    async fn command(&mut self, cmd: Command) -> Result<()> {
        self.require_before_streaming()?;
        self.session.apply(&cmd)?;
        self.connection.send_command(&cmd).await?;
        if matches!(cmd, Command::Batch) || !self.session.batch() {
            self.read_ok(cmd.name()).await?;
        }
        Ok(())
    }

    async fn start_data(
        &mut self,
        sequence: Option<SequenceNumber>,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<()> {
        debug!(?sequence, ?start, "DATA");
        self.command(Command::Data {
            sequence,
            start,
            end,
        })
        .await
    }

    async fn commit(&mut self, cmd: Command) -> Result<()> {
        self.require_before_streaming()?;
        match self.session.apply(&cmd)? {
            Transition::Commit { fetch } => {
                self.connection.send_command(&cmd).await?;
                self.session.commit()?;
                debug!(fetch, "streaming");
                Ok(())
            }
            other => Err(ClientError::UnexpectedResponse(format!(
                "{} did not commit the selection: {other:?}",
                cmd.name()
            ))),
        }
    }

    async fn read_ok(&mut self, command_name: &str) -> Result<()> {
        let line = self.connection.read_line().await?;
        match Response::parse_line(&line)? {
            Response::Ok => Ok(()),
            Response::Error { code, description } => {
                let msg = match code {
                    Some(c) => format!("{command_name}: {} {description}", c.as_str()),
                    None => format!("{command_name}: {description}"),
                };
                Err(ClientError::ServerError(msg))
            }
            _ => Err(ClientError::UnexpectedResponse(format!(
                "expected OK for {command_name}, got: {line:?}"
            ))),
        }
    }
}
