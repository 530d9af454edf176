use std::time::Duration;

use futures_core::Stream;
use seedlink_mux_protocol::{
    Packet, ProtocolVersion, Record, Selector, StartPoint, StationPattern, StationSelector,
};
use tracing::{debug, info, trace, warn};

use crate::SeedLinkClient;
use crate::error::{ClientError, Result};
use crate::state::{ClientConfig, Cursor, CursorMap, Event, ServerInfo};

/// Configuration for automatic reconnect with exponential backoff.
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnect attempt. Default: 1 second.
    pub initial_backoff: Duration,
    /// Maximum delay between reconnect attempts. Default: 60 seconds.
    pub max_backoff: Duration,
    /// Multiplier applied to backoff after each failed attempt. Default: 2.0.
    pub multiplier: f64,
    /// Consecutive attempts before giving up with
    /// [`ClientError::StreamUnavailable`]. 0 = unlimited. Default: 10.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    fn next_backoff(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_backoff)
    }
}

/// What to do when the server reports that requested records are gone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GapPolicy {
    /// Hand the gap to the consumer as [`Event::Gap`] and keep going.
    #[default]
    Accept,
    /// Close the session and fail with [`ClientError::GapDetected`].
    Abort,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub reconnect: ReconnectConfig,
    pub gap_policy: GapPolicy,
    /// How long [`ClientEngine::close`] waits for the server to end the
    /// stream before dropping the connection. Default: 2 seconds.
    pub close_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            reconnect: ReconnectConfig::default(),
            gap_policy: GapPolicy::default(),
            close_grace: Duration::from_secs(2),
        }
    }
}

/// A resumable subscription on top of [`SeedLinkClient`].
///
/// The engine keeps a [`Cursor`] per stream. When the transport fails it
/// reconnects with backoff and re-subscribes from the cursors, so the
/// consumer sees every record exactly once across the reconnect.
///
/// # Deduplication
///
/// A record at or below its stream's cursor is dropped. On v3 the 24-bit
/// sequence may wrap; a lower sequence counts as new only when the record
/// starts later than the cursor.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> seedlink_mux_client::Result<()> {
/// use seedlink_mux_client::{ClientEngine, EngineConfig, Event};
/// use seedlink_mux_protocol::StartPoint;
///
/// let mut engine = ClientEngine::connect("localhost:18000", EngineConfig::default()).await?;
/// engine.select(&["IU_ANMO:BHZ", "GE_*"], StartPoint::Next).await?;
///
/// while let Some(event) = engine.next_event().await? {
///     match event {
///         Event::Record(r) => println!("{} {}", r.key, r.sequence),
///         Event::Gap(g) => eprintln!("lost {} records", g.missed()),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct ClientEngine {
    addr: String,
    config: EngineConfig,
    client: Option<SeedLinkClient>,
    version: ProtocolVersion,
    server_info: ServerInfo,
    selector: Option<Selector>,
    cursors: CursorMap,
    attempts: u32,
    backoff: Duration,
    finished: bool,
}

impl ClientEngine {
    /// Connect and negotiate. Fails with [`ClientError::HandshakeFailed`].
    pub async fn connect(addr: &str, config: EngineConfig) -> Result<Self> {
        let client = SeedLinkClient::connect_with_config(addr, config.client.clone()).await?;
        Ok(Self {
            addr: addr.to_owned(),
            version: client.version(),
            server_info: client.server_info().clone(),
            client: Some(client),
            backoff: config.reconnect.initial_backoff,
            config,
            selector: None,
            cursors: CursorMap::new(),
            attempts: 0,
            finished: false,
        })
    }

    /// Start from previously saved cursors instead of the selection's start
    /// point, for every stream they cover.
    pub fn with_cursors(mut self, cursors: CursorMap) -> Self {
        self.cursors = cursors;
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Last delivered record per stream. Save these to resume in a later run.
    pub fn cursors(&self) -> &CursorMap {
        &self.cursors
    }

    /// Compile `specs` (`"NET_STA[:SEL,...]"`) and start streaming.
    pub async fn select<S: AsRef<str>>(&mut self, specs: &[S], start: StartPoint) -> Result<()> {
        let selector = Selector::compile(specs, start)?;
        self.subscribe(selector).await
    }

    /// Send `selector` and start streaming.
    pub async fn subscribe(&mut self, selector: Selector) -> Result<()> {
        let resume = resume_selector(&selector, &self.cursors, self.version);
        let client = self.client.as_mut().ok_or(ClientError::Disconnected)?;
        client.subscribe(&resume).await?;
        info!(stations = selector.stations.len(), "subscribed");
        self.selector = Some(selector);
        Ok(())
    }

    /// Next record or gap, reconnecting as needed.
    ///
    /// `Ok(None)` only after a gap aborted the session. Transport failures
    /// are retried; once the retries are spent this fails with
    /// [`ClientError::StreamUnavailable`].
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        if self.finished {
            return Ok(None);
        }
        if self.selector.is_none() {
            return Err(ClientError::InvalidState {
                expected: "streaming",
                actual: "negotiated",
            });
        }

        loop {
            let Some(client) = self.client.as_mut() else {
                self.reconnect().await?;
                continue;
            };

            match client.next_packet().await {
                Ok(Some(Packet::Data(record))) => {
                    if !self.cursors.is_new(&record, self.version) {
                        debug!(
                            key = %record.key,
                            sequence = %record.sequence,
                            "skipping duplicate record"
                        );
                        continue;
                    }
                    self.cursors.advance(&record);
                    self.reset_backoff();
                    return Ok(Some(Event::Record(record)));
                }
                Ok(Some(Packet::Gap(gap))) => {
                    self.reset_backoff();
                    match self.config.gap_policy {
                        GapPolicy::Accept => return Ok(Some(Event::Gap(gap))),
                        GapPolicy::Abort => {
                            warn!(%gap, "gap detected, aborting");
                            self.drop_client().await;
                            self.finished = true;
                            return Err(ClientError::GapDetected(gap));
                        }
                    }
                }
                Ok(Some(Packet::Info { .. })) => trace!("ignoring INFO packet"),
                Ok(Some(Packet::End) | None) => {
                    info!("server ended the stream");
                    self.client = None;
                }
                Ok(Some(Packet::Error(msg))) => {
                    if !is_retryable_server_error(&msg) {
                        self.drop_client().await;
                        return Err(ClientError::ServerError(msg));
                    }
                    warn!(%msg, "server dropped the session");
                    self.client = None;
                }
                Err(e) if e.is_transport() => {
                    warn!(error = %e, "transport failed");
                    self.client = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Next record; gap events are logged and skipped.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.next_event().await? {
                Some(Event::Record(record)) => return Ok(Some(record)),
                Some(Event::Gap(gap)) => debug!(%gap, "gap skipped"),
                None => return Ok(None),
            }
        }
    }

    /// Consume the engine and return a [`Stream`] of events.
    pub fn records(self) -> impl Stream<Item = Result<Event>> {
        crate::stream::event_stream(self)
    }

    /// Send `END`, wait up to the configured grace period for the server to
    /// finish, then drop the connection.
    ///
    /// Records still in flight are discarded without moving the cursors, so
    /// the returned map resumes right after the last record handed out.
    pub async fn close(mut self) -> Result<CursorMap> {
        if let Some(mut client) = self.client.take() {
            let in_flight = client.close(self.config.close_grace).await?;
            debug!(discarded = in_flight.len(), "closed");
        }
        Ok(self.cursors)
    }

    // -- Private helpers --

    fn reset_backoff(&mut self) {
        self.attempts = 0;
        self.backoff = self.config.reconnect.initial_backoff;
    }

    async fn drop_client(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.bye().await.ok();
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let Some(selector) = self.selector.clone() else {
            return Err(ClientError::Disconnected);
        };
        let max_attempts = self.config.reconnect.max_attempts;

        loop {
            self.attempts += 1;
            if max_attempts > 0 && self.attempts > max_attempts {
                warn!(attempts = max_attempts, "reconnect failed, giving up");
                self.finished = true;
                return Err(ClientError::StreamUnavailable {
                    attempts: max_attempts,
                });
            }

            info!(
                attempt = self.attempts,
                backoff_ms = self.backoff.as_millis(),
                "reconnecting"
            );
            tokio::time::sleep(self.backoff).await;
            self.backoff = self.config.reconnect.next_backoff(self.backoff);

            match self.resubscribe(&selector).await {
                Ok(client) => {
                    info!(attempt = self.attempts, "reconnected");
                    self.client = Some(client);
                    return Ok(());
                }
                Err(e) if e.is_transport() => {
                    warn!(attempt = self.attempts, error = %e, "reconnect attempt failed");
                }
                Err(e) => {
                    warn!(error = %e, "server refused to resume");
                    self.finished = true;
                    return Err(e);
                }
            }
        }
    }

    async fn resubscribe(&mut self, selector: &Selector) -> Result<SeedLinkClient> {
        let mut client =
            SeedLinkClient::connect_with_config(&self.addr, self.config.client.clone()).await?;
        if client.version() != self.version {
            warn!(
                was = %self.version,
                now = %client.version(),
                "protocol version changed across reconnect"
            );
            self.version = client.version();
        }
        let resume = resume_selector(selector, &self.cursors, self.version);
        client.subscribe(&resume).await?;
        Ok(client)
    }
}

/// The server gave up on this session for a reason a fresh one may not hit.
fn is_retryable_server_error(msg: &str) -> bool {
    let code = msg.split_whitespace().next().unwrap_or_default();
    code.eq_ignore_ascii_case("LIMIT") || code.eq_ignore_ascii_case("INTERNAL")
}

/// Rewrite `base` so that stations with a cursor start right after it.
///
/// An exact station entry keeps its place with a new start point. A
/// wildcard entry is preceded by one exact entry per station it covers;
/// the first matching entry wins, so those take precedence over the
/// wildcard's own start point.
fn resume_selector(base: &Selector, cursors: &CursorMap, version: ProtocolVersion) -> Selector {
    if cursors.is_empty() {
        return base.clone();
    }
    let stations = cursors.stations();
    let mut out = Vec::with_capacity(base.stations.len());

    for entry in &base.stations {
        let mut replaced = false;
        for id in &stations {
            let claimed_here = base
                .station_entry(id)
                .is_some_and(|first| std::ptr::eq(first, entry));
            if !claimed_here {
                continue;
            }
            let Some(cursor) = cursors.station_resume(id, version) else {
                continue;
            };
            let start = resume_point(entry.start, cursor);
            debug!(station = %id, sequence = %cursor.sequence, "resuming station");

            if entry.station.as_station_id().as_ref() == Some(id) {
                out.push(StationSelector {
                    start,
                    ..entry.clone()
                });
                replaced = true;
            } else {
                out.push(StationSelector {
                    station: StationPattern::exact(id),
                    patterns: entry.patterns.clone(),
                    start,
                });
            }
        }
        if !replaced {
            out.push(entry.clone());
        }
    }
    Selector { stations: out }
}

fn resume_point(original: StartPoint, cursor: &Cursor) -> StartPoint {
    match original {
        // Keep the window's end; records before the cursor are deduplicated
        StartPoint::Time { end, .. } => StartPoint::Time {
            start: cursor.time,
            end,
        },
        _ => StartPoint::after(cursor.sequence, Some(cursor.time)),
    }
}
