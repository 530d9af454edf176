use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use seedlink_mux_protocol::record::MSEED2_RECORD_LEN;
use seedlink_mux_protocol::{
    Codec, GapNotice, InfoDocument, ProtocolVersion, Record, SequenceNumber, StationId, StreamKey,
    Timestamp,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Start time of the record with sequence `seq` in test frames.
pub fn frame_time(seq: u64) -> Timestamp {
    Timestamp::from_unix_seconds(1_700_000_000 + seq as i64)
}

pub fn test_record(net: &str, sta: &str, seq: u64) -> Record {
    let key = StreamKey::new(StationId::new(net, sta), "00", "BHZ", 'D');
    let mut payload = vec![0u8; MSEED2_RECORD_LEN];
    key.write_mseed2_header(0, frame_time(seq), &mut payload);
    Record::new(key, SequenceNumber::new(seq), frame_time(seq), payload)
}

fn encoder(version: ProtocolVersion) -> Codec {
    let mut codec = Codec::new();
    codec.negotiate(version).unwrap();
    codec
}

/// A BHZ data frame for `net.sta` with sequence `seq`.
pub fn data_frame(version: ProtocolVersion, net: &str, sta: &str, seq: u64) -> Vec<u8> {
    encoder(version)
        .encode_record(&test_record(net, sta, seq))
        .unwrap()
}

pub fn gap_frame(
    version: ProtocolVersion,
    net: &str,
    sta: &str,
    requested: u64,
    earliest: u64,
) -> Vec<u8> {
    let gap = GapNotice::new(
        &StationId::new(net, sta),
        SequenceNumber::new(requested),
        SequenceNumber::new(earliest),
    );
    encoder(version).encode_gap(&gap).unwrap()
}

pub struct MockConfig {
    pub hello_line1: String,
    pub hello_line2: String,
    pub accept_slproto: bool,
    /// Frames streamed after END on every connection.
    pub frames: Vec<Vec<u8>>,
    /// Frames for connection `i`; falls back to `frames` past the end.
    pub connection_frames: Vec<Vec<Vec<u8>>>,
    /// Drop the connection once the frames are out.
    pub close_after_stream: bool,
    /// Stop accepting after this many connections.
    pub max_connections: Option<usize>,
    /// Command keyword answered with `ERROR ARGUMENTS`.
    pub reject: Option<String>,
    /// Sent as an in-band `ERROR` instead of frames after END.
    pub stream_error: Option<String>,
    /// INFO reply body (XML for v3, JSON for v4).
    pub info: Option<Vec<u8>>,
    /// CAT reply.
    pub cat: Vec<StationId>,
}

impl MockConfig {
    pub fn v3_default(frames: Vec<Vec<u8>>) -> Self {
        Self {
            hello_line1: "SeedLink v3.1 (2020.075)".to_owned(),
            hello_line2: "Mock Server".to_owned(),
            accept_slproto: false,
            frames,
            connection_frames: Vec::new(),
            close_after_stream: false,
            max_connections: None,
            reject: None,
            stream_error: None,
            info: None,
            cat: Vec::new(),
        }
    }

    pub fn v4_default(frames: Vec<Vec<u8>>) -> Self {
        Self {
            hello_line1: "SeedLink v4.0 (mock) :: SLPROTO:4.0 SLPROTO:3.1".to_owned(),
            hello_line2: "Mock Server v4".to_owned(),
            accept_slproto: true,
            ..Self::v3_default(frames)
        }
    }

    fn frames_for(&self, connection: usize) -> &[Vec<u8>] {
        self.connection_frames
            .get(connection)
            .unwrap_or(&self.frames)
    }
}

/// Commands received, one list per accepted connection.
#[derive(Clone, Default)]
pub struct Captured {
    connections: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Captured {
    pub fn connection(&self, index: usize) -> Vec<String> {
        self.connections
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn open(&self) -> usize {
        let mut conns = self.connections.lock().unwrap();
        conns.push(Vec::new());
        conns.len() - 1
    }

    fn push(&self, index: usize, line: &str) {
        self.connections.lock().unwrap()[index].push(line.to_owned());
    }
}

pub struct MockServer {
    addr: SocketAddr,
    captured: Captured,
}

impl MockServer {
    pub async fn start(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Captured::default();
        let config = Arc::new(config);

        let accepted = captured.clone();
        tokio::spawn(async move {
            loop {
                if config
                    .max_connections
                    .is_some_and(|max| accepted.connection_count() >= max)
                {
                    break;
                }
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let index = accepted.open();
                let config = config.clone();
                let captured = accepted.clone();
                tokio::spawn(async move {
                    handle_connection(stream, index, &config, &captured).await;
                });
            }
        });

        Self { addr, captured }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn captured(&self) -> &Captured {
        &self.captured
    }
}

async fn handle_connection(stream: TcpStream, index: usize, config: &MockConfig, captured: &Captured) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut version = ProtocolVersion::V3;
    let mut batch = false;
    let mut fetch = false;
    let mut streaming = false;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let command = line.trim().to_owned();
        if command.is_empty() {
            continue;
        }
        captured.push(index, &command);
        let keyword = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        let mut out: Vec<u8> = Vec::new();
        let mut close = false;
        match keyword.as_str() {
            "HELLO" => {
                out = format!("{}\r\n{}\r\n", config.hello_line1, config.hello_line2).into_bytes();
            }
            "SLPROTO" => {
                if config.accept_slproto {
                    version = ProtocolVersion::V4;
                    out = b"OK\r\n".to_vec();
                } else {
                    out = b"ERROR UNSUPPORTED unsupported command\r\n".to_vec();
                }
            }
            "USERAGENT" | "AUTH" => out = b"OK\r\n".to_vec(),
            "BATCH" => {
                batch = true;
                out = b"OK\r\n".to_vec();
            }
            "STATION" | "SELECT" | "DATA" | "TIME" | "FETCH" => {
                if keyword == "FETCH" {
                    fetch = true;
                }
                if config.reject.as_deref() == Some(keyword.as_str()) {
                    out = b"ERROR ARGUMENTS rejected by mock\r\n".to_vec();
                } else if !batch {
                    out = b"OK\r\n".to_vec();
                }
            }
            "END" | "ENDFETCH" if streaming => {
                out = b"END\r\n".to_vec();
                close = true;
            }
            "END" | "ENDFETCH" => {
                streaming = true;
                if let Some(msg) = &config.stream_error {
                    out = format!("ERROR {msg}\r\n").into_bytes();
                    close = true;
                } else {
                    out = config.frames_for(index).concat();
                    if fetch || keyword == "ENDFETCH" {
                        out.extend_from_slice(b"END\r\n");
                        close = true;
                    } else {
                        close = config.close_after_stream;
                    }
                }
            }
            "INFO" => {
                let doc = config.info.clone().unwrap_or_else(|| match version {
                    ProtocolVersion::V3 => b"<seedlink/>".to_vec(),
                    ProtocolVersion::V4 => b"{}".to_vec(),
                });
                let is_error = version == ProtocolVersion::V4
                    && InfoDocument::from_json(&doc).is_ok_and(|d| d.error.is_some());
                out = encoder(version).encode_info(&doc, is_error).unwrap();
            }
            "CAT" => {
                for id in &config.cat {
                    out.extend_from_slice(format!("{} {}\r\n", id.network, id.station).as_bytes());
                }
                out.extend_from_slice(b"END\r\n");
            }
            "BYE" => close = true,
            _ => out = b"ERROR UNSUPPORTED unknown command\r\n".to_vec(),
        }

        if !out.is_empty() && writer.write_all(&out).await.is_err() {
            break;
        }
        let _ = writer.flush().await;
        if close {
            let _ = writer.shutdown().await;
            break;
        }
    }
}
