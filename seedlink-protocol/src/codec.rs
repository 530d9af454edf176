//! Resumable wire codec for command lines and streamed packets.
//!
//! Bytes are accumulated in a `BytesMut`; each `decode_*` call either
//! consumes exactly one complete item or reports [`Decoded::NeedMoreData`]
//! and leaves the buffer untouched. Framing is chosen once per session with
//! [`Codec::negotiate`]; afterwards, frames of the other version are a
//! [`SeedlinkError::FramingMismatch`].

use bytes::{Bytes, BytesMut};

use crate::command::{Command, MAX_COMMAND_LEN};
use crate::error::{Result, SeedlinkError};
use crate::frame::{PayloadFormat, PayloadSubformat, RawFrame, v3, v4};
use crate::info::GapNotice;
use crate::record::{Record, StationId, StreamKey};
use crate::sequence::SequenceNumber;
use crate::time::Timestamp;
use crate::version::ProtocolVersion;

/// Outcome of a decode attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    Item(T),
    NeedMoreData,
}

impl<T> Decoded<T> {
    pub fn item(self) -> Option<T> {
        match self {
            Self::Item(t) => Some(t),
            Self::NeedMoreData => None,
        }
    }
}

/// Anything a server sends once streaming has started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Data(Record),
    /// INFO response payload: XML for v3 (possibly split, see `more`),
    /// JSON for v4.
    Info {
        format: PayloadFormat,
        subformat: PayloadSubformat,
        station: Option<String>,
        payload: Bytes,
        more: bool,
    },
    Gap(GapNotice),
    /// Server closed the stream gracefully (`END`).
    End,
    /// Server reported an error in-band (`ERROR ...`).
    Error(String),
}

#[derive(Debug)]
pub struct Codec {
    version: ProtocolVersion,
    negotiated: bool,
    buffer: BytesMut,
    max_line: usize,
}

impl Codec {
    /// A codec for a session that has not negotiated yet. Until
    /// [`Codec::negotiate`] is called, commands are encoded as v3 and
    /// packets of either framing are accepted.
    pub fn new() -> Self {
        Self::with_max_line(MAX_COMMAND_LEN)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            version: ProtocolVersion::V3,
            negotiated: false,
            buffer: BytesMut::with_capacity(8 * 1024),
            max_line,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    /// Fix the framing for the rest of the session.
    ///
    /// Calling again with the same version is a no-op; switching versions
    /// after negotiation is a `VersionMismatch`.
    pub fn negotiate(&mut self, version: ProtocolVersion) -> Result<()> {
        if self.negotiated && self.version != version {
            return Err(SeedlinkError::VersionMismatch {
                command: "SLPROTO",
                version: self.version,
            });
        }
        self.version = version;
        self.negotiated = true;
        Ok(())
    }

    /// Append raw bytes from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Buffer to read into directly (e.g. with `AsyncReadExt::read_buf`).
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode one CRLF- (or LF-) terminated text line.
    pub fn decode_line(&mut self) -> Result<Decoded<String>> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            // +2 leaves room for a CR and the LF still to come
            if self.buffer.len() > self.max_line + 2 {
                return Err(SeedlinkError::CommandTooLong {
                    limit: self.max_line,
                    actual: self.buffer.len(),
                });
            }
            return Ok(Decoded::NeedMoreData);
        };

        let raw = self.buffer.split_to(pos + 1);
        let mut line = &raw[..pos];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.len() > self.max_line {
            return Err(SeedlinkError::CommandTooLong {
                limit: self.max_line,
                actual: line.len(),
            });
        }
        let line = std::str::from_utf8(line)
            .map_err(|_| SeedlinkError::InvalidEncoding)?;
        Ok(Decoded::Item(line.to_owned()))
    }

    /// Decode one command line, skipping blank lines.
    pub fn decode_command(&mut self) -> Result<Decoded<Command>> {
        loop {
            match self.decode_line()? {
                Decoded::NeedMoreData => return Ok(Decoded::NeedMoreData),
                Decoded::Item(line) if line.trim().is_empty() => continue,
                Decoded::Item(line) => {
                    return Command::parse_for(&line, self.version).map(Decoded::Item);
                }
            }
        }
    }

    /// Decode one streamed packet: a data frame, INFO packet, gap notice,
    /// or a trailing `END`/`ERROR` line.
    pub fn decode_packet(&mut self) -> Result<Decoded<Packet>> {
        if self.buffer.len() < 2 {
            return Ok(Decoded::NeedMoreData);
        }
        let sig = [self.buffer[0], self.buffer[1]];

        match &sig {
            b"SL" => {
                self.check_framing(ProtocolVersion::V3, sig)?;
                if self.buffer.len() < v3::FRAME_LEN {
                    return Ok(Decoded::NeedMoreData);
                }
                let frame = self.buffer.split_to(v3::FRAME_LEN).freeze();
                Ok(Decoded::Item(v3_packet(&frame, v3::parse(&frame)?)?))
            }
            b"SE" => {
                self.check_framing(ProtocolVersion::V4, sig)?;
                let Some(total) = v4::frame_len(&self.buffer)? else {
                    return Ok(Decoded::NeedMoreData);
                };
                if self.buffer.len() < total {
                    return Ok(Decoded::NeedMoreData);
                }
                let frame = self.buffer.split_to(total).freeze();
                let (raw, _) = v4::parse(&frame)?;
                Ok(Decoded::Item(v4_packet(&frame, raw)?))
            }
            [b'E', _] => match self.decode_line()? {
                Decoded::NeedMoreData => Ok(Decoded::NeedMoreData),
                Decoded::Item(line) if line.eq_ignore_ascii_case("END") => Ok(Decoded::Item(Packet::End)),
                Decoded::Item(line) if line.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("ERROR")) => {
                    Ok(Decoded::Item(Packet::Error(line[5..].trim().to_owned())))
                }
                Decoded::Item(line) => Err(SeedlinkError::InvalidResponse(format!(
                    "unexpected line in stream: {line:?}"
                ))),
            },
            _ => Err(SeedlinkError::InvalidSignature {
                expected: "SL or SE",
                actual: sig,
            }),
        }
    }

    fn check_framing(&self, framing: ProtocolVersion, actual: [u8; 2]) -> Result<()> {
        if self.negotiated && self.version != framing {
            return Err(SeedlinkError::FramingMismatch {
                session: self.version,
                actual,
            });
        }
        Ok(())
    }

    /// Encode a command for this session's version.
    pub fn encode_command(&self, command: &Command) -> Result<Vec<u8>> {
        let bytes = command.to_bytes(self.version)?;
        let line_len = bytes.len() - 2;
        if line_len > self.max_line {
            return Err(SeedlinkError::CommandTooLong {
                limit: self.max_line,
                actual: line_len,
            });
        }
        Ok(bytes)
    }

    /// Encode a data record as a v3 or v4 frame.
    pub fn encode_record(&self, record: &Record) -> Result<Vec<u8>> {
        match self.version {
            ProtocolVersion::V3 => v3::write(record.sequence, &record.payload),
            ProtocolVersion::V4 => v4::write(
                PayloadFormat::MiniSeed2,
                PayloadSubformat::from_record_type(record.key.record_type),
                record.sequence,
                &record.key.station.to_v4_string(),
                &record.payload,
            ),
        }
    }

    /// Encode an INFO response document.
    ///
    /// v3: XML split over `SLINFO` packets. v4: a single JSON frame, with
    /// subformat `R` when `error` is set.
    pub fn encode_info(&self, document: &[u8], error: bool) -> Result<Vec<u8>> {
        match self.version {
            ProtocolVersion::V3 => Ok(v3::write_info_packets(document).concat()),
            ProtocolVersion::V4 => {
                let subformat = if error {
                    PayloadSubformat::InfoError
                } else {
                    PayloadSubformat::Info
                };
                v4::write(
                    PayloadFormat::Json,
                    subformat,
                    SequenceNumber::new(0),
                    "",
                    document,
                )
            }
        }
    }

    /// Encode a gap notice for in-band delivery.
    pub fn encode_gap(&self, gap: &GapNotice) -> Result<Vec<u8>> {
        let json = gap.to_json()?;
        match self.version {
            ProtocolVersion::V3 => v3::write_info(false, &json),
            ProtocolVersion::V4 => v4::write(
                PayloadFormat::Json,
                PayloadSubformat::Info,
                gap.earliest,
                &gap.station,
                &json,
            ),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a parsed v3 frame into a packet.
fn v3_packet(frame: &Bytes, raw: RawFrame<'_>) -> Result<Packet> {
    match raw {
        RawFrame::V3 { sequence, payload } => Ok(Packet::Data(Record::from_mseed2(
            None,
            sequence,
            frame.slice_ref(payload),
        )?)),
        RawFrame::V3Info { more, payload } => {
            let payload = frame.slice_ref(v3::trim_info_payload(payload));
            // A gap notice is always a single, final packet
            if !more && let Some(gap) = GapNotice::from_json(&payload) {
                return Ok(Packet::Gap(gap));
            }
            Ok(Packet::Info {
                format: PayloadFormat::Xml,
                subformat: PayloadSubformat::Info,
                station: None,
                payload,
                more,
            })
        }
        RawFrame::V4 { .. } => Err(SeedlinkError::InvalidSignature {
            expected: "SL",
            actual: *b"SE",
        }),
    }
}

/// Turn a parsed v4 frame into a packet. `frame` owns the bytes `raw`
/// borrows from, so payloads are sliced without copying.
fn v4_packet(frame: &Bytes, raw: RawFrame<'_>) -> Result<Packet> {
    let RawFrame::V4 {
        format,
        subformat,
        sequence,
        station_id,
        payload,
    } = raw
    else {
        return Err(SeedlinkError::InvalidSignature {
            expected: "SE",
            actual: *b"SL",
        });
    };
    let payload = frame.slice_ref(payload);
    let station = (!station_id.is_empty()).then(|| station_id.to_owned());

    match subformat {
        PayloadSubformat::Info | PayloadSubformat::InfoError => {
            if format == PayloadFormat::Json
                && subformat == PayloadSubformat::Info
                && let Some(gap) = GapNotice::from_json(&payload)
            {
                return Ok(Packet::Gap(gap));
            }
            Ok(Packet::Info {
                format,
                subformat,
                station,
                payload,
                more: false,
            })
        }
        _ => {
            let station = station.as_deref().map(StationId::parse).transpose()?;
            let record = match (format, station) {
                (PayloadFormat::MiniSeed2, station) => Record::from_mseed2(station, sequence, payload)?,
                // Payloads other than miniSEED 2 stay opaque; only the frame
                // header identifies them.
                (_, Some(station)) => {
                    let record_type = subformat.record_type().unwrap_or('O');
                    Record::new(
                        StreamKey::new(station, "", "", record_type),
                        sequence,
                        Timestamp::EPOCH,
                        payload,
                    )
                }
                (_, None) => {
                    return Err(SeedlinkError::InvalidResponse(
                        "data frame without station id".into(),
                    ));
                }
            };
            Ok(Packet::Data(record))
        }
    }
}
