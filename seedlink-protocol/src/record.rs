use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeedlinkError};
use crate::sequence::SequenceNumber;
use crate::time::Timestamp;

/// Fixed record length of classic miniSEED v2 SeedLink payloads.
pub const MSEED2_RECORD_LEN: usize = 512;

/// Length of the miniSEED v2 fixed section of data header.
pub const MSEED2_FIXED_HEADER_LEN: usize = 48;

/// Network + station code pair, uppercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationId {
    pub network: String,
    pub station: String,
}

impl StationId {
    pub fn new(network: &str, station: &str) -> Self {
        Self {
            network: network.trim().to_ascii_uppercase(),
            station: station.trim().to_ascii_uppercase(),
        }
    }

    /// Parse `"NET_STA"` (v4 station id) or `"NET.STA"`.
    pub fn parse(s: &str) -> Result<Self> {
        let (network, station) = s
            .split_once('_')
            .or_else(|| s.split_once('.'))
            .ok_or_else(|| SeedlinkError::InvalidCommand(format!("invalid station id: {s:?}")))?;
        if network.is_empty() || station.is_empty() {
            return Err(SeedlinkError::InvalidCommand(format!(
                "invalid station id: {s:?}"
            )));
        }
        Ok(Self::new(network, station))
    }

    /// `"NET_STA"`, as carried in v4 frame headers and gap notices.
    pub fn to_v4_string(&self) -> String {
        format!("{}_{}", self.network, self.station)
    }

    /// Read the station and network codes from a miniSEED v2 fixed header.
    pub fn from_mseed2_header(payload: &[u8]) -> Option<Self> {
        if payload.len() < MSEED2_FIXED_HEADER_LEN {
            return None;
        }
        let station = ascii_field(&payload[8..13])?;
        let network = ascii_field(&payload[18..20])?;
        if station.is_empty() {
            return None;
        }
        Some(Self::new(&network, &station))
    }
}

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.network, self.station)
    }
}

/// The unit of selection: one channel/location/type stream of a station.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub station: StationId,
    pub location: String,
    pub channel: String,
    /// SeedLink record type: `D` data, `E` event, `C` calibration,
    /// `T` timing, `L` log, `O` opaque.
    pub record_type: char,
}

impl StreamKey {
    pub fn new(station: StationId, location: &str, channel: &str, record_type: char) -> Self {
        Self {
            station,
            location: location.trim().to_owned(),
            channel: channel.trim().to_owned(),
            record_type,
        }
    }

    /// Derive the stream key of a miniSEED v2 record belonging to `station`.
    ///
    /// The station id is supplied by the caller so that records can be filed
    /// under a station other than the one written in the header.
    pub fn from_mseed2_header(station: StationId, payload: &[u8]) -> Option<Self> {
        if payload.len() < MSEED2_FIXED_HEADER_LEN {
            return None;
        }
        let location = ascii_field(&payload[13..15])?;
        let channel = ascii_field(&payload[15..18])?;
        let record_type = seedlink_type(payload[6], &channel);
        Some(Self {
            station,
            location,
            channel,
            record_type,
        })
    }

    /// Write the identification fields and start time into a miniSEED v2
    /// fixed header. Useful for feeding synthetic records.
    pub fn write_mseed2_header(&self, sequence: u32, start: Timestamp, payload: &mut [u8]) {
        if payload.len() < MSEED2_FIXED_HEADER_LEN {
            return;
        }
        let seq = format!("{:06}", sequence % 1_000_000);
        payload[0..6].copy_from_slice(seq.as_bytes());
        payload[6] = self.record_type as u8;
        payload[7] = b' ';
        write_padded(&mut payload[8..13], &self.station.station);
        write_padded(&mut payload[13..15], &self.location);
        write_padded(&mut payload[15..18], &self.channel);
        write_padded(&mut payload[18..20], &self.station.network);
        start.write_mseed_btime(payload);
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_{}.{}",
            self.station, self.location, self.channel, self.record_type
        )
    }
}

/// An immutable record as stored in a station log and carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: StreamKey,
    pub sequence: SequenceNumber,
    pub start_time: Timestamp,
    pub payload: Bytes,
}

impl Record {
    pub fn new(
        key: StreamKey,
        sequence: SequenceNumber,
        start_time: Timestamp,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            key,
            sequence,
            start_time,
            payload: payload.into(),
        }
    }

    /// Build a record from a miniSEED v2 payload, reading the stream key and
    /// start time from its fixed header.
    ///
    /// `station` overrides the header's station codes when given (v4 frames
    /// carry the station id in the frame header). A missing or malformed
    /// BTime yields the Unix epoch as start time.
    pub fn from_mseed2(
        station: Option<StationId>,
        sequence: SequenceNumber,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        let station = match station {
            Some(id) => id,
            None => StationId::from_mseed2_header(&payload).ok_or_else(|| {
                SeedlinkError::InvalidResponse("payload has no miniSEED station header".into())
            })?,
        };
        let key = StreamKey::from_mseed2_header(station, &payload).ok_or_else(|| {
            SeedlinkError::InvalidResponse("payload has no miniSEED stream header".into())
        })?;
        let start_time = Timestamp::from_mseed_payload(&payload).unwrap_or(Timestamp::EPOCH);
        Ok(Self {
            key,
            sequence,
            start_time,
            payload,
        })
    }

    pub fn station(&self) -> &StationId {
        &self.key.station
    }

    /// Decode the payload as a miniSEED record.
    pub fn decode(&self) -> Result<miniseed_rs::MseedRecord> {
        Ok(miniseed_rs::decode(&self.payload)?)
    }
}

/// Map a miniSEED v2 header type byte to a SeedLink record type.
fn seedlink_type(header_type: u8, channel: &str) -> char {
    match header_type {
        _ if channel == "LOG" => 'L',
        b'D' | b'R' | b'Q' | b'M' => 'D',
        b'E' | b'C' | b'T' | b'L' | b'O' => header_type as char,
        _ => 'O',
    }
}

fn ascii_field(bytes: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(bytes).ok()?;
    Some(s.trim_matches(|c: char| c == ' ' || c == '\0').to_owned())
}

fn write_padded(dst: &mut [u8], value: &str) {
    dst.fill(b' ');
    let n = value.len().min(dst.len());
    dst[..n].copy_from_slice(&value.as_bytes()[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iu_anmo() -> StationId {
        StationId::new("iu", "anmo")
    }

    fn synthetic(key: &StreamKey, start: Timestamp) -> Vec<u8> {
        let mut payload = vec![0u8; MSEED2_RECORD_LEN];
        key.write_mseed2_header(1, start, &mut payload);
        payload
    }

    #[test]
    fn station_id_uppercases() {
        let id = iu_anmo();
        assert_eq!(id.network, "IU");
        assert_eq!(id.station, "ANMO");
        assert_eq!(id.to_v4_string(), "IU_ANMO");
    }

    #[test]
    fn station_id_parse() {
        assert_eq!(StationId::parse("IU_ANMO").unwrap(), iu_anmo());
        assert_eq!(StationId::parse("XX.ABC").unwrap(), StationId::new("XX", "ABC"));
        assert!(StationId::parse("ANMO").is_err());
        assert!(StationId::parse("_ANMO").is_err());
    }

    #[test]
    fn header_roundtrip() {
        let key = StreamKey::new(iu_anmo(), "00", "BHZ", 'D');
        let start = Timestamp::from_time_command("2024,1,15,10,30,45").unwrap();
        let payload = synthetic(&key, start);

        assert_eq!(StationId::from_mseed2_header(&payload), Some(iu_anmo()));
        assert_eq!(StreamKey::from_mseed2_header(iu_anmo(), &payload), Some(key.clone()));

        let record = Record::from_mseed2(None, SequenceNumber::new(7), payload).unwrap();
        assert_eq!(record.key, key);
        assert_eq!(record.start_time, start);
        assert_eq!(record.station(), &iu_anmo());
    }

    #[test]
    fn empty_location() {
        let key = StreamKey::new(iu_anmo(), "", "LHZ", 'D');
        let payload = synthetic(&key, Timestamp::EPOCH);
        let parsed = StreamKey::from_mseed2_header(iu_anmo(), &payload).unwrap();
        assert_eq!(parsed.location, "");
        assert_eq!(parsed.channel, "LHZ");
    }

    #[test]
    fn quality_codes_are_data() {
        assert_eq!(seedlink_type(b'R', "BHZ"), 'D');
        assert_eq!(seedlink_type(b'Q', "BHZ"), 'D');
        assert_eq!(seedlink_type(b'D', "LOG"), 'L');
        assert_eq!(seedlink_type(b'T', "ACE"), 'T');
        assert_eq!(seedlink_type(b'?', "BHZ"), 'O');
    }

    #[test]
    fn station_override() {
        let key = StreamKey::new(iu_anmo(), "00", "BHZ", 'D');
        let payload = synthetic(&key, Timestamp::EPOCH);
        let other = StationId::new("GE", "WLF");
        let record = Record::from_mseed2(Some(other.clone()), SequenceNumber::new(1), payload)
            .unwrap();
        assert_eq!(record.station(), &other);
    }

    #[test]
    fn short_payload_rejected() {
        assert!(Record::from_mseed2(None, SequenceNumber::new(1), vec![0u8; 10]).is_err());
    }

    #[test]
    fn display() {
        let key = StreamKey::new(iu_anmo(), "00", "BHZ", 'D');
        assert_eq!(key.to_string(), "IU_ANMO_00_BHZ.D");
    }
}
