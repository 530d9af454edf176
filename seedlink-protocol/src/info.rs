//! INFO levels and the structured documents returned by INFO requests.
//!
//! v4 servers answer INFO with a JSON [`InfoDocument`]; v3 servers send XML
//! split across `SLINFO` packets. Gap notices share the JSON encoding but
//! are a separate document type.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeedlinkError};
use crate::record::StationId;
use crate::sequence::SequenceNumber;
use crate::time::Timestamp;
use crate::version::ProtocolVersion;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InfoLevel {
    /// Server identification (both v3 and v4).
    Id,
    /// Station list (both v3 and v4).
    Stations,
    /// Stream list (both v3 and v4).
    Streams,
    /// Connection list (both v3 and v4).
    Connections,
    /// Gap information (v3 only).
    Gaps,
    /// All information (v3 only).
    All,
    /// Format information (v4 only).
    Formats,
    /// Capability information (v4 only).
    Capabilities,
}

impl InfoLevel {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ID" => Ok(Self::Id),
            "STATIONS" => Ok(Self::Stations),
            "STREAMS" => Ok(Self::Streams),
            "CONNECTIONS" => Ok(Self::Connections),
            "GAPS" => Ok(Self::Gaps),
            "ALL" => Ok(Self::All),
            "FORMATS" => Ok(Self::Formats),
            "CAPABILITIES" => Ok(Self::Capabilities),
            _ => Err(SeedlinkError::InvalidInfoLevel(s.to_owned())),
        }
    }

    /// Wire representation (uppercase).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Stations => "STATIONS",
            Self::Streams => "STREAMS",
            Self::Connections => "CONNECTIONS",
            Self::Gaps => "GAPS",
            Self::All => "ALL",
            Self::Formats => "FORMATS",
            Self::Capabilities => "CAPABILITIES",
        }
    }

    /// Check if this info level is valid for the given protocol version.
    pub fn is_valid_for(&self, version: ProtocolVersion) -> bool {
        match self {
            Self::Id | Self::Stations | Self::Streams | Self::Connections => true,
            Self::Gaps | Self::All => version == ProtocolVersion::V3,
            Self::Formats | Self::Capabilities => version == ProtocolVersion::V4,
        }
    }
}

impl std::fmt::Display for InfoLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server identification (INFO ID).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdInfo {
    pub software: String,
    pub version: String,
    pub organization: String,
    /// Server start time, `YYYY/MM/DD hh:mm:ss`.
    pub started: String,
}

/// One station with its retained sequence range (INFO STATIONS / STREAMS).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationInfo {
    pub network: String,
    pub station: String,
    #[serde(default)]
    pub description: String,
    pub begin_seq: u64,
    pub end_seq: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamInfo>,
}

impl StationInfo {
    pub fn id(&self) -> StationId {
        StationId::new(&self.network, &self.station)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub location: String,
    pub channel: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub begin_seq: u64,
    pub end_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
}

/// A connected client (INFO CONNECTIONS).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub host: String,
    pub port: u16,
    /// Connect time, `YYYY/MM/DD hh:mm:ss`.
    pub ctime: String,
    pub proto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub useragent: Option<String>,
    pub state: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// JSON body of a v4 INFO response. Only the section matching the requested
/// level is populated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IdInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub station: Vec<StationInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection: Vec<ConnectionEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability: Vec<String>,
    /// Supported payload formats and their subformats.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub format: Vec<FormatInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format: String,
    pub subformat: Vec<String>,
}

impl InfoDocument {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorInfo {
                code: code.to_owned(),
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// In-band signal that a requested start point is no longer retained.
///
/// Delivery continues from `earliest`; records in between are lost.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GapNotice {
    /// `NET_STA`
    pub station: String,
    /// First sequence the subscriber asked for.
    pub requested: SequenceNumber,
    /// First sequence that will actually be delivered.
    pub earliest: SequenceNumber,
}

#[derive(Serialize, Deserialize)]
struct GapEnvelope {
    gap: GapNotice,
}

impl GapNotice {
    pub fn new(station: &StationId, requested: SequenceNumber, earliest: SequenceNumber) -> Self {
        Self {
            station: station.to_v4_string(),
            requested,
            earliest,
        }
    }

    /// Number of records skipped.
    pub fn missed(&self) -> u64 {
        self.earliest.value().saturating_sub(self.requested.value())
    }

    pub fn station_id(&self) -> Result<StationId> {
        StationId::parse(&self.station)
    }

    /// `{"gap":{"station":..,"requested":..,"earliest":..}}`
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&GapEnvelope { gap: self.clone() })?)
    }

    /// Parse a gap document. Returns `None` for any other JSON document.
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice::<GapEnvelope>(bytes)
            .ok()
            .map(|env| env.gap)
    }
}

impl std::fmt::Display for GapNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gap on {}: requested {}, earliest available {}",
            self.station, self.requested, self.earliest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_notice_json() {
        let gap = GapNotice::new(
            &StationId::new("XX", "ABC"),
            SequenceNumber::new(50),
            SequenceNumber::new(100),
        );
        let json = gap.to_json().unwrap();
        assert_eq!(
            std::str::from_utf8(&json).unwrap(),
            r#"{"gap":{"station":"XX_ABC","requested":50,"earliest":100}}"#
        );
        assert_eq!(GapNotice::from_json(&json), Some(gap.clone()));
        assert_eq!(gap.missed(), 50);
        assert_eq!(gap.station_id().unwrap(), StationId::new("XX", "ABC"));
    }

    #[test]
    fn info_document_is_not_a_gap() {
        let doc = InfoDocument {
            capability: vec!["SLPROTO:4.0".into()],
            ..InfoDocument::default()
        };
        let json = doc.to_json().unwrap();
        assert_eq!(std::str::from_utf8(&json).unwrap(), r#"{"capability":["SLPROTO:4.0"]}"#);
        assert!(GapNotice::from_json(&json).is_none());
        assert_eq!(InfoDocument::from_json(&json).unwrap(), doc);
    }

    #[test]
    fn info_document_stations() {
        let doc = InfoDocument {
            station: vec![StationInfo {
                network: "IU".into(),
                station: "ANMO".into(),
                description: String::new(),
                begin_seq: 100,
                end_seq: 150,
                streams: vec![StreamInfo {
                    location: "00".into(),
                    channel: "BHZ".into(),
                    record_type: "D".into(),
                    begin_seq: 100,
                    end_seq: 150,
                    begin_time: Some(Timestamp::from_unix_seconds(10)),
                    end_time: None,
                }],
            }],
            ..InfoDocument::default()
        };
        let json = doc.to_json().unwrap();
        let text = std::str::from_utf8(&json).unwrap();
        assert!(text.contains(r#""type":"D""#));
        assert!(!text.contains("end_time"));
        let back = InfoDocument::from_json(&json).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.station[0].id(), StationId::new("IU", "ANMO"));
    }

    #[test]
    fn error_document() {
        let json = InfoDocument::error("ARGUMENTS", "bad level").to_json().unwrap();
        assert_eq!(
            std::str::from_utf8(&json).unwrap(),
            r#"{"error":{"code":"ARGUMENTS","message":"bad level"}}"#
        );
    }

    #[test]
    fn parse_all_levels() {
        assert_eq!(InfoLevel::parse("ID").unwrap(), InfoLevel::Id);
        assert_eq!(InfoLevel::parse("STATIONS").unwrap(), InfoLevel::Stations);
        assert_eq!(InfoLevel::parse("STREAMS").unwrap(), InfoLevel::Streams);
        assert_eq!(
            InfoLevel::parse("CONNECTIONS").unwrap(),
            InfoLevel::Connections
        );
        assert_eq!(InfoLevel::parse("GAPS").unwrap(), InfoLevel::Gaps);
        assert_eq!(InfoLevel::parse("ALL").unwrap(), InfoLevel::All);
        assert_eq!(InfoLevel::parse("FORMATS").unwrap(), InfoLevel::Formats);
        assert_eq!(
            InfoLevel::parse("CAPABILITIES").unwrap(),
            InfoLevel::Capabilities
        );
    }

    #[test]
    fn parse_case_insensitive() {
        assert_eq!(InfoLevel::parse("id").unwrap(), InfoLevel::Id);
        assert_eq!(InfoLevel::parse("Stations").unwrap(), InfoLevel::Stations);
        assert_eq!(InfoLevel::parse("streams").unwrap(), InfoLevel::Streams);
    }

    #[test]
    fn parse_invalid() {
        assert!(InfoLevel::parse("UNKNOWN").is_err());
        assert!(InfoLevel::parse("").is_err());
    }

    #[test]
    fn as_str_roundtrip() {
        let levels = [
            InfoLevel::Id,
            InfoLevel::Stations,
            InfoLevel::Streams,
            InfoLevel::Connections,
            InfoLevel::Gaps,
            InfoLevel::All,
            InfoLevel::Formats,
            InfoLevel::Capabilities,
        ];
        for level in levels {
            assert_eq!(InfoLevel::parse(level.as_str()).unwrap(), level);
        }
    }

    #[test]
    fn version_validity() {
        // Both
        assert!(InfoLevel::Id.is_valid_for(ProtocolVersion::V3));
        assert!(InfoLevel::Id.is_valid_for(ProtocolVersion::V4));
        assert!(InfoLevel::Stations.is_valid_for(ProtocolVersion::V3));
        assert!(InfoLevel::Stations.is_valid_for(ProtocolVersion::V4));

        // v3 only
        assert!(InfoLevel::Gaps.is_valid_for(ProtocolVersion::V3));
        assert!(!InfoLevel::Gaps.is_valid_for(ProtocolVersion::V4));
        assert!(InfoLevel::All.is_valid_for(ProtocolVersion::V3));
        assert!(!InfoLevel::All.is_valid_for(ProtocolVersion::V4));

        // v4 only
        assert!(!InfoLevel::Formats.is_valid_for(ProtocolVersion::V3));
        assert!(InfoLevel::Formats.is_valid_for(ProtocolVersion::V4));
        assert!(!InfoLevel::Capabilities.is_valid_for(ProtocolVersion::V3));
        assert!(InfoLevel::Capabilities.is_valid_for(ProtocolVersion::V4));
    }
}
