use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use seedlink_mux_protocol::{
    CapabilityRequest, CapabilitySet, GapNotice, InfoDocument, ProtocolVersion, Record,
    SequenceNumber, StationId, StreamKey, Timestamp,
};

use crate::error::Result;

/// Configuration for [`SeedLinkClient`](crate::SeedLinkClient) connections.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Timeout for the initial TCP connection. Default: 10 seconds.
    pub connect_timeout: Duration,
    /// Timeout for individual reads (reply lines and packets). Default: 30 seconds.
    pub read_timeout: Duration,
    /// Protocol preference and required capabilities.
    pub capabilities: CapabilityRequest,
    /// Sent with `USERAGENT` after switching to v4.
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            capabilities: CapabilityRequest::default(),
            user_agent: None,
        }
    }
}

/// Information about the connected SeedLink server, parsed from HELLO.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    /// Server software name (e.g., `"SeedLink"`).
    pub software: String,
    /// Server version string (e.g., `"v3.1"`).
    pub version: String,
    /// Server organization line.
    pub organization: String,
    pub capabilities: CapabilitySet,
}

/// Reply to an INFO request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InfoResponse {
    /// v3: the reassembled XML document.
    Xml(String),
    /// v4: the JSON document.
    Json(InfoDocument),
}

/// What the engine hands to its consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Record(Record),
    /// Records between `requested` and `earliest` are gone; delivery goes on.
    Gap(GapNotice),
}

/// Last delivered record of one stream: the resume key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub key: StreamKey,
    pub sequence: SequenceNumber,
    /// Start time of that record; disambiguates 24-bit v3 sequences.
    pub time: Timestamp,
}

/// Cursors for every stream seen so far.
///
/// Serializes as a JSON array of [`Cursor`]s so it can be saved on shutdown
/// and handed back to [`ClientEngine::with_cursors`](crate::ClientEngine::with_cursors).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Cursor>", into = "Vec<Cursor>")]
pub struct CursorMap {
    cursors: BTreeMap<StreamKey, Cursor>,
}

impl CursorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn get(&self, key: &StreamKey) -> Option<&Cursor> {
        self.cursors.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cursor> {
        self.cursors.values()
    }

    /// Whether `record` is new for its stream.
    ///
    /// A record at or below the cursor is a replay. For v3, a lower sequence
    /// only counts as new if its start time is later (the 24-bit counter wrapped).
    pub fn is_new(&self, record: &Record, version: ProtocolVersion) -> bool {
        match self.cursors.get(&record.key) {
            Some(c) => record.sequence.succeeds(
                c.sequence,
                version,
                Some(c.time),
                Some(record.start_time),
            ),
            None => true,
        }
    }

    pub fn advance(&mut self, record: &Record) {
        self.cursors.insert(
            record.key.clone(),
            Cursor {
                key: record.key.clone(),
                sequence: record.sequence,
                time: record.start_time,
            },
        );
    }

    /// Where to resume `station`: the latest delivered record among its
    /// streams. Sequences are per station, so this is the highest one.
    pub fn station_resume(&self, station: &StationId, version: ProtocolVersion) -> Option<&Cursor> {
        self.cursors
            .values()
            .filter(|c| &c.key.station == station)
            .reduce(|best, c| {
                if c.sequence
                    .succeeds(best.sequence, version, Some(best.time), Some(c.time))
                {
                    c
                } else {
                    best
                }
            })
    }

    /// Stations with at least one cursor.
    pub fn stations(&self) -> Vec<StationId> {
        let mut ids: Vec<StationId> = self.cursors.keys().map(|k| k.station.clone()).collect();
        ids.dedup();
        ids
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Write the cursors to `path` as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read cursors saved with [`CursorMap::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl From<Vec<Cursor>> for CursorMap {
    fn from(list: Vec<Cursor>) -> Self {
        Self {
            cursors: list.into_iter().map(|c| (c.key.clone(), c)).collect(),
        }
    }
}

impl From<CursorMap> for Vec<Cursor> {
    fn from(map: CursorMap) -> Self {
        map.cursors.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sta: &str, chan: &str) -> StreamKey {
        StreamKey::new(StationId::new("IU", sta), "00", chan, 'D')
    }

    fn rec(sta: &str, chan: &str, seq: u64, time: i64) -> Record {
        Record::new(
            key(sta, chan),
            SequenceNumber::new(seq),
            Timestamp::from_unix_seconds(time),
            Vec::<u8>::new(),
        )
    }

    #[test]
    fn advance_and_dedup() {
        let mut map = CursorMap::new();
        let r = rec("ANMO", "BHZ", 10, 100);
        assert!(map.is_new(&r, ProtocolVersion::V4));
        map.advance(&r);

        assert!(!map.is_new(&rec("ANMO", "BHZ", 10, 100), ProtocolVersion::V4));
        assert!(!map.is_new(&rec("ANMO", "BHZ", 9, 90), ProtocolVersion::V4));
        assert!(map.is_new(&rec("ANMO", "BHZ", 11, 110), ProtocolVersion::V4));
        // Cursors are per stream
        assert!(map.is_new(&rec("ANMO", "BHN", 5, 50), ProtocolVersion::V4));
    }

    #[test]
    fn v3_wrap_needs_newer_time() {
        let mut map = CursorMap::new();
        map.advance(&rec("ANMO", "BHZ", 0xFF_FFF0, 1000));

        assert!(map.is_new(&rec("ANMO", "BHZ", 0x000002, 1010), ProtocolVersion::V3));
        assert!(!map.is_new(&rec("ANMO", "BHZ", 0x000002, 900), ProtocolVersion::V3));
    }

    #[test]
    fn station_resume_picks_latest() {
        let mut map = CursorMap::new();
        map.advance(&rec("ANMO", "BHZ", 10, 100));
        map.advance(&rec("ANMO", "BHN", 11, 105));
        map.advance(&rec("COLA", "BHZ", 3, 200));

        let anmo = StationId::new("IU", "ANMO");
        let resume = map.station_resume(&anmo, ProtocolVersion::V4).unwrap();
        assert_eq!(resume.sequence, SequenceNumber::new(11));
        assert!(
            map.station_resume(&StationId::new("GE", "WLF"), ProtocolVersion::V4)
                .is_none()
        );

        // v3: a wrapped sequence with a newer time is the latest
        map.advance(&rec("ANMO", "LHZ", 0x000001, 300));
        map.advance(&rec("ANMO", "BHE", 0xFF_FFFE, 290));
        let resume = map.station_resume(&anmo, ProtocolVersion::V3).unwrap();
        assert_eq!(resume.sequence, SequenceNumber::new(1));
        assert_eq!(map.stations().len(), 2);
    }

    #[test]
    fn json_roundtrip_through_file() {
        let mut map = CursorMap::new();
        map.advance(&rec("ANMO", "BHZ", 10, 100));
        map.advance(&rec("COLA", "LHZ", 3, 200));

        let json = map.to_json().unwrap();
        assert!(json.contains("\"sequence\": 10"), "{json}");

        let path = std::env::temp_dir().join(format!("cursors-{}.json", std::process::id()));
        map.save(&path).unwrap();
        let loaded = CursorMap::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, map);
    }
}
