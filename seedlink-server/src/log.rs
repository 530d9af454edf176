//! Bounded, ordered record log for one station.
//!
//! A [`StationLog`] is plain data; the store wraps each one in its own mutex
//! so appends to different stations never contend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use seedlink_mux_protocol::record::MSEED2_RECORD_LEN;
use seedlink_mux_protocol::select::StartPoint;
use seedlink_mux_protocol::{
    GapNotice, ProtocolVersion, Record, SequenceNumber, StationId, StreamKey, Timestamp,
};
use tracing::{error, info, warn};

use crate::error::{Result, ServerError};

/// What to do when an appended record does not advance the sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SequencePolicy {
    /// Halt the station log until an operator calls
    /// [`DataStore::resume_station`](crate::DataStore::resume_station).
    #[default]
    Strict,
    /// Give the record the next free sequence number and keep going.
    Renumber,
}

/// Retention and ordering settings shared by every station log.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Soft record count limit. Default: `10_000`.
    pub max_records: usize,
    /// Soft age limit, measured from arrival. Default: none.
    pub max_age: Option<Duration>,
    /// Records beyond this count are evicted even if a subscriber still
    /// needs them. Default: `100_000`.
    pub hard_limit: usize,
    pub policy: SequencePolicy,
    /// Required payload length, `None` to accept any. Default: `Some(512)`.
    pub record_len: Option<usize>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_age: None,
            hard_limit: 100_000,
            policy: SequencePolicy::Strict,
            record_len: Some(MSEED2_RECORD_LEN),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(Arc<Record>),
    /// Same sequence and payload as a retained record; nothing changed.
    Duplicate,
}

/// Starting point of a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchFrom {
    /// First sequence wanted (inclusive).
    Sequence(SequenceNumber),
    /// First record whose start time is at or after this time.
    Time(Timestamp),
}

/// Read access to retained records, independent of how they are stored.
pub trait RecordSource {
    type Reader: Iterator<Item = Arc<Record>>;

    /// Records of `key` from `from` onwards, in sequence order.
    ///
    /// Fails with the gap to report when `from` is older than retention;
    /// the caller restarts at [`GapNotice::earliest`].
    fn fetch(&self, key: &StreamKey, from: FetchFrom) -> std::result::Result<Self::Reader, GapNotice>;

    fn earliest_available(&self, key: &StreamKey) -> Option<SequenceNumber>;

    fn latest_available(&self, key: &StreamKey) -> Option<SequenceNumber>;
}

#[derive(Debug)]
struct Entry {
    record: Arc<Record>,
    arrived: Instant,
}

#[derive(Debug)]
pub struct StationLog {
    station: StationId,
    config: LogConfig,
    entries: VecDeque<Entry>,
    last: Option<SequenceNumber>,
    evicted_through: Option<SequenceNumber>,
    halted: Option<(SequenceNumber, SequenceNumber)>,
    deferred: bool,
}

impl StationLog {
    pub fn new(station: StationId, config: LogConfig) -> Self {
        Self {
            station,
            config,
            entries: VecDeque::new(),
            last: None,
            evicted_through: None,
            halted: None,
            deferred: false,
        }
    }

    pub fn station(&self) -> &StationId {
        &self.station
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Oldest retained sequence.
    pub fn earliest(&self) -> Option<SequenceNumber> {
        self.entries.front().map(|e| e.record.sequence)
    }

    /// Newest sequence ever appended, retained or not.
    pub fn latest(&self) -> Option<SequenceNumber> {
        self.last
    }

    /// Sequence the next auto-numbered record receives. Logs start at 1.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.last.map_or(SequenceNumber::new(1), SequenceNumber::next)
    }

    /// Highest sequence removed by retention.
    pub fn evicted_through(&self) -> Option<SequenceNumber> {
        self.evicted_through
    }

    pub fn get(&self, sequence: SequenceNumber) -> Option<&Arc<Record>> {
        let idx = self.position(sequence);
        self.entries
            .get(idx)
            .map(|e| &e.record)
            .filter(|r| r.sequence == sequence)
    }

    fn position(&self, sequence: SequenceNumber) -> usize {
        self.entries
            .partition_point(|e| e.record.sequence < sequence)
    }

    pub fn records(&self) -> impl DoubleEndedIterator<Item = &Arc<Record>> + Clone {
        self.entries.iter().map(|e| &e.record)
    }

    /// Append a record. Sequences must strictly increase and start at 1.
    pub fn append(&mut self, mut record: Record) -> Result<AppendOutcome> {
        if self.halted.is_some() {
            return Err(ServerError::LogHalted(self.station.clone()));
        }
        if record.sequence.value() == 0
            || record.sequence == SequenceNumber::UNSET
            || record.sequence == SequenceNumber::ALL_DATA
        {
            return Err(ServerError::InvalidSequence {
                station: self.station.clone(),
                got: record.sequence,
            });
        }
        if let Some(expected) = self.config.record_len
            && record.payload.len() != expected
        {
            return Err(ServerError::InvalidPayloadLength {
                expected,
                actual: record.payload.len(),
            });
        }

        if let Some(last) = self.last
            && record.sequence <= last
        {
            if self
                .get(record.sequence)
                .is_some_and(|r| r.payload == record.payload && r.key == record.key)
            {
                return Ok(AppendOutcome::Duplicate);
            }
            match self.config.policy {
                SequencePolicy::Strict => {
                    error!(
                        station = %self.station,
                        last = %last,
                        got = %record.sequence,
                        "sequence regression, station log halted"
                    );
                    self.halted = Some((last, record.sequence));
                    return Err(ServerError::SequenceRegression {
                        station: self.station.clone(),
                        last,
                        got: record.sequence,
                    });
                }
                SequencePolicy::Renumber => {
                    let next = last.next();
                    warn!(
                        station = %self.station,
                        got = %record.sequence,
                        assigned = %next,
                        "sequence regression, record renumbered"
                    );
                    record.sequence = next;
                }
            }
        }

        let record = Arc::new(record);
        self.last = Some(record.sequence);
        self.entries.push_back(Entry {
            record: Arc::clone(&record),
            arrived: Instant::now(),
        });
        Ok(AppendOutcome::Appended(record))
    }

    /// Lift a halt set by [`SequencePolicy::Strict`]. Returns whether the log
    /// was halted.
    pub fn resume(&mut self) -> bool {
        match self.halted.take() {
            Some((last, got)) => {
                info!(station = %self.station, %last, %got, "station log resumed");
                true
            }
            None => false,
        }
    }

    /// Apply retention.
    ///
    /// `min_cursor` is the lowest position still to be read by a catch-up
    /// reader. Soft limits never evict past it; the hard limit always does.
    pub fn evict(&mut self, min_cursor: Option<SequenceNumber>, now: Instant) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.config.hard_limit {
            self.pop_front();
            evicted += 1;
        }

        let mut deferred = false;
        while let Some(front) = self.entries.front() {
            let over_count = self.entries.len() > self.config.max_records;
            let over_age = self
                .config
                .max_age
                .is_some_and(|age| now.saturating_duration_since(front.arrived) > age);
            if !over_count && !over_age {
                break;
            }
            if min_cursor.is_some_and(|c| front.record.sequence > c) {
                deferred = true;
                break;
            }
            self.pop_front();
            evicted += 1;
        }

        if deferred && !self.deferred {
            warn!(
                station = %self.station,
                retained = self.entries.len(),
                "retention deferred by a lagging subscriber"
            );
        }
        self.deferred = deferred;
        evicted
    }

    fn pop_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            self.evicted_through = Some(entry.record.sequence);
        }
    }

    /// Position (last sequence already passed) from which a read starts.
    pub fn read_from(&self, from: FetchFrom) -> std::result::Result<SequenceNumber, GapNotice> {
        let head = self.last.unwrap_or(SequenceNumber::new(0));
        match from {
            FetchFrom::Sequence(first) => {
                if let Some(evicted) = self.evicted_through
                    && first <= evicted
                {
                    let earliest = self.earliest().unwrap_or_else(|| self.next_sequence());
                    return Err(GapNotice::new(&self.station, first, earliest));
                }
                Ok(SequenceNumber::new(first.value().saturating_sub(1)).min(head))
            }
            FetchFrom::Time(start) => Ok(self
                .records()
                .find(|r| r.start_time >= start)
                .map_or(head, |r| {
                    SequenceNumber::new(r.sequence.value().saturating_sub(1))
                })),
        }
    }

    /// Resolve a subscriber start point to the position after which
    /// delivery begins.
    pub fn start_after(
        &self,
        start: &StartPoint,
        version: ProtocolVersion,
    ) -> std::result::Result<SequenceNumber, GapNotice> {
        let head = self.last.unwrap_or(SequenceNumber::new(0));
        match *start {
            StartPoint::Next => Ok(head),
            StartPoint::All => Ok(self
                .earliest()
                .map_or(head, |e| SequenceNumber::new(e.value().saturating_sub(1)))),
            StartPoint::Sequence { after, time } => {
                let after = match version {
                    ProtocolVersion::V4 => after,
                    ProtocolVersion::V3 => match self.resolve_v3(after, time) {
                        Some(full) => full,
                        None => return Ok(head),
                    },
                };
                self.read_from(FetchFrom::Sequence(after.next()))
            }
            StartPoint::Time { start, .. } => self.read_from(FetchFrom::Time(start)),
        }
    }

    /// Extend a 24-bit v3 sequence to a full one.
    ///
    /// Prefers the newest retained record with matching low bits (and
    /// matching start time when `time` is given); otherwise the most recent
    /// sequence at or below the head with those bits.
    pub fn resolve_v3(
        &self,
        wire: SequenceNumber,
        time: Option<Timestamp>,
    ) -> Option<SequenceNumber> {
        let low = wire.value() & SequenceNumber::V3_MAX;
        let mut candidates = self
            .records()
            .rev()
            .filter(|r| r.sequence.value() & SequenceNumber::V3_MAX == low);
        if let Some(time) = time
            && let Some(hit) = candidates.clone().find(|r| r.start_time == time)
        {
            return Some(hit.sequence);
        }
        candidates
            .next()
            .map(|r| r.sequence)
            .or_else(|| SequenceNumber::extend_v3(low, self.last?))
    }

    /// Examine up to `limit` records after `after` (and not past `until`).
    ///
    /// Returns the accepted records and the last sequence examined, which is
    /// where the next batch continues.
    pub fn read_batch(
        &self,
        after: SequenceNumber,
        until: Option<SequenceNumber>,
        limit: usize,
        accept: impl Fn(&Record) -> bool,
    ) -> (Vec<Arc<Record>>, SequenceNumber) {
        let start = self.entries.partition_point(|e| e.record.sequence <= after);
        let mut out = Vec::new();
        let mut scanned = after;
        for entry in self.entries.range(start..).take(limit) {
            if until.is_some_and(|u| entry.record.sequence > u) {
                break;
            }
            scanned = entry.record.sequence;
            if accept(&entry.record) {
                out.push(Arc::clone(&entry.record));
            }
        }
        (out, scanned)
    }

    pub fn earliest_for(&self, key: &StreamKey) -> Option<SequenceNumber> {
        self.records().find(|r| &r.key == key).map(|r| r.sequence)
    }

    pub fn latest_for(&self, key: &StreamKey) -> Option<SequenceNumber> {
        self.records().rev().find(|r| &r.key == key).map(|r| r.sequence)
    }
}
