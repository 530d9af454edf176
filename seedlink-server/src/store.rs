use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use seedlink_mux_protocol::info::{StationInfo, StreamInfo};
use seedlink_mux_protocol::select::{StationPattern, StationSelector};
use seedlink_mux_protocol::{
    GapNotice, ProtocolVersion, Record, SequenceNumber, Selector, StationId, StreamKey, TimeWindow,
};
use tracing::{debug, info, trace};

use crate::error::{Result, ServerError};
use crate::fanout::{BackpressurePolicy, Delivery, SubscriberQueue, Subscription, Tap};
use crate::log::{AppendOutcome, FetchFrom, LogConfig, RecordSource, StationLog};

/// Records examined per lock acquisition during catch-up.
const READ_BATCH: usize = 256;

/// Reader position meaning "no longer reading from the log".
const LIVE: u64 = u64::MAX;

pub(crate) struct StationState {
    pub(crate) log: StationLog,
    taps: Vec<Tap>,
    readers: Vec<Weak<AtomicU64>>,
}

impl StationState {
    /// Lowest position of an active catch-up reader.
    fn min_cursor(&mut self) -> Option<SequenceNumber> {
        self.readers.retain(|r| r.strong_count() > 0);
        self.readers
            .iter()
            .filter_map(Weak::upgrade)
            .map(|c| c.load(Ordering::Acquire))
            .filter(|&c| c != LIVE)
            .min()
            .map(SequenceNumber::new)
    }
}

pub(crate) struct StationCell {
    state: Mutex<StationState>,
}

struct Watcher {
    queue: Arc<SubscriberQueue>,
    selector: Selector,
}

#[derive(Default)]
struct Registry {
    stations: BTreeMap<StationId, Arc<StationCell>>,
    /// Live subscribers, attached to stations created after they subscribed.
    watchers: Vec<Watcher>,
}

struct StoreInner {
    config: LogConfig,
    backpressure: BackpressurePolicy,
    registry: Mutex<Registry>,
    next_subscriber: AtomicU64,
}

/// Per-station record logs plus the subscribers attached to them.
///
/// Clone is cheap (Arc). Each station has its own lock; the registry lock is
/// only taken to find or create a station and to subscribe.
#[derive(Clone)]
pub struct DataStore(Arc<StoreInner>);

impl DataStore {
    pub fn new(config: LogConfig, backpressure: BackpressurePolicy) -> Self {
        Self(Arc::new(StoreInner {
            config,
            backpressure,
            registry: Mutex::new(Registry::default()),
            next_subscriber: AtomicU64::new(1),
        }))
    }

    /// Append a miniSEED v2 record under the next sequence of
    /// `network`/`station`.
    ///
    /// The stream key and start time are read from the fixed header; the
    /// station codes given here take precedence over the header's.
    pub fn push(&self, network: &str, station: &str, payload: &[u8]) -> Result<SequenceNumber> {
        if let Some(expected) = self.0.config.record_len
            && payload.len() != expected
        {
            return Err(ServerError::InvalidPayloadLength {
                expected,
                actual: payload.len(),
            });
        }
        let id = StationId::new(network, station);
        let cell = self.cell(&id);
        let mut state = cell.state.lock().unwrap();
        let record = Record::from_mseed2(
            Some(id),
            state.log.next_sequence(),
            Bytes::copy_from_slice(payload),
        )?;
        match Self::commit(&mut state, record)? {
            AppendOutcome::Appended(record) => Ok(record.sequence),
            AppendOutcome::Duplicate => Ok(state.log.next_sequence()),
        }
    }

    /// Append a record carrying its own sequence number.
    pub fn append(&self, record: Record) -> Result<AppendOutcome> {
        let cell = self.cell(record.station());
        let mut state = cell.state.lock().unwrap();
        Self::commit(&mut state, record)
    }

    /// Append, publish to live taps, then apply retention, all under the
    /// station lock.
    fn commit(state: &mut StationState, record: Record) -> Result<AppendOutcome> {
        let outcome = state.log.append(record)?;
        if let AppendOutcome::Appended(record) = &outcome {
            trace!(station = %record.station(), sequence = %record.sequence, "record appended");
            state.taps.retain(|tap| tap.offer(record));
            let min_cursor = state.min_cursor();
            state.log.evict(min_cursor, Instant::now());
        }
        Ok(outcome)
    }

    fn cell(&self, id: &StationId) -> Arc<StationCell> {
        let mut registry = self.0.registry.lock().unwrap();
        if let Some(cell) = registry.stations.get(id) {
            return Arc::clone(cell);
        }

        registry.watchers.retain(|w| !w.queue.is_closed());
        let taps = registry
            .watchers
            .iter()
            .filter_map(|w| {
                w.selector.station_entry(id).map(|entry| {
                    Tap::new(Arc::clone(&w.queue), entry.clone(), SequenceNumber::new(0))
                })
            })
            .collect();
        let cell = Arc::new(StationCell {
            state: Mutex::new(StationState {
                log: StationLog::new(id.clone(), self.0.config.clone()),
                taps,
                readers: Vec::new(),
            }),
        });
        info!(station = %id, "new station");
        registry.stations.insert(id.clone(), Arc::clone(&cell));
        cell
    }

    fn existing(&self, id: &StationId) -> Option<Arc<StationCell>> {
        self.0.registry.lock().unwrap().stations.get(id).cloned()
    }

    /// Attach a live subscriber: catch-up from each station's start point,
    /// then every matching record appended afterwards.
    pub fn subscribe(&self, selector: &Selector, version: ProtocolVersion) -> Subscription {
        self.attach(selector, version, true)
    }

    /// Catch-up only (dial-up mode): the subscription ends at the records
    /// present now.
    pub fn dial_up(&self, selector: &Selector, version: ProtocolVersion) -> Subscription {
        self.attach(selector, version, false)
    }

    fn attach(&self, selector: &Selector, version: ProtocolVersion, live: bool) -> Subscription {
        let id = self.0.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let queue = SubscriberQueue::new(id, self.0.backpressure);
        let mut pending = VecDeque::new();
        let mut catchup = VecDeque::new();

        let mut registry = self.0.registry.lock().unwrap();
        for (station, cell) in &registry.stations {
            let Some(entry) = selector.station_entry(station) else {
                continue;
            };
            let mut state = cell.state.lock().unwrap();
            let snapshot = state.log.latest().unwrap_or(SequenceNumber::new(0));
            let after = match state.log.start_after(&entry.start, version) {
                Ok(after) => after,
                Err(gap) => {
                    debug!(subscriber = id, %gap, "start point below retention");
                    let after = SequenceNumber::new(gap.earliest.value().saturating_sub(1));
                    pending.push_back(Delivery::Gap(gap));
                    after
                }
            };
            debug!(subscriber = id, %station, %after, %snapshot, "attached");

            if after < snapshot {
                let cursor = Arc::new(AtomicU64::new(after.value()));
                state.readers.push(Arc::downgrade(&cursor));
                catchup.push_back(LogReader::new(
                    Arc::clone(cell),
                    after,
                    Some(snapshot),
                    ReadFilter::Selection {
                        selector: entry.clone(),
                        window: entry.start.window(),
                    },
                    Some(cursor),
                ));
            }
            if live {
                state
                    .taps
                    .push(Tap::new(Arc::clone(&queue), entry.clone(), snapshot));
            }
        }

        if live {
            registry.watchers.retain(|w| !w.queue.is_closed());
            registry.watchers.push(Watcher {
                queue: Arc::clone(&queue),
                selector: selector.clone(),
            });
        } else {
            queue.close();
        }
        Subscription::new(queue, pending, catchup)
    }

    /// Clear a halt left by a sequence regression. Returns whether the
    /// station was halted.
    pub fn resume_station(&self, network: &str, station: &str) -> bool {
        self.existing(&StationId::new(network, station))
            .is_some_and(|cell| cell.state.lock().unwrap().log.resume())
    }

    pub fn stations(&self) -> Vec<StationId> {
        self.0.registry.lock().unwrap().stations.keys().cloned().collect()
    }

    pub fn has_station_matching(&self, pattern: &StationPattern) -> bool {
        self.0
            .registry
            .lock()
            .unwrap()
            .stations
            .keys()
            .any(|id| pattern.matches(id))
    }

    fn cells(&self) -> Vec<(StationId, Arc<StationCell>)> {
        self.0
            .registry
            .lock()
            .unwrap()
            .stations
            .iter()
            .map(|(id, cell)| (id.clone(), Arc::clone(cell)))
            .collect()
    }

    /// Retained range per station, with per-stream detail when `streams` is
    /// set.
    pub fn station_summary(&self, streams: bool) -> Vec<StationInfo> {
        self.cells()
            .into_iter()
            .map(|(id, cell)| {
                let state = cell.state.lock().unwrap();
                let log = &state.log;
                StationInfo {
                    network: id.network.clone(),
                    station: id.station.clone(),
                    description: String::new(),
                    begin_seq: log.earliest().map_or(0, SequenceNumber::value),
                    end_seq: log.latest().map_or(0, SequenceNumber::value),
                    streams: if streams { stream_summary(log) } else { Vec::new() },
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn tap_count(&self, network: &str, station: &str) -> usize {
        self.existing(&StationId::new(network, station))
            .map_or(0, |cell| cell.state.lock().unwrap().taps.len())
    }

    #[cfg(test)]
    pub(crate) fn with_log<T>(&self, network: &str, station: &str, f: impl FnOnce(&StationLog) -> T) -> Option<T> {
        self.existing(&StationId::new(network, station))
            .map(|cell| f(&cell.state.lock().unwrap().log))
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new(LogConfig::default(), BackpressurePolicy::default())
    }
}

fn stream_summary(log: &StationLog) -> Vec<StreamInfo> {
    let mut streams: BTreeMap<&StreamKey, StreamInfo> = BTreeMap::new();
    for record in log.records() {
        let seq = record.sequence.value();
        streams
            .entry(&record.key)
            .and_modify(|s| {
                s.end_seq = seq;
                s.end_time = Some(record.start_time);
            })
            .or_insert_with(|| StreamInfo {
                location: record.key.location.clone(),
                channel: record.key.channel.clone(),
                record_type: record.key.record_type.to_string(),
                begin_seq: seq,
                end_seq: seq,
                begin_time: Some(record.start_time),
                end_time: Some(record.start_time),
            });
    }
    streams.into_values().collect()
}

impl RecordSource for DataStore {
    type Reader = LogReader;

    fn fetch(&self, key: &StreamKey, from: FetchFrom) -> std::result::Result<LogReader, GapNotice> {
        let filter = ReadFilter::Stream(key.clone());
        let Some(cell) = self.existing(&key.station) else {
            return Ok(LogReader::empty(filter));
        };
        let after = cell.state.lock().unwrap().log.read_from(from)?;
        Ok(LogReader::new(cell, after, None, filter, None))
    }

    fn earliest_available(&self, key: &StreamKey) -> Option<SequenceNumber> {
        self.existing(&key.station)
            .and_then(|cell| cell.state.lock().unwrap().log.earliest_for(key))
    }

    fn latest_available(&self, key: &StreamKey) -> Option<SequenceNumber> {
        self.existing(&key.station)
            .and_then(|cell| cell.state.lock().unwrap().log.latest_for(key))
    }
}

pub(crate) enum ReadFilter {
    Stream(StreamKey),
    Selection {
        selector: StationSelector,
        window: Option<TimeWindow>,
    },
}

impl ReadFilter {
    fn accepts(&self, record: &Record) -> bool {
        match self {
            Self::Stream(key) => &record.key == key,
            Self::Selection { selector, window } => {
                selector.matches_stream(&record.key)
                    && window.is_none_or(|w| w.contains(record.start_time))
            }
        }
    }
}

/// Lazy, batched reader over one station log.
///
/// Takes the station lock once per batch. If retention overtakes the
/// reader it continues from the earliest retained record; as an iterator
/// the skipped count is available from [`LogReader::missed`], while the
/// distributor turns it into a gap notice.
pub struct LogReader {
    cell: Option<Arc<StationCell>>,
    after: SequenceNumber,
    until: Option<SequenceNumber>,
    filter: ReadFilter,
    batch: VecDeque<Arc<Record>>,
    cursor: Option<Arc<AtomicU64>>,
    missed: u64,
}

impl LogReader {
    fn new(
        cell: Arc<StationCell>,
        after: SequenceNumber,
        until: Option<SequenceNumber>,
        filter: ReadFilter,
        cursor: Option<Arc<AtomicU64>>,
    ) -> Self {
        Self {
            cell: Some(cell),
            after,
            until,
            filter,
            batch: VecDeque::new(),
            cursor,
            missed: 0,
        }
    }

    fn empty(filter: ReadFilter) -> Self {
        Self {
            cell: None,
            after: SequenceNumber::new(0),
            until: None,
            filter,
            batch: VecDeque::new(),
            cursor: None,
            missed: 0,
        }
    }

    /// Records lost to retention while reading.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub(crate) fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            if let Some(record) = self.batch.pop_front() {
                return Some(Delivery::Record(record));
            }
            let cell = Arc::clone(self.cell.as_ref()?);
            if self.until.is_some_and(|u| self.after >= u) {
                self.finish();
                return None;
            }

            let state = cell.state.lock().unwrap();
            if state
                .log
                .evicted_through()
                .is_some_and(|evicted| evicted > self.after)
            {
                let earliest = state
                    .log
                    .earliest()
                    .unwrap_or_else(|| state.log.next_sequence());
                let gap = GapNotice::new(state.log.station(), self.after.next(), earliest);
                drop(state);
                self.missed += gap.missed();
                self.advance(SequenceNumber::new(earliest.value().saturating_sub(1)));
                return Some(Delivery::Gap(gap));
            }

            let (records, scanned) =
                state
                    .log
                    .read_batch(self.after, self.until, READ_BATCH, |r| self.filter.accepts(r));
            drop(state);
            if scanned == self.after {
                self.finish();
                return None;
            }
            self.advance(scanned);
            self.batch.extend(records);
        }
    }

    fn advance(&mut self, to: SequenceNumber) {
        self.after = to;
        if let Some(cursor) = &self.cursor {
            cursor.store(to.value(), Ordering::Release);
        }
    }

    fn finish(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            cursor.store(LIVE, Ordering::Release);
        }
        self.cell = None;
    }
}

impl Iterator for LogReader {
    type Item = Arc<Record>;

    fn next(&mut self) -> Option<Arc<Record>> {
        loop {
            match self.next_delivery()? {
                Delivery::Record(record) => return Some(record),
                Delivery::Gap(_) => continue,
            }
        }
    }
}
