//! Delivery of appended records to subscribers.
//!
//! Each subscriber owns one [`SubscriberQueue`]. Appenders push into it
//! under the station lock without ever waiting on the subscriber, so a slow
//! session only ever affects itself. A [`Subscription`] first replays the
//! catch-up range from the log, then drains its queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use seedlink_mux_protocol::select::StationSelector;
use seedlink_mux_protocol::{GapNotice, Record, SequenceNumber, StationId, TimeWindow};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};
use crate::store::LogReader;

/// How a subscriber queue handles a consumer that does not keep up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Keep at most `capacity` records; drop the oldest and send a gap
    /// notice in its place.
    DropOldest { capacity: usize },
    /// Queue without dropping; disconnect once `max_lag` records are
    /// waiting.
    Disconnect { max_lag: usize },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::DropOldest { capacity: 1024 }
    }
}

/// One item handed to a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Record(Arc<Record>),
    Gap(GapNotice),
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<Record>>,
    /// First dropped sequence per station, reported before the next record.
    dropped: HashMap<StationId, SequenceNumber>,
    overflow: Option<usize>,
    closed: bool,
}

pub(crate) struct SubscriberQueue {
    id: u64,
    policy: BackpressurePolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    pub(crate) fn new(id: u64, policy: BackpressurePolicy) -> Arc<Self> {
        Arc::new(Self {
            id,
            policy,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a live record. Returns `false` once the queue is closed, so
    /// the caller can drop its reference.
    pub(crate) fn push(&self, record: Arc<Record>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        match self.policy {
            BackpressurePolicy::DropOldest { capacity } => {
                if state.items.len() >= capacity.max(1)
                    && let Some(old) = state.items.pop_front()
                {
                    state
                        .dropped
                        .entry(old.station().clone())
                        .or_insert(old.sequence);
                }
                state.items.push_back(record);
            }
            BackpressurePolicy::Disconnect { max_lag } => {
                if state.items.len() >= max_lag {
                    warn!(subscriber = self.id, lag = state.items.len(), "slow consumer, disconnecting");
                    state.overflow = Some(state.items.len());
                    state.closed = true;
                    state.items.clear();
                    drop(state);
                    self.notify.notify_one();
                    return false;
                }
                state.items.push_back(record);
            }
        }
        drop(state);
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().unwrap();
        if let Some(lag) = state.overflow {
            return Err(ServerError::SlowConsumerDisconnected { lag });
        }
        let Some(front) = state.items.front() else {
            return if state.closed {
                Err(ServerError::SubscriptionClosed)
            } else {
                Ok(None)
            };
        };
        let station = front.station().clone();
        let sequence = front.sequence;
        if let Some(first) = state.dropped.remove(&station) {
            return Ok(Some(Delivery::Gap(GapNotice::new(&station, first, sequence))));
        }
        Ok(state.items.pop_front().map(Delivery::Record))
    }

    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

/// A subscriber's attachment to one station log.
pub(crate) struct Tap {
    queue: Arc<SubscriberQueue>,
    selector: StationSelector,
    window: Option<TimeWindow>,
    /// Records up to here are covered by catch-up.
    live_after: SequenceNumber,
}

impl Tap {
    pub(crate) fn new(
        queue: Arc<SubscriberQueue>,
        selector: StationSelector,
        live_after: SequenceNumber,
    ) -> Self {
        let window = selector.start.window();
        Self {
            queue,
            selector,
            window,
            live_after,
        }
    }

    /// Offer a freshly appended record. Returns `false` when the tap is
    /// dead and should be removed.
    pub(crate) fn offer(&self, record: &Arc<Record>) -> bool {
        if record.sequence <= self.live_after
            || !self.selector.matches_stream(&record.key)
            || self.window.is_some_and(|w| !w.contains(record.start_time))
        {
            return !self.queue.is_closed();
        }
        self.queue.push(Arc::clone(record))
    }
}

/// A session's view of the distributor.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    pending: VecDeque<Delivery>,
    catchup: VecDeque<LogReader>,
}

impl Subscription {
    pub(crate) fn new(
        queue: Arc<SubscriberQueue>,
        pending: VecDeque<Delivery>,
        catchup: VecDeque<LogReader>,
    ) -> Self {
        Self {
            queue,
            pending,
            catchup,
        }
    }

    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Whether all start-point gaps and historical records have been handed
    /// out.
    pub fn is_caught_up(&self) -> bool {
        self.pending.is_empty() && self.catchup.is_empty()
    }

    /// Next item available without waiting.
    pub fn try_next(&mut self) -> Result<Option<Delivery>> {
        if let Some(delivery) = self.pending.pop_front() {
            return Ok(Some(delivery));
        }
        while let Some(reader) = self.catchup.front_mut() {
            if let Some(delivery) = reader.next_delivery() {
                return Ok(Some(delivery));
            }
            self.catchup.pop_front();
            if self.catchup.is_empty() {
                debug!(subscriber = self.queue.id, "catch-up complete");
            }
        }
        self.queue.pop()
    }

    /// Next item, waiting for live records if needed.
    ///
    /// Fails with [`ServerError::SlowConsumerDisconnected`] if the queue
    /// overflowed, or [`ServerError::SubscriptionClosed`] after
    /// [`unsubscribe`](Self::unsubscribe).
    pub async fn next(&mut self) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.try_next()? {
                return Ok(delivery);
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next catch-up item only; `None` once the catch-up is exhausted.
    pub fn next_catchup(&mut self) -> Option<Delivery> {
        if let Some(delivery) = self.pending.pop_front() {
            return Some(delivery);
        }
        while let Some(reader) = self.catchup.front_mut() {
            if let Some(delivery) = reader.next_delivery() {
                return Some(delivery);
            }
            self.catchup.pop_front();
        }
        None
    }

    /// Detach from all stations. Idempotent.
    pub fn unsubscribe(&self) {
        self.queue.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}
