//! Event Stream Publisher
//!
//! Per-session, append-only, totally ordered event log with live fan-out.
//!
//! - `append` assigns the next sequence number and pushes to subscribers
//!   without ever waiting on them.
//! - `subscribe` replays buffered history, then switches to live delivery.
//! - Each subscriber owns a bounded queue. On overflow the subscriber is
//!   dropped and, once its queue drains, receives a `Gap` item.

use crate::error::InvestigationError;
use crate::models::{Event, EventPayload, SessionId};
use crate::Result;
use chrono::Utc;
use futures::stream::{self, Stream};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Item yielded to a subscriber
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Event),
    /// The subscriber fell behind; events from `missed_from` on were not delivered
    Gap { session_id: SessionId, missed_from: u64 },
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    overflow: Arc<AtomicU64>,
}

#[derive(Default)]
struct SessionLog {
    next_sequence: u64,
    history: Vec<Event>,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Event Stream Publisher
pub struct EventPublisher {
    logs: Mutex<HashMap<SessionId, SessionLog>>,
    buffer: usize,
    next_subscriber: AtomicU64,
}

impl EventPublisher {
    /// `buffer` bounds each subscriber's live queue
    pub fn new(buffer: usize) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            next_subscriber: AtomicU64::new(1),
        }
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<SessionId, SessionLog>> {
        self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event and deliver it to every live subscriber
    pub fn append(&self, session_id: SessionId, payload: EventPayload) -> Result<Event> {
        let mut logs = self.logs();
        let log = logs.entry(session_id).or_default();

        if log.closed {
            return Err(InvestigationError::StreamDeliveryError(format!(
                "event log for session {} is closed",
                session_id
            )));
        }

        log.next_sequence += 1;
        let event = Event {
            session_id,
            sequence: log.next_sequence,
            timestamp: Utc::now(),
            payload,
        };
        log.history.push(event.clone());

        log.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.overflow.store(event.sequence, Ordering::SeqCst);
                warn!(
                    session_id = %session_id,
                    subscriber = sub.id,
                    missed_from = event.sequence,
                    "Subscriber queue full - dropping subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "Subscriber went away");
                false
            }
        });

        if event.is_terminal() {
            log.closed = true;
            // dropping the senders lets every stream drain and finish
            log.subscribers.clear();
        }

        debug!(
            session_id = %session_id,
            sequence = event.sequence,
            event = event.payload.name(),
            "Event appended"
        );

        Ok(event)
    }

    /// Subscribe with full history replay followed by live delivery
    pub fn subscribe(&self, session_id: SessionId) -> EventSubscription {
        let mut logs = self.logs();
        let log = logs.entry(session_id).or_default();

        let replay: VecDeque<Event> = log.history.iter().cloned().collect();
        let overflow = Arc::new(AtomicU64::new(0));

        let live = if log.closed {
            None
        } else {
            let (tx, rx) = mpsc::channel(self.buffer);
            let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
            log.subscribers.push(Subscriber {
                id,
                tx,
                overflow: overflow.clone(),
            });
            Some(rx)
        };

        EventSubscription {
            session_id,
            replay,
            live,
            overflow,
            last_sequence: 0,
            finished: false,
        }
    }

    /// Snapshot of everything appended so far
    pub fn history(&self, session_id: SessionId) -> Vec<Event> {
        self.logs()
            .get(&session_id)
            .map(|log| log.history.clone())
            .unwrap_or_default()
    }

    pub fn last_sequence(&self, session_id: SessionId) -> u64 {
        self.logs()
            .get(&session_id)
            .map(|log| log.next_sequence)
            .unwrap_or(0)
    }

    pub fn is_closed(&self, session_id: SessionId) -> bool {
        self.logs()
            .get(&session_id)
            .map(|log| log.closed)
            .unwrap_or(false)
    }

    /// Drop a session's log, returning its history
    pub fn remove(&self, session_id: SessionId) -> Vec<Event> {
        self.logs()
            .remove(&session_id)
            .map(|log| log.history)
            .unwrap_or_default()
    }
}

/// Ordered, finite view of one session's events
#[derive(Debug)]
pub struct EventSubscription {
    session_id: SessionId,
    replay: VecDeque<Event>,
    live: Option<mpsc::Receiver<Event>>,
    overflow: Arc<AtomicU64>,
    last_sequence: u64,
    finished: bool,
}

impl EventSubscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next item, or `None` once the session ended or the subscriber was dropped
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.finished {
            return None;
        }

        loop {
            let candidate = match self.replay.pop_front() {
                Some(event) => Some(event),
                None => match self.live.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => None,
                },
            };

            let Some(event) = candidate else {
                self.finished = true;
                let missed_from = self.overflow.load(Ordering::SeqCst);
                if missed_from > 0 {
                    return Some(StreamItem::Gap {
                        session_id: self.session_id,
                        missed_from,
                    });
                }
                return None;
            };

            // replay and live may overlap; sequence numbers dedupe
            if event.sequence <= self.last_sequence {
                continue;
            }
            self.last_sequence = event.sequence;

            if event.is_terminal() {
                self.finished = true;
            }
            return Some(StreamItem::Event(event));
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
    }
}
