// Per-run event bus
// Single writer, monotonic seq, per-subscriber bounded buffers. Slow
// subscribers shed lowest-priority events first and see a synthesized
// `backpressure_drop` marker in place of what was shed. The run itself never
// blocks on subscriber health.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::Notify;
use uuid::Uuid;

use agora_types::{EventPriority, RunEvent, RunEventPayload};

use crate::clock::Clock;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct SubscriberState {
    buffer: VecDeque<RunEvent>,
    /// Smallest dropped seq and count since the last delivered marker.
    pending_marker: Option<(u64, u64)>,
    closed: bool,
    receiver_gone: bool,
}

struct SubscriberShared {
    run_id: String,
    clock: Arc<dyn Clock>,
    state: Mutex<SubscriberState>,
    notify: Notify,
    capacity: usize,
}

pub struct RunEventBus {
    run_id: String,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    capacity: usize,
}

impl RunEventBus {
    pub fn new(run_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(run_id, clock, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(run_id: impl Into<String>, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            run_id: run_id.into(),
            seq: AtomicU64::new(0),
            clock,
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(2),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Seq of the most recently emitted event (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> EventSubscription {
        let shared = Arc::new(SubscriberShared {
            run_id: self.run_id.clone(),
            clock: self.clock.clone(),
            state: Mutex::new(SubscriberState {
                buffer: VecDeque::new(),
                pending_marker: None,
                closed: false,
                receiver_gone: false,
            }),
            notify: Notify::new(),
            capacity: self.capacity,
        });
        self.subscribers
            .lock()
            .expect("event bus poisoned")
            .push(shared.clone());
        EventSubscription { shared }
    }

    /// Assign the next seq and fan the event out. Returns the stamped event
    /// so the caller can persist and audit it.
    pub fn emit(&self, turn_index: u32, payload: RunEventPayload) -> RunEvent {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RunEvent {
            event_id: Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            turn_index,
            seq,
            ts_ms: self.clock.now_ms(),
            payload,
        };

        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.retain(|shared| {
            let mut state = shared.state.lock().expect("subscriber poisoned");
            if state.receiver_gone {
                return false;
            }
            deliver(&mut state, shared.capacity, event.clone());
            drop(state);
            shared.notify.notify_one();
            true
        });

        event
    }

    /// Close every subscription. Pending buffered events remain readable;
    /// `recv` returns `None` once drained.
    pub fn close(&self) {
        let subscribers = self.subscribers.lock().expect("event bus poisoned");
        for shared in subscribers.iter() {
            shared
                .state
                .lock()
                .expect("subscriber poisoned")
                .closed = true;
            shared.notify.notify_one();
        }
    }
}

fn deliver(state: &mut SubscriberState, capacity: usize, event: RunEvent) {
    if state.closed {
        return;
    }
    if state.buffer.len() < capacity {
        state.buffer.push_back(event);
        return;
    }

    // Buffer full: shed the lowest-priority event present, preferring the
    // oldest. Critical events are never shed; if everything buffered is
    // critical the buffer grows past capacity instead.
    let incoming_priority = event.payload.priority();
    let victim = lowest_priority_index(&state.buffer);
    match victim {
        Some((index, priority)) if priority <= incoming_priority => {
            let dropped = state.buffer.remove(index).expect("victim index valid");
            note_drop(state, dropped.seq);
            state.buffer.push_back(event);
        }
        _ if incoming_priority == EventPriority::Critical => {
            state.buffer.push_back(event);
        }
        _ => {
            // Incoming is the lowest priority in sight; shed it instead.
            note_drop(state, event.seq);
        }
    }
}

fn lowest_priority_index(buffer: &VecDeque<RunEvent>) -> Option<(usize, EventPriority)> {
    let mut best: Option<(usize, EventPriority)> = None;
    for (index, event) in buffer.iter().enumerate() {
        let priority = event.payload.priority();
        if priority == EventPriority::Critical {
            continue;
        }
        match best {
            Some((_, current)) if current <= priority => {}
            _ => best = Some((index, priority)),
        }
        if priority == EventPriority::Low {
            break;
        }
    }
    best
}

fn note_drop(state: &mut SubscriberState, seq: u64) {
    state.pending_marker = Some(match state.pending_marker {
        Some((first, count)) => (first.min(seq), count + 1),
        None => (seq, 1),
    });
}

/// A single consumer of a run's event stream, ordered by `seq`.
pub struct EventSubscription {
    shared: Arc<SubscriberShared>,
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("run_id", &self.shared.run_id)
            .finish()
    }
}

impl EventSubscription {
    /// Next event, or `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            {
                let mut state = self.shared.state.lock().expect("subscriber poisoned");
                // Deliver the drop marker once everything that precedes the
                // shed region has been handed out.
                if let Some((marker_seq, dropped)) = state.pending_marker {
                    let marker_due = match state.buffer.front() {
                        Some(front) => front.seq > marker_seq,
                        None => state.closed,
                    };
                    if marker_due {
                        state.pending_marker = None;
                        return Some(RunEvent {
                            event_id: Uuid::new_v4().to_string(),
                            run_id: self.shared.run_id.clone(),
                            turn_index: 0,
                            seq: marker_seq,
                            ts_ms: self.shared.clock.now_ms(),
                            payload: RunEventPayload::BackpressureDrop { dropped },
                        });
                    }
                }
                if let Some(event) = state.buffer.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Adapt the subscription into a `Stream` of events.
    pub fn into_stream(mut self) -> impl Stream<Item = RunEvent> + Send {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.shared
            .state
            .lock()
            .expect("subscriber poisoned")
            .receiver_gone = true;
    }
}
