//! Matches inbound replies to the invocations this side issued.

use crate::error::ConnectionError;
use chrono::{DateTime, Utc};
use hublink_protocol::{
    ArgumentShape, CompletionMessage, HubMessage, InvocationBinder, Parameters, TargetRegistry,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Kind of an outstanding invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Expects exactly one completion.
    Invocation,
    /// Expects stream items, then one completion.
    StreamInvocation,
}

impl fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationKind::Invocation => write!(f, "invocation"),
            InvocationKind::StreamInvocation => write!(f, "stream invocation"),
        }
    }
}

/// Bookkeeping for one outstanding invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRecord {
    pub invocation_id: String,
    pub kind: InvocationKind,
    pub target: String,
    pub created_at: DateTime<Utc>,
}

type Delivery = Result<HubMessage, ConnectionError>;

/// Canceled ids remembered per connection. Older ones are forgotten, so a
/// peer that never completes a canceled stream cannot grow the set.
pub const MAX_CANCELED_INVOCATIONS: usize = 1024;

struct PendingInvocation {
    record: InvocationRecord,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<String, PendingInvocation>,
    /// Ids canceled locally whose late replies are dropped.
    canceled: HashSet<String>,
    /// Cancellation order, oldest first; may hold ids already completed.
    canceled_order: VecDeque<String>,
    closed: bool,
}

impl CorrelatorState {
    fn remember_canceled(&mut self, invocation_id: &str) {
        self.canceled.insert(invocation_id.to_string());
        self.canceled_order.push_back(invocation_id.to_string());
        while self.canceled_order.len() > MAX_CANCELED_INVOCATIONS {
            if let Some(oldest) = self.canceled_order.pop_front() {
                self.canceled.remove(&oldest);
            }
        }
    }
}

/// What the read path should do with an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handed to the waiting invocation.
    Delivered,
    /// Fully handled here (pings, replies to canceled invocations).
    Consumed,
    /// Belongs to the hub dispatcher.
    Forward(HubMessage),
    /// The peer closed the connection.
    Closed(Option<String>),
}

/// Correlation engine of one connection.
pub struct InvocationCorrelator {
    state: Mutex<CorrelatorState>,
    next_id: AtomicU64,
}

impl Default for InvocationCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationCorrelator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CorrelatorState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates an id and starts tracking an invocation.
    pub fn register(
        &self,
        kind: InvocationKind,
        target: &str,
    ) -> Result<InvocationHandle, ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::TransportClosed);
        }

        let invocation_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        state.pending.insert(
            invocation_id.clone(),
            PendingInvocation {
                record: InvocationRecord {
                    invocation_id: invocation_id.clone(),
                    kind,
                    target: target.to_string(),
                    created_at: Utc::now(),
                },
                tx,
            },
        );

        Ok(InvocationHandle {
            invocation_id,
            kind,
            rx,
            finished: false,
        })
    }

    /// Stops tracking an invocation whose send failed.
    pub fn unregister(&self, invocation_id: &str) -> Option<InvocationRecord> {
        self.state
            .lock()
            .pending
            .remove(invocation_id)
            .map(|p| p.record)
    }

    /// Stops tracking an invocation the caller gave up on.
    ///
    /// Replies that were already in flight are dropped instead of being
    /// reported as unknown. The handle observes the end of its channel.
    pub fn cancel(&self, invocation_id: &str) -> Option<InvocationRecord> {
        let mut state = self.state.lock();
        let pending = state.pending.remove(invocation_id)?;
        state.remember_canceled(invocation_id);
        Some(pending.record)
    }

    /// Routes an inbound message.
    ///
    /// Replies with an id that was never issued, or already resolved, are a
    /// protocol violation and leave the pending set untouched.
    pub fn dispatch_inbound(&self, message: HubMessage) -> Result<DispatchOutcome, ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::TransportClosed);
        }

        match message {
            HubMessage::StreamItem(ref item) => {
                if state.canceled.contains(&item.invocation_id) {
                    return Ok(DispatchOutcome::Consumed);
                }
                let Some(pending) = state.pending.get(&item.invocation_id) else {
                    return Err(unknown_id(&item.invocation_id));
                };
                if pending.record.kind != InvocationKind::StreamInvocation {
                    return Err(ConnectionError::violation(format!(
                        "stream item for non-streaming invocation {}",
                        item.invocation_id
                    )));
                }
                // A dropped handle no longer cares
                let _ = pending.tx.send(Ok(message));
                Ok(DispatchOutcome::Delivered)
            }
            HubMessage::Completion(ref completion) => {
                if state.canceled.remove(&completion.invocation_id) {
                    return Ok(DispatchOutcome::Consumed);
                }
                let Some(pending) = state.pending.remove(&completion.invocation_id) else {
                    return Err(unknown_id(&completion.invocation_id));
                };
                let _ = pending.tx.send(Ok(message));
                Ok(DispatchOutcome::Delivered)
            }
            HubMessage::Ping => Ok(DispatchOutcome::Consumed),
            HubMessage::Close(close) => Ok(DispatchOutcome::Closed(close.error)),
            HubMessage::Invocation(_)
            | HubMessage::StreamInvocation(_)
            | HubMessage::CancelInvocation(_) => Ok(DispatchOutcome::Forward(message)),
        }
    }

    /// Resolves every pending invocation with `ConnectionAborted` and refuses
    /// further work. Returns how many were resolved; later calls return 0.
    pub fn abort_all(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        state.canceled.clear();
        state.canceled_order.clear();

        let count = state.pending.len();
        for (_, pending) in state.pending.drain() {
            let _ = pending.tx.send(Err(ConnectionError::ConnectionAborted));
        }
        if count > 0 {
            tracing::debug!("Aborted {} pending invocation(s)", count);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn contains(&self, invocation_id: &str) -> bool {
        self.state.lock().pending.contains_key(invocation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Canceled invocations whose completion has not arrived yet.
    pub fn canceled_count(&self) -> usize {
        self.state.lock().canceled.len()
    }

    pub fn record(&self, invocation_id: &str) -> Option<InvocationRecord> {
        self.state
            .lock()
            .pending
            .get(invocation_id)
            .map(|p| p.record.clone())
    }

    /// Result shape of an outstanding invocation, looked up by its target.
    pub fn return_shape(
        &self,
        invocation_id: &str,
        targets: &TargetRegistry,
    ) -> Option<ArgumentShape> {
        let state = self.state.lock();
        let pending = state.pending.get(invocation_id)?;
        Some(targets.returns(&pending.record.target))
    }
}

fn unknown_id(invocation_id: &str) -> ConnectionError {
    ConnectionError::violation(format!("unknown invocation id {}", invocation_id))
}

/// Binder over the local target table and the correlator's records.
pub struct CorrelatedBinder<'a> {
    targets: &'a TargetRegistry,
    correlator: &'a InvocationCorrelator,
}

impl<'a> CorrelatedBinder<'a> {
    pub fn new(targets: &'a TargetRegistry, correlator: &'a InvocationCorrelator) -> Self {
        Self {
            targets,
            correlator,
        }
    }
}

impl InvocationBinder for CorrelatedBinder<'_> {
    fn parameters(&self, target: &str) -> Option<Parameters> {
        self.targets.parameters(target)
    }

    fn return_shape(&self, invocation_id: &str) -> Option<ArgumentShape> {
        self.correlator.return_shape(invocation_id, self.targets)
    }
}

/// Caller's view of one outstanding invocation.
#[derive(Debug)]
pub struct InvocationHandle {
    invocation_id: String,
    kind: InvocationKind,
    rx: mpsc::UnboundedReceiver<Delivery>,
    finished: bool,
}

impl InvocationHandle {
    pub fn id(&self) -> &str {
        &self.invocation_id
    }

    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    /// Next stream item or the completion, in arrival order.
    ///
    /// Returns `None` after the terminal message, or when the invocation was
    /// canceled.
    pub async fn next(&mut self) -> Option<Delivery> {
        if self.finished {
            return None;
        }
        let delivery = self.rx.recv().await;
        self.observe(&delivery);
        delivery
    }

    /// Like [`next`](Self::next) without waiting. `None` means nothing arrived yet.
    pub fn try_next(&mut self) -> Option<Delivery> {
        if self.finished {
            return None;
        }
        let delivery = match self.rx.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(mpsc::error::TryRecvError::Empty) => return None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Err(self.canceled())),
        };
        self.observe(&delivery);
        delivery
    }

    /// Waits for the completion, skipping stream items.
    pub async fn completion(&mut self) -> Result<CompletionMessage, ConnectionError> {
        loop {
            match self.next().await {
                Some(Ok(HubMessage::Completion(completion))) => return Ok(completion),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => return Err(self.canceled()),
            }
        }
    }

    /// Collects stream items until the completion.
    pub async fn collect_stream(&mut self) -> Result<Vec<Value>, ConnectionError> {
        let mut items = Vec::new();
        loop {
            match self.next().await {
                Some(Ok(HubMessage::StreamItem(item))) => items.push(item.item),
                Some(Ok(HubMessage::Completion(completion))) => {
                    completion_result(completion)?;
                    return Ok(items);
                }
                Some(Ok(other)) => {
                    return Err(ConnectionError::violation(format!(
                        "unexpected {} for invocation {}",
                        other.message_type(),
                        self.invocation_id
                    )))
                }
                Some(Err(e)) => return Err(e),
                None => return Err(self.canceled()),
            }
        }
    }

    fn observe(&mut self, delivery: &Option<Delivery>) {
        match delivery {
            Some(Ok(HubMessage::StreamItem(_))) => {}
            _ => self.finished = true,
        }
    }

    fn canceled(&self) -> ConnectionError {
        ConnectionError::Canceled {
            invocation_id: self.invocation_id.clone(),
        }
    }
}

/// Converts a completion into its result, or the error it carries.
pub fn completion_result(completion: CompletionMessage) -> Result<Value, ConnectionError> {
    match completion.error {
        Some(message) => Err(ConnectionError::Invocation {
            invocation_id: completion.invocation_id,
            message,
        }),
        None => Ok(completion.result.unwrap_or(Value::Null)),
    }
}
