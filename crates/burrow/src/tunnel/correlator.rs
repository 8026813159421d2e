//! Request/response correlation for one tunnel session.
//!
//! Each forwarded request moves through `Idle -> Sent -> {Completed | TimedOut | ChannelError}`.
//! `Sent` is an entry in [`PendingRequests`] keyed by correlation id; the entry is
//! removed on every terminal transition, so the map never holds a finished request.
//!
//! Once the owning session closes, the map is sealed: every waiting caller is
//! released with the close reason and further reservations fail.
//!
//! Until the client has echoed a correlation id at least once it is treated as
//! id-unaware and limited to a single outstanding request, so an id-less
//! response can only ever belong to one caller.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::protocol::ResponseEnvelope;
use crate::error::{ProtocolError, TunnelError};

pub type CorrelationResult = Result<ResponseEnvelope, TunnelError>;

/// Result of routing an inbound response to its waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Delivered to the caller waiting on this id.
    Delivered(String),
    /// No caller is waiting (timed out, cancelled, or never sent). Dropped.
    Late(Option<String>),
}

#[derive(Debug)]
pub struct PendingRequests {
    waiting: HashMap<String, oneshot::Sender<CorrelationResult>>,
    /// Reservation order, used to match responses that carry no id.
    order: Vec<String>,
    capacity: usize,
    closed: Option<TunnelError>,
    echoes_ids: bool,
}

impl PendingRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            waiting: HashMap::new(),
            order: Vec::new(),
            capacity: capacity.max(1),
            closed: None,
            echoes_ids: false,
        }
    }

    /// `Idle -> Sent`: claim a slot for `id`.
    pub fn reserve(
        &mut self,
        id: &str,
        client_id: &str,
    ) -> Result<oneshot::Receiver<CorrelationResult>, TunnelError> {
        if let Some(ref reason) = self.closed {
            return Err(reason.clone());
        }
        if self.waiting.contains_key(id) {
            return Err(TunnelError::Protocol(format!("duplicate correlation id '{id}'")));
        }
        if self.waiting.len() >= self.capacity() {
            return Err(TunnelError::Busy(client_id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id.to_string(), tx);
        self.order.push(id.to_string());
        Ok(rx)
    }

    /// `Sent -> Completed`: hand a response to whoever is waiting for it.
    ///
    /// A response without an id is matched to the only outstanding request;
    /// with several outstanding it cannot be attributed and is a protocol error.
    /// Such a response also drops the session back to one slot.
    pub fn complete(&mut self, response: ResponseEnvelope) -> Result<Completion, ProtocolError> {
        let id = match response.id.clone() {
            Some(id) => {
                self.echoes_ids = true;
                id
            }
            None => {
                self.echoes_ids = false;
                match self.order.as_slice() {
                    [] => return Ok(Completion::Late(None)),
                    [only] => only.clone(),
                    many => return Err(ProtocolError::AmbiguousResponse(many.len())),
                }
            }
        };

        match self.take(&id) {
            Some(tx) => {
                // The receiver may have been dropped between timeout and removal
                let _ = tx.send(Ok(response));
                Ok(Completion::Delivered(id))
            }
            None => Ok(Completion::Late(Some(id))),
        }
    }

    /// Drop the slot for `id` without answering it (timeout or caller gone).
    pub fn cancel(&mut self, id: &str) -> bool {
        self.take(id).is_some()
    }

    /// `Sent -> ChannelError` for every outstanding request, and refuse new ones.
    /// Returns how many callers were released; zero if already sealed.
    pub fn fail_all(&mut self, reason: TunnelError) -> usize {
        if self.closed.is_some() {
            return 0;
        }
        self.closed = Some(reason.clone());
        self.order.clear();
        let released = self.waiting.len();
        for (_, tx) in self.waiting.drain() {
            let _ = tx.send(Err(reason.clone()));
        }
        released
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<&TunnelError> {
        self.closed.as_ref()
    }

    /// Whether responses from this client cannot be told apart by id, either
    /// because it has not echoed one yet or because its last answer had none.
    pub fn is_legacy(&self) -> bool {
        !self.echoes_ids
    }

    /// Slots currently available to the client.
    pub fn capacity(&self) -> usize {
        if self.echoes_ids {
            self.capacity
        } else {
            1
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    fn take(&mut self, id: &str) -> Option<oneshot::Sender<CorrelationResult>> {
        let tx = self.waiting.remove(id)?;
        self.order.retain(|pending| pending != id);
        Some(tx)
    }
}
