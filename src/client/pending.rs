//! Pending-request table.
//!
//! Tracks requests that are waiting for a correlated response. Each entry
//! owns a single-shot completion; exactly one of resolve, reject, sweep or
//! reject-all settles it, and the entry leaves the table at that moment.
//!
//! A response that matches no entry is expected (the request may already
//! have timed out or been rejected) and is dropped with a warning.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::envelope::{try_unpack_as, AnyPayload, Candidate};
use crate::types::{Error, RequestId, Result};

/// Receiving side of a request's completion.
pub type Response<R> = oneshot::Receiver<Result<R>>;

/// Type-erased single-shot resolve/reject handle.
pub trait Completion: Send {
    /// Type tag the response must carry.
    fn expected_kind(&self) -> &str;

    /// Decode `payload` and complete with it.
    ///
    /// On error the completion is left untouched and may still settle later.
    fn try_resolve(&mut self, payload: &AnyPayload) -> Result<()>;

    fn reject(&mut self, error: Error);

    /// True once nobody is waiting for the outcome.
    fn is_abandoned(&self) -> bool;
}

struct TypedCompletion<R> {
    expected: Candidate<R>,
    tx: Option<oneshot::Sender<Result<R>>>,
}

impl<R: Send + 'static> Completion for TypedCompletion<R> {
    fn expected_kind(&self) -> &str {
        self.expected.tag()
    }

    fn try_resolve(&mut self, payload: &AnyPayload) -> Result<()> {
        let Some((value, _)) = try_unpack_as(payload, std::slice::from_ref(&self.expected)) else {
            return Err(Error::unexpected_payload(self.expected.tag(), &payload.type_tag));
        };
        if let Some(tx) = self.tx.take() {
            // The caller may have stopped waiting; nothing to do then.
            let _ = tx.send(Ok(value));
        }
        Ok(())
    }

    fn reject(&mut self, error: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    fn is_abandoned(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Build a completion expecting `expected`, plus the receiver the caller awaits.
pub fn completion<R: Send + 'static>(expected: Candidate<R>) -> (Box<dyn Completion>, Response<R>) {
    let (tx, rx) = oneshot::channel();
    let completion = TypedCompletion {
        expected,
        tx: Some(tx),
    };
    (Box::new(completion), rx)
}

/// One in-flight request.
pub struct PendingRequest {
    pub id: RequestId,
    pub issued_at: Instant,
    completion: Box<dyn Completion>,
}

impl PendingRequest {
    pub fn expected_kind(&self) -> &str {
        self.completion.expected_kind()
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("issued_at", &self.issued_at)
            .field("expected_kind", &self.expected_kind())
            .finish()
    }
}

/// In-flight requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry.
    ///
    /// A colliding id rejects `completion` with `DuplicateRequestId` and
    /// leaves the existing entry alone.
    pub fn register(&mut self, id: RequestId, mut completion: Box<dyn Completion>) -> Result<()> {
        if self.entries.contains_key(&id) {
            tracing::error!(request_id = %id, "duplicate request id");
            completion.reject(Error::DuplicateRequestId(id.clone()));
            return Err(Error::DuplicateRequestId(id));
        }

        self.entries.insert(
            id.clone(),
            PendingRequest {
                id,
                issued_at: Instant::now(),
                completion,
            },
        );
        Ok(())
    }

    /// Complete the entry for `id` with `payload` and remove it.
    ///
    /// Returns how long the request was in flight. Unknown ids and payloads
    /// that do not decode as the expected kind are logged and reported as
    /// errors; a non-matching payload leaves the entry pending.
    pub fn resolve(&mut self, id: &RequestId, payload: &AnyPayload) -> Result<Duration> {
        let Some(entry) = self.entries.get_mut(id) else {
            tracing::warn!(
                request_id = %id,
                type_tag = %payload.type_tag,
                "dropping response for unknown request id"
            );
            return Err(Error::UnknownResponseId(id.clone()));
        };

        if let Err(e) = entry.completion.try_resolve(payload) {
            tracing::warn!(request_id = %id, error = %e, "dropping response that does not match the expected kind");
            return Err(e);
        }

        let elapsed = entry.issued_at.elapsed();
        self.entries.remove(id);
        Ok(elapsed)
    }

    /// Fail a single entry. Returns false if `id` was not pending.
    pub fn reject(&mut self, id: &RequestId, error: Error) -> bool {
        match self.entries.remove(id) {
            Some(mut entry) => {
                entry.completion.reject(error);
                true
            }
            None => false,
        }
    }

    /// Fail every entry with `ConnectionClosed(reason)` and clear the table.
    pub fn reject_all(&mut self, reason: &str) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.completion.reject(Error::connection_closed(reason));
        }
        count
    }

    /// Fail every entry issued at least `max_age` before `now` with `RequestTimeout`.
    pub fn sweep_expired(&mut self, now: Instant, max_age: Duration) -> usize {
        let expired: Vec<RequestId> = self
            .entries
            .values()
            .filter(|entry| now.saturating_duration_since(entry.issued_at) >= max_age)
            .map(|entry| entry.id.clone())
            .collect();

        for id in &expired {
            if let Some(mut entry) = self.entries.remove(id) {
                let message = format!(
                    "request {} awaiting {} got no response within {:?}",
                    id,
                    entry.expected_kind(),
                    max_age
                );
                entry.completion.reject(Error::request_timeout(message));
            }
        }
        expired.len()
    }

    /// Drop entries whose caller stopped waiting (e.g. a dropped or timed-out future).
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.completion.is_abandoned());
        before - self.entries.len()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
