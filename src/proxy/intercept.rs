//! Pause/resume of in-flight transactions awaiting an operator decision.
//!
//! When interception is active, the forwarding path parks each request (and
//! optionally each response) here and waits. The operator then:
//!
//! 1. Sees an `intercepted-request` event with the full payload
//! 2. Releases it unchanged, or with edits, via [`InterceptionQueue::release`]
//! 3. Or drops it via [`InterceptionQueue::abandon`]
//!
//! # Timeout Handling
//!
//! A parked transaction waits for the timeout of the configuration snapshot
//! it was accepted under. If no decision arrives in time it is forwarded
//! with its original payload.
//!
//! # Client Disconnects
//!
//! The forwarding task holds a [`PendingRelease`]. When the client goes away
//! the task is dropped, and with it the `PendingRelease`, which removes the
//! entry and reports it as cancelled. No stale entries are left behind.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(txn: intercept_proxy::proxy::InterceptedTransaction) {
//! use intercept_proxy::control::EventSink;
//! use intercept_proxy::proxy::{InterceptionQueue, Release};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let queue = Arc::new(InterceptionQueue::new(EventSink::null()));
//! let pending = queue.enqueue(txn, Duration::from_secs(30));
//! let id = pending.id();
//!
//! // Later, from the operator side
//! queue.release(id, None).unwrap();
//!
//! assert!(matches!(pending.wait().await, Release::Forward(None)));
//! # }
//! ```

use super::message::{EditedPayload, Header, RequestSnapshot, ResponseSnapshot};
use crate::control::{EventSink, ProxyEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

/// Which half of an exchange is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to origin.
    Request,
    /// Origin to client.
    Response,
}

/// Lifecycle of an intercepted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterceptStatus {
    /// Waiting for the operator.
    Pending,
    /// Released by the operator (edited or not).
    Released,
    /// Forwarded unchanged after the wait expired.
    TimedOut,
    /// Dropped without being forwarded.
    Abandoned,
}

/// A paused request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedTransaction {
    /// Correlation id used by the operator to release the transaction.
    #[serde(rename = "correlationId")]
    pub id: Uuid,
    /// Inbound connection the transaction belongs to.
    pub connection_id: u64,
    /// Request or response.
    pub direction: Direction,
    /// Request method.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// Response status code (responses only).
    pub status_code: Option<u16>,
    /// Headers of the paused message.
    pub headers: Vec<Header>,
    /// Body of the paused message.
    #[serde(with = "super::message::base64_body")]
    pub body: Bytes,
    /// When the transaction was parked.
    pub timestamp: DateTime<Utc>,
    /// Current state.
    pub status: InterceptStatus,
}

impl InterceptedTransaction {
    /// A paused request.
    pub fn request(connection_id: u64, request: &RequestSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            direction: Direction::Request,
            method: request.method.clone(),
            url: request.url.clone(),
            status_code: None,
            headers: request.headers.clone(),
            body: request.body.clone(),
            timestamp: Utc::now(),
            status: InterceptStatus::Pending,
        }
    }

    /// A paused response to `request`.
    pub fn response(
        connection_id: u64,
        request: &RequestSnapshot,
        response: &ResponseSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            direction: Direction::Response,
            method: request.method.clone(),
            url: request.url.clone(),
            status_code: Some(response.status),
            headers: response.headers.clone(),
            body: response.body.clone(),
            timestamp: Utc::now(),
            status: InterceptStatus::Pending,
        }
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Forward, with operator edits if any.
    Forward(Option<EditedPayload>),
    /// The wait expired; forward the original.
    TimedOut,
    /// Drop the transaction and its connection.
    Drop,
}

impl Release {
    /// Status recorded for this outcome.
    pub fn status(&self) -> InterceptStatus {
        match self {
            Release::Forward(_) => InterceptStatus::Released,
            Release::TimedOut => InterceptStatus::TimedOut,
            Release::Drop => InterceptStatus::Abandoned,
        }
    }
}

/// Errors from operator decisions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterceptError {
    /// No pending transaction with this id (unknown, already released,
    /// timed out, or abandoned).
    #[error("Intercepted transaction {0} is not pending")]
    NotPending(Uuid),

    /// The transaction was pending but its connection is gone.
    #[error("Connection for intercepted transaction {0} was closed")]
    ConnectionClosed(Uuid),
}

struct PendingEntry {
    seq: u64,
    transaction: InterceptedTransaction,
    release_tx: oneshot::Sender<Release>,
}

/// Queue of transactions paused for the operator.
pub struct InterceptionQueue {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    next_seq: AtomicU64,
    events: EventSink,
}

impl InterceptionQueue {
    /// Create an empty queue that reports to `events`.
    pub fn new(events: EventSink) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Park a transaction and notify the operator.
    ///
    /// The returned handle resolves on release, after `timeout`, or on
    /// abandonment. Dropping it unresolved abandons the transaction.
    pub fn enqueue(
        self: &Arc<Self>,
        transaction: InterceptedTransaction,
        timeout: Duration,
    ) -> PendingRelease {
        let id = transaction.id;
        let (release_tx, release_rx) = oneshot::channel();

        debug!(
            "Intercepted {:?} {} {} as {}",
            transaction.direction, transaction.method, transaction.url, id
        );

        self.lock().insert(
            id,
            PendingEntry {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                transaction: transaction.clone(),
                release_tx,
            },
        );
        self.events.emit(ProxyEvent::InterceptedRequest(transaction));

        PendingRelease {
            id,
            queue: self.clone(),
            release_rx,
            timeout,
            resolved: false,
        }
    }

    /// Release a pending transaction, optionally with edits.
    pub fn release(&self, id: Uuid, edit: Option<EditedPayload>) -> Result<(), InterceptError> {
        let entry = self.lock().remove(&id).ok_or(InterceptError::NotPending(id))?;

        debug!(
            "Releasing {} ({} {}), edited: {}",
            id,
            entry.transaction.method,
            entry.transaction.url,
            edit.is_some()
        );

        entry
            .release_tx
            .send(Release::Forward(edit))
            .map_err(|_| InterceptError::ConnectionClosed(id))
    }

    /// Drop a pending transaction without forwarding it.
    ///
    /// Returns true if the transaction was pending.
    pub fn abandon(&self, id: Uuid) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };

        // The waiter may already be gone
        let _ = entry.release_tx.send(Release::Drop);
        self.cancelled(id, "abandoned by operator");
        true
    }

    /// Drop every pending transaction.
    ///
    /// Returns the number of transactions abandoned.
    pub fn abandon_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();

        for entry in drained {
            let id = entry.transaction.id;
            let _ = entry.release_tx.send(Release::Drop);
            self.cancelled(id, reason);
        }

        if count > 0 {
            info!("Abandoned {} intercepted transactions: {}", count, reason);
        }
        count
    }

    /// Snapshot of the pending transactions, oldest first.
    pub fn list_pending(&self) -> Vec<InterceptedTransaction> {
        let pending = self.lock();
        let mut entries: Vec<&PendingEntry> = pending.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.iter().map(|entry| entry.transaction.clone()).collect()
    }

    /// Number of pending transactions.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn take(&self, id: Uuid) -> Option<PendingEntry> {
        self.lock().remove(&id)
    }

    fn cancelled(&self, id: Uuid, reason: &str) {
        self.events.emit(ProxyEvent::InterceptionCancelled {
            request_id: id,
            reason: reason.to_string(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on a parked transaction.
pub struct PendingRelease {
    id: Uuid,
    queue: Arc<InterceptionQueue>,
    release_rx: oneshot::Receiver<Release>,
    timeout: Duration,
    resolved: bool,
}

impl PendingRelease {
    /// Correlation id of the parked transaction.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the operator decision or the timeout.
    pub async fn wait(mut self) -> Release {
        let outcome = match tokio::time::timeout(self.timeout, &mut self.release_rx).await {
            Ok(Ok(release)) => release,
            // Sender dropped without a decision
            Ok(Err(_)) => Release::Drop,
            Err(_) => self.expire(),
        };

        self.resolved = true;
        outcome
    }

    fn expire(&mut self) -> Release {
        if self.queue.take(self.id).is_some() {
            info!("Intercepted transaction {} timed out, forwarding original", self.id);
            self.queue.cancelled(self.id, "timed out");
            return Release::TimedOut;
        }

        // A decision raced the deadline and is already in the channel
        self.release_rx.try_recv().unwrap_or(Release::Drop)
    }
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if self.queue.take(self.id).is_some() {
            debug!("Client went away while {} was pending", self.id);
            self.queue.cancelled(self.id, "client disconnected");
        }
    }
}
