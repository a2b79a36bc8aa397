//! Traffic capture.
//!
//! Every transaction that finishes, forwarded or failed, leaves a
//! [`TrafficRecord`] here. The recorder never blocks the exchange it
//! observes: records go into a bounded ring buffer and are offered to the UI
//! with a non-blocking send.

use super::intercept::InterceptStatus;
use super::message::{RequestSnapshot, ResponseSnapshot};
use crate::control::{EventSink, ProxyEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use uuid::Uuid;

/// Timing of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    /// When the request head arrived.
    pub started_at: DateTime<Utc>,
    /// TLS handshake time of the inbound connection, for tunneled traffic.
    pub tls_handshake_ms: Option<u64>,
    /// Time from request arrival to the response being handed back,
    /// operator pauses included.
    pub total_ms: u64,
}

/// Byte counts of one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Size {
    /// Request body bytes as forwarded.
    pub request_bytes: u64,
    /// Response body bytes as returned to the client.
    pub response_bytes: u64,
}

/// A finished exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    /// Record id.
    pub id: Uuid,
    /// Inbound connection the exchange belongs to.
    pub connection_id: u64,
    /// Request as forwarded (after operator edits).
    pub request: RequestSnapshot,
    /// Response as returned to the client, absent when none was produced.
    pub response: Option<ResponseSnapshot>,
    /// Timing.
    pub timing: Timing,
    /// Byte counts.
    pub size: Size,
    /// Outcome of request interception, if the request was paused.
    pub request_intercept: Option<InterceptStatus>,
    /// Outcome of response interception, if the response was paused.
    pub response_intercept: Option<InterceptStatus>,
    /// Failure description, if the exchange did not complete normally.
    pub error: Option<String>,
}

/// Bounded store of traffic records.
pub struct TrafficRecorder {
    inner: Mutex<RecorderState>,
    events: EventSink,
}

struct RecorderState {
    records: VecDeque<TrafficRecord>,
    capacity: usize,
}

impl TrafficRecorder {
    /// Create a recorder keeping `capacity` records (`0` keeps all).
    pub fn new(capacity: usize, events: EventSink) -> Self {
        Self {
            inner: Mutex::new(RecorderState {
                records: VecDeque::new(),
                capacity,
            }),
            events,
        }
    }

    /// Append a record, evicting the oldest if full, and notify the UI.
    pub fn record(&self, record: TrafficRecord) {
        {
            let mut state = self.lock();
            state.records.push_back(record.clone());
            state.evict();
        }
        self.events.emit(ProxyEvent::TrafficRecord(Box::new(record)));
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<TrafficRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every retained record.
    pub fn clear(&self) {
        self.lock().records.clear();
    }

    /// Change the retention bound, evicting as needed.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        state.capacity = capacity;
        state.evict();
    }

    /// Current retention bound.
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Milliseconds since `since`, saturating.
pub(crate) fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl RecorderState {
    fn evict(&mut self) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::create_event_channel;
    use bytes::Bytes;

    fn record(url: &str) -> TrafficRecord {
        TrafficRecord {
            id: Uuid::new_v4(),
            connection_id: 1,
            request: RequestSnapshot {
                method: "GET".to_string(),
                url: url.to_string(),
                headers: vec![],
                body: Bytes::new(),
            },
            response: None,
            timing: Timing {
                started_at: Utc::now(),
                tls_handshake_ms: None,
                total_ms: 0,
            },
            size: Size::default(),
            request_intercept: None,
            response_intercept: None,
            error: Some("refused".to_string()),
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let recorder = TrafficRecorder::new(2, EventSink::null());
        recorder.record(record("http://a.test/"));
        recorder.record(record("http://b.test/"));
        recorder.record(record("http://c.test/"));

        let urls: Vec<String> = recorder.records().into_iter().map(|r| r.request.url).collect();
        assert_eq!(urls, vec!["http://b.test/", "http://c.test/"]);
    }

    #[test]
    fn test_zero_capacity_is_unbounded() {
        let recorder = TrafficRecorder::new(0, EventSink::null());
        for i in 0..50 {
            recorder.record(record(&format!("http://{}.test/", i)));
        }
        assert_eq!(recorder.len(), 50);
    }

    #[test]
    fn test_clear_and_shrink() {
        let recorder = TrafficRecorder::new(10, EventSink::null());
        for i in 0..5 {
            recorder.record(record(&format!("http://{}.test/", i)));
        }

        recorder.set_capacity(3);
        assert_eq!(recorder.len(), 3);

        recorder.clear();
        assert!(recorder.is_empty());
    }

    #[tokio::test]
    async fn test_record_emits_event() {
        let (events, mut rx) = create_event_channel();
        let recorder = TrafficRecorder::new(10, events);
        recorder.record(record("http://a.test/"));

        match rx.recv().await {
            Some(ProxyEvent::TrafficRecord(r)) => assert_eq!(r.request.url, "http://a.test/"),
            other => unreachable!("Expected TrafficRecord, got {:?}", other),
        }
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let (events, _rx) = crate::control::create_event_channel_with_size(1);
        let recorder = TrafficRecorder::new(10, events);
        for _ in 0..5 {
            recorder.record(record("http://a.test/"));
        }
        assert_eq!(recorder.len(), 5);
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record("http://a.test/")).unwrap();
        assert!(json["timing"]["startedAt"].is_string());
        assert_eq!(json["size"]["requestBytes"], 0);
        assert!(json["response"].is_null());
    }
}
