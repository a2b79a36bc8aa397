//! Event delivery from the proxy to the operator.
//!
//! ```text
//! ┌────────────────┐  EventSink (try_send)  ┌────────────────┐
//! │     Proxy      │───────────────────────►│    Operator    │
//! │ queue/recorder │                        │     bridge     │
//! └────────────────┘                        └────────────────┘
//! ```
//!
//! Emitting never waits: a full or closed channel drops the event with a
//! warning so in-flight traffic is never held up by a slow consumer.

use super::protocol::ProxyEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Default channel buffer size.
pub const DEFAULT_CHANNEL_SIZE: usize = 1024;

/// Sending side of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ProxyEvent>>,
}

impl EventSink {
    /// Wrap an existing sender.
    pub fn new(tx: mpsc::Sender<ProxyEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn null() -> Self {
        Self { tx: None }
    }

    /// Offer an event to the operator without waiting.
    pub fn emit(&self, event: ProxyEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {}", event_name(&event));
            }
            Err(TrySendError::Closed(event)) => {
                trace!("Event channel closed, dropping {}", event_name(&event));
            }
        }
    }
}

fn event_name(event: &ProxyEvent) -> &'static str {
    match event {
        ProxyEvent::InterceptedRequest(_) => "intercepted-request",
        ProxyEvent::InterceptionCancelled { .. } => "interception-cancelled",
        ProxyEvent::TrafficRecord(_) => "traffic-record",
        ProxyEvent::ProxyState { .. } => "proxy-state",
    }
}

/// Create a connected sink/receiver pair.
///
/// # Example
///
/// ```
/// use intercept_proxy::control::create_event_channel;
///
/// let (sink, mut rx) = create_event_channel();
/// drop(sink);
/// assert!(rx.try_recv().is_err());
/// ```
#[inline]
pub fn create_event_channel() -> (EventSink, mpsc::Receiver<ProxyEvent>) {
    create_event_channel_with_size(DEFAULT_CHANNEL_SIZE)
}

/// Create a connected sink/receiver pair with a custom buffer size.
pub fn create_event_channel_with_size(size: usize) -> (EventSink, mpsc::Receiver<ProxyEvent>) {
    let (tx, rx) = mpsc::channel(size);
    (EventSink::new(tx), rx)
}
