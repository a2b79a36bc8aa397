//! Newline-delimited JSON bridge between an operator process and the proxy.
//!
//! ```text
//! ┌──────────────┐  commands (stdin)  ┌────────────────┐      ┌─────────────────┐
//! │   Operator   │───────────────────►│ OperatorBridge │─────►│ ProxyController │
//! │ (UI process) │◄───────────────────│                │◄─────│   (EventSink)   │
//! └──────────────┘ replies + events   └────────────────┘      └─────────────────┘
//!                      (stdout)
//! ```
//!
//! Each command line gets exactly one reply line, written before any later
//! output. Events are interleaved between replies as they arrive. Malformed
//! lines get a failure reply; they never end the session.

use super::protocol::{CommandReply, OperatorCommand, ProxyEvent};
use crate::proxy::{InterceptError, ProxyController};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors that end a bridge session.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Reading commands or writing output failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A reply or event could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Dispatches operator commands to a [`ProxyController`].
pub struct OperatorBridge {
    controller: Arc<ProxyController>,
}

impl OperatorBridge {
    /// Create a bridge driving `controller`.
    pub fn new(controller: Arc<ProxyController>) -> Self {
        Self { controller }
    }

    /// Execute one command.
    pub async fn handle(&self, command: OperatorCommand) -> CommandReply {
        match command {
            OperatorCommand::ProxyStart { config } => match self.controller.start(config).await {
                Ok(addr) => CommandReply {
                    port: Some(addr.port()),
                    ..CommandReply::ok()
                },
                Err(e) => CommandReply::failure(e),
            },
            OperatorCommand::ProxyStop => {
                self.controller.stop().await;
                CommandReply::ok()
            }
            OperatorCommand::ProxyUpdateConfig { config } => {
                match self.controller.update_config(config).await {
                    Ok(()) => CommandReply::ok(),
                    Err(e) => CommandReply::failure(e),
                }
            }
            OperatorCommand::ProxyRespond {
                request_id,
                response,
            } => match self
                .controller
                .respond_to_intercepted_request(request_id, response)
            {
                Ok(()) => CommandReply::ok(),
                Err(e) => {
                    debug!("Release of {} failed: {}", request_id, e);
                    CommandReply::failure(e)
                }
            },
            OperatorCommand::ProxyDrop { request_id } => {
                if self.controller.abandon(request_id) {
                    CommandReply::ok()
                } else {
                    CommandReply::failure(InterceptError::NotPending(request_id))
                }
            }
            OperatorCommand::ProxyPending => CommandReply {
                pending: Some(self.controller.queue().list_pending()),
                ..CommandReply::ok()
            },
            OperatorCommand::ProxyRecords => CommandReply {
                records: Some(self.controller.recorder().records()),
                ..CommandReply::ok()
            },
            OperatorCommand::ProxyClearRecords => {
                self.controller.recorder().clear();
                CommandReply::ok()
            }
            OperatorCommand::ProxyRootCertificate => {
                // First use generates the root key
                let ca = self.controller.certificate_authority().clone();
                match tokio::task::spawn_blocking(move || ca.root_certificate()).await {
                    Ok(Ok(root)) => CommandReply {
                        certificate_pem: Some(root.cert_pem().to_string()),
                        ..CommandReply::ok()
                    },
                    Ok(Err(e)) => CommandReply::failure(e),
                    Err(e) => CommandReply::failure(e),
                }
            }
        }
    }

    /// Parse and execute one command line.
    pub async fn handle_line(&self, line: &str) -> CommandReply {
        match serde_json::from_str::<OperatorCommand>(line) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                warn!("Rejected operator command: {}", e);
                CommandReply::failure(format!("Invalid command: {}", e))
            }
        }
    }

    /// Serve commands from `input` and write replies and `events` to
    /// `output` until `input` ends.
    pub async fn run<R, W>(
        self,
        input: R,
        mut output: W,
        mut events: mpsc::Receiver<ProxyEvent>,
    ) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(input).lines();
        let mut events_open = true;

        info!("Operator bridge started");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("Operator input closed");
                        break;
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let reply = self.handle_line(line).await;
                    write_line(&mut output, &reply).await?;
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => write_line(&mut output, &event).await?,
                    None => {
                        debug!("Event channel closed");
                        events_open = false;
                    }
                },
            }
        }

        Ok(())
    }
}

/// Write one value as a JSON line and flush.
async fn write_line<W, T>(output: &mut W, value: &T) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::control::{EventSink, create_event_channel};
    use crate::proxy::{Header, InterceptedTransaction, Release, RequestSnapshot};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use uuid::Uuid;

    fn bridge() -> OperatorBridge {
        let controller =
            ProxyController::new(Arc::new(CertificateAuthority::new()), EventSink::null());
        OperatorBridge::new(Arc::new(controller))
    }

    #[tokio::test]
    async fn test_invalid_line_is_failure_reply() {
        let reply = bridge().handle_line("{not json").await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("Invalid command"));
    }

    #[tokio::test]
    async fn test_respond_unknown_id_is_reported() {
        let id = Uuid::new_v4();
        let reply = bridge()
            .handle(OperatorCommand::ProxyRespond {
                request_id: id,
                response: None,
            })
            .await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains(&id.to_string()));
    }

    #[tokio::test]
    async fn test_root_certificate_reply() {
        let reply = bridge().handle(OperatorCommand::ProxyRootCertificate).await;
        assert!(reply.success);
        assert!(reply
            .certificate_pem
            .unwrap()
            .starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn test_records_and_clear() {
        let bridge = bridge();
        let reply = bridge.handle(OperatorCommand::ProxyRecords).await;
        assert_eq!(reply.records.map(|r| r.len()), Some(0));

        let reply = bridge.handle(OperatorCommand::ProxyClearRecords).await;
        assert_eq!(reply, CommandReply::ok());
    }

    /// Park a request, then release it with the id taken from its event.
    async fn release_from_event(response: &str) -> Release {
        let (events, mut events_rx) = create_event_channel();
        let controller = Arc::new(ProxyController::new(
            Arc::new(CertificateAuthority::new()),
            events,
        ));
        let bridge = OperatorBridge::new(controller.clone());

        let request = RequestSnapshot {
            method: "GET".to_string(),
            url: "https://test.local/api".to_string(),
            headers: vec![],
            body: Bytes::new(),
        };
        let pending = controller.queue().enqueue(
            InterceptedTransaction::request(1, &request),
            Duration::from_secs(30),
        );

        let event = serde_json::to_value(events_rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["event"], "intercepted-request");
        assert_eq!(event["url"], "https://test.local/api");
        let id = event["correlationId"].as_str().unwrap().to_string();

        let line = format!(
            r#"{{"type":"proxy-respond","requestId":"{}","response":{}}}"#,
            id, response
        );
        let reply = bridge.handle_line(&line).await;
        assert!(reply.success, "{:?}", reply.error);

        pending.wait().await
    }

    #[tokio::test]
    async fn test_respond_with_header_map() {
        let release = release_from_event(r#"{"headers":{"X-Test":"1"}}"#).await;
        let Release::Forward(Some(edit)) = release else {
            unreachable!("Expected an edited release, got {:?}", release);
        };
        assert_eq!(edit.headers, Some(vec![Header::new("X-Test", "1")]));
    }

    #[tokio::test]
    async fn test_respond_with_header_list() {
        let release =
            release_from_event(r#"{"headers":[{"name":"X-Test","value":"1"}],"body":"aGk="}"#)
                .await;
        let Release::Forward(Some(edit)) = release else {
            unreachable!("Expected an edited release, got {:?}", release);
        };
        assert_eq!(edit.headers, Some(vec![Header::new("X-Test", "1")]));
        assert_eq!(edit.body.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn test_session_over_pipes() {
        let (events, events_rx) = create_event_channel();
        let controller = Arc::new(ProxyController::new(
            Arc::new(CertificateAuthority::new()),
            events,
        ));
        let bridge = OperatorBridge::new(controller.clone());

        let (mut operator_in, bridge_in) = tokio::io::duplex(64 * 1024);
        let (bridge_out, operator_out) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(bridge.run(bridge_in, bridge_out, events_rx));

        let mut replies = BufReader::new(operator_out).lines();

        operator_in
            .write_all(b"{\"type\":\"proxy-start\",\"config\":{\"port\":0}}\n")
            .await
            .unwrap();

        // State events and the reply may interleave; find the reply
        let mut port = None;
        while port.is_none() {
            let line = replies.next_line().await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            if value.get("event").is_none() {
                assert_eq!(value["success"], true);
                port = value["port"].as_u64();
            }
        }
        assert_eq!(controller.local_addr().map(|a| a.port() as u64), port);

        operator_in.write_all(b"{\"type\":\"proxy-stop\"}\n").await.unwrap();
        drop(operator_in);

        session.await.unwrap().unwrap();
        assert!(controller.local_addr().is_none());
    }
}
