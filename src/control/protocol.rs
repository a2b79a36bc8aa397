//! Message types exchanged with the operator.
//!
//! - Proxy -> operator: [`ProxyEvent`] (paused transactions, cancellations,
//!   finished exchanges, lifecycle changes)
//! - Operator -> proxy: [`OperatorCommand`], each answered by one
//!   [`CommandReply`]
//!
//! # Wire Format
//!
//! One JSON object per line. Events carry an `event` tag, commands a `type`
//! tag, replies neither:
//!
//! ```text
//! -> {"type":"proxy-start","config":{"port":8181,"interceptEnabled":true}}
//! <- {"success":true,"port":8181}
//! <- {"event":"intercepted-request","correlationId":"...","method":"GET",...}
//! -> {"type":"proxy-respond","requestId":"...","response":{"headers":{"X-Test":"1"}}}
//! <- {"success":true}
//! <- {"event":"traffic-record","id":"...",...}
//! ```

use crate::proxy::{
    EditedPayload, InterceptedTransaction, ProxyConfig, ProxyState, TrafficRecord,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the proxy to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProxyEvent {
    /// A request or response is paused awaiting a decision.
    InterceptedRequest(InterceptedTransaction),

    /// A paused transaction left the queue without an operator decision.
    #[serde(rename_all = "camelCase")]
    InterceptionCancelled {
        /// Correlation id of the cancelled transaction.
        request_id: Uuid,
        /// Why it was cancelled (timeout, client disconnect, ...).
        reason: String,
    },

    /// An exchange finished.
    TrafficRecord(Box<TrafficRecord>),

    /// The controller changed state.
    ProxyState {
        /// New state.
        state: ProxyState,
    },
}

/// Commands sent from the operator to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OperatorCommand {
    /// Start (or restart) the proxy.
    ProxyStart {
        /// Settings for the new instance.
        #[serde(default)]
        config: ProxyConfig,
    },

    /// Stop the proxy.
    ProxyStop,

    /// Replace the settings of the running proxy.
    ProxyUpdateConfig {
        /// New settings.
        config: ProxyConfig,
    },

    /// Release a paused transaction.
    #[serde(rename_all = "camelCase")]
    ProxyRespond {
        /// Correlation id from the `intercepted-request` event.
        request_id: Uuid,
        /// Edits to apply, or null to forward unchanged.
        #[serde(default)]
        response: Option<EditedPayload>,
    },

    /// Drop a paused transaction without forwarding it.
    #[serde(rename_all = "camelCase")]
    ProxyDrop {
        /// Correlation id from the `intercepted-request` event.
        request_id: Uuid,
    },

    /// List paused transactions.
    ProxyPending,

    /// Fetch retained traffic records.
    ProxyRecords,

    /// Drop retained traffic records.
    ProxyClearRecords,

    /// Fetch the root certificate PEM for installation.
    ProxyRootCertificate,
}

/// Reply to one [`OperatorCommand`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    /// Whether the command succeeded.
    pub success: bool,

    /// Bound port, for `proxy-start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Records, for `proxy-records`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<TrafficRecord>>,

    /// Paused transactions, for `proxy-pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<InterceptedTransaction>>,

    /// Root certificate, for `proxy-root-certificate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_pem: Option<String>,
}

impl CommandReply {
    /// A bare success.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A failure with a message.
    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_command() {
        let cmd: OperatorCommand = serde_json::from_str(
            r#"{"type":"proxy-start","config":{"port":8181,"interceptEnabled":true}}"#,
        )
        .unwrap();

        match cmd {
            OperatorCommand::ProxyStart { config } => {
                assert_eq!(config.port, 8181);
                assert!(config.intercept_enabled);
            }
            other => unreachable!("Expected ProxyStart, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_respond_with_null_response() {
        let id = Uuid::new_v4();
        let line = format!(
            r#"{{"type":"proxy-respond","requestId":"{}","response":null}}"#,
            id
        );
        let cmd: OperatorCommand = serde_json::from_str(&line).unwrap();

        match cmd {
            OperatorCommand::ProxyRespond {
                request_id,
                response,
            } => {
                assert_eq!(request_id, id);
                assert!(response.is_none());
            }
            other => unreachable!("Expected ProxyRespond, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unit_commands() {
        let cmd: OperatorCommand = serde_json::from_str(r#"{"type":"proxy-stop"}"#).unwrap();
        assert!(matches!(cmd, OperatorCommand::ProxyStop));

        let cmd: OperatorCommand =
            serde_json::from_str(r#"{"type":"proxy-clear-records"}"#).unwrap();
        assert!(matches!(cmd, OperatorCommand::ProxyClearRecords));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let result: Result<OperatorCommand, _> =
            serde_json::from_str(r#"{"type":"proxy-explode"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_reply_omits_empty_fields() {
        let json = serde_json::to_string(&CommandReply {
            port: Some(8181),
            ..CommandReply::ok()
        })
        .unwrap();
        assert_eq!(json, r#"{"success":true,"port":8181}"#);

        let json = serde_json::to_string(&CommandReply::failure("boom")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"boom"}"#);
    }

    #[test]
    fn test_cancelled_event_shape() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(ProxyEvent::InterceptionCancelled {
            request_id: id,
            reason: "timed out".to_string(),
        })
        .unwrap();

        assert_eq!(json["event"], "interception-cancelled");
        assert_eq!(json["requestId"], id.to_string());
    }

    #[test]
    fn test_intercepted_event_shape() {
        let request = crate::proxy::RequestSnapshot {
            method: "GET".to_string(),
            url: "https://test.local/api".to_string(),
            headers: vec![crate::proxy::Header::new("X-Test", "1")],
            body: bytes::Bytes::from_static(b"hi"),
        };
        let transaction = InterceptedTransaction::request(7, &request);
        let json =
            serde_json::to_value(ProxyEvent::InterceptedRequest(transaction.clone())).unwrap();

        assert_eq!(json["event"], "intercepted-request");
        assert_eq!(json["correlationId"], transaction.id.to_string());
        assert!(json.get("id").is_none());
        assert_eq!(json["connectionId"], 7);
        assert_eq!(json["headers"][0]["name"], "X-Test");
        assert_eq!(json["body"], "aGk=");
    }

    #[test]
    fn test_state_event_shape() {
        let json = serde_json::to_value(ProxyEvent::ProxyState {
            state: ProxyState::Listening,
        })
        .unwrap();
        assert_eq!(json["event"], "proxy-state");
        assert_eq!(json["state"], "listening");
    }
}
