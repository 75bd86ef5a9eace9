//! Wire messages exchanged with clients.
//!
//! Every message is a JSON object discriminated by its `msg` field. The codec
//! itself is plain `serde_json`; framing belongs to the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorBody, MethodError};
use crate::ids::{CallId, ConnectionId, SubscriptionId};

/// Protocol versions this server speaks, most preferred first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1", "pre2", "pre1"];

/// Inbound message decoded from a client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Protocol handshake.
    Connect {
        /// Version the client proposes.
        version: String,
        /// All versions the client can speak, in preference order.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        support: Vec<String>,
    },
    /// Remote method invocation.
    Method {
        /// Call identifier echoed in the reply.
        id: CallId,
        /// Method name.
        method: String,
        /// Positional arguments.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        params: Vec<Value>,
        /// Seed for deterministic side effects, shared with the client.
        #[serde(
            default,
            rename = "randomSeed",
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
    },
    /// Open a subscription.
    Sub {
        /// Client-chosen subscription id.
        id: SubscriptionId,
        /// Publication name.
        name: String,
        /// Positional arguments.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        params: Vec<Value>,
    },
    /// Close a subscription.
    Unsub {
        /// Subscription to stop.
        id: SubscriptionId,
    },
    /// Liveness probe.
    Ping {
        /// Optional id echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Reply to a server ping.
    Pong {
        /// Id of the ping being answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, MethodError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| MethodError::protocol(format!("Bad request: {e}")))?;
        if !value.is_object() {
            return Err(MethodError::protocol("Bad request: message must be an object"));
        }
        if value.get("msg").and_then(Value::as_str).is_none() {
            return Err(MethodError::protocol("Bad request: missing 'msg'"));
        }
        serde_json::from_value(value).map_err(|e| MethodError::protocol(format!("Bad request: {e}")))
    }

    /// Short kind tag used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Method { .. } => "method",
            Self::Sub { .. } => "sub",
            Self::Unsub { .. } => "unsub",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Outbound message sent to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected {
        /// Id of the new connection.
        session: ConnectionId,
    },
    /// Handshake rejected; carries the version the server would accept.
    Failed {
        /// Suggested protocol version.
        version: String,
    },
    /// Method reply.
    Result {
        /// Call this reply answers.
        id: CallId,
        /// Return value on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// Subscriptions that have delivered their initial result set.
    Ready {
        /// Ready subscription ids.
        subs: Vec<SubscriptionId>,
    },
    /// Subscription terminated.
    Nosub {
        /// Stopped subscription.
        id: SubscriptionId,
        /// Error that stopped it, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// Protocol-level error.
    Error {
        /// What went wrong.
        reason: String,
        /// The message that caused it, when it could be decoded.
        #[serde(
            default,
            rename = "offendingMessage",
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },
    /// Liveness probe.
    Ping {
        /// Optional id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Reply to a client ping.
    Pong {
        /// Echoed ping id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ServerMessage {
    /// Build a method reply from a dispatch outcome.
    pub fn method_result(id: CallId, outcome: &Result<Value, MethodError>) -> Self {
        match outcome {
            Ok(value) => Self::Result {
                id,
                result: Some(value.clone()),
                error: None,
            },
            Err(err) => Self::Result {
                id,
                result: None,
                error: Some(err.to_error_body()),
            },
        }
    }

    /// Build a `nosub` for a subscription that stopped, optionally with an error.
    pub fn nosub(id: SubscriptionId, error: Option<&MethodError>) -> Self {
        Self::Nosub {
            id,
            error: error.map(MethodError::to_error_body),
        }
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Pick the protocol version to speak with a client.
///
/// The first entry of `support` that the server also speaks wins. A client
/// that sent no `support` list is accepted when its `version` is supported.
pub fn negotiate_version(version: &str, support: &[String]) -> Option<&'static str> {
    if support.is_empty() {
        return SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .copied()
            .find(|v| *v == version);
    }
    support.iter().find_map(|candidate| {
        SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .copied()
            .find(|v| v == candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_method_message() {
        let msg = ClientMessage::parse(
            r#"{"msg":"method","id":"1","method":"echo","params":["a",2],"randomSeed":"s"}"#,
        )
        .unwrap();
        assert_matches!(msg, ClientMessage::Method { id, method, params, random_seed } => {
            assert_eq!(id.as_str(), "1");
            assert_eq!(method, "echo");
            assert_eq!(params, vec![json!("a"), json!(2)]);
            assert_eq!(random_seed.as_deref(), Some("s"));
        });
    }

    #[test]
    fn parse_method_without_params() {
        let msg = ClientMessage::parse(r#"{"msg":"method","id":"2","method":"ping"}"#).unwrap();
        assert_matches!(msg, ClientMessage::Method { params, random_seed: None, .. } => {
            assert!(params.is_empty());
        });
    }

    #[test]
    fn parse_sub_and_unsub() {
        let sub = ClientMessage::parse(r#"{"msg":"sub","id":"s1","name":"feed","params":[1]}"#)
            .unwrap();
        assert_eq!(sub.kind(), "sub");
        let unsub = ClientMessage::parse(r#"{"msg":"unsub","id":"s1"}"#).unwrap();
        assert_matches!(unsub, ClientMessage::Unsub { id } if id.as_str() == "s1");
    }

    #[test]
    fn parse_connect_with_support() {
        let msg =
            ClientMessage::parse(r#"{"msg":"connect","version":"1","support":["1","pre2"]}"#)
                .unwrap();
        assert_matches!(msg, ClientMessage::Connect { version, support } => {
            assert_eq!(version, "1");
            assert_eq!(support.len(), 2);
        });
    }

    #[test]
    fn parse_rejects_invalid_json() {
        let err = ClientMessage::parse("not json").unwrap_err();
        assert_matches!(err, MethodError::Protocol { .. });
    }

    #[test]
    fn parse_rejects_non_object() {
        let err = ClientMessage::parse("[1,2]").unwrap_err();
        assert!(err.to_string().contains("object"));
    }

    #[test]
    fn parse_rejects_missing_msg() {
        let err = ClientMessage::parse(r#"{"id":"1"}"#).unwrap_err();
        assert!(err.to_string().contains("msg"));
    }

    #[test]
    fn parse_rejects_unknown_msg() {
        let err = ClientMessage::parse(r#"{"msg":"teleport"}"#).unwrap_err();
        assert_eq!(err.code(), crate::errors::PROTOCOL_ERROR);
    }

    #[test]
    fn parse_rejects_method_without_name() {
        assert!(ClientMessage::parse(r#"{"msg":"method","id":"1"}"#).is_err());
    }

    #[test]
    fn result_success_encoding() {
        let msg = ServerMessage::method_result(CallId::from("7"), &Ok(json!("hi")));
        let v: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(v["msg"], "result");
        assert_eq!(v["id"], "7");
        assert_eq!(v["result"], "hi");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn result_error_encoding_is_sanitized() {
        let msg = ServerMessage::method_result(
            CallId::from("8"),
            &Err(MethodError::internal("secret path /etc/shadow")),
        );
        let text = msg.encode().unwrap();
        assert!(!text.contains("/etc/shadow"));
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["error"]["error"], "INTERNAL_ERROR");
    }

    #[test]
    fn ready_and_nosub_encoding() {
        let ready = ServerMessage::Ready {
            subs: vec![SubscriptionId::from("a")],
        };
        let v = serde_json::to_value(&ready).unwrap();
        assert_eq!(v, json!({"msg": "ready", "subs": ["a"]}));

        let nosub = ServerMessage::nosub(SubscriptionId::from("a"), None);
        let v = serde_json::to_value(&nosub).unwrap();
        assert_eq!(v, json!({"msg": "nosub", "id": "a"}));
    }

    #[test]
    fn protocol_error_encoding() {
        let msg = ServerMessage::Error {
            reason: "Bad request".into(),
            offending_message: Some(json!({"msg": "sub"})),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["msg"], "error");
        assert_eq!(v["offendingMessage"]["msg"], "sub");
    }

    #[test]
    fn negotiate_prefers_client_order() {
        let support = vec!["pre2".to_owned(), "1".to_owned()];
        assert_eq!(negotiate_version("pre2", &support), Some("pre2"));
    }

    #[test]
    fn negotiate_skips_unknown_versions() {
        let support = vec!["99".to_owned(), "1".to_owned()];
        assert_eq!(negotiate_version("99", &support), Some("1"));
    }

    #[test]
    fn negotiate_bare_version() {
        assert_eq!(negotiate_version("1", &[]), Some("1"));
        assert_eq!(negotiate_version("0.9", &[]), None);
    }
}
