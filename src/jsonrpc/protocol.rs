//! JSON-RPC 2.0 envelope types for the MakerBot dialect.
//!
//! Requests carry `{"id", "jsonrpc": "2.0", "method", "params"}`; responses
//! carry `id` plus `result` or `error`; server-initiated notifications carry
//! only `{"method", "params"}`. Inbound messages are first decoded with the
//! response shape, and fall back to the notification shape when `id`,
//! `result`, and `error` are all absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The only protocol version this dialect speaks.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Outbound request envelope.
#[derive(Debug, Serialize)]
pub(crate) struct Request<'a, P: Serialize> {
    pub id: &'a str,
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: P,
}

impl<'a, P: Serialize> Request<'a, P> {
    pub fn new(id: &'a str, method: &'a str, params: P) -> Self {
        Self {
            id,
            jsonrpc: PROTOCOL_VERSION,
            method,
            params,
        }
    }
}

/// Empty `params` placeholder; serializes as `{}`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EmptyParams {}

/// Inbound message decoded with the response shape.
///
/// Notifications also parse into this (all fields absent), which is how
/// the dispatcher tells the two apart.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl Response {
    /// True when this message has none of the response markers and should
    /// be re-read as a notification.
    pub fn is_notification_shaped(&self) -> bool {
        self.id.is_none() && self.result.is_none() && self.error.is_none()
    }

    /// True unless the message names a protocol version other than `"2.0"`.
    pub fn version_ok(&self) -> bool {
        match self.jsonrpc.as_deref() {
            Some(v) => v == PROTOCOL_VERSION,
            None => true,
        }
    }
}

/// Server-initiated notification envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Error object carried in an RPC response.
#[derive(Debug, Clone, Deserialize, Error)]
#[error("rpc error (remote): {data}: {message}")]
pub struct RemoteError {
    /// Numeric error code assigned by the printer.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Raw JSON detail payload, `null` when the printer sent none.
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let req = Request::new("abc-123", "ping", EmptyParams {});
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"id": "abc-123", "jsonrpc": "2.0", "method": "ping", "params": {}})
        );
    }

    #[test]
    fn test_request_with_typed_params() {
        #[derive(Serialize)]
        struct P {
            tool_index: i32,
        }
        let req = Request::new("x", "load_filament", P { tool_index: 1 });
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["params"], json!({"tool_index": 1}));
    }

    #[test]
    fn test_response_with_result() {
        let raw = br#"{"id":"X","jsonrpc":"2.0","result":true}"#;
        let resp: Response = serde_json::from_slice(raw).unwrap();
        assert_eq!(resp.id.as_deref(), Some("X"));
        assert_eq!(resp.result, Some(json!(true)));
        assert!(resp.error.is_none());
        assert!(!resp.is_notification_shaped());
        assert!(resp.version_ok());
    }

    #[test]
    fn test_response_with_error() {
        let raw = br#"{"id":"X","jsonrpc":"2.0","error":{"code":-32000,"message":"busy","data":{"step":"printing"}}}"#;
        let resp: Response = serde_json::from_slice(raw).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "busy");
        assert_eq!(err.data, json!({"step": "printing"}));
    }

    #[test]
    fn test_notification_shape_detection() {
        let raw = br#"{"jsonrpc":"2.0","method":"state_notification","params":{"info":{}}}"#;
        let resp: Response = serde_json::from_slice(raw).unwrap();
        assert!(resp.is_notification_shaped());

        let notif: Notification = serde_json::from_slice(raw).unwrap();
        assert_eq!(notif.method, "state_notification");
        assert_eq!(notif.params, json!({"info": {}}));
    }

    #[test]
    fn test_notification_without_params_defaults_null() {
        let raw = br#"{"jsonrpc":"2.0","method":"camera_frame"}"#;
        let notif: Notification = serde_json::from_slice(raw).unwrap();
        assert_eq!(notif.params, Value::Null);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let raw = br#"{"id":"X","jsonrpc":"1.0","result":true}"#;
        let resp: Response = serde_json::from_slice(raw).unwrap();
        assert!(!resp.version_ok());
    }

    #[test]
    fn test_remote_error_display_format() {
        let err = RemoteError {
            code: 5,
            message: "method not found".to_string(),
            data: json!({"method": "frobnicate"}),
        };
        assert_eq!(
            err.to_string(),
            r#"rpc error (remote): {"method":"frobnicate"}: method not found"#
        );
    }

    #[test]
    fn test_remote_error_display_without_data() {
        let err = RemoteError {
            code: 1,
            message: "nope".to_string(),
            data: Value::Null,
        };
        assert_eq!(err.to_string(), "rpc error (remote): null: nope");
    }
}
