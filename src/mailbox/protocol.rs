//! Wire types for the drop-box protocol.
//!
//! Requests and responses are whole JSON files exchanged through the
//! mailbox directory tree. Parsing is two-stage: even when the typed parse
//! fails, the correlation ids are salvaged from the raw JSON so an error
//! response can still reach the client.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::envelope::now_ms;
use crate::error::Error;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    Publish,
    ConsumeNext,
    Ack,
    Nack,
    ExtendLease,
    Status,
    Health,
    Metrics,
    ListDlq,
    ReprocessDlq,
}

#[derive(Debug, Deserialize)]
pub struct MailboxRequest {
    pub request_id: String,
    pub client_id: String,
    pub command: Command,
    #[serde(default)]
    pub queue: Option<String>,
    /// Opaque payload; producers may embed a JSON object or a string.
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub attributes: Option<Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub delay_ms: Option<i64>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub requeue: Option<bool>,
    #[serde(default)]
    pub visibility_timeout_sec: Option<u32>,
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default)]
    pub up_to: Option<u32>,
}

impl MailboxRequest {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let request: Self = serde_json::from_str(raw)
            .map_err(|e| Error::invalid_request(format!("malformed request: {e}")))?;
        if request.request_id.is_empty() {
            return Err(Error::invalid_request("request_id must not be empty"));
        }
        if request.client_id.is_empty() {
            return Err(Error::invalid_request("client_id must not be empty"));
        }
        Ok(request)
    }

    pub fn require_queue(&self) -> Result<&str, Error> {
        self.queue
            .as_deref()
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::invalid_request("missing required field 'queue'"))
    }

    pub fn require_consumer_id(&self) -> Result<&str, Error> {
        self.consumer_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::invalid_request("missing required field 'consumer_id'"))
    }

    pub fn require_lease_id(&self) -> Result<&str, Error> {
        self.lease_id
            .as_deref()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::invalid_request("missing required field 'lease_id'"))
    }

    pub fn require_requeue(&self) -> Result<bool, Error> {
        self.requeue
            .ok_or_else(|| Error::invalid_request("missing required field 'requeue'"))
    }

    pub fn require_visibility_timeout(&self) -> Result<u32, Error> {
        self.visibility_timeout_sec.ok_or_else(|| {
            Error::invalid_request("missing required field 'visibility_timeout_sec'")
        })
    }

    /// Payload as the opaque string the broker stores: JSON strings pass
    /// through unwrapped, other JSON values keep their serialized form.
    pub fn payload_string(&self) -> Result<String, Error> {
        match &self.payload {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(Error::invalid_request("missing required field 'payload'")),
        }
    }

    pub fn attributes_string(&self) -> Option<String> {
        match &self.attributes {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }
}

/// Correlation ids pulled out of a request that failed the typed parse.
#[derive(Debug, Default)]
pub struct SalvagedIds {
    pub request_id: Option<String>,
    pub client_id: Option<String>,
}

pub fn salvage_ids(raw: &str) -> SalvagedIds {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return SalvagedIds::default();
    };
    let get = |field: &str| {
        value
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };
    SalvagedIds {
        request_id: get("request_id"),
        client_id: get("client_id"),
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MailboxResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub server_time_ms: i64,
}

impl MailboxResponse {
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            error: None,
            data: Some(data),
            server_time_ms: now_ms(),
        }
    }

    pub fn failure(request_id: impl Into<String>, error: &Error) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            error: Some(ErrorBody {
                code: error.code().to_owned(),
                message: error.to_string(),
            }),
            data: None,
            server_time_ms: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn commands_parse_from_snake_case() {
        assert_eq!(Command::from_str("publish").unwrap(), Command::Publish);
        assert_eq!(
            Command::from_str("consume_next").unwrap(),
            Command::ConsumeNext
        );
        assert_eq!(
            Command::from_str("reprocess_dlq").unwrap(),
            Command::ReprocessDlq
        );
        assert!(Command::from_str("subscribe").is_err());
    }

    #[test]
    fn full_publish_request_parses() {
        let request = MailboxRequest::parse(
            r#"{
                "request_id": "req-1",
                "client_id": "producer-a",
                "command": "publish",
                "queue": "orders",
                "payload": {"sku": "x"},
                "priority": 2,
                "delay_ms": 500
            }"#,
        )
        .unwrap();
        assert_eq!(request.command, Command::Publish);
        assert_eq!(request.require_queue().unwrap(), "orders");
        assert_eq!(request.payload_string().unwrap(), r#"{"sku":"x"}"#);
        assert_eq!(request.priority, Some(2));
        assert_eq!(request.delay_ms, Some(500));
    }

    #[test]
    fn string_payload_passes_through_unwrapped() {
        let request = MailboxRequest::parse(
            r#"{"request_id":"r","client_id":"c","command":"publish","queue":"q","payload":"raw-text"}"#,
        )
        .unwrap();
        assert_eq!(request.payload_string().unwrap(), "raw-text");
    }

    #[test]
    fn unknown_command_is_invalid_request() {
        let err = MailboxRequest::parse(
            r#"{"request_id":"r","client_id":"c","command":"subscribe"}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let request = MailboxRequest::parse(
            r#"{"request_id":"r","client_id":"c","command":"ack"}"#,
        )
        .unwrap();
        assert!(request.require_lease_id().is_err());
        assert!(request.require_requeue().is_err());
    }

    #[test]
    fn ids_are_salvaged_from_a_request_that_fails_typed_parse() {
        let ids = salvage_ids(
            r#"{"request_id":"req-9","client_id":"c-3","command":"not_a_command"}"#,
        );
        assert_eq!(ids.request_id.as_deref(), Some("req-9"));
        assert_eq!(ids.client_id.as_deref(), Some("c-3"));
    }

    #[test]
    fn nothing_is_salvaged_from_non_json() {
        let ids = salvage_ids("not json at all");
        assert!(ids.request_id.is_none());
        assert!(ids.client_id.is_none());
    }

    #[test]
    fn error_response_carries_wire_code() {
        let response =
            MailboxResponse::failure("req-1", &Error::conflict("duplicate key 'k'"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "conflict");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn success_response_omits_error() {
        let response = MailboxResponse::success("req-2", serde_json::json!({"message_id": "m"}));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json.get("error").is_none());
        assert_eq!(json["data"]["message_id"], "m");
    }
}
