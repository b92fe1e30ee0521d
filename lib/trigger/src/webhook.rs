//! Webhook deliveries and the triggers that receive them.

use chrono::{DateTime, Utc};
use flowgate_core::{TriggerId, WorkflowVersionId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Header that lets a sender name its own deduplication key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// One inbound HTTP delivery, independent of any web framework.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub method: String,
    /// Header names are stored lowercase.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub remote_addr: Option<IpAddr>,
    pub received_at: DateTime<Utc>,
}

impl WebhookRequest {
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: Vec::new(),
            remote_addr: None,
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and its content type.
    #[must_use]
    pub fn with_json(self, body: &JsonValue) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    #[must_use]
    pub fn from_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn declares_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }

    /// The body as JSON. Non-JSON bodies become a string; an empty body is
    /// `null`.
    ///
    /// # Errors
    ///
    /// Returns the parse error when the request declares a JSON content
    /// type but the body is not valid JSON.
    pub fn parsed_body(&self) -> Result<JsonValue, serde_json::Error> {
        if self.body.is_empty() {
            return Ok(JsonValue::Null);
        }
        match serde_json::from_slice(&self.body) {
            Ok(value) => Ok(value),
            Err(e) if self.declares_json() => Err(e),
            Err(_) => Ok(JsonValue::String(
                String::from_utf8_lossy(&self.body).into_owned(),
            )),
        }
    }

    /// The trigger payload snapshot stored on the run.
    #[must_use]
    pub fn snapshot(&self, body: JsonValue) -> JsonValue {
        json!({
            "method": self.method,
            "headers": self.headers,
            "query": self.query,
            "body": body,
        })
    }
}

/// How a webhook proves who sent it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    /// A shared secret carried verbatim in a header.
    Header {
        name: String,
        value: String,
    },
    /// HMAC-SHA256 of the raw body, hex encoded, in `header`.
    Signature {
        header: String,
        secret: String,
        /// Prefix before the hex digest, such as `sha256=`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

/// When the webhook answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseMode {
    /// Answer `202` as soon as the run exists.
    #[default]
    Immediate,
    /// Wait for the run to finish, up to the timeout.
    Synchronous {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
}

/// Custom pieces of a successful response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTemplate {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// A webhook bound to one workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTrigger {
    pub id: TriggerId,
    pub version_id: WorkflowVersionId,
    /// Acknowledge crawler traffic without starting a run.
    #[serde(default)]
    pub filter_bots: bool,
    /// Origins allowed to call. Empty allows everyone.
    #[serde(default)]
    pub ip_allow_list: Vec<IpAddr>,
    #[serde(default)]
    pub auth: WebhookAuth,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default)]
    pub response: ResponseTemplate,
}

impl WebhookTrigger {
    #[must_use]
    pub fn new(version_id: WorkflowVersionId) -> Self {
        Self {
            id: TriggerId::new(),
            version_id,
            filter_bots: false,
            ip_allow_list: Vec::new(),
            auth: WebhookAuth::None,
            response_mode: ResponseMode::Immediate,
            response: ResponseTemplate::default(),
        }
    }

    #[must_use]
    pub fn with_bot_filter(mut self) -> Self {
        self.filter_bots = true;
        self
    }

    #[must_use]
    pub fn with_allow_list(mut self, allow_list: Vec<IpAddr>) -> Self {
        self.ip_allow_list = allow_list;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: WebhookAuth) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: ResponseTemplate) -> Self {
        self.response = response;
        self
    }
}

/// What the webhook answers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: JsonValue,
}

impl WebhookResponse {
    #[must_use]
    pub fn new(status: u16, body: JsonValue) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Applies a trigger's custom status, body and headers.
    #[must_use]
    pub fn customized(mut self, template: &ResponseTemplate) -> Self {
        if let Some(status) = template.status {
            self.status = status;
        }
        if let Some(body) = &template.body {
            self.body = body.clone();
        }
        self.headers
            .extend(template.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let request = WebhookRequest::new("POST").with_header("X-Signature", "abc");
        assert_eq!(request.header("x-signature"), Some("abc"));
        assert_eq!(request.header("X-SIGNATURE"), Some("abc"));
    }

    #[test]
    fn non_json_bodies_are_kept_as_text() {
        let request = WebhookRequest::new("POST").with_body("name=ada");
        assert_eq!(request.parsed_body().expect("body"), json!("name=ada"));
    }

    #[test]
    fn declared_json_must_parse() {
        let request = WebhookRequest::new("POST")
            .with_header("Content-Type", "application/json")
            .with_body("{not json");
        assert!(request.parsed_body().is_err());
    }

    #[test]
    fn snapshot_carries_request_parts() {
        let request = WebhookRequest::new("POST")
            .with_query("source", "crm")
            .with_json(&json!({"id": 1}));
        let body = request.parsed_body().expect("body");
        let snapshot = request.snapshot(body);
        assert_eq!(snapshot["method"], json!("POST"));
        assert_eq!(snapshot["query"]["source"], json!("crm"));
        assert_eq!(snapshot["body"]["id"], json!(1));
        assert_eq!(snapshot["headers"]["content-type"], json!("application/json"));
    }

    #[test]
    fn trigger_config_deserializes_with_defaults() {
        let trigger: WebhookTrigger = serde_json::from_value(json!({
            "id": TriggerId::new(),
            "version_id": WorkflowVersionId::new(),
            "ip_allow_list": ["10.0.0.1"],
            "auth": {"type": "signature", "header": "X-Sig", "secret": "s", "prefix": "sha256="},
            "response_mode": {"type": "synchronous", "timeout_seconds": 5},
        }))
        .expect("deserialize");
        assert!(!trigger.filter_bots);
        assert_eq!(trigger.ip_allow_list.len(), 1);
        assert!(matches!(trigger.auth, WebhookAuth::Signature { .. }));
        assert_eq!(
            trigger.response_mode,
            ResponseMode::Synchronous {
                timeout_seconds: Some(5)
            }
        );
    }

    #[test]
    fn custom_response_overrides_defaults() {
        let template = ResponseTemplate {
            status: Some(200),
            body: Some(json!({"ok": true})),
            headers: BTreeMap::from([("x-handled-by".to_string(), "flowgate".to_string())]),
        };
        let response = WebhookResponse::new(202, json!({})).customized(&template);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"ok": true}));
        assert_eq!(response.headers.get("x-handled-by").map(String::as_str), Some("flowgate"));
    }
}
