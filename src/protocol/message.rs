//! Text message codec
//!
//! Messages are `TYPE[:k1=v1&k2=v2&...]` where `TYPE` is an uppercase ASCII
//! identifier and the parameters are URL-encoded key/value pairs. The codec
//! is intentionally forgiving on parse: an unparseable parameter section is
//! treated as no parameters, and duplicate keys concatenate their values.
//! Emitters never produce duplicates.

use std::collections::HashMap;

use super::constants::*;

/// A parsed (or to-be-serialized) protocol text message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolMessage {
    /// Message type, uppercase
    pub message_type: String,

    /// Message parameters
    pub parameters: HashMap<String, String>,
}

impl ProtocolMessage {
    /// Create a message with no parameters
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            parameters: HashMap::new(),
        }
    }

    /// Create a message with parameters
    pub fn with_parameters(
        message_type: impl Into<String>,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            parameters,
        }
    }

    /// Get a parameter value, or the empty string if absent
    pub fn parameter(&self, key: &str) -> &str {
        self.parameters.get(key).map(String::as_str).unwrap_or("")
    }

    /// `OK` message
    pub fn ok() -> Self {
        Self::new(MSG_TYPE_OK)
    }

    /// `H` heartbeat message
    pub fn heartbeat() -> Self {
        Self::new(MSG_TYPE_HEARTBEAT)
    }

    /// `CLOSE` message
    pub fn close() -> Self {
        Self::new(MSG_TYPE_CLOSE)
    }

    /// `E` message with an error code and a human-readable description
    pub fn error(code: &str, message: &str) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("code".to_string(), code.to_string());
        parameters.insert("message".to_string(), message.to_string());
        Self::with_parameters(MSG_TYPE_ERROR, parameters)
    }

    /// `F` fragment-metadata message; the payload follows as a binary frame
    pub fn fragment(duration: f32) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("duration".to_string(), duration.to_string());
        Self::with_parameters(MSG_TYPE_FRAGMENT, parameters)
    }

    /// `PUSH` opening message
    pub fn push(stream_id: &str, auth: &str) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("stream".to_string(), stream_id.to_string());
        parameters.insert("auth".to_string(), auth.to_string());
        Self::with_parameters(MSG_TYPE_PUSH, parameters)
    }

    /// `PULL` opening message
    pub fn pull(stream_id: &str, auth: &str, only_source: bool) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("stream".to_string(), stream_id.to_string());
        parameters.insert("auth".to_string(), auth.to_string());
        parameters.insert("only_source".to_string(), only_source.to_string());
        Self::with_parameters(MSG_TYPE_PULL, parameters)
    }

    /// Serialize to the wire form
    ///
    /// Emits `TYPE` alone when there are no parameters. Parameter iteration
    /// order is unspecified; parsers do not depend on it.
    pub fn serialize(&self) -> String {
        if self.parameters.is_empty() {
            return self.message_type.clone();
        }

        let mut serializer = form_urlencoded::Serializer::new(String::new());

        for (key, value) in &self.parameters {
            serializer.append_pair(key, value);
        }

        format!("{}:{}", self.message_type, serializer.finish())
    }

    /// Parse a message from its wire form
    ///
    /// The first `:` splits type from parameters. A missing or trailing `:`
    /// means the whole (uppercased) input is the type with no parameters.
    /// Duplicate keys concatenate their values in order of appearance.
    pub fn parse(raw: &str) -> Self {
        let colon = match raw.find(':') {
            Some(i) if i + 1 < raw.len() => i,
            _ => {
                return Self::new(raw.to_uppercase());
            }
        };

        let message_type = raw[..colon].to_uppercase();
        let mut parameters: HashMap<String, String> = HashMap::new();

        for (key, value) in form_urlencoded::parse(raw[colon + 1..].as_bytes()) {
            parameters
                .entry(key.into_owned())
                .or_default()
                .push_str(&value);
        }

        Self {
            message_type,
            parameters,
        }
    }
}

impl std::fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}
