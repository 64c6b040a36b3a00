use serde::{Deserialize, Serialize};

pub type Bytes = Vec<u8>;
pub type JobId = String;

/// Why a job was moved to the dead-letter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    PermanentError,
    MaxRetries,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::PermanentError => "permanent_error",
            DeadLetterReason::MaxRetries => "max_retries",
        }
    }
}

/// Trace context captured at enqueue time (§4.6). Reconstructed at dequeue
/// as a span *link*, never a parent -- see `crate::trace`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_flags: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
}

/// The JSON envelope written to `body`/`jobs.body`. Opaque to storage; only
/// the worker decodes it. Canonical field casing is lower-case (see
/// SPEC_FULL.md §6) -- the upper-case `Name`/`Message` variant that the
/// distilled spec's dedup path originally used is rejected as a decode
/// error rather than silently accepted, so a single queue never has to
/// speak two casings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    /// Base64-encoded serializer output, round-tripped through the `Bytes`
    /// the caller handed the worker.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl Envelope {
    pub fn new(name: impl Into<String>, message: &[u8], trace: Option<TraceContext>) -> Self {
        use base64::Engine;
        Self {
            name: name.into(),
            message: base64::engine::general_purpose::STANDARD.encode(message),
            trace,
        }
    }

    pub fn message_bytes(&self) -> Result<Bytes, crate::error::JobError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.message)
            .map_err(|e| crate::error::JobError::EnvelopeDecode(e.to_string()))
    }

    /// Parses and validates an envelope's bytes, enforcing the canonical
    /// casing decision: a payload carrying the upper-case `Name`/`Message`
    /// fields (and not the canonical ones) is rejected rather than silently
    /// accepted under the other casing.
    pub fn decode(body: &[u8]) -> Result<Self, crate::error::JobError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| crate::error::JobError::EnvelopeDecode(e.to_string()))?;

        if value.get("name").is_none() {
            if value.get("Name").is_some() {
                return Err(crate::error::JobError::EnvelopeDecode(
                    "envelope uses upper-case field names; this queue requires lower-case \
                     `name`/`message`/`trace`"
                        .to_string(),
                ));
            }
            return Err(crate::error::JobError::MissingName);
        }

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| crate::error::JobError::EnvelopeDecode(e.to_string()))?;

        if envelope.name.is_empty() {
            return Err(crate::error::JobError::MissingName);
        }

        Ok(envelope)
    }

    pub fn encode(&self) -> Bytes {
        // Constructed from validated fields, so this can't fail.
        serde_json::to_vec(self).expect("envelope always serializes")
    }

    /// Extracts just the task name from raw bytes, without fully
    /// deserializing -- used by the dedup queue's `send`, which needs the
    /// name to resolve a namespace before it can attempt the insert.
    pub fn peek_name(body: &[u8]) -> Result<String, crate::error::JobError> {
        Self::decode(body).map(|e| e.name)
    }
}

/// A live job as returned by `receive`. Shared shape between the plain and
/// dedup queue backends; the dedup backend additionally tracks `ns_id` and
/// `key` internally but surfaces the same record to the worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub body: Bytes,
    pub received: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_lowercase_envelope() {
        let trace = Some(TraceContext {
            trace_id: "a".repeat(32),
            span_id: "b".repeat(16),
            trace_flags: Some(1),
            trace_state: None,
        });
        let env = Envelope::new("my-task", b"hello world", trace.clone());
        let bytes = env.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.name, "my-task");
        assert_eq!(decoded.message_bytes().unwrap(), b"hello world");
        assert_eq!(decoded.trace, trace);
    }

    #[test]
    fn rejects_uppercase_envelope() {
        let bytes = br#"{"Name":"job","Message":"cGF5bG9hZA=="}"#;
        let err = Envelope::decode(bytes).unwrap_err();
        assert!(matches!(err, crate::error::JobError::EnvelopeDecode(_)));
    }

    #[test]
    fn missing_name_is_an_error() {
        let bytes = br#"{"message":"cGF5bG9hZA=="}"#;
        let err = Envelope::decode(bytes).unwrap_err();
        assert!(matches!(
            err,
            crate::error::JobError::EnvelopeDecode(_) | crate::error::JobError::MissingName
        ));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let err = Envelope::decode(b"not-json").unwrap_err();
        assert!(err.to_string().contains("decode message envelope"));
    }

    #[test]
    fn missing_name_field_message_mentions_missing_name() {
        let bytes = br#"{"message":"cGF5bG9hZA=="}"#;
        let err = Envelope::decode(bytes).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("missing name"));
    }
}
