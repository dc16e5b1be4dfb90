use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current wire-contract version. Bump whenever a field changes meaning so
/// older workers reject the payload instead of misreading it.
pub const SCHEMA_VERSION: u32 = 1;

/// The message published to the durable queue for each prediction job.
///
/// `attempt_count` is informational only; the queue's own delivery count is
/// authoritative for retry limits.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct QueueMessage {
    #[garde(range(min = 1))]
    pub schema_version: u32,

    #[garde(skip)]
    pub job_id: Uuid,

    #[garde(length(min = 1, max = 1024))]
    pub input_key: String,

    #[garde(skip)]
    pub attempt_count: u32,
}

impl QueueMessage {
    pub fn new(job_id: Uuid, input_key: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            job_id,
            input_key: input_key.into(),
            attempt_count: 0,
        }
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Strict decode of a received payload.
    ///
    /// The version tag is inspected before deserializing the full contract so
    /// a payload from a newer producer is reported as `UnknownVersion` even
    /// when its field set no longer matches ours.
    pub fn decode(raw: &str) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| MessageError::Invalid("missing schema_version".to_string()))?;
        if version != u64::from(SCHEMA_VERSION) {
            let job_id = value
                .get("job_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            return Err(MessageError::UnknownVersion {
                found: version as u32,
                job_id,
            });
        }
        let msg: QueueMessage = serde_json::from_value(value)?;
        msg.validate()
            .map_err(|e| MessageError::Invalid(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("unparsable message payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown schema_version {found}")]
    UnknownVersion { found: u32, job_id: Option<Uuid> },

    #[error("message failed validation: {0}")]
    Invalid(String),
}

impl MessageError {
    /// Job id salvaged from the payload, if the parse got that far. Lets the
    /// worker fail the job record when dead-lettering a poison message.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            MessageError::UnknownVersion { job_id, .. } => *job_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let msg = QueueMessage::new(Uuid::new_v4(), "inputs/abc.csv");
        let decoded = QueueMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn unknown_version_is_rejected_with_job_id() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"schema_version":99,"job_id":"{id}","input_key":"inputs/x.csv","attempt_count":0}}"#
        );
        let err = QueueMessage::decode(&raw).unwrap_err();
        match err {
            MessageError::UnknownVersion { found, job_id } => {
                assert_eq!(found, 99);
                assert_eq!(job_id, Some(id));
            }
            other => panic!("expected UnknownVersion, got {other:?}"),
        }
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(
            QueueMessage::decode("not json at all"),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn empty_input_key_fails_validation() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"schema_version":1,"job_id":"{id}","input_key":"","attempt_count":0}}"#
        );
        assert!(matches!(
            QueueMessage::decode(&raw),
            Err(MessageError::Invalid(_))
        ));
    }

    #[test]
    fn missing_field_is_malformed_not_defaulted() {
        let raw = r#"{"schema_version":1,"input_key":"inputs/x.csv"}"#;
        assert!(matches!(
            QueueMessage::decode(raw),
            Err(MessageError::Malformed(_))
        ));
    }
}
