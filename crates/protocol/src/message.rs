use crate::error::{ErrorKind, ProtocolError, Result};
use crate::types::{CredentialRecord, MutateAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every `type` tag the channel understands. Anything else is rejected before
/// variant fields are looked at.
pub const MESSAGE_TYPES: &[&str] = &[
    "query",
    "query_result",
    "mutate",
    "mutate_result",
    "invalidate",
    "error",
];

/// Correlation id carried by unsolicited messages.
pub const UNSOLICITED: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    Query {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        domain: String,
    },
    QueryResult {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        domain: String,
        records: Vec<CredentialRecord>,
    },
    Mutate {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        domain: String,
        action: MutateAction,
        record: CredentialRecord,
    },
    MutateResult {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        domain: String,
        record: CredentialRecord,
    },
    Invalidate {
        #[serde(rename = "correlationId", default)]
        correlation_id: u64,
        domain: String,
    },
    Error {
        #[serde(rename = "correlationId", default)]
        correlation_id: u64,
        #[serde(default)]
        domain: String,
        kind: ErrorKind,
        message: String,
    },
}

impl SyncMessage {
    pub fn invalidate(domain: impl Into<String>) -> Self {
        Self::Invalidate {
            correlation_id: UNSOLICITED,
            domain: domain.into(),
        }
    }

    pub fn error(
        correlation_id: u64,
        domain: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            correlation_id,
            domain: domain.into(),
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn correlation_id(&self) -> u64 {
        match self {
            Self::Query { correlation_id, .. }
            | Self::QueryResult { correlation_id, .. }
            | Self::Mutate { correlation_id, .. }
            | Self::MutateResult { correlation_id, .. }
            | Self::Invalidate { correlation_id, .. }
            | Self::Error { correlation_id, .. } => *correlation_id,
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        match self {
            Self::Query { domain, .. }
            | Self::QueryResult { domain, .. }
            | Self::Mutate { domain, .. }
            | Self::MutateResult { domain, .. }
            | Self::Invalidate { domain, .. }
            | Self::Error { domain, .. } => domain,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::QueryResult { .. } => "query_result",
            Self::Mutate { .. } => "mutate",
            Self::MutateResult { .. } => "mutate_result",
            Self::Invalidate { .. } => "invalidate",
            Self::Error { .. } => "error",
        }
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Invalidate { correlation_id, .. } if *correlation_id != UNSOLICITED => Err(
                ProtocolError::Malformed("invalidate must not carry a correlation id".to_string()),
            ),
            Self::Query { correlation_id, .. }
            | Self::QueryResult { correlation_id, .. }
            | Self::Mutate { correlation_id, .. }
            | Self::MutateResult { correlation_id, .. }
                if *correlation_id == UNSOLICITED =>
            {
                Err(ProtocolError::Malformed(format!(
                    "{} requires a non-zero correlation id",
                    self.type_name()
                )))
            }
            Self::Mutate {
                action: MutateAction::UpdatePassword,
                record,
                ..
            } if record.id.is_none() => Err(ProtocolError::Malformed(
                "update_password requires a record id".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Parses one payload. The tag is checked first so unknown message types are
/// reported as such instead of as a field mismatch.
pub fn decode_payload(bytes: &[u8]) -> Result<SyncMessage> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::Malformed(
            "payload is not a JSON object".to_string(),
        ));
    };
    let tag = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing `type` tag".to_string()))?;
    if !MESSAGE_TYPES.contains(&tag) {
        return Err(ProtocolError::Malformed(format!(
            "unknown message type `{tag}`"
        )));
    }

    let message: SyncMessage = serde_json::from_value(value)?;
    message.validate()?;
    Ok(message)
}

pub fn encode_payload(message: &SyncMessage) -> Result<Vec<u8>> {
    message.validate()?;
    serde_json::to_vec(message).map_err(Into::into)
}
