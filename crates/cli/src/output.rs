use mima_core::MatchResult;
use mima_protocol::{CredentialRecord, ErrorKind, MutateAction, RecordId};
use mima_sync::SyncError;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub id: Option<u64>,
    pub username: String,
    pub category: String,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AccountSummary {
    fn from_record(record: &CredentialRecord, reveal: bool) -> Self {
        Self {
            id: record.id.map(|id| id.0),
            username: record.display_username.clone(),
            category: record.category.to_string(),
            updated_at: record.updated_at,
            password: reveal.then(|| record.password.expose().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueryReport {
    pub domain: String,
    #[serde(rename = "match")]
    pub kind: &'static str,
    pub accounts: Vec<AccountSummary>,
}

impl QueryReport {
    pub fn new(domain: String, result: &MatchResult, reveal: bool) -> Self {
        let kind = match result {
            MatchResult::None => "none",
            MatchResult::Single(_) => "single",
            MatchResult::Multiple(_) => "multiple",
        };
        Self {
            domain,
            kind,
            accounts: result
                .records()
                .into_iter()
                .map(|r| AccountSummary::from_record(r, reveal))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserveReport {
    pub domain: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ObserveReport {
    pub fn unchanged(domain: String, id: RecordId) -> Self {
        Self {
            domain,
            outcome: "no_action",
            id: Some(id.0),
            error_kind: None,
            error: None,
        }
    }

    pub fn saved(action: MutateAction, record: &CredentialRecord) -> Self {
        Self {
            domain: record.canonical_key.domain().to_string(),
            outcome: match action {
                MutateAction::SaveNew => "save_new",
                MutateAction::UpdatePassword => "update_password",
            },
            id: record.id.map(|id| id.0),
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(domain: String, outcome: &'static str, error: &SyncError) -> Self {
        Self {
            domain,
            outcome,
            id: None,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
        }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.error_kind.is_some()
    }
}
