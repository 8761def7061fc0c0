use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier assigned by the authority store. Opaque to the browser side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Password payload. Never rendered by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Record category. The first six are the defaults every store starts with;
/// anything else is a user-defined category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Social,
    Shopping,
    Work,
    Entertainment,
    Finance,
    #[default]
    Other,
    Custom(String),
}

impl Category {
    pub const DEFAULTS: [Self; 6] = [
        Self::Social,
        Self::Shopping,
        Self::Work,
        Self::Entertainment,
        Self::Finance,
        Self::Other,
    ];

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Social => "social",
            Self::Shopping => "shopping",
            Self::Work => "work",
            Self::Entertainment => "entertainment",
            Self::Finance => "finance",
            Self::Other => "other",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for Category {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "social" => Self::Social,
            "shopping" => Self::Shopping,
            "work" => Self::Work,
            "entertainment" => Self::Entertainment,
            "finance" => Self::Finance,
            "" | "other" => Self::Other,
            _ => Self::Custom(raw.trim().to_string()),
        }
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        match category {
            Category::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized `(domain, username)` identity of an account.
///
/// Build it with `mima_core::normalize`; this crate only carries it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CanonicalKey {
    domain: String,
    username: String,
}

impl CanonicalKey {
    /// Wraps parts that are already normalized.
    pub fn from_normalized(domain: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            username: username.into(),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub domain: String,
    pub display_username: String,
    /// Derived from `domain` and `display_username`; receivers recompute it.
    #[serde(default)]
    pub canonical_key: CanonicalKey,
    pub password: Secret,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub deleted: bool,
}

impl CredentialRecord {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.deleted
    }
}

/// Mutation requested from the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutateAction {
    SaveNew,
    UpdatePassword,
}

impl fmt::Display for MutateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SaveNew => "save_new",
            Self::UpdatePassword => "update_password",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let record = CredentialRecord {
            password: Secret::new("hunter2"),
            ..CredentialRecord::default()
        };
        let rendered = format!("{record:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Secret(***)"));
    }

    #[test]
    fn category_round_trips_as_plain_string() {
        let json = serde_json::to_string(&Category::Finance).expect("serialize");
        assert_eq!(json, "\"finance\"");
        let custom: Category = serde_json::from_str("\"Banking\"").expect("deserialize");
        assert_eq!(custom, Category::Custom("Banking".to_string()));
        let empty: Category = serde_json::from_str("\"\"").expect("deserialize");
        assert_eq!(empty, Category::Other);
    }

    #[test]
    fn record_uses_camel_case_fields() {
        let record = CredentialRecord {
            id: Some(RecordId(7)),
            domain: "shop.example".to_string(),
            display_username: "Alice".to_string(),
            canonical_key: CanonicalKey::from_normalized("shop.example", "alice"),
            password: Secret::new("p1"),
            updated_at: 42,
            ..CredentialRecord::default()
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["displayUsername"], "Alice");
        assert_eq!(value["canonicalKey"]["username"], "alice");
        assert_eq!(value["updatedAt"], 42);
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn record_without_id_omits_the_field() {
        let value = serde_json::to_value(CredentialRecord::default()).expect("serialize");
        assert!(value.get("id").is_none());
    }
}
