use crate::cache::CredentialCache;
use mima_protocol::CredentialRecord;
use std::cmp::Ordering;

/// Autofill candidates for a page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchResult {
    #[default]
    None,
    /// Exactly one account: fill without prompting.
    Single(CredentialRecord),
    /// Several accounts, most recently used first: the caller asks the user.
    Multiple(Vec<CredentialRecord>),
}

impl MatchResult {
    #[must_use]
    pub fn records(&self) -> Vec<&CredentialRecord> {
        match self {
            Self::None => Vec::new(),
            Self::Single(record) => vec![record],
            Self::Multiple(records) => records.iter().collect(),
        }
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Ranks the active records of one domain.
#[must_use]
pub fn match_records(records: &[CredentialRecord]) -> MatchResult {
    let mut active: Vec<CredentialRecord> =
        records.iter().filter(|r| r.is_active()).cloned().collect();
    match active.len() {
        0 => MatchResult::None,
        1 => MatchResult::Single(active.remove(0)),
        _ => {
            active.sort_by(rank);
            MatchResult::Multiple(active)
        }
    }
}

/// Matches against a cache, answering `None` unless the domain is fresh.
/// A cold domain is not filled here; callers own fills.
#[must_use]
pub fn match_domain(cache: &CredentialCache, domain: &str) -> MatchResult {
    if !cache.is_fresh(domain) {
        return MatchResult::None;
    }
    cache
        .peek(domain)
        .map_or(MatchResult::None, |entry| match_records(entry.records()))
}

fn rank(a: &CredentialRecord, b: &CredentialRecord) -> Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| a.display_username.cmp(&b.display_username))
        .then_with(|| a.id.cmp(&b.id))
}
