use crate::error::{CoreError, Result};
use crate::normalize::normalize;
use crate::observation::{FormKind, FormObservation};
use mima_protocol::{CredentialRecord, MutateAction, RecordId, Secret};

/// Outcome of classifying one settled form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Unknown account: store a new record (no id yet).
    SaveNew { record: CredentialRecord },
    /// Credential already known as submitted.
    NoAction { id: RecordId },
    /// Known account with a new password.
    UpdatePassword { id: RecordId, password: Secret },
}

/// A request the authority must apply for an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub action: MutateAction,
    pub record: CredentialRecord,
}

impl Action {
    #[must_use]
    pub const fn mutate_action(&self) -> Option<MutateAction> {
        match self {
            Self::SaveNew { .. } => Some(MutateAction::SaveNew),
            Self::UpdatePassword { .. } => Some(MutateAction::UpdatePassword),
            Self::NoAction { .. } => None,
        }
    }

    /// Builds the mutate request. `matches` are the records the action was
    /// classified against; an update starts from the matched record so the
    /// authority keeps its other fields.
    #[must_use]
    pub fn mutation(&self, matches: &[CredentialRecord]) -> Option<Mutation> {
        match self {
            Self::SaveNew { record } => Some(Mutation {
                action: MutateAction::SaveNew,
                record: record.clone(),
            }),
            Self::UpdatePassword { id, password } => {
                let mut record = matches.iter().find(|r| r.id == Some(*id))?.clone();
                record.password = password.clone();
                Some(Mutation {
                    action: MutateAction::UpdatePassword,
                    record,
                })
            }
            Self::NoAction { .. } => None,
        }
    }
}

/// Active records of `domain_records` sharing the observation's canonical key.
#[must_use]
pub fn matching_records<'a>(
    observation: &FormObservation,
    domain_records: &'a [CredentialRecord],
) -> Vec<&'a CredentialRecord> {
    let key = observation.canonical_key();
    domain_records
        .iter()
        .filter(|record| {
            record.is_active() && normalize(&record.domain, &record.display_username) == key
        })
        .collect()
}

/// Classifies against every record known for the observation's domain.
pub fn classify_against(
    observation: &FormObservation,
    domain_records: &[CredentialRecord],
) -> Result<Action> {
    let matches: Vec<CredentialRecord> = matching_records(observation, domain_records)
        .into_iter()
        .cloned()
        .collect();
    classify(observation, &matches)
}

/// Classifies a settled observation against the records matching its key.
///
/// Other accounts on the same domain never influence the result: a key with
/// no match is always a new account.
pub fn classify(observation: &FormObservation, matches: &[CredentialRecord]) -> Result<Action> {
    observation.validate()?;

    let mut candidates: Vec<&CredentialRecord> = matches.iter().filter(|r| r.is_active()).collect();
    if candidates.is_empty() {
        return Ok(Action::SaveNew {
            record: draft_record(observation),
        });
    }
    if candidates.len() > 1 {
        log::warn!(
            "{} active records share key {}; deciding against the newest",
            candidates.len(),
            observation.canonical_key()
        );
        candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    if observation.form_kind == FormKind::Login {
        if let Some(known) = candidates
            .iter()
            .find(|r| r.password == observation.password)
        {
            return Ok(Action::NoAction {
                id: require_id(known)?,
            });
        }
    }

    // Change-password forms always update, even when the password already
    // matches: a previous update may still be in flight.
    Ok(Action::UpdatePassword {
        id: require_id(candidates[0])?,
        password: observation.password.clone(),
    })
}

fn require_id(record: &CredentialRecord) -> Result<RecordId> {
    record.id.ok_or_else(|| {
        CoreError::InvalidObservation(format!(
            "matched record for {} has no authority id",
            record.canonical_key
        ))
    })
}

fn draft_record(observation: &FormObservation) -> CredentialRecord {
    let canonical_key = observation.canonical_key();
    CredentialRecord {
        id: None,
        domain: canonical_key.domain().to_string(),
        display_username: observation.username.trim().to_string(),
        canonical_key,
        password: observation.password.clone(),
        ..CredentialRecord::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mima_protocol::ErrorKind;
    use pretty_assertions::assert_eq;

    fn record(id: u64, domain: &str, username: &str, password: &str) -> CredentialRecord {
        CredentialRecord {
            id: Some(RecordId(id)),
            domain: domain.to_string(),
            display_username: username.to_string(),
            canonical_key: normalize(domain, username),
            password: Secret::new(password),
            updated_at: id * 10,
            ..CredentialRecord::default()
        }
    }

    #[test]
    fn unknown_domain_saves_new() {
        let obs = FormObservation::login("https://new.example/login", " Carol ", "pw");
        let action = classify_against(&obs, &[]).expect("classify");
        let Action::SaveNew { record } = action else {
            panic!("expected SaveNew, got {action:?}");
        };
        assert_eq!(record.domain, "new.example");
        assert_eq!(record.display_username, "Carol");
        assert_eq!(record.canonical_key, normalize("new.example", "carol"));
        assert_eq!(record.id, None);
    }

    #[test]
    fn same_password_is_no_action() {
        let existing = vec![record(1, "shop.example", "Alice", "p1")];
        let obs = FormObservation::login("shop.example", "alice", "p1");
        assert_eq!(
            classify_against(&obs, &existing).expect("classify"),
            Action::NoAction { id: RecordId(1) }
        );
    }

    #[test]
    fn different_password_updates() {
        let existing = vec![record(1, "shop.example", "Alice", "p1")];
        let obs = FormObservation::login("shop.example", " alice ", "p2");
        assert_eq!(
            classify_against(&obs, &existing).expect("classify"),
            Action::UpdatePassword {
                id: RecordId(1),
                password: Secret::new("p2"),
            }
        );
    }

    #[test]
    fn other_account_on_domain_saves_new() {
        let existing = vec![record(1, "shop.example", "Alice", "p1")];
        let obs = FormObservation::login("shop.example", "bob", "q1");
        assert!(matches!(
            classify_against(&obs, &existing).expect("classify"),
            Action::SaveNew { .. }
        ));
    }

    #[test]
    fn change_password_form_updates_even_if_unchanged() {
        let existing = vec![record(1, "shop.example", "Alice", "p1")];
        let obs = FormObservation::new("shop.example", "alice", "p1", FormKind::ChangePassword);
        assert_eq!(
            classify_against(&obs, &existing).expect("classify"),
            Action::UpdatePassword {
                id: RecordId(1),
                password: Secret::new("p1"),
            }
        );
    }

    #[test]
    fn tombstoned_match_is_ignored() {
        let mut gone = record(1, "shop.example", "alice", "p1");
        gone.deleted = true;
        let obs = FormObservation::login("shop.example", "alice", "p1");
        assert!(matches!(
            classify_against(&obs, &[gone]).expect("classify"),
            Action::SaveNew { .. }
        ));
    }

    #[test]
    fn blank_password_never_classifies() {
        let obs = FormObservation::login("shop.example", "alice", "");
        let err = classify(&obs, &[]).expect_err("blank");
        assert_eq!(err.kind(), ErrorKind::InvalidObservation);
    }

    #[test]
    fn update_mutation_keeps_other_fields() {
        let mut existing = record(1, "shop.example", "Alice", "p1");
        existing
            .custom_fields
            .insert("pin".to_string(), "0000".to_string());
        let matches = vec![existing];
        let action = Action::UpdatePassword {
            id: RecordId(1),
            password: Secret::new("p2"),
        };
        let mutation = action.mutation(&matches).expect("mutation");
        assert_eq!(mutation.action, MutateAction::UpdatePassword);
        assert_eq!(mutation.record.password.expose(), "p2");
        assert_eq!(mutation.record.display_username, "Alice");
        assert_eq!(mutation.record.custom_fields.get("pin").map(String::as_str), Some("0000"));
    }

    #[test]
    fn no_action_has_no_mutation() {
        assert!(Action::NoAction { id: RecordId(1) }.mutation(&[]).is_none());
    }
}
