use crate::error::{CoreError, Result};
use crate::normalize::{normalize, normalize_domain};
use mima_protocol::{CanonicalKey, Secret};
use serde::{Deserialize, Serialize};

/// Kind of form the submission came from, as guessed by form detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormKind {
    #[default]
    Login,
    ChangePassword,
}

/// One submitted form, consumed once by the decision engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormObservation {
    pub domain: String,
    /// Raw, as typed.
    pub username: String,
    pub password: Secret,
    #[serde(default)]
    pub form_kind: FormKind,
}

impl FormObservation {
    pub fn new(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Secret>,
        form_kind: FormKind,
    ) -> Self {
        Self {
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
            form_kind,
        }
    }

    pub fn login(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Secret>,
    ) -> Self {
        Self::new(domain, username, password, FormKind::Login)
    }

    #[must_use]
    pub fn canonical_key(&self) -> CanonicalKey {
        normalize(&self.domain, &self.username)
    }

    #[must_use]
    pub fn normalized_domain(&self) -> String {
        normalize_domain(&self.domain)
    }

    /// Rejects observations that must never reach classification.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_blank() {
            return Err(CoreError::InvalidObservation("blank password".to_string()));
        }
        if self.normalized_domain().is_empty() {
            return Err(CoreError::InvalidObservation(format!(
                "no host in domain {:?}",
                self.domain
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_password_is_invalid() {
        let err = FormObservation::login("shop.example", "alice", "   ")
            .validate()
            .expect_err("blank");
        assert_eq!(err.kind(), mima_protocol::ErrorKind::InvalidObservation);
    }

    #[test]
    fn hostless_domain_is_invalid() {
        assert!(FormObservation::login("https:///", "alice", "pw").validate().is_err());
    }

    #[test]
    fn empty_username_is_allowed() {
        assert!(FormObservation::login("pin.example", "", "1234").validate().is_ok());
    }
}
