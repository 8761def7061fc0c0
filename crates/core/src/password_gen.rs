use crate::error::{CoreError, Result};
use mima_protocol::Secret;
use std::ops::RangeInclusive;

pub const LENGTH_RANGE: RangeInclusive<usize> = 8..=32;
pub const DEFAULT_LENGTH: usize = 12;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()_+-=[]{}|;:,.<>?";

/// Character classes and length for a generated password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub length: usize,
    pub uppercase: bool,
    pub lowercase: bool,
    pub digits: bool,
    pub symbols: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: DEFAULT_LENGTH,
            uppercase: true,
            lowercase: true,
            digits: true,
            symbols: true,
        }
    }
}

impl PasswordPolicy {
    fn classes(&self) -> Vec<&'static [u8]> {
        [
            (self.uppercase, UPPER),
            (self.lowercase, LOWER),
            (self.digits, DIGITS),
            (self.symbols, SYMBOLS),
        ]
        .into_iter()
        .filter_map(|(enabled, set)| enabled.then_some(set))
        .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !LENGTH_RANGE.contains(&self.length) {
            return Err(CoreError::InvalidConfig(format!(
                "password length {} outside {}..={}",
                self.length,
                LENGTH_RANGE.start(),
                LENGTH_RANGE.end()
            )));
        }
        if self.classes().is_empty() {
            return Err(CoreError::InvalidConfig(
                "at least one character class must be enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generates a password containing at least one character of every enabled
/// class, drawn from the OS random source.
pub fn generate_password(policy: &PasswordPolicy) -> Result<Secret> {
    policy.validate()?;
    let classes = policy.classes();
    let alphabet: Vec<u8> = classes.iter().flat_map(|set| set.iter().copied()).collect();

    let mut out: Vec<u8> = Vec::with_capacity(policy.length);
    for set in &classes {
        out.push(set[random_below(set.len())?]);
    }
    while out.len() < policy.length {
        out.push(alphabet[random_below(alphabet.len())?]);
    }
    // Fisher-Yates so the guaranteed characters are not always up front.
    for i in (1..out.len()).rev() {
        let j = random_below(i + 1)?;
        out.swap(i, j);
    }

    String::from_utf8(out)
        .map(Secret::from)
        .map_err(|err| CoreError::Random(err.to_string()))
}

/// Uniform index in `0..bound` by rejection sampling.
fn random_below(bound: usize) -> Result<usize> {
    debug_assert!(bound > 0 && bound <= 256);
    let limit = 256 - (256 % bound);
    loop {
        let mut byte = [0u8; 1];
        getrandom::getrandom(&mut byte).map_err(|err| CoreError::Random(err.to_string()))?;
        let value = usize::from(byte[0]);
        if value < limit {
            return Ok(value % bound);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn has_any(secret: &Secret, set: &[u8]) -> bool {
        secret.expose().bytes().any(|b| set.contains(&b))
    }

    #[test]
    fn default_policy_yields_twelve_mixed_characters() {
        let secret = generate_password(&PasswordPolicy::default()).expect("generate");
        assert_eq!(secret.len(), DEFAULT_LENGTH);
        assert!(has_any(&secret, UPPER));
        assert!(has_any(&secret, LOWER));
        assert!(has_any(&secret, DIGITS));
        assert!(has_any(&secret, SYMBOLS));
    }

    #[test]
    fn disabled_classes_never_appear() {
        let policy = PasswordPolicy {
            symbols: false,
            uppercase: false,
            ..PasswordPolicy::default()
        };
        for _ in 0..20 {
            let secret = generate_password(&policy).expect("generate");
            assert!(!has_any(&secret, SYMBOLS));
            assert!(!has_any(&secret, UPPER));
        }
    }

    #[test]
    fn length_outside_range_is_rejected() {
        for length in [0, 7, 33] {
            let policy = PasswordPolicy {
                length,
                ..PasswordPolicy::default()
            };
            assert!(generate_password(&policy).is_err(), "length {length}");
        }
    }

    #[test]
    fn no_classes_is_rejected() {
        let policy = PasswordPolicy {
            uppercase: false,
            lowercase: false,
            digits: false,
            symbols: false,
            ..PasswordPolicy::default()
        };
        assert!(matches!(
            generate_password(&policy),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    proptest! {
        #[test]
        fn any_valid_length_is_honored(length in 8usize..=32) {
            let policy = PasswordPolicy { length, ..PasswordPolicy::default() };
            let secret = generate_password(&policy).expect("generate");
            prop_assert_eq!(secret.len(), length);
        }
    }
}
