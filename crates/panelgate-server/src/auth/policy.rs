//! Password strength policy.
//!
//! Applied to every password a user chooses: panel login, Linux account and
//! VNC passwords.

use std::fmt;

use argon2::password_hash::rand_core::{OsRng, RngCore};

const MIN_LEN: usize = 8;
const MAX_LEN: usize = 16;
const MIN_CLASSES: usize = 3;
/// Longest allowed run of one repeated character.
const MAX_REPEAT: usize = 3;
/// Longest allowed ascending or descending run such as `abcd` or `4321`.
const MAX_SEQUENCE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    Length,
    CharacterClasses,
    ContainsUsername,
    RepeatedCharacters,
    Sequence,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length => write!(f, "password must be {MIN_LEN} to {MAX_LEN} characters long"),
            Self::CharacterClasses => write!(
                f,
                "password must mix at least {MIN_CLASSES} of lowercase, uppercase, digits and symbols"
            ),
            Self::ContainsUsername => f.write_str("password must not contain the username"),
            Self::RepeatedCharacters => write!(
                f,
                "password must not repeat a character more than {MAX_REPEAT} times in a row"
            ),
            Self::Sequence => write!(
                f,
                "password must not contain a sequence longer than {MAX_SEQUENCE} characters"
            ),
        }
    }
}

/// Check `password` against the policy for the account `username`.
pub fn validate(password: &str, username: &str) -> Result<(), PolicyViolation> {
    let chars: Vec<char> = password.chars().collect();

    if !(MIN_LEN..=MAX_LEN).contains(&chars.len()) {
        return Err(PolicyViolation::Length);
    }

    let classes = [
        chars.iter().any(char::is_ascii_lowercase),
        chars.iter().any(char::is_ascii_uppercase),
        chars.iter().any(char::is_ascii_digit),
        chars.iter().any(|c| !c.is_ascii_alphanumeric()),
    ];
    if classes.iter().filter(|present| **present).count() < MIN_CLASSES {
        return Err(PolicyViolation::CharacterClasses);
    }

    if !username.is_empty() && password.contains(username) {
        return Err(PolicyViolation::ContainsUsername);
    }

    if chars
        .windows(MAX_REPEAT + 1)
        .any(|w| w.iter().all(|c| *c == w[0]))
    {
        return Err(PolicyViolation::RepeatedCharacters);
    }

    if chars.windows(MAX_SEQUENCE + 1).any(is_sequence) {
        return Err(PolicyViolation::Sequence);
    }

    Ok(())
}

fn is_sequence(window: &[char]) -> bool {
    let step = |a: &char, b: &char| i64::from(u32::from(*b)) - i64::from(u32::from(*a));
    let ascending = window.windows(2).all(|p| step(&p[0], &p[1]) == 1);
    let descending = window.windows(2).all(|p| step(&p[0], &p[1]) == -1);
    ascending || descending
}

const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!@#$%^&*-_=+";

/// Generate a 14-character password that satisfies the policy for `username`.
pub fn generate(username: &str) -> String {
    let alphabet: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS].concat();
    loop {
        let candidate: String = (0..14)
            .map(|i| {
                // Seed the first four positions with one of each class.
                let set = match i {
                    0 => LOWER,
                    1 => UPPER,
                    2 => DIGITS,
                    3 => SYMBOLS,
                    _ => alphabet.as_slice(),
                };
                pick(set)
            })
            .collect();
        if validate(&candidate, username).is_ok() {
            return candidate;
        }
    }
}

fn pick(set: &[u8]) -> char {
    let len = u32::try_from(set.len()).unwrap_or(u32::MAX);
    let idx = (OsRng.next_u32() % len) as usize;
    char::from(set[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_password() {
        assert_eq!(validate("Tr0ub4dor&3x", "alice"), Ok(()));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(validate("Ab1!", "alice"), Err(PolicyViolation::Length));
        assert_eq!(
            validate("Ab1!Ab1!Ab1!Ab1!X", "alice"),
            Err(PolicyViolation::Length)
        );
    }

    #[test]
    fn rejects_too_few_classes() {
        assert_eq!(
            validate("lowercase99", "alice"),
            Err(PolicyViolation::CharacterClasses)
        );
    }

    #[test]
    fn rejects_username() {
        assert_eq!(
            validate("xAlice-alice9", "alice"),
            Err(PolicyViolation::ContainsUsername)
        );
    }

    #[test]
    fn repeat_of_three_is_fine_four_is_not() {
        assert_eq!(validate("Paaa-word92", "bob"), Ok(()));
        assert_eq!(
            validate("Paaaa-word92", "bob"),
            Err(PolicyViolation::RepeatedCharacters)
        );
    }

    #[test]
    fn sequence_of_four_is_fine_five_is_not() {
        assert_eq!(validate("Xy!1234Qz", "bob"), Ok(()));
        assert_eq!(validate("Xy!12345Qz", "bob"), Err(PolicyViolation::Sequence));
        assert_eq!(validate("Xy!edcbaQ7", "bob"), Err(PolicyViolation::Sequence));
    }

    #[test]
    fn generated_passwords_pass() {
        for _ in 0..20 {
            let pw = generate("alice");
            assert_eq!(validate(&pw, "alice"), Ok(()));
        }
    }
}
