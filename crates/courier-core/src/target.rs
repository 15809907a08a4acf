//! Conversation addressing.
//!
//! Callers pass phone numbers in whatever shape they have them
//! (`+54 9 11 2233-4455`, `5491122334455`, `5491122334455@c.us`). Everything
//! past the HTTP boundary uses the normalized chat id, which is also the key
//! the reply correlator matches inbound `from` values against.

use serde::Serialize;

use crate::error::CourierError;

const USER_SUFFIX: &str = "@c.us";
const MIN_DIGITS: usize = 6;
const MAX_DIGITS: usize = 20;

/// A normalized chat id (e.g. `5491122334455@c.us`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChatTarget(String);

impl ChatTarget {
    /// Parse and normalize a caller-supplied target.
    ///
    /// Ids that already carry a server part (`@c.us`, `@g.us`) are kept as-is.
    /// Bare numbers are stripped of formatting, optionally prefixed with
    /// `default_country_code`, and suffixed with `@c.us`.
    pub fn parse(raw: &str, default_country_code: Option<&str>) -> Result<Self, CourierError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CourierError::Validation("target is required".to_string()));
        }

        if let Some((local, server)) = trimmed.split_once('@') {
            if local.is_empty() || server.is_empty() {
                return Err(CourierError::Validation(format!(
                    "invalid chat id: {trimmed}"
                )));
            }
            return Ok(Self(trimmed.to_string()));
        }

        let mut digits = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            match c {
                '0'..='9' => digits.push(c),
                '+' | '-' | '(' | ')' | ' ' | '.' => {}
                _ => {
                    return Err(CourierError::Validation(format!(
                        "invalid phone number: {trimmed}"
                    )))
                }
            }
        }

        if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
            return Err(CourierError::Validation(format!(
                "phone number must have {MIN_DIGITS}-{MAX_DIGITS} digits: {trimmed}"
            )));
        }

        if let Some(code) = default_country_code.filter(|c| !c.is_empty()) {
            if !digits.starts_with(code) {
                digits.insert_str(0, code);
            }
        }

        Ok(Self(format!("{digits}{USER_SUFFIX}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `@`: the phone number for user chats.
    pub fn user(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
