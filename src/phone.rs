//! Phone number canonicalization.
//!
//! Numbers are compared and stored as bare digit strings. Ten-digit US
//! numbers gain the leading country code `1` so that `(702) 555-1234` and
//! `+1 702 555 1234` hash to the same key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A canonicalized phone number (digits only, US country code applied).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Canonicalize an arbitrary phone string.
    ///
    /// Non-digits are elided; a 10-digit result gains a leading `1`.
    /// Canonicalization is idempotent.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.len() == 10 {
            digits.insert(0, '1');
        }
        Self(digits)
    }

    /// The canonical digit string.
    #[must_use]
    pub fn digits(&self) -> &str {
        &self.0
    }

    /// Whether any digits survived canonicalization.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PhoneNumber {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_digit_us_number_gains_country_code() {
        assert_eq!(PhoneNumber::normalize("7025551234").digits(), "17025551234");
        assert_eq!(
            PhoneNumber::normalize("(702) 555-1234").digits(),
            "17025551234"
        );
        assert_eq!(
            PhoneNumber::normalize("702.555.1234").digits(),
            "17025551234"
        );
    }

    #[test]
    fn eleven_digit_number_kept_verbatim() {
        assert_eq!(
            PhoneNumber::normalize("+1 702 555 1234").digits(),
            "17025551234"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["7025551234", "+1 (702) 555-1234", "555-0100", "", "abc"] {
            let once = PhoneNumber::normalize(raw);
            let twice = PhoneNumber::normalize(once.digits());
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn non_digits_are_elided() {
        assert_eq!(PhoneNumber::normalize("call me!").digits(), "");
        assert_eq!(PhoneNumber::normalize("x123").digits(), "123");
    }

    #[test]
    fn equality_is_digit_string_equality() {
        assert_eq!(
            PhoneNumber::normalize("702-555-1234"),
            PhoneNumber::normalize("17025551234")
        );
        assert_ne!(
            PhoneNumber::normalize("702-555-1234"),
            PhoneNumber::normalize("702-555-1235")
        );
    }
}
