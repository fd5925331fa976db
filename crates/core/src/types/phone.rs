//! Phone number normalization and matching.
//!
//! Customers type phone numbers in whatever shape they like, and records from
//! older imports only carry the raw string. Everything that compares phone
//! numbers goes through this module so the rules live in one place.
//!
//! ## Rules
//!
//! - Normalization strips whitespace, hyphens, parentheses and a leading `+`.
//!   It is a pure string transform and is not locale-aware.
//! - Two numbers match when their normalized forms are equal, or when one uses
//!   the South African trunk prefix `0` and the other the country code `27`
//!   for the same subscriber number.

use core::fmt;

use serde::{Deserialize, Serialize};

/// South African country calling code.
const ZA_COUNTRY_CODE: &str = "27";
/// South African national trunk prefix.
const ZA_TRUNK_PREFIX: &str = "0";

/// Errors that can occur when parsing a [`PhoneNumber`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PhoneError {
    /// The input string is empty or only whitespace.
    #[error("phone number cannot be empty")]
    Empty,
    /// The input contains no digits after normalization.
    #[error("phone number must contain digits")]
    NoDigits,
    /// The input contains a character that is not a digit or separator.
    #[error("phone number contains invalid character '{0}'")]
    InvalidCharacter(char),
}

/// Strip whitespace, hyphens, parentheses, and a leading `+` from a phone number.
///
/// ```
/// use couponhub_core::normalize_phone_number;
///
/// assert_eq!(normalize_phone_number("+27 (83) 209-1122"), "27832091122");
/// assert_eq!(normalize_phone_number("083 209 1122"), "0832091122");
/// ```
#[must_use]
pub fn normalize_phone_number(phone: &str) -> String {
    let stripped: String = phone
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect();

    match stripped.strip_prefix('+') {
        Some(rest) => rest.to_owned(),
        None => stripped,
    }
}

/// Returns `true` if two phone numbers refer to the same subscriber.
///
/// ```
/// use couponhub_core::phone_numbers_match;
///
/// assert!(phone_numbers_match("0832091122", "+27832091122"));
/// assert!(!phone_numbers_match("0832091122", "0839999999"));
/// ```
#[must_use]
pub fn phone_numbers_match(a: &str, b: &str) -> bool {
    let a = normalize_phone_number(a);
    let b = normalize_phone_number(b);

    if a.is_empty() || b.is_empty() {
        return false;
    }

    if a == b {
        return true;
    }

    match (national_number(&a), national_number(&b)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

/// Every stored shape a phone number is likely to have been saved in.
///
/// Order: the trimmed raw input, the normalized form, then the South African
/// `0`/`27`/`+27` alternatives. Duplicates are removed, first occurrence wins.
///
/// ```
/// use couponhub_core::phone_variants;
///
/// let variants = phone_variants("083 209 1122");
/// assert!(variants.contains(&"0832091122".to_string()));
/// assert!(variants.contains(&"27832091122".to_string()));
/// assert!(variants.contains(&"+27832091122".to_string()));
/// ```
#[must_use]
pub fn phone_variants(phone: &str) -> Vec<String> {
    let raw = phone.trim();
    let normalized = normalize_phone_number(raw);

    let mut variants = Vec::with_capacity(5);
    let mut push = |candidate: String| {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    };

    push(raw.to_owned());
    push(normalized.clone());

    if let Some(national) = national_number(&normalized) {
        push(format!("{ZA_TRUNK_PREFIX}{national}"));
        push(format!("{ZA_COUNTRY_CODE}{national}"));
        push(format!("+{ZA_COUNTRY_CODE}{national}"));
    }

    variants
}

/// Subscriber number without the South African trunk prefix or country code.
fn national_number(normalized: &str) -> Option<&str> {
    normalized
        .strip_prefix(ZA_COUNTRY_CODE)
        .or_else(|| normalized.strip_prefix(ZA_TRUNK_PREFIX))
        .filter(|rest| !rest.is_empty())
}

/// A phone number in normalized (digits-only) form.
///
/// This is the value written to a customer's `phone_normalized` field.
///
/// ## Constraints
///
/// - Must contain at least one digit
/// - Only digits, whitespace, `-`, `(`, `)` and a leading `+` are accepted
///
/// ## Examples
///
/// ```
/// use couponhub_core::PhoneNumber;
///
/// let phone = PhoneNumber::parse("+27 (83) 209-1122").unwrap();
/// assert_eq!(phone.as_str(), "27832091122");
///
/// assert!(PhoneNumber::parse("").is_err());
/// assert!(PhoneNumber::parse("call me").is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Parse and normalize a phone number.
    ///
    /// # Errors
    ///
    /// Returns an error if the input:
    /// - Is empty or whitespace
    /// - Contains characters other than digits and separators
    /// - Has no digits
    pub fn parse(s: &str) -> Result<Self, PhoneError> {
        if s.trim().is_empty() {
            return Err(PhoneError::Empty);
        }

        let normalized = normalize_phone_number(s.trim());

        if let Some(bad) = normalized.chars().find(|c| !c.is_ascii_digit()) {
            return Err(PhoneError::InvalidCharacter(bad));
        }

        if normalized.is_empty() {
            return Err(PhoneError::NoDigits);
        }

        Ok(Self(normalized))
    }

    /// Returns the normalized digits.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the `PhoneNumber` and returns the normalized digits.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PhoneNumber {
    type Err = PhoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
