//! Phone number normalization.
//!
//! `phone_normalized` is the uniqueness key for contacts, so client and server
//! must derive it identically from `phone_raw`.

use crate::error::{ProtocolError, ProtocolResult};

/// Minimum number of digits in a normalized phone number.
pub const MIN_PHONE_DIGITS: usize = 3;

/// Maximum number of digits in a normalized phone number (E.164 limit).
pub const MAX_PHONE_DIGITS: usize = 15;

/// Normalizes a display phone number into its canonical key.
///
/// Keeps ASCII digits and a single leading `+`. Separators such as spaces,
/// dashes, dots and parentheses are dropped. Any other character, a `+`
/// anywhere but the front, or a digit count outside
/// [`MIN_PHONE_DIGITS`]..=[`MAX_PHONE_DIGITS`] is rejected.
///
/// # Example
///
/// ```
/// use crmsync_protocol::normalize_phone;
///
/// assert_eq!(normalize_phone("+1 (555) 123-4567").unwrap(), "+15551234567");
/// assert_eq!(normalize_phone("555.123.4567").unwrap(), "5551234567");
/// assert!(normalize_phone("call me").is_err());
/// ```
pub fn normalize_phone(raw: &str) -> ProtocolResult<String> {
    let trimmed = raw.trim();
    let mut normalized = String::with_capacity(trimmed.len());
    let mut digits = 0usize;

    for (i, ch) in trimmed.chars().enumerate() {
        match ch {
            '0'..='9' => {
                normalized.push(ch);
                digits += 1;
            }
            '+' if i == 0 => normalized.push('+'),
            ' ' | '-' | '.' | '(' | ')' | '/' => {}
            _ => {
                return Err(ProtocolError::InvalidPhone {
                    raw: raw.to_string(),
                    reason: format!("unexpected character {ch:?}"),
                })
            }
        }
    }

    if digits < MIN_PHONE_DIGITS {
        return Err(ProtocolError::InvalidPhone {
            raw: raw.to_string(),
            reason: format!("needs at least {MIN_PHONE_DIGITS} digits"),
        });
    }
    if digits > MAX_PHONE_DIGITS {
        return Err(ProtocolError::InvalidPhone {
            raw: raw.to_string(),
            reason: format!("more than {MAX_PHONE_DIGITS} digits"),
        });
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_separators() {
        assert_eq!(normalize_phone("(555) 123-4567").unwrap(), "5551234567");
        assert_eq!(normalize_phone("  +44 20 7946 0958 ").unwrap(), "+442079460958");
        assert_eq!(normalize_phone("555/123").unwrap(), "555123");
    }

    #[test]
    fn rejects_inner_plus() {
        assert!(normalize_phone("555+1234").is_err());
    }

    #[test]
    fn rejects_letters() {
        assert!(normalize_phone("1-800-FLOWERS").is_err());
    }

    #[test]
    fn digit_bounds() {
        assert!(normalize_phone("12").is_err());
        assert!(normalize_phone("123").is_ok());
        assert!(normalize_phone("123456789012345").is_ok());
        assert!(normalize_phone("1234567890123456").is_err());
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(digits in "[0-9]{3,15}", plus in any::<bool>()) {
            let raw = if plus { format!("+{digits}") } else { digits.clone() };
            let once = normalize_phone(&raw).unwrap();
            let twice = normalize_phone(&once).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn separators_do_not_change_key(digits in "[0-9]{6,12}") {
            let (head, tail) = digits.split_at(3);
            let spaced = format!("({head}) {tail}");
            prop_assert_eq!(normalize_phone(&spaced).unwrap(), normalize_phone(&digits).unwrap());
        }
    }
}
