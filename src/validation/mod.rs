use bigdecimal::BigDecimal;
use std::collections::BTreeMap;
use std::fmt;

pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 255;
pub const IDENTIFIER_MAX_LEN: usize = 128;
pub const CURRENCY_MAX_LEN: usize = 12;
pub const FREE_TEXT_MAX_LEN: usize = 255;
pub const METADATA_MAX_ENTRIES: usize = 32;
pub const METADATA_KEY_MAX_LEN: usize = 64;
pub const METADATA_VALUE_MAX_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.chars().count() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

pub fn validate_enum(field: &'static str, value: &str, allowed: &[&str]) -> ValidationResult {
    if allowed.iter().all(|candidate| value != *candidate) {
        return Err(ValidationError::new(
            field,
            format!("must be one of: {}", allowed.join(", ")),
        ));
    }

    Ok(())
}

/// Required, trimmed, length-bounded text field. Returns the sanitized value.
pub fn required_text(
    field: &'static str,
    value: Option<&str>,
    max_len: usize,
) -> Result<String, ValidationError> {
    let value = sanitize_string(value.unwrap_or_default());
    validate_required(field, &value)?;
    validate_max_len(field, &value, max_len)?;
    Ok(value)
}

/// Optional text field; blank values collapse to `None`.
pub fn optional_text(
    field: &'static str,
    value: Option<&str>,
    max_len: usize,
) -> Result<Option<String>, ValidationError> {
    match value.map(sanitize_string) {
        Some(value) if !value.is_empty() => {
            validate_max_len(field, &value, max_len)?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}

/// Idempotency keys are opaque, but must be a single printable token.
pub fn validate_idempotency_key(key: &str) -> Result<String, ValidationError> {
    let key = key.trim();
    validate_required("idempotency_key", key)?;
    validate_max_len("idempotency_key", key, IDEMPOTENCY_KEY_MAX_LEN)?;

    if key.chars().any(|ch| ch.is_control() || ch.is_whitespace()) {
        return Err(ValidationError::new(
            "idempotency_key",
            "must not contain whitespace or control characters",
        ));
    }

    Ok(key.to_string())
}

pub fn validate_positive_amount(amount: &BigDecimal) -> ValidationResult {
    if amount <= &BigDecimal::from(0) {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }

    Ok(())
}

pub fn validate_metadata(metadata: &BTreeMap<String, String>) -> ValidationResult {
    if metadata.len() > METADATA_MAX_ENTRIES {
        return Err(ValidationError::new(
            "metadata",
            format!("must have at most {} entries", METADATA_MAX_ENTRIES),
        ));
    }

    for (key, value) in metadata {
        if key.trim().is_empty() {
            return Err(ValidationError::new("metadata", "keys must not be empty"));
        }
        validate_max_len("metadata", key, METADATA_KEY_MAX_LEN)?;
        validate_max_len("metadata", value, METADATA_VALUE_MAX_LEN)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn validates_required_field() {
        assert!(validate_required("field", "value").is_ok());
        assert!(validate_required("field", "   ").is_err());
    }

    #[test]
    fn validates_max_len() {
        assert!(validate_max_len("field", "abc", 3).is_ok());
        assert!(validate_max_len("field", "abcd", 3).is_err());
    }

    #[test]
    fn validates_enum_values() {
        assert!(validate_enum("type", "purchase", &["purchase", "refund"]).is_ok());
        let err = validate_enum("type", "gift", &["purchase", "refund"]).unwrap_err();
        assert_eq!(err.field, "type");
        assert_eq!(err.message, "must be one of: purchase, refund");
    }

    #[test]
    fn sanitizes_string() {
        assert_eq!(sanitize_string("  hello\tworld  "), "hello world");
        assert_eq!(sanitize_string("single"), "single");
        assert_eq!(sanitize_string(" \n "), "");
        assert_eq!(sanitize_string("ab\u{0000}cd\u{0007}"), "abcd");
    }

    #[test]
    fn required_text_trims_and_rejects_missing() {
        assert_eq!(required_text("account_id", Some("  A-1 "), 10).unwrap(), "A-1");
        assert_eq!(
            required_text("account_id", None, 10).unwrap_err().field,
            "account_id"
        );
        assert!(required_text("account_id", Some("x".repeat(11).as_str()), 10).is_err());
    }

    #[test]
    fn optional_text_collapses_blank() {
        assert_eq!(optional_text("merchant", Some("   "), 10).unwrap(), None);
        assert_eq!(optional_text("merchant", None, 10).unwrap(), None);
        assert_eq!(
            optional_text("merchant", Some("Acme"), 10).unwrap(),
            Some("Acme".to_string())
        );
    }

    #[test]
    fn validates_idempotency_key() {
        assert_eq!(validate_idempotency_key(" k1 ").unwrap(), "k1");
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key("has space").is_err());
        assert!(validate_idempotency_key(&"k".repeat(256)).is_err());
    }

    #[test]
    fn validates_positive_amount() {
        let positive = BigDecimal::from_str("1.23").expect("valid decimal");
        let zero = BigDecimal::from(0);
        let negative = BigDecimal::from(-5);

        assert!(validate_positive_amount(&positive).is_ok());
        assert!(validate_positive_amount(&zero).is_err());
        assert!(validate_positive_amount(&negative).is_err());
    }

    #[test]
    fn validates_metadata_bounds() {
        let mut metadata = BTreeMap::new();
        metadata.insert("channel".to_string(), "web".to_string());
        assert!(validate_metadata(&metadata).is_ok());

        metadata.insert("note".to_string(), "x".repeat(513));
        assert!(validate_metadata(&metadata).is_err());

        let crowded: BTreeMap<String, String> = (0..33)
            .map(|i| (format!("k{i}"), "v".to_string()))
            .collect();
        assert!(validate_metadata(&crowded).is_err());
    }
}
