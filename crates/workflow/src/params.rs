//! Request parameter validation.
//!
//! Identifiers validated here are the only values ever spliced into SQL
//! identifier positions or filesystem paths; everything else is passed as
//! bound parameters or argument vectors.

use std::collections::BTreeMap;

use crate::error::ValidationError;

/// Fetches a required parameter from the request map.
pub fn require<'a>(
    params: &'a BTreeMap<String, String>,
    name: &'static str,
) -> Result<&'a str, ValidationError> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingParam(name))
}

/// Validates a fully-qualified domain name.
///
/// Labels are ASCII alphanumerics and hyphens, 1-63 characters, no leading
/// or trailing hyphen, total length at most 253.
pub fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidDomain(domain.to_string());

    if domain.is_empty() || domain.len() > 253 {
        return Err(invalid());
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid());
        }
    }

    Ok(())
}

/// Validates a MySQL database or user identifier.
///
/// ASCII alphanumerics and underscores only, not starting with a digit,
/// at most 64 characters.
pub fn validate_identifier(ident: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidIdentifier(ident.to_string());

    if ident.is_empty() || ident.len() > 64 {
        return Err(invalid());
    }
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(invalid()),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid());
    }

    Ok(())
}

/// Validates an email address of the form `local@domain`.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidEmail(email.to_string());

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || local.len() > 64 {
        return Err(invalid());
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '+' | '-'))
    {
        return Err(invalid());
    }
    validate_domain(domain).map_err(|_| invalid())
}

/// Splits an email address into its local part and domain.
///
/// Callers must validate with [`validate_email`] first.
pub fn split_email(email: &str) -> Option<(&str, &str)> {
    email.split_once('@')
}
