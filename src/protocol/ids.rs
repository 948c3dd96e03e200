//! Identifier and topic validation
//!
//! Agent ids, coordinator ids, session ids and workflow step ids share one
//! character set. Topic names are canonicalized before they are compared.

use thiserror::Error;

/// Validation errors for protocol identifiers
#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("Identifier cannot be empty")]
    Empty,
    #[error("Identifier contains invalid character: '{0}'")]
    InvalidChar(char),
}

/// Check an identifier against `[a-zA-Z0-9._-]+`
pub fn validate_id(id: &str) -> Result<(), IdError> {
    if id.is_empty() {
        return Err(IdError::Empty);
    }

    for ch in id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(IdError::InvalidChar(ch));
        }
    }

    Ok(())
}

pub fn is_valid_id(id: &str) -> bool {
    validate_id(id).is_ok()
}

/// Canonical topic form: segments joined by single slashes, no leading or
/// trailing slash. `//workflow//events/` becomes `workflow/events`.
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
