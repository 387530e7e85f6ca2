//! Identifier validation
//!
//! Identifiers end up as arguments to the extractor process and inside
//! outbound URLs, so every caller must validate before using one.

use crate::error::{RelayError, Result};

/// Exact identifier length
pub const IDENTIFIER_LEN: usize = 11;

/// Validates resource identifiers: exactly 11 characters of `[A-Za-z0-9_-]`
pub struct IdentifierValidator;

impl IdentifierValidator {
    /// Check whether `id` is a well-formed identifier
    pub fn is_valid(id: &str) -> bool {
        id.len() == IDENTIFIER_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    /// Validate `id`, returning `InvalidIdentifier` on failure
    pub fn validate(id: &str) -> Result<()> {
        if Self::is_valid(id) {
            Ok(())
        } else {
            Err(RelayError::InvalidIdentifier(format!("{:?}", id)))
        }
    }

    /// Build the canonical resource URL handed to the extractor
    pub fn canonical_url(prefix: &str, id: &str) -> Result<String> {
        Self::validate(id)?;
        Ok(format!("{}{}", prefix, id))
    }
}
