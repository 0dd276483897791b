//! Input validation for identity attributes
//!
//! Naming values (UID, OU) go through [`crate::naming::is_valid_value`];
//! this module covers the remaining attributes and collects every problem
//! in one pass.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::OumanError;
use crate::naming::{is_valid_value, MAX_VALUE_LENGTH};

pub const MAX_EMAIL_LENGTH: usize = 320; // RFC 5321
pub const MAX_IDENTIFYING_NUMBER_LENGTH: usize = 64;

/// Email validation regex (RFC 5322 simplified)
static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());

/// Identifying numbers: alphanumerics with optional separators
static IDENTIFYING_NUMBER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9./-]*$").unwrap());

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<ValidationError> for OumanError {
    fn from(err: ValidationError) -> Self {
        OumanError::validation(err.field, err.message)
    }
}

/// Accumulating validator
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    pub fn new() -> Self {
        Self { errors: vec![] }
    }

    pub fn error(&mut self, field: &str, message: &str) -> &mut Self {
        self.errors.push(ValidationError::new(field, message));
        self
    }

    /// A value that becomes part of a naming path
    pub fn naming_value(&mut self, field: &str, value: &str) -> &mut Self {
        if !is_valid_value(value) {
            self.error(
                field,
                &format!(
                    "must be non-blank, at most {} characters, without control characters",
                    MAX_VALUE_LENGTH
                ),
            );
        }
        self
    }

    pub fn email_optional(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            if v.len() > MAX_EMAIL_LENGTH {
                self.error(field, "Email is too long");
            } else if !EMAIL_REGEX.is_match(v) {
                self.error(field, "Invalid email format");
            }
        }
        self
    }

    pub fn identifying_number_optional(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            if v.len() > MAX_IDENTIFYING_NUMBER_LENGTH {
                self.error(field, "Identifying number is too long");
            } else if !IDENTIFYING_NUMBER_REGEX.is_match(v) {
                self.error(field, "Identifying number has invalid characters");
            }
        }
        self
    }

    /// Free-text attribute: bounded length, no control characters
    pub fn text_optional(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            if v.chars().count() > MAX_VALUE_LENGTH {
                self.error(field, "Value is too long");
            } else if v.chars().any(|c| c.is_control()) {
                self.error(field, "Value contains control characters");
            }
        }
        self
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// First error, if any, as an engine error
    pub fn finish(self) -> Result<(), OumanError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
