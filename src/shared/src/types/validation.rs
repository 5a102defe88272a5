//! Field-level validation errors raised by request and definition checks
//!
//! Field rules are declared with `validator` derives on the DTOs and action
//! configs. The derived `ValidationErrors` tree is flattened here into the
//! single camelCase field path the console shows next to its input.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;
use validator::{ValidationErrors, ValidationErrorsKind};

use super::events::{canonical_event_type, WILDCARD_EVENT};

/// A single rejected field, with a reason the console can show next to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for the most common failure
    pub fn required<F: Into<String>>(field: F) -> Self {
        Self::new(field, "is required")
    }

    /// Prefix the field path, e.g. `actions[2].config.tagName`
    pub fn within<P: AsRef<str>>(mut self, prefix: P) -> Self {
        self.field = format!("{}.{}", prefix.as_ref(), self.field);
        self
    }
}

impl From<ValidationErrors> for ValidationError {
    fn from(errors: ValidationErrors) -> Self {
        first_error(&errors).unwrap_or_else(|| ValidationError::new("body", "is invalid"))
    }
}

/// First failing field in name order, descending into nested structs and lists
fn first_error(errors: &ValidationErrors) -> Option<ValidationError> {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by_key(|(name, _)| *name);

    fields.into_iter().find_map(|(name, kind)| {
        let name = camel_case(name);
        match kind {
            ValidationErrorsKind::Field(failures) => failures
                .first()
                .map(|failure| ValidationError::new(name.clone(), describe(failure))),
            ValidationErrorsKind::Struct(nested) => first_error(nested).map(|e| e.within(&name)),
            ValidationErrorsKind::List(items) => items.iter().find_map(|(index, nested)| {
                first_error(nested).map(|e| e.within(format!("{}[{}]", name, index)))
            }),
        }
    })
}

fn describe(failure: &validator::ValidationError) -> String {
    if let Some(message) = &failure.message {
        return message.to_string();
    }
    match &*failure.code {
        "required" => "is required".to_string(),
        "email" => "must be an email address".to_string(),
        "url" => "is not a valid URL".to_string(),
        "length" => "has an invalid length".to_string(),
        "range" => "is out of range".to_string(),
        code => format!("failed the {} check", code),
    }
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

// =============================================================================
// Custom field validators
// =============================================================================

fn invalid(code: &'static str, message: impl Into<String>) -> validator::ValidationError {
    let mut error = validator::ValidationError::new(code);
    error.message = Some(Cow::Owned(message.into()));
    error
}

/// Reject blank (empty or whitespace-only) strings
pub(crate) fn not_blank(value: &str) -> Result<(), validator::ValidationError> {
    if value.trim().is_empty() {
        Err(invalid("required", "is required"))
    } else {
        Ok(())
    }
}

/// Accept only absolute http(s) URLs
pub(crate) fn http_url(value: &str) -> Result<(), validator::ValidationError> {
    not_blank(value)?;
    let parsed =
        url::Url::parse(value).map_err(|e| invalid("url", format!("is not a valid URL: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid("url", format!("must use http or https, got {}", other))),
    }
}

/// Header names are tokens of letters, digits, `-` and `_`
pub(crate) fn header_names(headers: &HashMap<String, String>) -> Result<(), validator::ValidationError> {
    match headers.keys().find(|name| {
        name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }) {
        Some(name) => Err(invalid("header", format!("invalid header name: {}", name))),
        None => Ok(()),
    }
}

/// Every filter is `*` or an event type (or trigger alias) from the catalog
pub(crate) fn event_filters(events: &[String]) -> Result<(), validator::ValidationError> {
    match events.iter().map(|event| event.trim()).find(|event| {
        *event != WILDCARD_EVENT && canonical_event_type(event).is_none()
    }) {
        Some(unknown) => Err(invalid("event", format!("unknown event type: {}", unknown))),
        None => Ok(()),
    }
}
