//! Field-level validation shared by the household rules and the photo pipeline.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use url::Url;

/// One rejected field, addressed by its JSON path (e.g. `focalPoint.email`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

/// Collected validation failures for a single request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a failure on a single field
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(path, message);
        errors
    }

    pub fn add(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Whether any collected error targets `path`
    pub fn has(&self, path: &str) -> bool {
        self.errors.iter().any(|e| e.path == path)
    }

    /// `Ok(())` when nothing was collected
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [only] => f.write_str(&only.message),
            _ => f.write_str("Validation failed"),
        }
    }
}

impl std::error::Error for ValidationErrors {}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
            .expect("email pattern is valid")
    })
}

/// Require `value` to hold between `min` and `max` characters after trimming
pub fn check_length(
    errors: &mut ValidationErrors,
    path: &str,
    value: &str,
    min: usize,
    max: usize,
    label: &str,
) {
    let len = value.trim().chars().count();
    if len < min {
        errors.add(path, format!("{label} is required"));
    } else if len > max {
        errors.add(path, format!("{label} must be less than {max} characters"));
    }
}

pub fn check_email(errors: &mut ValidationErrors, path: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        errors.add(path, "Email is required");
    } else if value.chars().count() > 100 {
        errors.add(path, "Email is too long");
    } else if !email_regex().is_match(value) {
        errors.add(path, "Invalid email address");
    }
}

/// Require an absolute http(s) URL with a host
pub fn check_url(errors: &mut ValidationErrors, path: &str, value: &str) {
    if value.chars().count() > 500 {
        errors.add(path, "URL is too long");
        return;
    }

    let valid = Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false);
    if !valid {
        errors.add(path, "Invalid URL format");
    }
}

/// Counts arrive as signed JSON numbers; reject negatives before narrowing
pub fn check_count(errors: &mut ValidationErrors, path: &str, value: i64, label: &str) -> u32 {
    match u32::try_from(value) {
        Ok(count) => count,
        Err(_) => {
            errors.add(path, format!("{label} must be a non-negative integer"));
            0
        }
    }
}
