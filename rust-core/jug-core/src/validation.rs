//! # Validation Module
//!
//! A fluent accumulator of human-readable validation failures.
//!
//! Every `require_*` call checks one condition and, when it does not hold,
//! records the caller's message. [`Validator::validate`] then yields a single
//! [`ValidationError`] holding all messages joined by `", "`, or `Ok(())`.
//!
//! ```
//! use jug_core::{Validatable, ValidationError, Validator};
//!
//! struct CreateUser {
//!     name: String,
//!     role: String,
//! }
//!
//! impl Validatable for CreateUser {
//!     fn validate(&self) -> Result<(), ValidationError> {
//!         Validator::new()
//!             .require_not_empty(&self.name, "name is required")
//!             .require_enum(&self.role, "role is invalid", &["admin", "member"])
//!             .validate()
//!     }
//! }
//! ```
//!
//! Lengths are byte lengths, and the max-length checks are exclusive
//! (`len < max`).

use crate::error::ValidationError;
use regex::Regex;
use std::collections::HashSet;

/// Types that can check their own invariants after being bound from a request.
///
/// The default implementation accepts everything, so request types without
/// rules only need an empty `impl`.
pub trait Validatable {
    /// Check the value, returning the joined failure messages on error
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Fluent validation error accumulator
#[derive(Debug, Clone, Default)]
pub struct Validator {
    errors: String,
}

impl Validator {
    /// Create a validator with no recorded failures
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a reusable validation function against this validator
    pub fn check<F>(&mut self, f: F) -> &mut Self
    where
        F: FnOnce(&mut Self),
    {
        f(self);
        self
    }

    /// Require a condition to be true
    pub fn require(&mut self, condition: bool, message: &str) -> &mut Self {
        if !condition {
            self.append(message);
        }
        self
    }

    /// Require `s` to be one of `values`. An empty `s` passes.
    pub fn require_enum(&mut self, s: &str, message: &str, values: &[&str]) -> &mut Self {
        if s.is_empty() || values.contains(&s) {
            return self;
        }
        self.append(message);
        self
    }

    /// Require the slice to have at least `min` elements
    pub fn require_slice_min_length<T>(&mut self, s: &[T], min: usize, message: &str) -> &mut Self {
        self.require(s.len() >= min, message)
    }

    /// Require the slice to have at least one element
    pub fn require_slice_not_empty<T>(&mut self, s: &[T], message: &str) -> &mut Self {
        self.require(!s.is_empty(), message)
    }

    /// Require every element of `s` to be one of `values`.
    ///
    /// An empty slice passes. The message is recorded at most once.
    pub fn require_slice_enum<S>(&mut self, s: &[S], message: &str, values: &[&str]) -> &mut Self
    where
        S: AsRef<str>,
    {
        if s.is_empty() {
            return self;
        }
        let allowed: HashSet<&str> = values.iter().copied().collect();
        if s.iter().any(|item| !allowed.contains(item.as_ref())) {
            self.append(message);
        }
        self
    }

    /// Require `s` to match `regex`. An empty `s` passes.
    pub fn require_matches_regex(&mut self, s: &str, regex: &Regex, message: &str) -> &mut Self {
        if !s.is_empty() && !regex.is_match(s) {
            self.append(message);
        }
        self
    }

    /// Require `s` to be at least `min` bytes long
    pub fn require_min_length(&mut self, s: &str, min: usize, message: &str) -> &mut Self {
        self.require(s.len() >= min, message)
    }

    /// Require `s` to be shorter than `max` bytes
    pub fn require_max_length(&mut self, s: &str, max: usize, message: &str) -> &mut Self {
        self.require(s.len() < max, message)
    }

    /// Require `s` not to be empty
    pub fn require_not_empty(&mut self, s: &str, message: &str) -> &mut Self {
        self.require(!s.is_empty(), message)
    }

    /// Require `min <= s.len() < max`
    pub fn require_length_between(
        &mut self,
        s: &str,
        min: usize,
        max: usize,
        message: &str,
    ) -> &mut Self {
        self.require(s.len() >= min && s.len() < max, message)
    }

    /// Validate each item, recording failures as `key[index]: message`
    pub fn validate_sub<T: Validatable>(&mut self, key: &str, items: &[T]) -> &mut Self {
        for (i, item) in items.iter().enumerate() {
            if let Err(err) = item.validate() {
                self.append(&format!("{key}[{i}]: {err}"));
            }
        }
        self
    }

    /// Finish validation.
    ///
    /// # Errors
    ///
    /// Returns the recorded messages joined by `", "` if any check failed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError(self.errors.clone()))
        }
    }

    fn append(&mut self, message: &str) {
        if !self.errors.is_empty() {
            self.errors.push_str(", ");
        }
        self.errors.push_str(message);
    }
}

// Older names, kept so callers can migrate gradually.
impl Validator {
    /// Require the slice to have at least `min` elements
    #[deprecated(note = "use require_slice_min_length instead")]
    pub fn require_string_slice_min_length(
        &mut self,
        s: &[String],
        min: usize,
        message: &str,
    ) -> &mut Self {
        self.require_slice_min_length(s, min, message)
    }

    /// Require the slice to have at least one element
    #[deprecated(note = "use require_slice_not_empty instead")]
    pub fn require_string_slice_not_empty(&mut self, s: &[String], message: &str) -> &mut Self {
        self.require_slice_not_empty(s, message)
    }

    /// Require every element of `s` to be one of `values`
    #[deprecated(note = "use require_slice_enum instead")]
    pub fn require_string_slice_enum(
        &mut self,
        s: &[String],
        message: &str,
        values: &[&str],
    ) -> &mut Self {
        self.require_slice_enum(s, message, values)
    }

    /// Require `s` to be at least `min` bytes long
    #[deprecated(note = "use require_min_length instead")]
    pub fn require_string_min_length(&mut self, s: &str, min: usize, message: &str) -> &mut Self {
        self.require_min_length(s, min, message)
    }

    /// Require `s` to be shorter than `max` bytes
    #[deprecated(note = "use require_max_length instead")]
    pub fn require_string_max_length(&mut self, s: &str, max: usize, message: &str) -> &mut Self {
        self.require_max_length(s, max, message)
    }

    /// Require `s` not to be empty
    #[deprecated(note = "use require_not_empty instead")]
    pub fn require_string_not_empty(&mut self, s: &str, message: &str) -> &mut Self {
        self.require_not_empty(s, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        name: String,
    }

    impl Validatable for Item {
        fn validate(&self) -> Result<(), ValidationError> {
            Validator::new()
                .require_not_empty(&self.name, "name is required")
                .validate()
        }
    }

    #[test]
    fn test_new_validator_passes() {
        assert!(Validator::new().validate().is_ok());
    }

    #[test]
    fn test_require() {
        let err = Validator::new().require(false, "message").validate().unwrap_err();
        assert_eq!(err.message(), "message");

        assert!(Validator::new().require(true, "m").validate().is_ok());
    }

    #[test]
    fn test_messages_joined_in_order() {
        let err = Validator::new()
            .require(false, "first")
            .require(true, "skipped")
            .require(false, "second")
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "first, second");
    }

    #[test]
    fn test_require_enum() {
        assert!(Validator::new()
            .require_enum("a", "message", &["a", "b"])
            .validate()
            .is_ok());

        let err = Validator::new()
            .require_enum("c", "message", &["a", "b"])
            .validate()
            .unwrap_err();
        assert_eq!(err.message(), "message");

        assert!(Validator::new()
            .require_enum("", "message", &["a", "b"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_require_slice_enum_reports_once() {
        let values = vec!["x".to_string(), "y".to_string(), "a".to_string()];
        let err = Validator::new()
            .require_slice_enum(&values, "bad tag", &["a", "b"])
            .validate()
            .unwrap_err();
        assert_eq!(err.message(), "bad tag");

        let empty: Vec<String> = Vec::new();
        assert!(Validator::new()
            .require_slice_enum(&empty, "bad tag", &["a"])
            .validate()
            .is_ok());

        assert!(Validator::new()
            .require_slice_enum(&["a", "b"], "bad tag", &["a", "b"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_slice_lengths() {
        let tags = ["one", "two"];
        assert!(Validator::new()
            .require_slice_min_length(&tags, 2, "too few")
            .require_slice_not_empty(&tags, "empty")
            .validate()
            .is_ok());

        let none: [&str; 0] = [];
        let err = Validator::new()
            .require_slice_min_length(&none, 1, "too few")
            .require_slice_not_empty(&none, "empty")
            .validate()
            .unwrap_err();
        assert_eq!(err.message(), "too few, empty");
    }

    #[test]
    fn test_require_matches_regex() {
        let re = Regex::new(r"^[a-z]+$").unwrap();
        assert!(Validator::new()
            .require_matches_regex("abc", &re, "lowercase only")
            .require_matches_regex("", &re, "lowercase only")
            .validate()
            .is_ok());
        assert!(Validator::new()
            .require_matches_regex("ABC", &re, "lowercase only")
            .validate()
            .is_err());
    }

    #[test]
    fn test_string_lengths() {
        assert!(Validator::new()
            .require_min_length("abc", 3, "min")
            .require_max_length("abc", 4, "max")
            .require_length_between("abc", 3, 4, "between")
            .validate()
            .is_ok());

        // max is exclusive
        let err = Validator::new()
            .require_max_length("abcd", 4, "max")
            .require_length_between("abcd", 1, 4, "between")
            .require_min_length("ab", 3, "min")
            .validate()
            .unwrap_err();
        assert_eq!(err.message(), "max, between, min");
    }

    #[test]
    fn test_check_runs_closure() {
        fn name_rules(v: &mut Validator) {
            v.require_not_empty("", "name is required");
        }
        let err = Validator::new().check(name_rules).validate().unwrap_err();
        assert_eq!(err.message(), "name is required");
    }

    #[test]
    fn test_validate_sub() {
        let items = vec![
            Item { name: "ok".into() },
            Item { name: String::new() },
            Item { name: String::new() },
        ];
        let err = Validator::new()
            .validate_sub("items", &items)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.message(),
            "items[1]: name is required, items[2]: name is required"
        );
    }

    #[test]
    #[allow(deprecated)]
    fn test_deprecated_aliases_delegate() {
        let err = Validator::new()
            .require_string_not_empty("", "empty")
            .require_string_min_length("a", 2, "short")
            .require_string_max_length("abc", 2, "long")
            .require_string_slice_not_empty(&[], "no tags")
            .validate()
            .unwrap_err();
        assert_eq!(err.message(), "empty, short, long, no tags");
    }
}
