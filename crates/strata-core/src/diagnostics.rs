//! Programmer-error invariant checks.
//!
//! The metastore distinguishes expected predicate failures (returned as
//! typed results) from invariant violations that indicate a bug in the
//! caller or in the store itself: null-equivalent arguments where
//! forbidden, a grantee that is not a grantee type, bootstrap entities
//! missing mid-operation. The latter go through [`Diagnostics`] and abort
//! the process with the signal name; they are never retried and never
//! surfaced as operation statuses.

/// Invariant-check service carried on every call context.
///
/// All checks panic on failure. The panic message starts with the short
/// machine-readable signal name followed by optional detail.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics;

impl Diagnostics {
    /// Creates a new diagnostics service.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Checks that a condition holds.
    ///
    /// # Panics
    ///
    /// Panics with `signal` if the condition is false.
    pub fn check(&self, condition: bool, signal: &str) {
        assert!(condition, "diagnostic failure: {signal}");
    }

    /// Checks that a condition holds, with extra detail in the failure.
    ///
    /// # Panics
    ///
    /// Panics with `signal` and `detail` if the condition is false.
    pub fn check_with(&self, condition: bool, signal: &str, detail: &str) {
        assert!(condition, "diagnostic failure: {signal}: {detail}");
    }

    /// Unwraps an optional value that must be present.
    ///
    /// # Panics
    ///
    /// Panics with `signal` if the value is `None`.
    pub fn check_not_none<T>(&self, value: Option<T>, signal: &str) -> T {
        match value {
            Some(v) => v,
            None => panic!("diagnostic failure: {signal}"),
        }
    }
}
