//! Privacy primitives applied to local and aggregated model updates.
//!
//! - [`GaussianMechanism`]: calibrated `(ε, δ)` differential privacy noise.
//! - [`PrivacyBudget`]: the cumulative privacy loss across rounds.
//! - [`GradientSanitizer`]: clipping and scrubbing of gradients before they leave an
//!   organization.
//!
//! The secure aggregation masks live in the [mask module](crate::mask).

pub(crate) mod budget;
pub(crate) mod dp;
pub(crate) mod sanitize;

use thiserror::Error;

pub use self::{
    budget::{BudgetEntry, PrivacyBudget},
    dp::GaussianMechanism,
    sanitize::{GradientSanitizer, SanitizationStats},
};

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to the privacy primitives.
///
/// These signal a violated privacy policy and must never be silently dropped.
pub enum PrivacyError {
    #[error(
        "privacy budget exceeded: requested (epsilon: {requested_epsilon}, delta: {requested_delta}), \
         remaining (epsilon: {remaining_epsilon}, delta: {remaining_delta})"
    )]
    BudgetExceeded {
        requested_epsilon: f64,
        requested_delta: f64,
        remaining_epsilon: f64,
        remaining_delta: f64,
    },

    #[error("gradient sanitization failed: {0}")]
    SanitizationFailed(String),

    #[error("invalid gradient: {0}")]
    InvalidGradient(String),

    #[error("invalid privacy parameters: {0}")]
    InvalidPrivacyParameters(String),
}
