//! The cumulative privacy budget.
//!
//! See the [privacy module] documentation since this is a private module anyways.
//!
//! [privacy module]: crate::privacy

use serde::{Deserialize, Serialize};

use crate::privacy::PrivacyError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// The privacy loss consumed by a single round.
pub struct BudgetEntry {
    pub round: u64,
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Tracks the cumulative `(ε, δ)` against fixed ceilings.
///
/// Consumption is append-only, there is no way to give budget back.
pub struct PrivacyBudget {
    max_epsilon: f64,
    max_delta: f64,
    epsilon_used: f64,
    delta_used: f64,
    history: Vec<BudgetEntry>,
}

fn ensure_non_negative(name: &str, value: f64) -> Result<(), PrivacyError> {
    if value >= 0. && value.is_finite() {
        Ok(())
    } else {
        Err(PrivacyError::InvalidPrivacyParameters(format!(
            "{} must be finite and non-negative, got {}",
            name, value
        )))
    }
}

impl PrivacyBudget {
    /// Creates an unused budget with the given ceilings.
    ///
    /// # Errors
    /// Fails if a ceiling is negative or not finite.
    pub fn new(max_epsilon: f64, max_delta: f64) -> Result<Self, PrivacyError> {
        ensure_non_negative("max epsilon", max_epsilon)?;
        ensure_non_negative("max delta", max_delta)?;
        Ok(Self {
            max_epsilon,
            max_delta,
            epsilon_used: 0.,
            delta_used: 0.,
            history: Vec::new(),
        })
    }

    /// Consumes `(epsilon, delta)` on behalf of `round`.
    ///
    /// # Errors
    /// Fails with [`PrivacyError::BudgetExceeded`] if either cumulative value would exceed its
    /// ceiling. The budget is left untouched in that case.
    pub fn consume(&mut self, round: u64, epsilon: f64, delta: f64) -> Result<(), PrivacyError> {
        ensure_non_negative("epsilon", epsilon)?;
        ensure_non_negative("delta", delta)?;
        if !self.can_afford(epsilon, delta) {
            return Err(PrivacyError::BudgetExceeded {
                requested_epsilon: epsilon,
                requested_delta: delta,
                remaining_epsilon: self.remaining_epsilon(),
                remaining_delta: self.remaining_delta(),
            });
        }
        self.epsilon_used += epsilon;
        self.delta_used += delta;
        self.history.push(BudgetEntry {
            round,
            epsilon,
            delta,
        });
        Ok(())
    }

    /// Checks whether `(epsilon, delta)` can still be consumed.
    pub fn can_afford(&self, epsilon: f64, delta: f64) -> bool {
        self.epsilon_used + epsilon <= self.max_epsilon && self.delta_used + delta <= self.max_delta
    }

    /// Gets the cumulative epsilon consumed so far.
    pub fn epsilon_used(&self) -> f64 {
        self.epsilon_used
    }

    /// Gets the cumulative delta consumed so far.
    pub fn delta_used(&self) -> f64 {
        self.delta_used
    }

    pub fn remaining_epsilon(&self) -> f64 {
        (self.max_epsilon - self.epsilon_used).max(0.)
    }

    pub fn remaining_delta(&self) -> f64 {
        (self.max_delta - self.delta_used).max(0.)
    }

    /// Gets the consumption history in the order of consumption.
    pub fn history(&self) -> &[BudgetEntry] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_within_budget() {
        let mut budget = PrivacyBudget::new(10., 1e-4).unwrap();
        budget.consume(1, 2.5, 1e-5).unwrap();
        budget.consume(2, 2.5, 1e-5).unwrap();
        assert_eq!(budget.epsilon_used(), 5.);
        assert_eq!(budget.remaining_epsilon(), 5.);
        assert_eq!(
            budget.history(),
            &[
                BudgetEntry {
                    round: 1,
                    epsilon: 2.5,
                    delta: 1e-5
                },
                BudgetEntry {
                    round: 2,
                    epsilon: 2.5,
                    delta: 1e-5
                },
            ],
        );
    }

    #[test]
    fn test_exceeding_consumption_leaves_budget_untouched() {
        let mut budget = PrivacyBudget::new(10., 1e-4).unwrap();
        budget.consume(1, 6., 1e-5).unwrap();
        let err = budget.consume(2, 5., 1e-5).unwrap_err();
        assert_eq!(
            err,
            PrivacyError::BudgetExceeded {
                requested_epsilon: 5.,
                requested_delta: 1e-5,
                remaining_epsilon: 4.,
                remaining_delta: budget.remaining_delta(),
            },
        );
        assert_eq!(budget.epsilon_used(), 6.);
        assert_eq!(budget.history().len(), 1);

        // the ceiling itself is still reachable
        budget.consume(3, 4., 1e-5).unwrap();
        assert_eq!(budget.epsilon_used(), 10.);
    }

    #[test]
    fn test_delta_ceiling() {
        let mut budget = PrivacyBudget::new(10., 1e-5).unwrap();
        assert!(matches!(
            budget.consume(1, 1., 1e-4),
            Err(PrivacyError::BudgetExceeded { .. }),
        ));
        assert_eq!(budget.delta_used(), 0.);
    }

    #[test]
    fn test_invalid_consumption() {
        let mut budget = PrivacyBudget::new(10., 1e-5).unwrap();
        assert!(matches!(
            budget.consume(1, -1., 0.),
            Err(PrivacyError::InvalidPrivacyParameters(_)),
        ));
        assert!(PrivacyBudget::new(f64::NAN, 1e-5).is_err());
    }
}
