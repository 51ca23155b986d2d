//! Sample-weighted aggregation strategies.
//!
//! See the [aggregation module] documentation since this is a private module anyways.
//!
//! [aggregation module]: crate::aggregation

use crate::aggregation::{AggregationError, SampleCounts, Updates};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// Federated averaging: `Σ (nᵢ / Σn) · wᵢ`.
pub struct FedAvg;

impl FedAvg {
    pub const QUALITY: f64 = 1.;

    /// Computes the sample-weighted average of the updates.
    ///
    /// The updates are expected to be validated already.
    pub fn aggregate(
        &self,
        updates: &Updates,
        sample_counts: &SampleCounts,
    ) -> Result<Vec<f64>, AggregationError> {
        let len = updates
            .values()
            .next()
            .map(Vec::len)
            .ok_or(AggregationError::EmptyInput)?;

        let mut counts = Vec::with_capacity(updates.len());
        for org in updates.keys() {
            match sample_counts.get(org) {
                None => return Err(AggregationError::MissingSampleCount(org.clone())),
                Some(0) => return Err(AggregationError::ZeroSampleCount(org.clone())),
                Some(count) => counts.push(*count as f64),
            }
        }
        let total = counts.iter().sum::<f64>();

        let mut average = vec![0_f64; len];
        for (update, count) in updates.values().zip(counts) {
            let weight = count / total;
            for (avg, w) in average.iter_mut().zip(update) {
                *avg += weight * w;
            }
        }
        Ok(average)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Federated averaging with a proximal correction towards the previous global model:
/// `avg + learning_rate · mu · (previous − avg)`.
pub struct FedProx {
    mu: f64,
    learning_rate: f64,
}

impl FedProx {
    pub const QUALITY: f64 = 0.95;

    /// Creates the strategy with the proximal coefficient `mu` and the learning rate.
    ///
    /// # Errors
    /// Fails if either parameter is negative or not finite.
    pub fn new(mu: f64, learning_rate: f64) -> Result<Self, AggregationError> {
        for (name, value) in &[("proximal coefficient", mu), ("learning rate", learning_rate)] {
            if !(*value >= 0. && value.is_finite()) {
                return Err(AggregationError::InvalidParameter(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(Self { mu, learning_rate })
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Computes the proximally corrected weighted average.
    ///
    /// # Errors
    /// Fails with [`AggregationError::MissingPreviousState`] without a previous global model.
    pub fn aggregate(
        &self,
        updates: &Updates,
        sample_counts: &SampleCounts,
        previous: Option<&[f64]>,
    ) -> Result<Vec<f64>, AggregationError> {
        let previous = previous.ok_or(AggregationError::MissingPreviousState)?;
        let mut average = FedAvg.aggregate(updates, sample_counts)?;
        let factor = self.learning_rate * self.mu;
        for (avg, prev) in average.iter_mut().zip(previous) {
            *avg += factor * (prev - *avg);
        }
        Ok(average)
    }
}
