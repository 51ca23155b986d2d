//! Aggregation of local model updates into a global model update.
//!
//! An [`Aggregator`] is fixed to one strategy and its parameters at construction:
//! - [`FedAvg`]: the sample-weighted average of the updates.
//! - [`FedProx`]: the weighted average pulled back towards the previous global model.
//! - [`Median`], [`TrimmedMean`] and [`Krum`]: Byzantine-robust reducers which ignore the sample
//!   counts and additionally score how anomalous the set of updates looks.
//!
//! ```
//! # use std::collections::BTreeMap;
//! # use fedledger_core::aggregation::{Aggregator, FedAvg};
//! let updates: BTreeMap<_, _> = vec![
//!     ("org-a".to_string(), vec![0.0, 1.0]),
//!     ("org-b".to_string(), vec![1.0, 1.0]),
//! ]
//! .into_iter()
//! .collect();
//! let samples: BTreeMap<_, _> = vec![("org-a".to_string(), 1), ("org-b".to_string(), 3)]
//!     .into_iter()
//!     .collect();
//! let aggregation = Aggregator::from(FedAvg).aggregate(&updates, &samples, None).unwrap();
//! assert_eq!(aggregation.global, vec![0.75, 1.0]);
//! assert_eq!(aggregation.metrics.quality, 1.0);
//! ```

pub(crate) mod robust;
pub(crate) mod weighted;

use std::collections::BTreeMap;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    common::{euclidean_distance, is_finite, l2_norm},
    OrganizationId,
};

pub use self::{
    robust::{Krum, Median, RobustReducer, TrimmedMean},
    weighted::{FedAvg, FedProx},
};

/// A mapping of organizations to their local update vectors.
pub type Updates = BTreeMap<OrganizationId, Vec<f64>>;

/// A mapping of organizations to the number of samples they trained on.
pub type SampleCounts = BTreeMap<OrganizationId, u64>;

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to the aggregation of updates.
pub enum AggregationError {
    #[error("there are no updates to aggregate")]
    EmptyInput,

    #[error("the proximal aggregation requires the previous global model")]
    MissingPreviousState,

    #[error("update of {org} has length {actual}, expected {expected}")]
    DimensionMismatch {
        org: OrganizationId,
        expected: usize,
        actual: usize,
    },

    #[error("no sample count for the update of {0}")]
    MissingSampleCount(OrganizationId),

    #[error("the update of {0} was trained on zero samples")]
    ZeroSampleCount(OrganizationId),

    #[error("the update of {0} contains non-finite values")]
    NonFiniteInput(OrganizationId),

    #[error("invalid aggregation parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The configurable aggregation methods.
pub enum AggregationMethod {
    #[display(fmt = "fedavg")]
    FedAvg,
    #[display(fmt = "fedprox")]
    FedProx,
    /// Weighted averaging of securely aggregated, masked updates.
    #[display(fmt = "secagg")]
    SecAgg,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The configurable Byzantine-robust aggregation methods.
pub enum RobustMethod {
    #[display(fmt = "median")]
    Median,
    #[display(fmt = "trimmed_mean")]
    TrimmedMean,
    #[display(fmt = "krum")]
    Krum,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Metrics of an aggregation.
pub struct AggregationMetrics {
    /// The number of aggregated updates.
    pub participants: usize,
    /// The norm of the difference to the previous global model, or of the result without one.
    pub delta_norm: f64,
    /// The norm of the aggregated update.
    pub gradient_norm: f64,
    /// A quality score in `[0, 1]`.
    pub quality: f64,
    /// The anomaly score of the robust reducers.
    pub anomaly_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
/// The outcome of an aggregation.
pub struct Aggregation {
    pub global: Vec<f64>,
    pub metrics: AggregationMetrics,
}

#[derive(Debug, Clone, PartialEq, From)]
/// An aggregation strategy together with its parameters.
pub enum Aggregator {
    FedAvg(FedAvg),
    FedProx(FedProx),
    Median(Median),
    TrimmedMean(TrimmedMean),
    Krum(Krum),
}

impl Aggregator {
    /// Gets the name of the strategy as recorded in the ledger.
    pub fn method_name(&self) -> &'static str {
        match self {
            Aggregator::FedAvg(_) => "fedavg",
            Aggregator::FedProx(_) => "fedprox",
            Aggregator::Median(_) => "median",
            Aggregator::TrimmedMean(_) => "trimmed_mean",
            Aggregator::Krum(_) => "krum",
        }
    }

    /// Aggregates the updates.
    ///
    /// The sample counts are only used by the weighted strategies and the previous global model
    /// is required by [`FedProx`]. If present it is also used for the delta norm metric.
    ///
    /// # Errors
    /// Fails if there are no updates, if the updates are inconsistent or if the strategy misses
    /// some of its inputs.
    pub fn aggregate(
        &self,
        updates: &Updates,
        sample_counts: &SampleCounts,
        previous: Option<&[f64]>,
    ) -> Result<Aggregation, AggregationError> {
        let len = validate_updates(updates)?;
        if let Some(previous) = previous {
            check_dimension("previous global model", len, previous.len())?;
        }

        let (global, quality, anomaly_score) = match self {
            Aggregator::FedAvg(fedavg) => (
                fedavg.aggregate(updates, sample_counts)?,
                FedAvg::QUALITY,
                None,
            ),
            Aggregator::FedProx(fedprox) => (
                fedprox.aggregate(updates, sample_counts, previous)?,
                FedProx::QUALITY,
                None,
            ),
            Aggregator::Median(median) => robust_outcome(median.reduce(updates)?),
            Aggregator::TrimmedMean(trimmed) => robust_outcome(trimmed.reduce(updates)?),
            Aggregator::Krum(krum) => robust_outcome(krum.reduce(updates)?),
        };

        let gradient_norm = l2_norm(&global);
        let delta_norm = previous
            .map(|previous| euclidean_distance(&global, previous))
            .unwrap_or(gradient_norm);
        let metrics = AggregationMetrics {
            participants: updates.len(),
            delta_norm,
            gradient_norm,
            quality,
            anomaly_score,
        };
        Ok(Aggregation { global, metrics })
    }
}

fn robust_outcome((global, anomaly): (Vec<f64>, f64)) -> (Vec<f64>, f64, Option<f64>) {
    let quality = (1. - anomaly).max(0.).min(1.);
    (global, quality, Some(anomaly))
}

fn check_dimension(org: &str, expected: usize, actual: usize) -> Result<(), AggregationError> {
    if expected == actual {
        Ok(())
    } else {
        Err(AggregationError::DimensionMismatch {
            org: org.to_string(),
            expected,
            actual,
        })
    }
}

/// Checks that the updates are non-empty, finite and of equal length.
///
/// Returns the common length of the updates.
pub(crate) fn validate_updates(updates: &Updates) -> Result<usize, AggregationError> {
    let len = updates
        .values()
        .next()
        .map(Vec::len)
        .ok_or(AggregationError::EmptyInput)?;
    for (org, update) in updates {
        check_dimension(org, len, update.len())?;
        if !is_finite(update) {
            return Err(AggregationError::NonFiniteInput(org.clone()));
        }
    }
    Ok(len)
}

#[cfg(test)]
pub(crate) mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::*;

    pub fn updates(entries: &[(&str, Vec<f64>)]) -> Updates {
        entries
            .iter()
            .map(|(org, update)| (org.to_string(), update.clone()))
            .collect()
    }

    pub fn samples(entries: &[(&str, u64)]) -> SampleCounts {
        entries
            .iter()
            .map(|(org, count)| (org.to_string(), *count))
            .collect()
    }

    pub fn random_updates(prng: &mut ChaCha20Rng, n: usize, len: usize) -> Updates {
        (0..n)
            .map(|i| {
                let update = (0..len).map(|_| prng.gen_range(-10_f64..10.)).collect();
                (format!("org-{:02}", i), update)
            })
            .collect()
    }

    #[test]
    fn test_empty_input() {
        let aggregators: Vec<Aggregator> = vec![
            FedAvg.into(),
            FedProx::new(0.1, 0.01).unwrap().into(),
            Median.into(),
            TrimmedMean::new(0.1).unwrap().into(),
            Krum.into(),
        ];
        for aggregator in aggregators {
            assert_eq!(
                aggregator.aggregate(&Updates::new(), &SampleCounts::new(), Some(&[])),
                Err(AggregationError::EmptyInput),
            );
        }
    }

    #[test]
    fn test_inconsistent_updates() {
        let aggregator = Aggregator::from(Median);
        let mismatch = updates(&[("org-a", vec![1., 2.]), ("org-b", vec![1.])]);
        assert!(matches!(
            aggregator.aggregate(&mismatch, &SampleCounts::new(), None),
            Err(AggregationError::DimensionMismatch { .. }),
        ));
        let non_finite = updates(&[("org-a", vec![1., f64::NAN])]);
        assert_eq!(
            aggregator.aggregate(&non_finite, &SampleCounts::new(), None),
            Err(AggregationError::NonFiniteInput("org-a".into())),
        );
        let fine = updates(&[("org-a", vec![1., 2.])]);
        assert!(matches!(
            aggregator.aggregate(&fine, &SampleCounts::new(), Some(&[1.])),
            Err(AggregationError::DimensionMismatch { .. }),
        ));
    }

    #[test]
    fn test_metrics() {
        let input = updates(&[("org-a", vec![3., 0.]), ("org-b", vec![3., 8.])]);
        let counts = samples(&[("org-a", 1), ("org-b", 1)]);
        let aggregation = Aggregator::from(FedAvg)
            .aggregate(&input, &counts, Some(&[0., 0.]))
            .unwrap();
        assert_eq!(aggregation.global, vec![3., 4.]);
        assert_eq!(aggregation.metrics.participants, 2);
        assert_eq!(aggregation.metrics.gradient_norm, 5.);
        assert_eq!(aggregation.metrics.delta_norm, 5.);
        assert_eq!(aggregation.metrics.anomaly_score, None);

        let aggregation = Aggregator::from(FedAvg)
            .aggregate(&input, &counts, Some(&[3., 0.]))
            .unwrap();
        assert_eq!(aggregation.metrics.delta_norm, 4.);

        let aggregation = Aggregator::from(Krum)
            .aggregate(&input, &counts, None)
            .unwrap();
        let quality = aggregation.metrics.quality;
        assert!((0. ..=1.).contains(&quality));
        assert_eq!(
            Some(1. - quality),
            aggregation.metrics.anomaly_score.map(|a| a.min(1.)),
        );
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Aggregator::from(FedAvg).method_name(), "fedavg");
        assert_eq!(
            Aggregator::from(TrimmedMean::new(0.2).unwrap()).method_name(),
            "trimmed_mean",
        );
        assert_eq!(AggregationMethod::SecAgg.to_string(), "secagg");
        assert_eq!(RobustMethod::TrimmedMean.to_string(), "trimmed_mean");
    }
}
