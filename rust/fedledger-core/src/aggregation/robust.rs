//! Byzantine-robust reducers.
//!
//! See the [aggregation module] documentation since this is a private module anyways.
//!
//! [aggregation module]: crate::aggregation

use crate::{
    aggregation::{validate_updates, AggregationError, Updates},
    common::{euclidean_distance, l2_norm},
    OrganizationId,
};

/// A reducer which tolerates a fraction of malicious or corrupted updates.
pub trait RobustReducer {
    /// Reduces the gradients to a single gradient and an anomaly score.
    ///
    /// # Errors
    /// Fails with [`AggregationError::EmptyInput`] if there are no gradients and with
    /// [`AggregationError::DimensionMismatch`] if their lengths differ.
    fn reduce(&self, gradients: &Updates) -> Result<(Vec<f64>, f64), AggregationError>;
}

fn median_of(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.
    } else {
        values[mid]
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// The element-wise median.
///
/// The anomaly score is the mean distance of the gradients to the median divided by the standard
/// deviation of those distances, capped at `1`.
pub struct Median;

impl RobustReducer for Median {
    fn reduce(&self, gradients: &Updates) -> Result<(Vec<f64>, f64), AggregationError> {
        let len = validate_updates(gradients)?;
        let mut column = Vec::with_capacity(gradients.len());
        let median = (0..len)
            .map(|i| {
                column.clear();
                column.extend(gradients.values().map(|gradient| gradient[i]));
                median_of(&mut column)
            })
            .collect::<Vec<_>>();

        let distances = gradients
            .values()
            .map(|gradient| euclidean_distance(gradient, &median))
            .collect::<Vec<_>>();
        let (mean, std) = mean_and_std(&distances);
        let anomaly = if std > 0. { (mean / std).min(1.) } else { 0. };
        Ok((median, anomaly))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// The mean after discarding the fraction `trim` of gradients with the smallest and the largest
/// norms each.
///
/// The anomaly score is the mean element-wise standard deviation of the retained gradients.
pub struct TrimmedMean {
    trim: f64,
}

impl TrimmedMean {
    /// Creates the reducer with a trim fraction in `[0, 0.5)`.
    ///
    /// # Errors
    /// Fails if the trim fraction is out of range.
    pub fn new(trim: f64) -> Result<Self, AggregationError> {
        if (0. ..0.5).contains(&trim) {
            Ok(Self { trim })
        } else {
            Err(AggregationError::InvalidParameter(format!(
                "trim percentage must be in [0, 0.5), got {}",
                trim
            )))
        }
    }

    pub fn trim(&self) -> f64 {
        self.trim
    }

    /// Selects the gradients which are retained after trimming, ordered by norm.
    ///
    /// Exactly `n - 2 * floor(n * trim)` out of `n` gradients are retained. Gradients of equal
    /// norm keep the order of their organizations.
    pub fn retained<'a>(&self, gradients: &'a Updates) -> Vec<(&'a OrganizationId, &'a Vec<f64>)> {
        let mut by_norm = gradients
            .iter()
            .map(|(org, gradient)| (l2_norm(gradient), org, gradient))
            .collect::<Vec<_>>();
        by_norm.sort_by(|a, b| a.0.total_cmp(&b.0));

        let n = by_norm.len();
        let k = (n as f64 * self.trim).floor() as usize;
        by_norm
            .into_iter()
            .skip(k)
            .take(n - 2 * k)
            .map(|(_, org, gradient)| (org, gradient))
            .collect()
    }
}

impl RobustReducer for TrimmedMean {
    fn reduce(&self, gradients: &Updates) -> Result<(Vec<f64>, f64), AggregationError> {
        let len = validate_updates(gradients)?;
        let retained = self.retained(gradients);

        let mut column = Vec::with_capacity(retained.len());
        let mut mean = Vec::with_capacity(len);
        let mut std_sum = 0.;
        for i in 0..len {
            column.clear();
            column.extend(retained.iter().map(|(_, gradient)| gradient[i]));
            let (m, s) = mean_and_std(&column);
            mean.push(m);
            std_sum += s;
        }
        let anomaly = if len > 0 { std_sum / len as f64 } else { 0. };
        Ok((mean, anomaly))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// Selects the single gradient with the smallest summed distance to its `floor(n / 2)` nearest
/// neighbors.
///
/// The anomaly score is the distance of the selected gradient to its nearest neighbor divided by
/// its largest distance to any other gradient.
pub struct Krum;

impl Krum {
    /// Selects the organization whose gradient Krum picks.
    ///
    /// Ties are resolved in favor of the first organization.
    ///
    /// # Errors
    /// Fails if the gradients are empty or inconsistent.
    pub fn select<'a>(
        &self,
        gradients: &'a Updates,
    ) -> Result<&'a OrganizationId, AggregationError> {
        validate_updates(gradients)?;
        self.score(gradients)
            .map(|(org, _)| org)
            .ok_or(AggregationError::EmptyInput)
    }

    fn score<'a>(&self, gradients: &'a Updates) -> Option<(&'a OrganizationId, Vec<f64>)> {
        let k = gradients.len() / 2;
        let mut best: Option<(&OrganizationId, f64, Vec<f64>)> = None;
        for (org, gradient) in gradients {
            let mut distances = gradients
                .iter()
                .filter(|(other, _)| *other != org)
                .map(|(_, other)| euclidean_distance(gradient, other))
                .collect::<Vec<_>>();
            distances.sort_by(f64::total_cmp);
            let score = distances.iter().take(k).sum::<f64>();
            if best.as_ref().map_or(true, |(_, best_score, _)| score < *best_score) {
                best = Some((org, score, distances));
            }
        }
        best.map(|(org, _, distances)| (org, distances))
    }
}

impl RobustReducer for Krum {
    fn reduce(&self, gradients: &Updates) -> Result<(Vec<f64>, f64), AggregationError> {
        validate_updates(gradients)?;
        let (org, distances) = self.score(gradients).ok_or(AggregationError::EmptyInput)?;
        let selected = gradients
            .get(org)
            .cloned()
            .ok_or(AggregationError::EmptyInput)?;

        // the distances are sorted ascendingly
        let anomaly = match (distances.first(), distances.last()) {
            (Some(min), Some(max)) if *max > 0. => min / max,
            _ => 0.,
        };
        Ok((selected, anomaly))
    }
}
