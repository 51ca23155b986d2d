//! Types and vector helpers shared across the crate.

use serde::{Deserialize, Serialize};

/// The differential privacy parameters of a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PrivacyParameters {
    /// The privacy loss bound.
    pub epsilon: f64,
    /// The probability of exceeding the privacy loss bound.
    pub delta: f64,
}

/// Computes the euclidean norm of a vector.
pub fn l2_norm(vector: &[f64]) -> f64 {
    vector.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Computes the euclidean distance between two vectors of equal length.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Checks whether all elements of a vector are finite.
pub fn is_finite(vector: &[f64]) -> bool {
    vector.iter().all(|x| x.is_finite())
}

/// Rescales a vector to an euclidean norm of at most `max_norm`.
///
/// Returns the rescaled vector and whether it had to be clipped.
pub fn clip_to_norm(vector: &[f64], max_norm: f64) -> (Vec<f64>, bool) {
    let norm = l2_norm(vector);
    if norm > max_norm {
        let scale = max_norm / norm;
        (vector.iter().map(|x| x * scale).collect(), true)
    } else {
        (vector.to_vec(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norms() {
        assert_eq!(l2_norm(&[3., 4.]), 5.);
        assert_eq!(l2_norm(&[]), 0.);
        assert_eq!(euclidean_distance(&[1., 1.], &[4., 5.]), 5.);
    }

    #[test]
    fn test_clip_to_norm() {
        let (clipped, was_clipped) = clip_to_norm(&[3., 4.], 1.);
        assert!(was_clipped);
        assert!((l2_norm(&clipped) - 1.).abs() < 1e-12);
        assert!((clipped[0] - 0.6).abs() < 1e-12);

        let (kept, was_clipped) = clip_to_norm(&[0.3, 0.4], 1.);
        assert!(!was_clipped);
        assert_eq!(kept, vec![0.3, 0.4]);
    }
}
