//! The Gaussian mechanism for `(ε, δ)` differential privacy.
//!
//! See the [privacy module] documentation since this is a private module anyways.
//!
//! [privacy module]: crate::privacy

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{
    common::{clip_to_norm, PrivacyParameters},
    privacy::PrivacyError,
};

/// The largest privacy loss bound which is still accepted.
pub const MAX_EPSILON: f64 = 10.;

#[derive(Debug, Clone, Copy)]
/// Adds noise drawn from `N(0, σ²)` with `σ = sqrt(2 ln(1.25 / δ)) / ε`.
pub struct GaussianMechanism {
    params: PrivacyParameters,
    sigma: f64,
    noise: Normal<f64>,
}

impl GaussianMechanism {
    /// Creates a mechanism for the privacy parameters `0 < epsilon <= 10` and `0 < delta < 1`.
    ///
    /// # Errors
    /// Fails with [`PrivacyError::InvalidPrivacyParameters`] if the parameters are out of range.
    pub fn new(epsilon: f64, delta: f64) -> Result<Self, PrivacyError> {
        if !(epsilon > 0. && epsilon <= MAX_EPSILON) {
            return Err(PrivacyError::InvalidPrivacyParameters(format!(
                "epsilon must be in (0, {}], got {}",
                MAX_EPSILON, epsilon
            )));
        }
        if !(delta > 0. && delta < 1.) {
            return Err(PrivacyError::InvalidPrivacyParameters(format!(
                "delta must be in (0, 1), got {}",
                delta
            )));
        }
        let sigma = (2. * (1.25 / delta).ln()).sqrt() / epsilon;
        let noise = Normal::new(0., sigma)
            .map_err(|err| PrivacyError::InvalidPrivacyParameters(err.to_string()))?;
        Ok(Self {
            params: PrivacyParameters { epsilon, delta },
            sigma,
            noise,
        })
    }

    /// Gets the privacy parameters.
    pub fn params(&self) -> PrivacyParameters {
        self.params
    }

    /// Gets the standard deviation of the noise.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Adds noise to every element of the vector.
    ///
    /// Returns the noisy vector and the standard deviation of the noise.
    pub fn add_noise<R: Rng + ?Sized>(&self, vector: &[f64], rng: &mut R) -> (Vec<f64>, f64) {
        let noisy = vector
            .iter()
            .map(|x| x + self.noise.sample(rng))
            .collect();
        (noisy, self.sigma)
    }

    /// Clips the vector to an euclidean norm of at most `clip_norm` and then adds noise.
    ///
    /// # Errors
    /// Fails with [`PrivacyError::InvalidPrivacyParameters`] if the clipping norm isn't positive.
    pub fn add_noise_with_clipping<R: Rng + ?Sized>(
        &self,
        vector: &[f64],
        clip_norm: f64,
        rng: &mut R,
    ) -> Result<(Vec<f64>, f64), PrivacyError> {
        if !(clip_norm > 0. && clip_norm.is_finite()) {
            return Err(PrivacyError::InvalidPrivacyParameters(format!(
                "clipping norm must be positive, got {}",
                clip_norm
            )));
        }
        let (clipped, _) = clip_to_norm(vector, clip_norm);
        Ok(self.add_noise(&clipped, rng))
    }
}
