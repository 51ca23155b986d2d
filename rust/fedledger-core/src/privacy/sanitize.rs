//! Gradient sanitization.
//!
//! See the [privacy module] documentation since this is a private module anyways.
//!
//! [privacy module]: crate::privacy

use serde::{Deserialize, Serialize};

use crate::{
    common::{clip_to_norm, is_finite, l2_norm},
    privacy::PrivacyError,
};

/// Keeps the category normalization finite for zero elements.
const NORMALIZATION_OFFSET: f64 = 1e-8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// Statistics about a sanitized gradient.
pub struct SanitizationStats {
    pub original_norm: f64,
    pub final_norm: f64,
    pub clipped: bool,
    /// The number of elements removed as likely identifying values.
    pub zeroed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Sanitizes gradients before they leave an organization.
///
/// The sanitization steps are, in order:
/// 1. clipping to an euclidean norm of at most `clip_norm`,
/// 2. zeroing out elements with a magnitude above `pii_threshold`, a heuristic for values which
///    likely identify individual records,
/// 3. category normalization, which rescales every element by its own magnitude so that all
///    elements end up close to `-1`, `0` or `1`.
pub struct GradientSanitizer {
    clip_norm: f64,
    pii_threshold: f64,
}

impl GradientSanitizer {
    /// Creates a sanitizer.
    ///
    /// # Errors
    /// Fails if the clipping norm or the threshold aren't positive.
    pub fn new(clip_norm: f64, pii_threshold: f64) -> Result<Self, PrivacyError> {
        if !(clip_norm > 0. && clip_norm.is_finite()) {
            return Err(PrivacyError::InvalidPrivacyParameters(format!(
                "clipping norm must be positive, got {}",
                clip_norm
            )));
        }
        if !(pii_threshold > 0.) {
            return Err(PrivacyError::InvalidPrivacyParameters(format!(
                "identifying value threshold must be positive, got {}",
                pii_threshold
            )));
        }
        Ok(Self {
            clip_norm,
            pii_threshold,
        })
    }

    /// Sanitizes a gradient.
    ///
    /// # Errors
    /// Fails with [`PrivacyError::InvalidGradient`] for an empty gradient and with
    /// [`PrivacyError::SanitizationFailed`] if the result contains non-finite values.
    pub fn sanitize(
        &self,
        gradient: &[f64],
    ) -> Result<(Vec<f64>, SanitizationStats), PrivacyError> {
        if gradient.is_empty() {
            return Err(PrivacyError::InvalidGradient("empty gradient".into()));
        }
        let original_norm = l2_norm(gradient);
        let (mut sanitized, clipped) = clip_to_norm(gradient, self.clip_norm);

        let mut zeroed = 0;
        for x in sanitized.iter_mut() {
            if x.abs() > self.pii_threshold {
                *x = 0.;
                zeroed += 1;
            }
            *x /= x.abs() + NORMALIZATION_OFFSET;
        }

        if !is_finite(&sanitized) {
            return Err(PrivacyError::SanitizationFailed(format!(
                "non-finite values after sanitizing a gradient of norm {}",
                original_norm
            )));
        }
        let stats = SanitizationStats {
            original_norm,
            final_norm: l2_norm(&sanitized),
            clipped,
            zeroed,
        };
        Ok((sanitized, stats))
    }
}
