//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedledger_core::{
    aggregation::{AggregationMethod, RobustMethod},
    common::PrivacyParameters,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub aggregation: AggregationSettings,
    #[validate]
    pub round: RoundSettings,
    #[validate]
    pub privacy: PrivacySettings,
    #[validate]
    pub encryption: EncryptionSettings,
    #[validate]
    pub ledger: LedgerSettings,
    #[validate]
    pub model: ModelSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedledger").separator("__"))?;
        config.try_into()
    }

    /// Splits the settings into the federation and the logging settings.
    pub fn into_parts(self) -> (FederationSettings, LoggingSettings) {
        let federation = FederationSettings {
            aggregation: self.aggregation,
            round: self.round,
            privacy: self.privacy,
            encryption: self.encryption,
            ledger: self.ledger,
            model: self.model,
        };
        (federation, self.log)
    }
}

/// A wrapper for validate derive.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    validate_methods(&s.aggregation, &s.encryption)
}

/// Checks that the aggregation method fits the encryption settings.
fn validate_methods(
    aggregation: &AggregationSettings,
    encryption: &EncryptionSettings,
) -> Result<(), ValidationError> {
    let secagg = aggregation.method == AggregationMethod::SecAgg;
    if secagg != encryption.secure_aggregation {
        return Err(ValidationError::new(
            "the secagg method and secure aggregation must be enabled together",
        ));
    }
    if secagg && aggregation.robust.enabled {
        // masked updates only reveal their sum
        return Err(ValidationError::new(
            "robust aggregation is unavailable for masked updates",
        ));
    }
    if encryption.homomorphic
        && (aggregation.method != AggregationMethod::FedAvg || aggregation.robust.enabled)
    {
        // ciphertexts only support the weighted sum
        return Err(ValidationError::new(
            "homomorphic encryption requires plain fedavg aggregation",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
/// The settings a federation is built from.
pub struct FederationSettings {
    pub aggregation: AggregationSettings,
    pub round: RoundSettings,
    pub privacy: PrivacySettings,
    pub encryption: EncryptionSettings,
    pub ledger: LedgerSettings,
    pub model: ModelSettings,
}

impl FederationSettings {
    /// Checks the sections and their combination.
    ///
    /// # Errors
    /// Fails if any section is invalid.
    pub fn check(&self) -> Result<(), ValidationErrors> {
        self.aggregation.validate()?;
        self.round.validate()?;
        self.privacy.validate()?;
        self.encryption.validate()?;
        self.ledger.validate()?;
        self.model.validate()?;
        validate_methods(&self.aggregation, &self.encryption).map_err(|err| {
            let mut errors = ValidationErrors::new();
            errors.add("aggregation", err);
            errors
        })
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_aggregation"))]
/// Aggregation settings.
pub struct AggregationSettings {
    /// The aggregation method: `fedavg`, `fedprox` or `secagg`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// method = "fedavg"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLEDGER_AGGREGATION__METHOD=fedprox
    /// ```
    pub method: AggregationMethod,
    /// The proximal coefficient λ of the `fedprox` method.
    pub proximal_mu: f64,
    /// The learning rate of the `fedprox` method.
    pub learning_rate: f64,
    /// The Byzantine-robust reducer which replaces the weighted methods if enabled.
    #[serde(default)]
    pub robust: RobustSettings,
}

impl AggregationSettings {
    fn validate_aggregation(&self) -> Result<(), ValidationError> {
        if !(self.proximal_mu >= 0. && self.proximal_mu.is_finite()) {
            return Err(ValidationError::new("invalid proximal coefficient"));
        }
        if !(self.learning_rate > 0. && self.learning_rate.is_finite()) {
            return Err(ValidationError::new("invalid learning rate"));
        }
        if !(0. ..0.5).contains(&self.robust.trim_percentage) {
            return Err(ValidationError::new("invalid trim percentage"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_aggregation(s: &AggregationSettings) -> Result<(), ValidationError> {
    s.validate_aggregation()
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Byzantine-robust aggregation settings.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [aggregation.robust]
/// enabled = true
/// method = "trimmed_mean"
/// trim_percentage = 0.1
/// ```
///
/// **Environment variable**
/// ```text
/// FEDLEDGER_AGGREGATION__ROBUST__ENABLED=true
/// FEDLEDGER_AGGREGATION__ROBUST__METHOD=krum
/// ```
pub struct RobustSettings {
    pub enabled: bool,
    /// The reducer: `median`, `trimmed_mean` or `krum`.
    pub method: RobustMethod,
    /// The fraction of participants trimmed at each end by `trimmed_mean`, in `[0, 0.5)`.
    pub trim_percentage: f64,
}

impl Default for RobustSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            method: RobustMethod::Median,
            trim_percentage: 0.1,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Round settings.
pub struct RoundSettings {
    /// The minimal number of verified submissions required to aggregate a round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// min_clients = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLEDGER_ROUND__MIN_CLIENTS=3
    /// ```
    #[validate(range(min = 1))]
    pub min_clients: usize,
    /// The time organizations have to submit their updates after the start of a round, in
    /// seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// timeout = 3600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLEDGER_ROUND__TIMEOUT=3600
    /// ```
    #[validate(range(min = 1))]
    pub timeout: u64,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_privacy"))]
/// Differential privacy settings.
pub struct PrivacySettings {
    /// Whether the aggregated model is protected by differential privacy noise.
    pub differential_privacy: bool,
    /// The privacy loss bound per round, in `(0, 10]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// epsilon = 1.0
    /// delta = 1e-5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLEDGER_PRIVACY__EPSILON=1.0
    /// FEDLEDGER_PRIVACY__DELTA=0.00001
    /// ```
    pub epsilon: f64,
    /// The probability of exceeding the privacy loss bound per round, in `(0, 1)`.
    pub delta: f64,
    /// The euclidean norm every update is clipped to before aggregation.
    pub clipping_norm: f64,
    /// The ceiling of the cumulative epsilon over all rounds.
    pub max_epsilon: f64,
    /// The ceiling of the cumulative delta over all rounds.
    pub max_delta: f64,
}

impl PrivacySettings {
    /// Gets the per round privacy parameters.
    pub fn params(&self) -> PrivacyParameters {
        PrivacyParameters {
            epsilon: self.epsilon,
            delta: self.delta,
        }
    }

    fn validate_privacy(&self) -> Result<(), ValidationError> {
        if !(0. < self.epsilon && self.epsilon <= 10. && 0. < self.delta && self.delta < 1.) {
            return Err(ValidationError::new("invalid privacy parameters"));
        }
        if !(self.clipping_norm > 0. && self.clipping_norm.is_finite()) {
            return Err(ValidationError::new("invalid clipping norm"));
        }
        if !(self.epsilon <= self.max_epsilon
            && self.max_epsilon.is_finite()
            && self.delta <= self.max_delta
            && self.max_delta.is_finite())
        {
            return Err(ValidationError::new("privacy ceiling below a single round"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_privacy(s: &PrivacySettings) -> Result<(), ValidationError> {
    s.validate_privacy()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_encryption"))]
/// Encryption settings.
pub struct EncryptionSettings {
    /// Whether updates may be submitted homomorphically encrypted.
    pub homomorphic: bool,
    /// The key size of the homomorphic encryption in bits, either `128` or `256`.
    pub key_size: usize,
    /// Whether updates are submitted with pairwise masks.
    pub secure_aggregation: bool,
}

/// A wrapper for validate derive.
fn validate_encryption(s: &EncryptionSettings) -> Result<(), ValidationError> {
    if s.key_size == 128 || s.key_size == 256 {
        Ok(())
    } else {
        Err(ValidationError::new("invalid key size"))
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Ledger settings.
pub struct LedgerSettings {
    /// Whether every block must be signed by several organizations.
    pub multi_signature: bool,
    /// The minimal number of organization signatures per block if `multi_signature` is enabled.
    #[validate(range(min = 1))]
    pub min_signatures: usize,
    /// The file the ledger is persisted to. The ledger is kept in memory only if this is unset.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [ledger]
    /// path = "/var/lib/fedledger/ledger.json"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLEDGER_LEDGER__PATH=/var/lib/fedledger/ledger.json
    /// ```
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Model settings.
pub struct ModelSettings {
    /// The expected length of the model.
    #[validate(range(min = 1))]
    pub length: usize,
    /// The version of the initial model, anchored in the genesis block.
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLEDGER_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.16/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.16/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    impl Default for FederationSettings {
        fn default() -> Self {
            Self {
                aggregation: AggregationSettings {
                    method: AggregationMethod::FedAvg,
                    proximal_mu: 0.01,
                    learning_rate: 0.01,
                    robust: RobustSettings::default(),
                },
                round: RoundSettings {
                    min_clients: 2,
                    timeout: 3600,
                },
                privacy: PrivacySettings {
                    differential_privacy: false,
                    epsilon: 1.,
                    delta: 1e-5,
                    clipping_norm: 10.,
                    max_epsilon: 10.,
                    max_delta: 1e-4,
                },
                encryption: EncryptionSettings {
                    homomorphic: false,
                    key_size: 256,
                    secure_aggregation: false,
                },
                ledger: LedgerSettings {
                    multi_signature: false,
                    min_signatures: 1,
                    path: None,
                },
                model: ModelSettings {
                    length: 4,
                    version: 0,
                },
            }
        }
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new("../../configs/config.toml").is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_into_parts() {
        let (federation, _) = Settings::new("../../configs/config.toml")
            .unwrap()
            .into_parts();
        assert!(federation.check().is_ok());
    }

    #[test]
    fn test_validate_default() {
        assert!(FederationSettings::default().check().is_ok());
    }

    #[test]
    fn test_validate_aggregation() {
        let mut settings = FederationSettings::default();
        settings.aggregation.proximal_mu = -0.1;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.aggregation.learning_rate = 0.;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.aggregation.robust.trim_percentage = 0.5;
        assert!(settings.check().is_err());
    }

    #[test]
    fn test_validate_methods() {
        let mut settings = FederationSettings::default();
        settings.aggregation.method = AggregationMethod::SecAgg;
        assert!(settings.check().is_err());
        settings.encryption.secure_aggregation = true;
        assert!(settings.check().is_ok());
        settings.aggregation.robust.enabled = true;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.encryption.secure_aggregation = true;
        assert!(settings.check().is_err());
    }

    #[test]
    fn test_validate_homomorphic_methods() {
        let mut settings = FederationSettings::default();
        settings.encryption.homomorphic = true;
        assert!(settings.check().is_ok());

        settings.aggregation.method = AggregationMethod::FedProx;
        assert!(settings.check().is_err());

        settings.aggregation.method = AggregationMethod::FedAvg;
        settings.aggregation.robust.enabled = true;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.encryption.homomorphic = true;
        settings.encryption.secure_aggregation = true;
        settings.aggregation.method = AggregationMethod::SecAgg;
        assert!(settings.check().is_err());
    }

    #[test]
    fn test_validate_round() {
        let mut settings = FederationSettings::default();
        settings.round.min_clients = 0;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.round.timeout = 0;
        assert!(settings.check().is_err());
    }

    #[test]
    fn test_validate_privacy() {
        let mut settings = FederationSettings::default();
        settings.privacy.epsilon = 0.;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.privacy.epsilon = 10. + f64::EPSILON * 10.;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.privacy.delta = 1.;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.privacy.clipping_norm = 0.;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.privacy.max_epsilon = 0.5;
        assert!(settings.check().is_err());
    }

    #[test]
    fn test_validate_encryption_and_ledger() {
        let mut settings = FederationSettings::default();
        settings.encryption.key_size = 512;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.ledger.min_signatures = 0;
        assert!(settings.check().is_err());

        let mut settings = FederationSettings::default();
        settings.model.length = 0;
        assert!(settings.check().is_err());
    }
}
