//! The federation orchestrator.
//!
//! A [`Federation`] is the context object which external callers address. It owns the registry
//! of organizations and the live training rounds, aggregates the updates of a round under the
//! configured strategy and privacy policy, and finalizes rounds by anchoring them in the
//! [`Ledger`].
//!
//! A round is driven through the following calls:
//!
//! 1. [`Federation::start_training_round`] enrolls all active organizations.
//! 2. [`Federation::submit_gradient`] records and verifies the submission of an organization.
//! 3. [`Federation::aggregate_round`] (or one of its masked and encrypted variants) computes the
//!    new global model from the decrypted updates once a quorum is reached.
//! 4. [`Federation::anchor_round`] appends the block signed by the organizations.
//! 5. [`Federation::complete_round`] publishes the new global model.
//!
//! Deadlines are cooperative: a supervisor calls [`Federation::expire_overdue_rounds`]
//! periodically. At most one round is active at a time.

mod organization;

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use displaydoc::Display;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::{self, JoinError};
use tracing::{debug, info, info_span, warn, Instrument};

use fedledger_core::{
    aggregation::{
        AggregationError,
        AggregationMethod,
        Aggregator,
        FedAvg,
        FedProx,
        Krum,
        Median,
        RobustMethod,
        SampleCounts,
        TrimmedMean,
        Updates,
    },
    common::{clip_to_norm, euclidean_distance, l2_norm, PrivacyParameters},
    crypto::{
        model_hash,
        ByteObject,
        Ciphertext,
        EncryptionError,
        HomomorphicEncryption,
        PadEncryption,
        PublicSigningKey,
        Sha256,
        Signature,
    },
    mask::{aggregate_masked, Mask, MaskingError, MaskingSession},
    privacy::{GaussianMechanism, PrivacyBudget, PrivacyError},
    OrganizationId,
};

use crate::{
    events::{EventPublisher, EventSubscriber, ModelUpdate},
    ledger::{
        anchor_message,
        check_signatures,
        Block,
        Ledger,
        LedgerError,
        LedgerStorage,
        Provenance,
    },
    round::{
        AggregationRecord,
        ConvergenceMetrics,
        Round,
        RoundError,
        RoundPhase,
        RoundSnapshot,
        SubmissionPhase,
        UpdateMetadata,
    },
    settings::{AggregationSettings, FederationSettings},
};

pub use self::organization::{Organization, INITIAL_REPUTATION};

/// The organization recorded as creator of a genesis block made by the federation.
pub const COORDINATOR_ID: &str = "coordinator";

/// Errors of the federation.
#[derive(Debug, Display, Error)]
pub enum FederationError {
    /// Invalid settings: {0}.
    InvalidSettings(String),
    /// Organization {0} is already registered.
    AlreadyRegistered(OrganizationId),
    /// Organization {0} is not registered.
    UnknownOrganization(OrganizationId),
    /// Organization {0} is inactive.
    InactiveOrganization(OrganizationId),
    /// Round {0} is still active.
    RoundAlreadyActive(u64),
    /// Round {0} does not exist.
    UnknownRound(u64),
    /// Round {0} exceeded its deadline.
    RoundTimeout(u64),
    /// Round {round} has {have} verified participants but requires {need}.
    InsufficientParticipants { round: u64, have: usize, need: usize },
    /// Aggregation of round {round} failed: {reason}.
    AggregationFailed { round: u64, reason: String },
    /// Submission of {org} for round {round} was rejected: {reason}.
    InvalidSubmission {
        round: u64,
        org: OrganizationId,
        reason: String,
    },
    /// Round {0} is not anchored in the ledger.
    RoundNotAnchored(u64),
    /// Round {0} is already anchored in the ledger.
    RoundAlreadyAnchored(u64),
    /// Round {round} has no secure aggregation session.
    NoMaskingSession { round: u64 },
    /// Round {round} refused the request: {source}.
    Round { round: u64, source: RoundError },
    /// Privacy policy violated in round {round}: {source}.
    Privacy { round: u64, source: PrivacyError },
    /// Masking failed in round {round}: {source}.
    Masking { round: u64, source: MaskingError },
    /// Anchoring of round {round} failed: {source}.
    AnchoringFailed { round: u64, source: LedgerError },
    /// Ledger error: {0}.
    Ledger(#[from] LedgerError),
    /// Encryption error: {0}.
    Encryption(#[from] EncryptionError),
}

/// Errors while combining protected updates.
#[derive(Debug, Error)]
enum CombineError {
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Masking(#[from] MaskingError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

#[derive(Debug, Clone, PartialEq)]
/// The acknowledgment of a registration.
pub struct RegistrationAck {
    pub org: OrganizationId,
    pub method: AggregationMethod,
    /// Whether the federation adds differential privacy noise.
    pub differential_privacy: bool,
    pub privacy: PrivacyParameters,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
/// The parameters of a started round.
pub struct RoundInfo {
    pub round_id: u64,
    /// The time after which the round may be failed.
    pub deadline: Duration,
    pub privacy: PrivacyParameters,
    pub model_version: u64,
    pub model_hash: String,
    pub participants: Vec<OrganizationId>,
}

#[derive(Debug, Clone, PartialEq)]
/// The receipt of an accepted submission.
pub struct SubmissionReceipt {
    pub round_id: u64,
    pub org: OrganizationId,
    pub content_hash: String,
    pub phase: SubmissionPhase,
}

#[derive(Debug, Clone, PartialEq)]
/// The current global model.
pub struct GlobalModel {
    pub version: u64,
    pub hash: String,
    /// The weights, unless the federation was restored from a ledger.
    pub weights: Option<Arc<Vec<f64>>>,
}

/// The federation orchestrator.
pub struct Federation<S> {
    settings: FederationSettings,
    aggregator: Aggregator,
    noise: Option<GaussianMechanism>,
    budget: Mutex<PrivacyBudget>,
    encryption: Option<Arc<dyn HomomorphicEncryption>>,
    organizations: RwLock<BTreeMap<OrganizationId, Organization>>,
    rounds: RwLock<BTreeMap<u64, Arc<Round>>>,
    active: Mutex<Option<u64>>,
    next_round_id: Mutex<u64>,
    masking: Mutex<BTreeMap<u64, MaskingSession>>,
    global: RwLock<GlobalModel>,
    ledger: Ledger<S>,
    events: EventPublisher,
}

fn build_aggregator(settings: &AggregationSettings) -> Result<Aggregator, AggregationError> {
    if settings.robust.enabled {
        return Ok(match settings.robust.method {
            RobustMethod::Median => Median.into(),
            RobustMethod::TrimmedMean => TrimmedMean::new(settings.robust.trim_percentage)?.into(),
            RobustMethod::Krum => Krum.into(),
        });
    }
    Ok(match settings.method {
        AggregationMethod::FedAvg | AggregationMethod::SecAgg => FedAvg.into(),
        AggregationMethod::FedProx => {
            FedProx::new(settings.proximal_mu, settings.learning_rate)?.into()
        }
    })
}

impl<S> Federation<S>
where
    S: LedgerStorage,
{
    /// Builds a federation on top of a ledger store.
    ///
    /// An empty ledger gets a genesis block for a model of zeros. Otherwise the global model and
    /// the consumed privacy budget are restored from the ledger.
    ///
    /// # Errors
    /// Fails if the settings are invalid, if the store is not ready or if the ledger already
    /// consumed more privacy budget than configured.
    pub async fn new(settings: FederationSettings, store: S) -> Result<Self, FederationError> {
        settings
            .check()
            .map_err(|err| FederationError::InvalidSettings(err.to_string()))?;
        let aggregator = build_aggregator(&settings.aggregation)
            .map_err(|err| FederationError::InvalidSettings(err.to_string()))?;
        let invalid_privacy = |err: PrivacyError| FederationError::InvalidSettings(err.to_string());
        let noise = if settings.privacy.differential_privacy {
            Some(
                GaussianMechanism::new(settings.privacy.epsilon, settings.privacy.delta)
                    .map_err(invalid_privacy)?,
            )
        } else {
            None
        };
        let mut budget =
            PrivacyBudget::new(settings.privacy.max_epsilon, settings.privacy.max_delta)
                .map_err(invalid_privacy)?;
        let encryption = if settings.encryption.homomorphic {
            let scheme = PadEncryption::with_key_size(settings.encryption.key_size)?;
            Some(Arc::new(scheme) as Arc<dyn HomomorphicEncryption>)
        } else {
            None
        };

        let mut ready = store.clone();
        ready.is_ready().await.map_err(LedgerError::Storage)?;
        let ledger = Ledger::new(store);

        let blocks = ledger.blocks().await?;
        let (global, last_round) = match blocks.last() {
            Some(latest) => {
                for block in &blocks {
                    if let Some(params) = block.provenance.privacy {
                        budget
                            .consume(block.provenance.round, params.epsilon, params.delta)
                            .map_err(|err| {
                                FederationError::InvalidSettings(format!(
                                    "the ledger exceeds the privacy budget: {}",
                                    err
                                ))
                            })?;
                    }
                }
                info!(
                    "restored global model {} of version {} from block {}",
                    latest.model_hash, latest.provenance.model_version, latest.height
                );
                let global = GlobalModel {
                    version: latest.provenance.model_version,
                    hash: latest.model_hash.clone(),
                    weights: None,
                };
                (global, latest.provenance.round)
            }
            None => {
                let weights = vec![0.; settings.model.length];
                let hash = model_hash(&weights);
                ledger
                    .create_genesis(hash.clone(), settings.model.version, COORDINATOR_ID)
                    .await?;
                let global = GlobalModel {
                    version: settings.model.version,
                    hash,
                    weights: Some(Arc::new(weights)),
                };
                (global, 0)
            }
        };

        let (events, _) = EventPublisher::init(
            last_round,
            RoundPhase::Completed,
            ModelUpdate {
                version: global.version,
                hash: global.hash.clone(),
            },
        );

        Ok(Self {
            settings,
            aggregator,
            noise,
            budget: Mutex::new(budget),
            encryption,
            organizations: RwLock::new(BTreeMap::new()),
            rounds: RwLock::new(BTreeMap::new()),
            active: Mutex::new(None),
            next_round_id: Mutex::new(last_round + 1),
            masking: Mutex::new(BTreeMap::new()),
            global: RwLock::new(global),
            ledger,
            events,
        })
    }

    /// Registers an organization. An organization which registers while a round is in progress
    /// is enrolled into it.
    ///
    /// # Errors
    /// Fails if the organization is already registered.
    pub fn register_organization(
        &self,
        id: impl Into<OrganizationId>,
        public_key: PublicSigningKey,
        endpoint: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Result<RegistrationAck, FederationError> {
        let id = id.into();
        let registered_at = {
            let mut organizations = self.organizations.write();
            if organizations.contains_key(&id) {
                return Err(FederationError::AlreadyRegistered(id));
            }
            let org = Organization::new(id.clone(), public_key, endpoint.into(), capabilities);
            let registered_at = org.registered_at;
            organizations.insert(id.clone(), org);
            registered_at
        };
        info!("registered organization {}", id);

        if let Some(round) = self.active_round().and_then(|id| self.round(id).ok()) {
            // the pairwise masks of a running session don't cover late registrations
            if self.masking.lock().contains_key(&round.id()) {
                debug!(
                    "organization {} waits for the next round, round {} is masked",
                    id,
                    round.id()
                );
            } else if round.register_organization(id.as_str()).is_ok() {
                debug!("enrolled organization {} into round {}", id, round.id());
            }
        }

        Ok(RegistrationAck {
            org: id,
            method: self.settings.aggregation.method,
            differential_privacy: self.noise.is_some(),
            privacy: self.settings.privacy.params(),
            registered_at,
        })
    }

    /// Marks an organization as inactive. It won't be enrolled into new rounds and its
    /// submissions are refused.
    pub fn deactivate_organization(&self, id: &str) -> Result<(), FederationError> {
        let mut organizations = self.organizations.write();
        let org = organizations
            .get_mut(id)
            .ok_or_else(|| FederationError::UnknownOrganization(id.to_string()))?;
        org.active = false;
        info!("deactivated organization {}", id);
        Ok(())
    }

    /// Gets a copy of the registry entry of an organization.
    pub fn organization(&self, id: &str) -> Option<Organization> {
        self.organizations.read().get(id).cloned()
    }

    /// Starts a new training round on top of the current global model.
    ///
    /// # Errors
    /// Fails if another round is still active.
    pub fn start_training_round(&self) -> Result<RoundInfo, FederationError> {
        let mut active = self.active.lock();
        if let Some(id) = *active {
            return Err(FederationError::RoundAlreadyActive(id));
        }
        let round_id = {
            let mut next = self.next_round_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let global = self.global.read().clone();
        let deadline = Duration::from_secs(self.settings.round.timeout);
        let round = Arc::new(Round::new(
            round_id,
            global.hash.clone(),
            deadline,
            self.settings.round.min_clients,
        ));

        let participants = self
            .organizations
            .read()
            .values()
            .filter(|org| org.active)
            .map(|org| org.id.clone())
            .collect::<Vec<_>>();
        let round_err = |source| FederationError::Round {
            round: round_id,
            source,
        };
        for org in &participants {
            round.register_organization(org.as_str()).map_err(round_err)?;
        }
        round.start().map_err(round_err)?;

        if self.settings.encryption.secure_aggregation {
            self.masking
                .lock()
                .insert(round_id, MaskingSession::new(participants.clone()));
        }
        self.rounds.write().insert(round_id, round);
        *active = Some(round_id);
        self.events.broadcast_phase(round_id, RoundPhase::InProgress);

        Ok(RoundInfo {
            round_id,
            deadline,
            privacy: self.settings.privacy.params(),
            model_version: global.version,
            model_hash: global.hash,
            participants,
        })
    }

    /// Generates the secure aggregation mask of an organization for a round.
    ///
    /// In a deployment the organizations derive their masks from pairwise key agreements. Here
    /// the session of the round hands them out.
    pub fn generate_mask(
        &self,
        round_id: u64,
        org: &str,
        len: usize,
    ) -> Result<Mask, FederationError> {
        let mut sessions = self.masking.lock();
        let session = sessions
            .get_mut(&round_id)
            .ok_or(FederationError::NoMaskingSession { round: round_id })?;
        session
            .generate_mask(org, len)
            .map_err(|source| FederationError::Masking {
                round: round_id,
                source,
            })
    }

    /// Records the submission of an organization and verifies it.
    ///
    /// The submission is accepted if the content hash is the `SHA256` digest of the payload and
    /// the signature of the organization over the content hash is valid.
    ///
    /// # Errors
    /// Fails if the round refuses the submission. A submission which fails verification is kept
    /// as failed and reported as [`FederationError::InvalidSubmission`].
    pub fn submit_gradient(
        &self,
        round_id: u64,
        org: &str,
        content_hash: impl Into<String>,
        payload: Vec<u8>,
        signature: Signature,
        metadata: UpdateMetadata,
    ) -> Result<SubmissionReceipt, FederationError> {
        let round = self.round(round_id)?;
        let public_key = {
            let organizations = self.organizations.read();
            let entry = organizations
                .get(org)
                .ok_or_else(|| FederationError::UnknownOrganization(org.to_string()))?;
            if !entry.active {
                return Err(FederationError::InactiveOrganization(org.to_string()));
            }
            entry.public_key
        };

        let content_hash = content_hash.into();
        let rejection = if Sha256::hash(&payload).to_hex() != content_hash {
            Some("the content hash doesn't match the payload")
        } else if !public_key.verify_detached(&signature, content_hash.as_bytes()) {
            Some("invalid signature")
        } else {
            None
        };

        let round_err = |source| FederationError::Round {
            round: round_id,
            source,
        };
        round
            .submit_update(org, content_hash.clone(), payload, signature, metadata)
            .map_err(round_err)?;
        let phase = round
            .verify_update(org, rejection.is_none())
            .map_err(round_err)?;

        if let Some(entry) = self.organizations.write().get_mut(org) {
            if rejection.is_none() {
                entry.record_success();
            } else {
                entry.record_failure();
            }
        }

        match rejection {
            Some(reason) => Err(FederationError::InvalidSubmission {
                round: round_id,
                org: org.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(SubmissionReceipt {
                round_id,
                org: org.to_string(),
                content_hash,
                phase,
            }),
        }
    }

    /// Aggregates the decrypted updates of a round with the configured strategy.
    ///
    /// If differential privacy is enabled, every update is clipped before the aggregation and
    /// noise is added to the aggregate. The new model is recorded on the round, which then awaits
    /// its anchoring.
    ///
    /// # Errors
    /// Fails without touching the round if the round is not in progress, if an update has no
    /// verified submission, if the quorum is not reached or if the privacy budget is exhausted.
    /// Fails the round if its deadline is exceeded or if the aggregation fails.
    pub async fn aggregate_round(
        &self,
        round_id: u64,
        updates: Updates,
        sample_counts: SampleCounts,
    ) -> Result<ConvergenceMetrics, FederationError> {
        self.aggregate_plain(round_id, updates, sample_counts)
            .instrument(info_span!("aggregate_round", round = round_id))
            .await
    }

    async fn aggregate_plain(
        &self,
        round_id: u64,
        updates: Updates,
        sample_counts: SampleCounts,
    ) -> Result<ConvergenceMetrics, FederationError> {
        let round = self.round(round_id)?;
        self.check_aggregatable(&round, updates.iter().map(|(org, u)| (org, u.len())))?;
        self.check_privacy_budget(round_id)?;
        self.begin_aggregation(&round)?;

        let previous = self.previous_weights(&round);
        let participants = updates.keys().cloned().collect();
        let clipping_norm = self.noise.map(|_| self.settings.privacy.clipping_norm);
        let aggregator = self.aggregator.clone();
        let baseline = previous.clone();
        let outcome = task::spawn_blocking(move || {
            let updates = match clipping_norm {
                Some(norm) => updates
                    .into_iter()
                    .map(|(org, update)| (org, clip_to_norm(&update, norm).0))
                    .collect(),
                None => updates,
            };
            aggregator.aggregate(
                &updates,
                &sample_counts,
                baseline.as_deref().map(Vec::as_slice),
            )
        })
        .await;

        let aggregation = match task_outcome(outcome) {
            Ok(aggregation) => aggregation,
            Err(reason) => return Err(self.abort_aggregation(&round, reason)),
        };
        self.finish_aggregation(
            &round,
            aggregation.global,
            self.aggregator.method_name(),
            aggregation.metrics.quality,
            participants,
            previous,
        )
    }

    /// Aggregates the masked updates of a round.
    ///
    /// Each survivor submits `n_i * w_i - mask_i`. The masks of organizations which dropped out
    /// are revealed from the seeds the survivors shared with them, and the recovered sum is
    /// divided by the total number of samples.
    ///
    /// # Errors
    /// Fails like [`aggregate_round`] and additionally if secure aggregation is disabled.
    ///
    /// [`aggregate_round`]: Federation::aggregate_round
    pub async fn aggregate_masked_round(
        &self,
        round_id: u64,
        masked: Updates,
        sample_counts: SampleCounts,
    ) -> Result<ConvergenceMetrics, FederationError> {
        self.aggregate_masked(round_id, masked, sample_counts)
            .instrument(info_span!("aggregate_masked_round", round = round_id))
            .await
    }

    async fn aggregate_masked(
        &self,
        round_id: u64,
        masked: Updates,
        sample_counts: SampleCounts,
    ) -> Result<ConvergenceMetrics, FederationError> {
        let round = self.round(round_id)?;
        if !self.settings.encryption.secure_aggregation {
            return Err(FederationError::AggregationFailed {
                round: round_id,
                reason: "secure aggregation is disabled".into(),
            });
        }
        self.check_aggregatable(&round, masked.iter().map(|(org, u)| (org, u.len())))?;
        let outsider = self.masking.lock().get(&round_id).and_then(|session| {
            masked
                .keys()
                .find(|org| !session.participants().any(|participant| participant == *org))
                .cloned()
        });
        if let Some(org) = outsider {
            return Err(FederationError::AggregationFailed {
                round: round_id,
                reason: format!("organization {} has no pairwise masks in the round", org),
            });
        }
        self.check_privacy_budget(round_id)?;
        self.begin_aggregation(&round)?;

        let session = self.masking.lock().remove(&round_id);
        let session = match session {
            Some(session) => session,
            None => {
                return Err(self.abort_aggregation(&round, "no secure aggregation session".into()))
            }
        };
        let previous = self.previous_weights(&round);
        let participants = masked.keys().cloned().collect();
        let outcome =
            task::spawn_blocking(move || unmask_weighted(&session, &masked, &sample_counts)).await;

        let global = match task_outcome(outcome) {
            Ok(global) => global,
            Err(reason) => return Err(self.abort_aggregation(&round, reason)),
        };
        self.finish_aggregation(
            &round,
            global,
            &AggregationMethod::SecAgg.to_string(),
            FedAvg::QUALITY,
            participants,
            previous,
        )
    }

    /// Aggregates the homomorphically encrypted updates of a round.
    ///
    /// Each organization encrypts `n_i * w_i`. The ciphertexts are summed up, only the sum is
    /// decrypted and divided by the total number of samples.
    ///
    /// # Errors
    /// Fails like [`aggregate_round`] and additionally if homomorphic encryption is disabled.
    ///
    /// [`aggregate_round`]: Federation::aggregate_round
    pub async fn aggregate_encrypted_round(
        &self,
        round_id: u64,
        ciphertexts: BTreeMap<OrganizationId, Ciphertext>,
        sample_counts: SampleCounts,
    ) -> Result<ConvergenceMetrics, FederationError> {
        self.aggregate_encrypted(round_id, ciphertexts, sample_counts)
            .instrument(info_span!("aggregate_encrypted_round", round = round_id))
            .await
    }

    async fn aggregate_encrypted(
        &self,
        round_id: u64,
        ciphertexts: BTreeMap<OrganizationId, Ciphertext>,
        sample_counts: SampleCounts,
    ) -> Result<ConvergenceMetrics, FederationError> {
        let round = self.round(round_id)?;
        let encryption =
            self.encryption
                .clone()
                .ok_or_else(|| FederationError::AggregationFailed {
                    round: round_id,
                    reason: "homomorphic encryption is disabled".into(),
                })?;
        self.check_aggregatable(&round, ciphertexts.iter().map(|(org, c)| (org, c.len())))?;
        self.check_privacy_budget(round_id)?;
        self.begin_aggregation(&round)?;

        let previous = self.previous_weights(&round);
        let participants = ciphertexts.keys().cloned().collect();
        let outcome = task::spawn_blocking(move || {
            decrypt_weighted(encryption.as_ref(), &ciphertexts, &sample_counts)
        })
        .await;

        let global = match task_outcome(outcome) {
            Ok(global) => global,
            Err(reason) => return Err(self.abort_aggregation(&round, reason)),
        };
        self.finish_aggregation(
            &round,
            global,
            &AggregationMethod::FedAvg.to_string(),
            FedAvg::QUALITY,
            participants,
            previous,
        )
    }

    /// Anchors the aggregated model of a round in the ledger.
    ///
    /// The organizations sign the message `"{round}:{model hash}"`. If multiple signatures are
    /// required, at least the configured minimum of valid signatures must be present.
    ///
    /// # Errors
    /// Fails if the round is not verifying, already anchored or being anchored. Invalid signatures
    /// and ledger failures fail the round.
    pub async fn anchor_round(
        &self,
        round_id: u64,
        signatures: BTreeMap<OrganizationId, Signature>,
    ) -> Result<Block, FederationError> {
        let round = self.round(round_id)?;
        // the reservation is held until the block is appended or the round failed
        let aggregation = round.begin_anchoring().map_err(|source| match source {
            RoundError::AlreadyAnchored(_) => FederationError::RoundAlreadyAnchored(round_id),
            source => FederationError::Round {
                round: round_id,
                source,
            },
        })?;

        let min_signatures = if self.settings.ledger.multi_signature {
            self.settings.ledger.min_signatures
        } else {
            0
        };
        let message = anchor_message(round_id, &aggregation.model_hash);
        let checked = {
            let organizations = self.organizations.read();
            check_signatures(&message, &signatures, min_signatures, |org| {
                organizations.get(org).map(|entry| entry.public_key)
            })
        };
        if let Err(source) = checked {
            self.abandon_anchoring(&round, source.to_string());
            return Err(FederationError::AnchoringFailed {
                round: round_id,
                source,
            });
        }

        let model_version = self.global.read().version + 1;
        let provenance = Provenance {
            round: round_id,
            model_version,
            parent_model_hash: Some(round.start_model_hash().to_string()),
            participants: aggregation.participants.clone(),
            privacy: self.noise.map(|noise| noise.params()),
            quality: round.metrics().map(|metrics| metrics.aggregation_quality),
        };
        let appended = self
            .ledger
            .append(
                round_id,
                aggregation.model_hash.clone(),
                aggregation.method.clone(),
                aggregation.participants.len(),
                provenance,
                signatures,
            )
            .await;
        let block = match appended {
            Ok(block) => block,
            Err(source) => {
                self.abandon_anchoring(&round, source.to_string());
                return Err(FederationError::AnchoringFailed {
                    round: round_id,
                    source,
                });
            }
        };
        round
            .set_ledger_reference(block.block_hash.clone())
            .map_err(|source| FederationError::Round {
                round: round_id,
                source,
            })?;
        info!("round {} anchored in block {}", round_id, block.height);
        Ok(block)
    }

    /// Completes an anchored round and publishes its model as the new global model.
    ///
    /// # Errors
    /// Fails if the round is not anchored or not verifying.
    pub fn complete_round(&self, round_id: u64) -> Result<GlobalModel, FederationError> {
        let round = self.round(round_id)?;
        if round.ledger_reference().is_none() {
            return Err(FederationError::RoundNotAnchored(round_id));
        }
        let round_err = |source| FederationError::Round {
            round: round_id,
            source,
        };
        let aggregation = round
            .aggregation()
            .ok_or_else(|| round_err(RoundError::MissingAggregation))?;
        round.complete().map_err(round_err)?;

        let model = {
            let mut global = self.global.write();
            *global = GlobalModel {
                version: global.version + 1,
                hash: aggregation.model_hash,
                weights: Some(aggregation.weights),
            };
            global.clone()
        };
        self.release(round_id);
        self.events.broadcast_phase(round_id, RoundPhase::Completed);
        self.events.broadcast_model(
            round_id,
            ModelUpdate {
                version: model.version,
                hash: model.hash.clone(),
            },
        );
        info!(
            "global model updated to version {} ({})",
            model.version, model.hash
        );
        Ok(model)
    }

    /// Fails a round.
    ///
    /// # Errors
    /// Fails if the round is unknown, already completed or being anchored.
    pub fn fail_round(&self, round_id: u64, reason: &str) -> Result<(), FederationError> {
        let round = self.round(round_id)?;
        round
            .fail(reason)
            .map_err(|source| FederationError::Round {
                round: round_id,
                source,
            })?;
        self.release(round_id);
        self.events.broadcast_phase(round_id, RoundPhase::Failed);
        Ok(())
    }

    /// Fails the active round if its deadline is exceeded.
    ///
    /// Returns the ids of the failed rounds.
    pub fn expire_overdue_rounds(&self) -> Vec<u64> {
        let round = match self.active_round().and_then(|id| self.round(id).ok()) {
            Some(round) => round,
            None => return Vec::new(),
        };
        if round.phase().is_terminal() || !round.is_deadline_exceeded() {
            return Vec::new();
        }
        if self.abort(&round, "deadline exceeded") {
            vec![round.id()]
        } else {
            Vec::new()
        }
    }

    /// Gets a snapshot of a round.
    pub fn round_status(&self, round_id: u64) -> Result<RoundSnapshot, FederationError> {
        self.round(round_id).map(|round| round.snapshot())
    }

    /// Gets the id of the active round.
    pub fn active_round(&self) -> Option<u64> {
        *self.active.lock()
    }

    /// Gets the current global model.
    pub fn global_model(&self) -> GlobalModel {
        self.global.read().clone()
    }

    /// Gets a copy of the privacy budget.
    pub fn privacy_budget(&self) -> PrivacyBudget {
        self.budget.lock().clone()
    }

    /// Gets the homomorphic encryption capability, if enabled.
    pub fn encryption(&self) -> Option<Arc<dyn HomomorphicEncryption>> {
        self.encryption.clone()
    }

    /// Gets a subscriber for the events of the federation.
    pub fn events(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    /// Verifies the whole ledger. Returns the number of verified blocks.
    pub async fn verify_chain(&self) -> Result<usize, FederationError> {
        Ok(self.ledger.verify_chain().await?)
    }

    /// Gets the blocks which led to a model, newest first.
    pub async fn model_lineage(&self, model_hash: &str) -> Result<Vec<Block>, FederationError> {
        Ok(self.ledger.model_lineage(model_hash).await?)
    }

    fn round(&self, round_id: u64) -> Result<Arc<Round>, FederationError> {
        self.rounds
            .read()
            .get(&round_id)
            .cloned()
            .ok_or(FederationError::UnknownRound(round_id))
    }

    /// Checks the preconditions of an aggregation without touching the round, except for failing
    /// it once its deadline is exceeded.
    fn check_aggregatable<'a, I>(
        &self,
        round: &Round,
        contributions: I,
    ) -> Result<(), FederationError>
    where
        I: Iterator<Item = (&'a OrganizationId, usize)>,
    {
        let round_id = round.id();
        if round.phase() == RoundPhase::InProgress && round.is_deadline_exceeded() {
            self.abort(round, "deadline exceeded");
            return Err(FederationError::RoundTimeout(round_id));
        }
        let phase = round.phase();
        if phase != RoundPhase::InProgress {
            return Err(FederationError::AggregationFailed {
                round: round_id,
                reason: format!("the round is in phase {}", phase),
            });
        }

        let verified = round.verified_organizations();
        let mut have = 0;
        for (org, len) in contributions {
            if !verified.contains(org) {
                return Err(FederationError::AggregationFailed {
                    round: round_id,
                    reason: format!("{} has no verified submission", org),
                });
            }
            if len != self.settings.model.length {
                return Err(FederationError::AggregationFailed {
                    round: round_id,
                    reason: format!(
                        "the update of {} has length {}, expected {}",
                        org, len, self.settings.model.length
                    ),
                });
            }
            have += 1;
        }
        let need = round.min_participants();
        if have < need {
            return Err(FederationError::InsufficientParticipants {
                round: round_id,
                have,
                need,
            });
        }
        Ok(())
    }

    fn check_privacy_budget(&self, round_id: u64) -> Result<(), FederationError> {
        if let Some(noise) = &self.noise {
            let params = noise.params();
            let mut probe = self.budget.lock().clone();
            probe
                .consume(round_id, params.epsilon, params.delta)
                .map_err(|source| FederationError::Privacy {
                    round: round_id,
                    source,
                })?;
        }
        Ok(())
    }

    fn begin_aggregation(&self, round: &Round) -> Result<(), FederationError> {
        round
            .start_aggregation()
            .map_err(|source| FederationError::Round {
                round: round.id(),
                source,
            })?;
        self.events.broadcast_phase(round.id(), RoundPhase::Aggregating);
        Ok(())
    }

    /// Gets the weights of the global model the round started from, if they are known.
    fn previous_weights(&self, round: &Round) -> Option<Arc<Vec<f64>>> {
        let global = self.global.read();
        if global.hash == round.start_model_hash() {
            global.weights.clone()
        } else {
            None
        }
    }

    /// Adds the privacy noise, records the aggregation and hands the round over to verification.
    fn finish_aggregation(
        &self,
        round: &Round,
        mut global: Vec<f64>,
        method: &str,
        quality: f64,
        participants: Vec<OrganizationId>,
        previous: Option<Arc<Vec<f64>>>,
    ) -> Result<ConvergenceMetrics, FederationError> {
        let round_id = round.id();
        let mut privacy_budget_consumed = 0.;
        if let Some(noise) = &self.noise {
            let params = noise.params();
            let consumed = self
                .budget
                .lock()
                .consume(round_id, params.epsilon, params.delta);
            if let Err(source) = consumed {
                self.abort(round, &source.to_string());
                return Err(FederationError::Privacy {
                    round: round_id,
                    source,
                });
            }
            let (noisy, sigma) = noise.add_noise(&global, &mut rand::thread_rng());
            debug!("added gaussian noise with sigma {}", sigma);
            global = noisy;
            privacy_budget_consumed = params.epsilon;
        }

        let gradient_norm = l2_norm(&global);
        let metrics = ConvergenceMetrics {
            update_norm: previous
                .map(|previous| euclidean_distance(&global, &previous))
                .unwrap_or(gradient_norm),
            gradient_norm,
            privacy_budget_consumed,
            aggregation_quality: quality,
        };
        let record = AggregationRecord {
            model_hash: model_hash(&global),
            weights: Arc::new(global),
            method: method.to_string(),
            participants,
        };
        let model_hash = record.model_hash.clone();

        let recorded = round
            .record_aggregation(record, metrics)
            .and_then(|_| round.start_verification());
        if let Err(source) = recorded {
            self.abort(round, &source.to_string());
            return Err(FederationError::Round {
                round: round_id,
                source,
            });
        }
        self.events.broadcast_phase(round_id, RoundPhase::Verifying);
        info!(
            "aggregated round {} into model {} with quality {}",
            round_id, model_hash, quality
        );
        Ok(metrics)
    }

    /// Fails the round after a failed aggregation.
    fn abort_aggregation(&self, round: &Round, reason: String) -> FederationError {
        self.abort(round, &reason);
        FederationError::AggregationFailed {
            round: round.id(),
            reason,
        }
    }

    /// Fails a round and frees its slot. Returns whether the round was failed.
    fn abort(&self, round: &Round, reason: &str) -> bool {
        if let Err(err) = round.fail(reason) {
            warn!("round {} could not be failed: {}", round.id(), err);
            return false;
        }
        self.release(round.id());
        self.events.broadcast_phase(round.id(), RoundPhase::Failed);
        true
    }

    fn abandon_anchoring(&self, round: &Round, reason: String) {
        round.abandon_anchoring(reason);
        self.release(round.id());
        self.events.broadcast_phase(round.id(), RoundPhase::Failed);
    }

    /// Frees the active slot and the masking session of a finished round.
    fn release(&self, round_id: u64) {
        let mut active = self.active.lock();
        if *active == Some(round_id) {
            *active = None;
        }
        self.masking.lock().remove(&round_id);
    }
}

fn task_outcome<T, E>(outcome: Result<Result<T, E>, JoinError>) -> Result<T, String>
where
    E: fmt::Display,
{
    match outcome {
        Ok(result) => result.map_err(|err| err.to_string()),
        Err(err) => Err(format!("aggregation task failed: {}", err)),
    }
}

fn total_samples<'a, I>(orgs: I, sample_counts: &SampleCounts) -> Result<f64, AggregationError>
where
    I: Iterator<Item = &'a OrganizationId>,
{
    let mut total = 0_u64;
    for org in orgs {
        match sample_counts.get(org) {
            Some(0) => return Err(AggregationError::ZeroSampleCount(org.clone())),
            Some(count) => total += count,
            None => return Err(AggregationError::MissingSampleCount(org.clone())),
        }
    }
    Ok(total as f64)
}

/// Recovers the weighted average from the masked, sample-scaled updates of the survivors.
fn unmask_weighted(
    session: &MaskingSession,
    masked: &Updates,
    sample_counts: &SampleCounts,
) -> Result<Vec<f64>, CombineError> {
    let survivors = masked.keys().collect::<Vec<_>>();
    let mut revealed = BTreeMap::new();
    for dropout in session
        .participants()
        .filter(|org| !masked.contains_key(*org))
    {
        warn!("revealing the mask of dropped out organization {}", dropout);
        let mask = session.reveal_dropout(dropout, survivors.iter().copied())?;
        revealed.insert(dropout.clone(), mask);
    }
    let sum = aggregate_masked(masked, &revealed)?;
    let total = total_samples(masked.keys(), sample_counts)?;
    Ok(sum.into_iter().map(|value| value / total).collect())
}

/// Recovers the weighted average from the encrypted, sample-scaled updates.
fn decrypt_weighted(
    encryption: &dyn HomomorphicEncryption,
    ciphertexts: &BTreeMap<OrganizationId, Ciphertext>,
    sample_counts: &SampleCounts,
) -> Result<Vec<f64>, CombineError> {
    let mut summands = ciphertexts.values();
    let first = summands
        .next()
        .cloned()
        .ok_or(AggregationError::EmptyInput)?;
    let sum = summands.try_fold(first, |sum, ciphertext| encryption.add(&sum, ciphertext))?;
    let total = total_samples(ciphertexts.keys(), sample_counts)?;
    Ok(encryption
        .decrypt(&sum)?
        .into_iter()
        .map(|value| value / total)
        .collect())
}
