//! The round state machine.
//!
//! See the [round module] documentation since this is a private module anyways.
//!
//! [round module]: crate::round

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fedledger_core::{crypto::Signature, OrganizationId};

use crate::round::{
    AggregationRecord,
    ConvergenceMetrics,
    OrgUpdateSubmission,
    RoundError,
    RoundPhase,
    SubmissionPhase,
    SubmissionSummary,
    UpdateMetadata,
};

#[derive(Debug)]
struct RoundState {
    phase: RoundPhase,
    started_at: Option<Instant>,
    enrolled: BTreeSet<OrganizationId>,
    submissions: BTreeMap<OrganizationId, OrgUpdateSubmission>,
    aggregation: Option<AggregationRecord>,
    metrics: Option<ConvergenceMetrics>,
    ledger_reference: Option<String>,
    anchoring: bool,
    errors: Vec<String>,
}

impl RoundState {
    fn transition(
        &mut self,
        round_id: u64,
        expected: RoundPhase,
        next: RoundPhase,
    ) -> Result<(), RoundError> {
        if self.phase != expected {
            return Err(RoundError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!("round {}: {} -> {}", round_id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    fn expect_phase(&self, expected: RoundPhase) -> Result<(), RoundError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(RoundError::UnexpectedPhase {
                expected,
                actual: self.phase,
            })
        }
    }

    fn move_submission(
        &mut self,
        org: &str,
        next: SubmissionPhase,
    ) -> Result<SubmissionPhase, RoundError> {
        let submission = self
            .submissions
            .get_mut(org)
            .ok_or_else(|| RoundError::NoSubmission(org.to_string()))?;
        if !submission.phase.can_transition_to(next) {
            return Err(RoundError::InvalidSubmissionTransition {
                org: org.to_string(),
                from: submission.phase,
                to: next,
            });
        }
        submission.phase = next;
        Ok(next)
    }
}

/// A read-only view of a round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSnapshot {
    pub id: u64,
    pub phase: RoundPhase,
    pub start_model_hash: String,
    pub deadline: Duration,
    pub min_participants: usize,
    pub enrolled: BTreeSet<OrganizationId>,
    pub submissions: BTreeMap<OrganizationId, SubmissionSummary>,
    /// The hash of the aggregated global model.
    pub model_hash: Option<String>,
    pub metrics: Option<ConvergenceMetrics>,
    /// The hash of the block which anchors the round.
    pub ledger_reference: Option<String>,
    pub errors: Vec<String>,
}

/// A training round.
///
/// All methods take `&self`. The state of the round is guarded by a single lock which is only held
/// for the duration of a mutation, so submissions and status queries can happen concurrently.
#[derive(Debug)]
pub struct Round {
    id: u64,
    start_model_hash: String,
    deadline: Duration,
    min_participants: usize,
    state: Mutex<RoundState>,
}

impl Round {
    /// Creates a round which trains on top of the global model with the given hash.
    pub fn new(
        id: u64,
        start_model_hash: impl Into<String>,
        deadline: Duration,
        min_participants: usize,
    ) -> Self {
        Self {
            id,
            start_model_hash: start_model_hash.into(),
            deadline,
            min_participants,
            state: Mutex::new(RoundState {
                phase: RoundPhase::Initialized,
                started_at: None,
                enrolled: BTreeSet::new(),
                submissions: BTreeMap::new(),
                aggregation: None,
                metrics: None,
                ledger_reference: None,
                anchoring: false,
                errors: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> RoundPhase {
        self.state.lock().phase
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Gets the hash of the global model the round trains on.
    pub fn start_model_hash(&self) -> &str {
        &self.start_model_hash
    }

    /// Enrolls an organization. Enrolling an organization twice has no effect.
    ///
    /// # Errors
    /// Fails once the round moved past `InProgress`.
    pub fn register_organization(&self, org: impl Into<OrganizationId>) -> Result<(), RoundError> {
        let mut state = self.state.lock();
        match state.phase {
            RoundPhase::Initialized | RoundPhase::InProgress => {
                state.enrolled.insert(org.into());
                Ok(())
            }
            phase => Err(RoundError::RegistrationClosed(phase)),
        }
    }

    /// Opens the round for submissions and starts its deadline.
    pub fn start(&self) -> Result<(), RoundError> {
        let mut state = self.state.lock();
        state.transition(self.id, RoundPhase::Initialized, RoundPhase::InProgress)?;
        state.started_at = Some(Instant::now());
        info!(
            "round {} started with {} enrolled organizations",
            self.id,
            state.enrolled.len()
        );
        Ok(())
    }

    /// Records the submission of an enrolled organization.
    ///
    /// # Errors
    /// Fails if the round is not `InProgress`, if the organization is not enrolled or if it
    /// already submitted an update. The round is left untouched in that case.
    pub fn submit_update(
        &self,
        org: &str,
        content_hash: impl Into<String>,
        payload: Vec<u8>,
        signature: Signature,
        metadata: UpdateMetadata,
    ) -> Result<SubmissionPhase, RoundError> {
        let mut state = self.state.lock();
        if state.phase != RoundPhase::InProgress {
            return Err(RoundError::SubmissionsClosed(state.phase));
        }
        if !state.enrolled.contains(org) {
            return Err(RoundError::NotRegistered(org.to_string()));
        }
        if state.submissions.contains_key(org) {
            return Err(RoundError::DuplicateSubmission(org.to_string()));
        }
        let submission = OrgUpdateSubmission {
            org: org.to_string(),
            timestamp: Utc::now(),
            content_hash: content_hash.into(),
            payload,
            signature,
            metadata,
            phase: SubmissionPhase::Submitted,
        };
        state.submissions.insert(org.to_string(), submission);
        debug!("round {}: update of {} submitted", self.id, org);
        Ok(SubmissionPhase::Submitted)
    }

    /// Marks the submission of an organization as verified or as failed.
    pub fn verify_update(
        &self,
        org: &str,
        signature_valid: bool,
    ) -> Result<SubmissionPhase, RoundError> {
        let next = if signature_valid {
            SubmissionPhase::Verified
        } else {
            warn!("round {}: update of {} failed verification", self.id, org);
            SubmissionPhase::Failed
        };
        self.state.lock().move_submission(org, next)
    }

    /// Gets a copy of the submission of an organization.
    pub fn submission(&self, org: &str) -> Option<OrgUpdateSubmission> {
        self.state.lock().submissions.get(org).cloned()
    }

    /// Gets the organizations with a verified submission.
    pub fn verified_organizations(&self) -> Vec<OrganizationId> {
        self.state
            .lock()
            .submissions
            .values()
            .filter(|submission| submission.phase == SubmissionPhase::Verified)
            .map(|submission| submission.org.clone())
            .collect()
    }

    /// Checks whether the quorum of verified submissions is reached.
    pub fn has_minimum_participants(&self) -> bool {
        self.verified_organizations().len() >= self.min_participants
    }

    pub fn min_participants(&self) -> usize {
        self.min_participants
    }

    /// Checks whether more time than the deadline passed since the start of the round.
    pub fn is_deadline_exceeded(&self) -> bool {
        self.state
            .lock()
            .started_at
            .map_or(false, |started_at| started_at.elapsed() > self.deadline)
    }

    /// Closes the submissions and starts the aggregation.
    pub fn start_aggregation(&self) -> Result<(), RoundError> {
        self.state
            .lock()
            .transition(self.id, RoundPhase::InProgress, RoundPhase::Aggregating)
    }

    /// Records the aggregation result and marks the aggregated submissions.
    ///
    /// # Errors
    /// Fails if the round is not `Aggregating` or if any participant has no verified submission.
    pub fn record_aggregation(
        &self,
        record: AggregationRecord,
        metrics: ConvergenceMetrics,
    ) -> Result<(), RoundError> {
        let mut state = self.state.lock();
        state.expect_phase(RoundPhase::Aggregating)?;
        for org in &record.participants {
            match state.submissions.get(org) {
                Some(submission) if submission.phase == SubmissionPhase::Verified => {}
                Some(submission) => {
                    return Err(RoundError::InvalidSubmissionTransition {
                        org: org.clone(),
                        from: submission.phase,
                        to: SubmissionPhase::Aggregated,
                    })
                }
                None => return Err(RoundError::NoSubmission(org.clone())),
            }
        }
        for org in &record.participants {
            state.move_submission(org, SubmissionPhase::Aggregated)?;
        }
        state.aggregation = Some(record);
        state.metrics = Some(metrics);
        Ok(())
    }

    /// Gets the recorded aggregation result.
    pub fn aggregation(&self) -> Option<AggregationRecord> {
        self.state.lock().aggregation.clone()
    }

    pub fn metrics(&self) -> Option<ConvergenceMetrics> {
        self.state.lock().metrics
    }

    /// Hands the aggregated model over to the verification.
    ///
    /// # Errors
    /// Fails if the round is not `Aggregating` or if no aggregation was recorded.
    pub fn start_verification(&self) -> Result<(), RoundError> {
        let mut state = self.state.lock();
        if state.phase == RoundPhase::Aggregating && state.aggregation.is_none() {
            return Err(RoundError::MissingAggregation);
        }
        state.transition(self.id, RoundPhase::Aggregating, RoundPhase::Verifying)
    }

    /// Reserves the round for anchoring and returns the aggregation to anchor.
    ///
    /// Until the reservation ends with [`set_ledger_reference`] or [`abandon_anchoring`], the round
    /// can neither be anchored again nor failed.
    ///
    /// # Errors
    /// Fails if the round is not `Verifying`, already anchored or being anchored.
    ///
    /// [`set_ledger_reference`]: Round::set_ledger_reference
    /// [`abandon_anchoring`]: Round::abandon_anchoring
    pub fn begin_anchoring(&self) -> Result<AggregationRecord, RoundError> {
        let mut state = self.state.lock();
        if let Some(reference) = &state.ledger_reference {
            return Err(RoundError::AlreadyAnchored(reference.clone()));
        }
        if state.anchoring {
            return Err(RoundError::AnchoringInProgress);
        }
        state.expect_phase(RoundPhase::Verifying)?;
        let aggregation = state
            .aggregation
            .clone()
            .ok_or(RoundError::MissingAggregation)?;
        state.anchoring = true;
        Ok(aggregation)
    }

    /// Ends an anchoring reservation without a block and fails the round.
    pub fn abandon_anchoring(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        state.anchoring = false;
        warn!("round {} failed to anchor: {}", self.id, reason);
        state.phase = RoundPhase::Failed;
        state.errors.push(reason);
    }

    /// Sets the hash of the block which anchors the round and ends an anchoring reservation.
    pub fn set_ledger_reference(&self, block_hash: impl Into<String>) -> Result<(), RoundError> {
        let mut state = self.state.lock();
        state.expect_phase(RoundPhase::Verifying)?;
        if let Some(reference) = &state.ledger_reference {
            return Err(RoundError::AlreadyAnchored(reference.clone()));
        }
        state.ledger_reference = Some(block_hash.into());
        state.anchoring = false;
        Ok(())
    }

    pub fn ledger_reference(&self) -> Option<String> {
        self.state.lock().ledger_reference.clone()
    }

    /// Completes the round.
    pub fn complete(&self) -> Result<(), RoundError> {
        let mut state = self.state.lock();
        state.transition(self.id, RoundPhase::Verifying, RoundPhase::Completed)?;
        info!("round {} completed", self.id);
        Ok(())
    }

    /// Fails the round. The reason is recorded even if the round already failed.
    ///
    /// # Errors
    /// Fails if the round is already completed or being anchored.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), RoundError> {
        let reason = reason.into();
        let mut state = self.state.lock();
        if state.anchoring {
            return Err(RoundError::AnchoringInProgress);
        }
        if state.phase == RoundPhase::Completed {
            return Err(RoundError::InvalidTransition {
                from: RoundPhase::Completed,
                to: RoundPhase::Failed,
            });
        }
        warn!("round {} failed in phase {}: {}", self.id, state.phase, reason);
        state.phase = RoundPhase::Failed;
        state.errors.push(reason);
        Ok(())
    }

    /// Takes a read-only snapshot of the round.
    pub fn snapshot(&self) -> RoundSnapshot {
        let state = self.state.lock();
        RoundSnapshot {
            id: self.id,
            phase: state.phase,
            start_model_hash: self.start_model_hash.clone(),
            deadline: self.deadline,
            min_participants: self.min_participants,
            enrolled: state.enrolled.clone(),
            submissions: state
                .submissions
                .iter()
                .map(|(org, submission)| (org.clone(), submission.into()))
                .collect(),
            model_hash: state
                .aggregation
                .as_ref()
                .map(|aggregation| aggregation.model_hash.clone()),
            metrics: state.metrics,
            ledger_reference: state.ledger_reference.clone(),
            errors: state.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fedledger_core::crypto::{ByteObject, Sha256, SigningKeyPair};

    use super::*;

    fn signed(payload: &[u8]) -> (String, Signature) {
        let keys = SigningKeyPair::generate();
        let hash = Sha256::hash(payload).to_hex();
        let signature = keys.secret.sign_detached(hash.as_bytes());
        (hash, signature)
    }

    fn submit(round: &Round, org: &str) -> Result<SubmissionPhase, RoundError> {
        let (hash, signature) = signed(org.as_bytes());
        round.submit_update(
            org,
            hash,
            org.as_bytes().to_vec(),
            signature,
            UpdateMetadata::new(),
        )
    }

    fn started_round(orgs: &[&str], min_participants: usize) -> Round {
        let round = Round::new(1, "genesis", Duration::from_secs(60), min_participants);
        for org in orgs {
            round.register_organization(*org).unwrap();
        }
        round.start().unwrap();
        round
    }

    fn record(round: &Round, participants: &[&str]) -> Result<(), RoundError> {
        round.record_aggregation(
            AggregationRecord {
                model_hash: "model".into(),
                weights: Arc::new(vec![0.; 2]),
                method: "fedavg".into(),
                participants: participants.iter().map(|org| org.to_string()).collect(),
            },
            ConvergenceMetrics {
                update_norm: 0.,
                gradient_norm: 0.,
                privacy_budget_consumed: 0.,
                aggregation_quality: 1.,
            },
        )
    }

    #[test]
    fn test_happy_path() {
        let round = started_round(&["org-a", "org-b"], 2);
        assert_eq!(round.phase(), RoundPhase::InProgress);
        for org in &["org-a", "org-b"] {
            assert_eq!(submit(&round, org).unwrap(), SubmissionPhase::Submitted);
            assert!(!round.has_minimum_participants() || *org == "org-b");
            assert_eq!(
                round.verify_update(org, true).unwrap(),
                SubmissionPhase::Verified
            );
        }
        assert!(round.has_minimum_participants());

        round.start_aggregation().unwrap();
        record(&round, &["org-a", "org-b"]).unwrap();
        round.start_verification().unwrap();
        round.set_ledger_reference("block").unwrap();
        round.complete().unwrap();

        let snapshot = round.snapshot();
        assert_eq!(snapshot.phase, RoundPhase::Completed);
        assert_eq!(snapshot.model_hash.as_deref(), Some("model"));
        assert_eq!(snapshot.ledger_reference.as_deref(), Some("block"));
        assert!(snapshot
            .submissions
            .values()
            .all(|submission| submission.phase == SubmissionPhase::Aggregated));
    }

    #[test]
    fn test_start_aggregation_before_start() {
        let round = Round::new(1, "genesis", Duration::from_secs(60), 1);
        assert_eq!(
            round.start_aggregation(),
            Err(RoundError::InvalidTransition {
                from: RoundPhase::Initialized,
                to: RoundPhase::Aggregating,
            }),
        );
        assert_eq!(round.phase(), RoundPhase::Initialized);
        assert!(round.start_verification().is_err());
        assert!(round.complete().is_err());
        assert_eq!(round.phase(), RoundPhase::Initialized);
    }

    #[test]
    fn test_duplicate_submission_keeps_first() {
        let round = started_round(&["org-a"], 1);
        submit(&round, "org-a").unwrap();
        let first = round.submission("org-a").unwrap();

        assert_eq!(
            submit(&round, "org-a"),
            Err(RoundError::DuplicateSubmission("org-a".into())),
        );
        assert_eq!(round.submission("org-a").unwrap(), first);
    }

    #[test]
    fn test_submission_refusals() {
        let round = Round::new(1, "genesis", Duration::from_secs(60), 1);
        round.register_organization("org-a").unwrap();
        assert_eq!(
            submit(&round, "org-a"),
            Err(RoundError::SubmissionsClosed(RoundPhase::Initialized)),
        );
        round.start().unwrap();
        assert_eq!(
            submit(&round, "org-x"),
            Err(RoundError::NotRegistered("org-x".into())),
        );
        assert_eq!(
            round.verify_update("org-a", true),
            Err(RoundError::NoSubmission("org-a".into())),
        );

        // late enrollment is fine while the round is in progress
        round.register_organization("org-b").unwrap();
        submit(&round, "org-b").unwrap();
        round.verify_update("org-b", true).unwrap();
        round.start_aggregation().unwrap();
        assert_eq!(
            round.register_organization("org-c"),
            Err(RoundError::RegistrationClosed(RoundPhase::Aggregating)),
        );
        assert_eq!(
            submit(&round, "org-a"),
            Err(RoundError::SubmissionsClosed(RoundPhase::Aggregating)),
        );
    }

    #[test]
    fn test_failed_verification_only_affects_the_submission() {
        let round = started_round(&["org-a", "org-b"], 1);
        submit(&round, "org-a").unwrap();
        submit(&round, "org-b").unwrap();
        assert_eq!(
            round.verify_update("org-a", false).unwrap(),
            SubmissionPhase::Failed
        );
        round.verify_update("org-b", true).unwrap();
        assert_eq!(round.phase(), RoundPhase::InProgress);
        assert_eq!(round.verified_organizations(), vec!["org-b".to_string()]);

        // failed submissions never come back
        assert!(round.verify_update("org-a", true).is_err());

        round.start_aggregation().unwrap();
        assert!(matches!(
            record(&round, &["org-a", "org-b"]),
            Err(RoundError::InvalidSubmissionTransition { .. }),
        ));
        assert_eq!(
            round.start_verification(),
            Err(RoundError::MissingAggregation)
        );
    }

    #[test]
    fn test_fail_is_idempotent() {
        let round = started_round(&["org-a"], 1);
        round.fail("deadline exceeded").unwrap();
        round.fail("operator cancelled").unwrap();
        let snapshot = round.snapshot();
        assert_eq!(snapshot.phase, RoundPhase::Failed);
        assert_eq!(
            snapshot.errors,
            vec!["deadline exceeded".to_string(), "operator cancelled".to_string()],
        );
        assert!(round.start_aggregation().is_err());
        assert_eq!(round.phase(), RoundPhase::Failed);
    }

    #[test]
    fn test_completed_round_cannot_fail() {
        let round = started_round(&["org-a"], 1);
        submit(&round, "org-a").unwrap();
        round.verify_update("org-a", true).unwrap();
        round.start_aggregation().unwrap();
        record(&round, &["org-a"]).unwrap();
        round.start_verification().unwrap();
        round.set_ledger_reference("block").unwrap();
        assert_eq!(
            round.set_ledger_reference("other"),
            Err(RoundError::AlreadyAnchored("block".into())),
        );
        round.complete().unwrap();
        assert!(round.fail("too late").is_err());
        assert_eq!(round.phase(), RoundPhase::Completed);
    }

    #[test]
    fn test_anchoring_reservation() {
        let round = started_round(&["org-a"], 1);
        submit(&round, "org-a").unwrap();
        round.verify_update("org-a", true).unwrap();
        assert!(matches!(
            round.begin_anchoring(),
            Err(RoundError::UnexpectedPhase { .. }),
        ));
        round.start_aggregation().unwrap();
        record(&round, &["org-a"]).unwrap();
        round.start_verification().unwrap();

        assert_eq!(round.begin_anchoring().unwrap().model_hash, "model");
        assert_eq!(
            round.begin_anchoring(),
            Err(RoundError::AnchoringInProgress)
        );
        assert_eq!(round.fail("cancelled"), Err(RoundError::AnchoringInProgress));
        assert_eq!(round.phase(), RoundPhase::Verifying);

        round.set_ledger_reference("block").unwrap();
        assert_eq!(
            round.begin_anchoring(),
            Err(RoundError::AlreadyAnchored("block".into())),
        );
        // the reservation ended with the block
        round.fail("cancelled").unwrap();
        assert_eq!(round.phase(), RoundPhase::Failed);
    }

    #[test]
    fn test_abandoned_anchoring_fails_the_round() {
        let round = started_round(&["org-a"], 1);
        submit(&round, "org-a").unwrap();
        round.verify_update("org-a", true).unwrap();
        round.start_aggregation().unwrap();
        record(&round, &["org-a"]).unwrap();
        round.start_verification().unwrap();

        round.begin_anchoring().unwrap();
        round.abandon_anchoring("ledger unavailable");
        let snapshot = round.snapshot();
        assert_eq!(snapshot.phase, RoundPhase::Failed);
        assert_eq!(snapshot.ledger_reference, None);
        assert_eq!(snapshot.errors, vec!["ledger unavailable".to_string()]);
        assert!(matches!(
            round.begin_anchoring(),
            Err(RoundError::UnexpectedPhase { .. }),
        ));
        round.fail("operator cancelled").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let round = Round::new(1, "genesis", Duration::from_secs(60), 1);
        assert!(!round.is_deadline_exceeded());
        round.start().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!round.is_deadline_exceeded());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(round.is_deadline_exceeded());
        // the round doesn't cancel itself
        assert_eq!(round.phase(), RoundPhase::InProgress);
    }

    #[test]
    fn test_concurrent_submissions() {
        let orgs = (0..16).map(|i| format!("org-{}", i)).collect::<Vec<_>>();
        let round = Arc::new(Round::new(1, "genesis", Duration::from_secs(60), 16));
        for org in &orgs {
            round.register_organization(org.as_str()).unwrap();
        }
        round.start().unwrap();

        let handles = orgs
            .iter()
            .cloned()
            .map(|org| {
                let round = round.clone();
                std::thread::spawn(move || {
                    let _ = submit(&round, &org);
                    submit(&round, &org).unwrap_err();
                    round.verify_update(&org, true).unwrap();
                    round.snapshot()
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(round.has_minimum_participants());
        assert_eq!(round.snapshot().submissions.len(), 16);
    }
}
