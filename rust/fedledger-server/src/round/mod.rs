//! The lifecycle of a training round.
//!
//! A [`Round`] moves through the following phases:
//!
//! ```text
//! Initialized -> InProgress -> Aggregating -> Verifying -> Completed
//!      |             |             |             |
//!      +-------------+-------------+-------------+---------> Failed
//! ```
//!
//! **Initialized**
//!
//! Organizations are enrolled into the round.
//!
//! **InProgress**
//!
//! Enrolled organizations submit their encrypted updates, at most one per organization. Each
//! submission is verified individually, a failed verification only affects the submission and not
//! the round. Late enrollment is still possible.
//!
//! **Aggregating**
//!
//! Once a quorum of verified submissions exists, the updates are aggregated into a new global
//! model. Submissions are closed.
//!
//! **Verifying**
//!
//! The aggregated model awaits its anchoring in the ledger, signed by the organizations.
//!
//! **Completed**
//!
//! The round is anchored and immutable. It can neither be cancelled nor retried.
//!
//! **Failed**
//!
//! Reachable from every other phase except `Completed`. Failing a failed round again only records
//! the additional reason.
//!
//! Transitions out of the wrong phase are refused with [`RoundError::InvalidTransition`] and leave
//! the round untouched. Deadlines are cooperative: a round only reports whether its deadline is
//! exceeded and a supervisor has to fail it.

mod lifecycle;
mod phase;
mod submission;

use std::sync::Arc;

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fedledger_core::OrganizationId;

pub use self::{
    lifecycle::{Round, RoundSnapshot},
    phase::{RoundPhase, SubmissionPhase},
    submission::{OrgUpdateSubmission, SubmissionSummary, UpdateMetadata},
};

/// Errors which can occur while a round handles a request.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum RoundError {
    /// Invalid transition from {from} to {to}.
    InvalidTransition { from: RoundPhase, to: RoundPhase },
    /// Enrollment is closed in phase {0}.
    RegistrationClosed(RoundPhase),
    /// Submissions are closed in phase {0}.
    SubmissionsClosed(RoundPhase),
    /// Organization {0} is not enrolled in the round.
    NotRegistered(OrganizationId),
    /// Organization {0} already submitted an update.
    DuplicateSubmission(OrganizationId),
    /// Organization {0} has not submitted an update.
    NoSubmission(OrganizationId),
    /// The submission of organization {org} can't move from {from} to {to}.
    InvalidSubmissionTransition {
        org: OrganizationId,
        from: SubmissionPhase,
        to: SubmissionPhase,
    },
    /// Expected phase {expected} but the round is in phase {actual}.
    UnexpectedPhase {
        expected: RoundPhase,
        actual: RoundPhase,
    },
    /// No aggregation has been recorded.
    MissingAggregation,
    /// The round is already anchored in block {0}.
    AlreadyAnchored(String),
    /// The round is being anchored.
    AnchoringInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Convergence metrics of an aggregation.
pub struct ConvergenceMetrics {
    /// The norm of the difference between the new and the previous global model.
    pub update_norm: f64,
    /// The norm of the aggregated update.
    pub gradient_norm: f64,
    /// The epsilon consumed by this round.
    pub privacy_budget_consumed: f64,
    /// The quality score of the aggregation in `[0, 1]`.
    pub aggregation_quality: f64,
}

#[derive(Debug, Clone, PartialEq)]
/// The result of the aggregation of a round.
pub struct AggregationRecord {
    /// The hash of the new global model.
    pub model_hash: String,
    pub weights: Arc<Vec<f64>>,
    /// The aggregation method as recorded in the ledger.
    pub method: String,
    /// The organizations whose updates were aggregated.
    pub participants: Vec<OrganizationId>,
}
