//! Update submissions of organizations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fedledger_core::{crypto::Signature, OrganizationId};

use crate::round::SubmissionPhase;

/// Free-form metadata attached to a submission by the transport.
pub type UpdateMetadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// An update submitted by an organization for a round.
pub struct OrgUpdateSubmission {
    pub org: OrganizationId,
    pub timestamp: DateTime<Utc>,
    /// The hex encoded `SHA256` digest of the payload.
    pub content_hash: String,
    /// The encrypted update. It is never decrypted by the round.
    pub payload: Vec<u8>,
    /// The signature of the organization over the content hash.
    pub signature: Signature,
    pub metadata: UpdateMetadata,
    pub phase: SubmissionPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A summary of a submission without its payload.
pub struct SubmissionSummary {
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub phase: SubmissionPhase,
}

impl From<&OrgUpdateSubmission> for SubmissionSummary {
    fn from(submission: &OrgUpdateSubmission) -> Self {
        Self {
            timestamp: submission.timestamp,
            content_hash: submission.content_hash.clone(),
            phase: submission.phase,
        }
    }
}
