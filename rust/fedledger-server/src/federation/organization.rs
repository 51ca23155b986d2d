//! The registry entries of organizations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fedledger_core::{crypto::PublicSigningKey, OrganizationId};

/// The reputation of a newly registered organization.
pub const INITIAL_REPUTATION: f64 = 0.5;

const REPUTATION_REWARD: f64 = 0.01;
const REPUTATION_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// An organization taking part in the federation.
pub struct Organization {
    pub id: OrganizationId,
    /// The key which verifies the signatures of the organization.
    pub public_key: PublicSigningKey,
    /// The callback endpoint of the organization.
    pub endpoint: String,
    pub capabilities: Vec<String>,
    /// A score in `[0, 1]`.
    pub reputation: f64,
    /// The number of accepted submissions.
    pub submissions: u64,
    /// The number of rejected submissions.
    pub failures: u64,
    /// Inactive organizations are not enrolled into new rounds.
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(
        id: OrganizationId,
        public_key: PublicSigningKey,
        endpoint: String,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            id,
            public_key,
            endpoint,
            capabilities,
            reputation: INITIAL_REPUTATION,
            submissions: 0,
            failures: 0,
            active: true,
            registered_at: Utc::now(),
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.submissions += 1;
        self.reputation = (self.reputation + REPUTATION_REWARD).min(1.);
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures += 1;
        self.reputation = (self.reputation - REPUTATION_PENALTY).max(0.);
    }
}
