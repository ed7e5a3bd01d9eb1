//! # Ballot State Machine
//!
//! ```text
//! (none) --cast--> pending_payment --submit_proof--> pending_approval --approve--> approved
//!   ^                 |    ^                                          \--reject--> rejected
//!   |                 +cast+                                                        |
//!   +------------------------------------ cast ------------------------------------+
//! ```
//!
//! Transitions here are pure: they take the current ballot and return the next one. Writing
//! the result back (and the side effects on tallies and blobs) belongs to the workflow.
use chrono::{DateTime, Utc};

use crate::{
    error::WorkflowError,
    model::{Ballot, BallotState, ProofRef},
};

impl Ballot {
    /// Casting is allowed when there is no ballot yet, while payment is still pending, or
    /// after a rejection. Pending approval and approved ballots are locked.
    pub fn cast(
        existing: Option<&Ballot>,
        candidate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Ballot, WorkflowError> {
        if let Some(ballot) = existing {
            match ballot.state {
                BallotState::PendingApproval | BallotState::Approved => {
                    return Err(WorkflowError::AlreadyCast(ballot.state));
                }
                BallotState::PendingPayment | BallotState::Rejected => {}
            }
        }

        Ok(Ballot {
            candidate_id: candidate_id.to_string(),
            state: BallotState::PendingPayment,
            cast_at: now,
            proof: None,
        })
    }

    pub fn submit_proof(&self, proof: ProofRef, now: DateTime<Utc>) -> Result<Ballot, WorkflowError> {
        self.expect_state(BallotState::PendingPayment, "submit proof for")?;

        Ok(Ballot {
            candidate_id: self.candidate_id.clone(),
            state: BallotState::PendingApproval,
            cast_at: now,
            proof: Some(proof),
        })
    }

    pub fn approve(&self, now: DateTime<Utc>) -> Result<Ballot, WorkflowError> {
        self.decide(BallotState::Approved, "approve", now)
    }

    pub fn reject(&self, now: DateTime<Utc>) -> Result<Ballot, WorkflowError> {
        self.decide(BallotState::Rejected, "reject", now)
    }

    fn decide(
        &self,
        outcome: BallotState,
        event: &'static str,
        now: DateTime<Utc>,
    ) -> Result<Ballot, WorkflowError> {
        self.expect_state(BallotState::PendingApproval, event)?;

        Ok(Ballot {
            candidate_id: self.candidate_id.clone(),
            state: outcome,
            cast_at: now,
            proof: None,
        })
    }

    fn expect_state(&self, expected: BallotState, event: &'static str) -> Result<(), WorkflowError> {
        if self.state != expected {
            return Err(WorkflowError::InvalidTransition {
                from: self.state,
                event,
            });
        }

        Ok(())
    }
}
