//! # Documents
//!
//! Records persisted by the document store.
//!
//! ## Voters
//! - One record per authenticated user, keyed by the identity provider's id
//! - `display_id` is the registration number given at signup, never changed afterwards
//! - `ballots` maps poll id to that voter's single ballot for the poll
//!
//! ## Polls
//! - Created once by an admin with at least two candidates
//! - Only `approved_votes` and `status` change after creation
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type VoterId = String;
pub type PollId = String;
pub type CandidateId = String;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BallotState {
    PendingPayment,
    PendingApproval,
    Approved,
    Rejected,
}

impl BallotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BallotState::PendingPayment => "pending_payment",
            BallotState::PendingApproval => "pending_approval",
            BallotState::Approved => "approved",
            BallotState::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for BallotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an uploaded payment screenshot lives.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProofRef {
    pub url: String,
    pub path: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Ballot {
    pub candidate_id: CandidateId,
    pub state: BallotState,
    pub cast_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VoterRecord {
    pub id: VoterId,
    pub email: String,
    pub display_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ballots: BTreeMap<PollId, Ballot>,
}

impl VoterRecord {
    pub fn new(id: VoterId, email: String, display_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            email,
            display_id: normalize_display_id(display_id),
            created_at,
            ballots: BTreeMap::new(),
        }
    }

    pub fn ballot(&self, poll_id: &str) -> Option<&Ballot> {
        self.ballots.get(poll_id)
    }
}

/// Registration numbers are compared case-insensitively, so they are stored upper-cased.
pub fn normalize_display_id(display_id: &str) -> String {
    display_id.trim().to_uppercase()
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Active,
    Closed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub path: String,
    pub url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    pub image: ImageRef,
    #[serde(default)]
    pub approved_votes: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Poll {
    pub id: PollId,
    pub title: String,
    pub status: PollStatus,
    pub candidates: Vec<Candidate>,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    pub fn candidate(&self, candidate_id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == candidate_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == PollStatus::Active
    }

    pub fn total_approved(&self) -> u64 {
        self.candidates
            .iter()
            .map(|c| u64::from(c.approved_votes))
            .sum()
    }
}
