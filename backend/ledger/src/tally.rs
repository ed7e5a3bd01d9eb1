//! # Tally
//!
//! Approved vote counts live on each candidate and are only bumped by the approval
//! transition. Since the ballot write and the counter write are separate, the counters can
//! be recomputed from ballot states at any time (`recount`) to detect and repair drift.
use std::collections::HashMap;

use serde::Serialize;

use crate::model::{BallotState, CandidateId, Poll, PollId, VoterRecord};

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TallyRow {
    pub candidate_id: CandidateId,
    pub name: String,
    pub votes: u32,
    pub percentage: f64,
}

/// Candidates ordered by approved votes, highest first. Equal counts keep poll order.
pub fn compute_tally(poll: &Poll) -> Vec<TallyRow> {
    let total = poll.total_approved();

    let mut rows: Vec<TallyRow> = poll
        .candidates
        .iter()
        .map(|candidate| TallyRow {
            candidate_id: candidate.id.clone(),
            name: candidate.name.clone(),
            votes: candidate.approved_votes,
            percentage: percentage(candidate.approved_votes, total),
        })
        .collect();

    // sort_by is stable
    rows.sort_by(|a, b| b.votes.cmp(&a.votes));
    rows
}

fn percentage(votes: u32, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    let share = f64::from(votes) / total as f64 * 100.0;
    (share * 10.0).round() / 10.0
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CandidateDrift {
    pub candidate_id: CandidateId,
    pub stored: u32,
    pub recomputed: u32,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RecountReport {
    pub poll_id: PollId,
    pub candidates: Vec<CandidateDrift>,
}

impl RecountReport {
    pub fn drifted(&self) -> impl Iterator<Item = &CandidateDrift> {
        self.candidates.iter().filter(|c| c.stored != c.recomputed)
    }

    pub fn is_consistent(&self) -> bool {
        self.drifted().next().is_none()
    }
}

/// Counts approved ballots per candidate and compares them with the stored counters.
pub fn recount<'a, I>(poll: &Poll, voters: I) -> RecountReport
where
    I: IntoIterator<Item = &'a VoterRecord>,
{
    let mut approved: HashMap<&str, u32> = HashMap::new();

    for voter in voters {
        if let Some(ballot) = voter.ballot(&poll.id) {
            if ballot.state == BallotState::Approved {
                *approved.entry(ballot.candidate_id.as_str()).or_insert(0) += 1;
            }
        }
    }

    RecountReport {
        poll_id: poll.id.clone(),
        candidates: poll
            .candidates
            .iter()
            .map(|candidate| CandidateDrift {
                candidate_id: candidate.id.clone(),
                stored: candidate.approved_votes,
                recomputed: approved.get(candidate.id.as_str()).copied().unwrap_or(0),
            })
            .collect(),
    }
}
