//! # Vote Ledger
//!
//! Drives ballots through the payment approval workflow and keeps poll tallies in step.
//!
//! ## Writes
//! - Every ballot write is a compare-and-set against the ballot read at the start of the
//!   operation, so two admins deciding the same ballot cannot both win
//! - Only the winner of an approval bumps the candidate counter, through the store's atomic
//!   increment against the latest stored value
//! - Approval is two writes, ballot first then tally. If the second one fails the ballot
//!   stays approved and [`Ledger::reconcile`] repairs the counter
//!
//! ## Blobs
//! - A proof is uploaded before the ballot moves; if the ballot write then fails the upload
//!   is discarded and the ballot stays pending payment
//! - Every proof upload gets its own path, and a losing upload is never deleted while the
//!   stored ballot points at it
//! - Deleting a decided proof is best effort and only logged when it fails
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    authoring::{ImageUpload, PollDraft, candidate_id, candidate_image_path, proof_path},
    error::WorkflowError,
    model::{
        Ballot, BallotState, Candidate, ImageRef, Poll, PollId, PollStatus, ProofRef, VoterId,
        VoterRecord,
    },
    ports::{BlobStore, Clock, DocumentStore, Subscription},
    tally::{RecountReport, TallyRow, compute_tally, recount},
};

/// Result of an admin decision. `applied` is false when the ballot was already in the
/// requested state, in which case nothing was written.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Review {
    pub ballot: Ballot,
    pub applied: bool,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PendingReview {
    pub voter_id: VoterId,
    pub display_id: String,
    pub poll_id: PollId,
    pub poll_title: String,
    pub candidate_id: String,
    pub candidate_name: String,
    pub proof: ProofRef,
    pub cast_at: DateTime<Utc>,
}

/// An active poll as seen by one voter.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PollView {
    pub poll: Poll,
    pub status: &'static str,
    pub ballot: Option<Ballot>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn outcome(self) -> BallotState {
        match self {
            Decision::Approve => BallotState::Approved,
            Decision::Reject => BallotState::Rejected,
        }
    }
}

pub struct Ledger {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    proof_uploads: AtomicU64,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            proof_uploads: AtomicU64::new(0),
        }
    }

    pub async fn require_admin(&self, caller: &str) -> Result<(), WorkflowError> {
        if self.store.is_admin(caller).await? {
            Ok(())
        } else {
            warn!("Non-admin {caller} attempted an admin action");
            Err(WorkflowError::Forbidden)
        }
    }

    pub async fn cast(
        &self,
        voter_id: &str,
        poll_id: &str,
        candidate_id: &str,
    ) -> Result<Ballot, WorkflowError> {
        let poll = self.active_poll(poll_id).await?;
        if poll.candidate(candidate_id).is_none() {
            return Err(WorkflowError::UnknownCandidate {
                poll_id: poll_id.to_string(),
                candidate_id: candidate_id.to_string(),
            });
        }

        let voter = self.voter(voter_id).await?;
        let existing = voter.ballot(poll_id);
        let ballot = Ballot::cast(existing, candidate_id, self.clock.now())?;

        if !self
            .store
            .update_ballot(voter_id, poll_id, existing, &ballot)
            .await?
        {
            return Err(WorkflowError::Conflict);
        }

        info!("Voter {voter_id} cast for {candidate_id} in poll {poll_id}, awaiting payment");
        Ok(ballot)
    }

    pub async fn submit_proof(
        &self,
        voter_id: &str,
        poll_id: &str,
        image: ImageUpload,
    ) -> Result<Ballot, WorkflowError> {
        image.validate()?;

        let current = self.current_ballot(voter_id, poll_id).await?;
        if current.state != BallotState::PendingPayment {
            return Err(WorkflowError::InvalidTransition {
                from: current.state,
                event: "submit proof for",
            });
        }

        let now = self.clock.now();
        let attempt = self.proof_uploads.fetch_add(1, Ordering::Relaxed);
        let path = proof_path(voter_id, poll_id, now.timestamp_millis(), attempt);

        let location = self
            .blobs
            .upload(&path, &image.bytes, &image.content_type)
            .await
            .inspect_err(|e| warn!("Proof upload for {voter_id} in poll {poll_id} failed: {e}"))?;

        let url = match self.blobs.public_url(&location).await {
            Ok(url) => url,
            Err(e) => {
                self.discard_blob(&location.path).await;
                return Err(e.into());
            }
        };

        let next = current.submit_proof(
            ProofRef {
                url,
                path: location.path.clone(),
            },
            now,
        )?;

        match self
            .store
            .update_ballot(voter_id, poll_id, Some(&current), &next)
            .await
        {
            Ok(true) => {
                info!("Voter {voter_id} submitted proof for poll {poll_id}, awaiting approval");
                Ok(next)
            }
            Ok(false) => {
                self.discard_unreferenced_proof(voter_id, poll_id, &location.path)
                    .await;
                Err(WorkflowError::Conflict)
            }
            Err(e) => {
                self.discard_blob(&location.path).await;
                Err(e.into())
            }
        }
    }

    pub async fn approve(
        &self,
        admin_id: &str,
        voter_id: &str,
        poll_id: &str,
    ) -> Result<Review, WorkflowError> {
        self.require_admin(admin_id).await?;
        self.decide(voter_id, poll_id, Decision::Approve).await
    }

    pub async fn reject(
        &self,
        admin_id: &str,
        voter_id: &str,
        poll_id: &str,
    ) -> Result<Review, WorkflowError> {
        self.require_admin(admin_id).await?;
        self.decide(voter_id, poll_id, Decision::Reject).await
    }

    async fn decide(
        &self,
        voter_id: &str,
        poll_id: &str,
        decision: Decision,
    ) -> Result<Review, WorkflowError> {
        let current = self.current_ballot(voter_id, poll_id).await?;
        if current.state == decision.outcome() {
            info!("Ballot of {voter_id} in poll {poll_id} already {}", current.state);
            return Ok(Review {
                ballot: current,
                applied: false,
            });
        }

        let now = self.clock.now();
        let next = match decision {
            Decision::Approve => current.approve(now)?,
            Decision::Reject => current.reject(now)?,
        };

        if !self
            .store
            .update_ballot(voter_id, poll_id, Some(&current), &next)
            .await?
        {
            let latest = self.current_ballot(voter_id, poll_id).await?;
            if latest.state == decision.outcome() {
                info!("Ballot of {voter_id} in poll {poll_id} decided concurrently");
                return Ok(Review {
                    ballot: latest,
                    applied: false,
                });
            }

            return Err(WorkflowError::Conflict);
        }

        let counted = match decision {
            Decision::Approve => self
                .store
                .increment_votes(poll_id, &next.candidate_id)
                .await
                .map(Some),
            Decision::Reject => Ok(None),
        };

        // the ballot no longer references the proof, whatever happened to the tally
        if let Some(proof) = &current.proof {
            self.discard_blob(&proof.path).await;
        }

        match counted {
            Ok(Some(votes)) => info!(
                "Approved ballot of {voter_id} in poll {poll_id}, {} now has {votes} votes",
                next.candidate_id
            ),
            Ok(None) => info!("Rejected ballot of {voter_id} in poll {poll_id}"),
            Err(e) => {
                error!("Ballot of {voter_id} in poll {poll_id} approved but tally not updated: {e}");
                return Err(e.into());
            }
        }

        Ok(Review {
            ballot: next,
            applied: true,
        })
    }

    /// Ballots awaiting review, oldest first.
    pub async fn pending_queue(&self, admin_id: &str) -> Result<Vec<PendingReview>, WorkflowError> {
        self.require_admin(admin_id).await?;

        let polls: HashMap<PollId, Poll> = self
            .store
            .polls(None)
            .await?
            .into_iter()
            .map(|poll| (poll.id.clone(), poll))
            .collect();

        let mut queue = Vec::new();
        for voter in self.store.voters().await? {
            for (poll_id, ballot) in &voter.ballots {
                if ballot.state != BallotState::PendingApproval {
                    continue;
                }

                let Some(poll) = polls.get(poll_id) else {
                    warn!("Pending ballot of {} references unknown poll {poll_id}", voter.id);
                    continue;
                };
                let Some(candidate) = poll.candidate(&ballot.candidate_id) else {
                    warn!(
                        "Pending ballot of {} references unknown candidate {}",
                        voter.id, ballot.candidate_id
                    );
                    continue;
                };
                let Some(proof) = &ballot.proof else {
                    warn!("Pending ballot of {} in poll {poll_id} has no proof", voter.id);
                    continue;
                };

                queue.push(PendingReview {
                    voter_id: voter.id.clone(),
                    display_id: voter.display_id.clone(),
                    poll_id: poll_id.clone(),
                    poll_title: poll.title.clone(),
                    candidate_id: candidate.id.clone(),
                    candidate_name: candidate.name.clone(),
                    proof: proof.clone(),
                    cast_at: ballot.cast_at,
                });
            }
        }

        queue.sort_by(|a, b| {
            a.cast_at
                .cmp(&b.cast_at)
                .then_with(|| a.voter_id.cmp(&b.voter_id))
                .then_with(|| a.poll_id.cmp(&b.poll_id))
        });

        Ok(queue)
    }

    pub async fn create_poll(&self, admin_id: &str, draft: PollDraft) -> Result<Poll, WorkflowError> {
        self.require_admin(admin_id).await?;

        let draft = draft.validate()?;
        let poll_id = self.store.allocate_poll_id().await?;
        let now = self.clock.now();

        let mut uploaded: Vec<String> = Vec::new();
        let mut candidates = Vec::with_capacity(draft.candidates.len());

        for (position, (name, image)) in draft.candidates.into_iter().enumerate() {
            let id = candidate_id(position, now.timestamp_millis());
            let path = candidate_image_path(&poll_id, &id, &image.filename);

            let url = match self.upload_image(&path, &image, &mut uploaded).await {
                Ok(url) => url,
                Err(e) => {
                    warn!("Creating poll {poll_id} failed on image {path}: {e}");
                    self.rollback_images(&uploaded).await;
                    return Err(e);
                }
            };

            candidates.push(Candidate {
                id,
                name,
                image: ImageRef { path, url },
                approved_votes: 0,
            });
        }

        let poll = Poll {
            id: poll_id,
            title: draft.title,
            status: PollStatus::Active,
            candidates,
            created_at: now,
        };

        if let Err(e) = self.store.create_poll(&poll).await {
            self.rollback_images(&uploaded).await;
            return Err(e.into());
        }

        info!(
            "Created poll {} with {} candidates",
            poll.id,
            poll.candidates.len()
        );
        Ok(poll)
    }

    async fn upload_image(
        &self,
        path: &str,
        image: &ImageUpload,
        uploaded: &mut Vec<String>,
    ) -> Result<String, WorkflowError> {
        let location = self
            .blobs
            .upload(path, &image.bytes, &image.content_type)
            .await?;
        uploaded.push(location.path.clone());

        Ok(self.blobs.public_url(&location).await?)
    }

    async fn rollback_images(&self, paths: &[String]) {
        for path in paths {
            self.discard_blob(path).await;
        }
    }

    pub async fn close_poll(&self, admin_id: &str, poll_id: &str) -> Result<Poll, WorkflowError> {
        self.require_admin(admin_id).await?;

        let mut poll = self.poll(poll_id).await?;
        if poll.status != PollStatus::Closed {
            self.store
                .set_poll_status(poll_id, PollStatus::Closed)
                .await?;
            poll.status = PollStatus::Closed;
            info!("Closed poll {poll_id}");
        }

        Ok(poll)
    }

    pub async fn all_polls(&self, admin_id: &str) -> Result<Vec<Poll>, WorkflowError> {
        self.require_admin(admin_id).await?;
        Ok(self.store.polls(None).await?)
    }

    /// Active polls joined with the voter's ballot for each.
    pub async fn dashboard(&self, voter_id: &str) -> Result<Vec<PollView>, WorkflowError> {
        let voter = self.voter(voter_id).await?;

        Ok(self
            .store
            .polls(Some(PollStatus::Active))
            .await?
            .into_iter()
            .map(|poll| {
                let ballot = voter.ballot(&poll.id).cloned();
                PollView {
                    status: ballot.as_ref().map_or("not_cast", |b| b.state.as_str()),
                    ballot,
                    poll,
                }
            })
            .collect())
    }

    /// Always computed from the latest stored counters.
    pub async fn tally(&self, poll_id: &str) -> Result<Vec<TallyRow>, WorkflowError> {
        Ok(compute_tally(&self.poll(poll_id).await?))
    }

    /// Recomputes the poll's counters from ballot states. With `repair`, drifted counters
    /// are overwritten with the recomputed values.
    pub async fn reconcile(&self, poll_id: &str, repair: bool) -> Result<RecountReport, WorkflowError> {
        let poll = self.poll(poll_id).await?;
        let voters = self.store.voters().await?;
        let report = recount(&poll, &voters);

        for drift in report.drifted() {
            warn!(
                "Poll {poll_id} candidate {} stored {} approved votes, ballots say {}",
                drift.candidate_id, drift.stored, drift.recomputed
            );

            if repair {
                self.store
                    .set_votes(poll_id, &drift.candidate_id, drift.recomputed)
                    .await?;
            }
        }

        Ok(report)
    }

    pub async fn ballot(&self, voter_id: &str, poll_id: &str) -> Result<Option<Ballot>, WorkflowError> {
        Ok(self.voter(voter_id).await?.ballots.remove(poll_id))
    }

    pub async fn poll(&self, poll_id: &str) -> Result<Poll, WorkflowError> {
        self.store
            .poll(poll_id)
            .await?
            .ok_or_else(|| WorkflowError::PollNotFound(poll_id.to_string()))
    }

    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe()
    }

    async fn active_poll(&self, poll_id: &str) -> Result<Poll, WorkflowError> {
        let poll = self.poll(poll_id).await?;
        if !poll.is_active() {
            return Err(WorkflowError::PollNotActive {
                poll_id: poll_id.to_string(),
                status: poll.status,
            });
        }

        Ok(poll)
    }

    async fn voter(&self, voter_id: &str) -> Result<VoterRecord, WorkflowError> {
        self.store
            .voter(voter_id)
            .await?
            .ok_or_else(|| WorkflowError::VoterNotFound(voter_id.to_string()))
    }

    async fn current_ballot(&self, voter_id: &str, poll_id: &str) -> Result<Ballot, WorkflowError> {
        self.ballot(voter_id, poll_id)
            .await?
            .ok_or_else(|| WorkflowError::BallotNotFound(poll_id.to_string()))
    }

    /// Deletes a proof upload that lost its ballot write, unless the stored ballot ended up
    /// pointing at the same path.
    async fn discard_unreferenced_proof(&self, voter_id: &str, poll_id: &str, path: &str) {
        match self.ballot(voter_id, poll_id).await {
            Ok(Some(Ballot {
                proof: Some(proof), ..
            })) if proof.path == path => {
                warn!("Proof {path} of {voter_id} in poll {poll_id} is still referenced, keeping it");
            }
            Ok(_) => self.discard_blob(path).await,
            Err(e) => {
                warn!("Could not re-read ballot of {voter_id} in poll {poll_id}, keeping {path}: {e}")
            }
        }
    }

    async fn discard_blob(&self, path: &str) {
        if let Err(e) = self.blobs.delete(path).await {
            warn!("Could not delete blob {path}: {e}");
        }
    }
}
