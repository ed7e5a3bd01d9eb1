//! # Collaborators
//!
//! The ledger never talks to a backend directly. Identity, documents and blobs are
//! injected as trait objects so the server can plug Redis and HTTP services in while tests
//! use the in-memory versions from [`crate::memory`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    error::{AuthError, StoreError},
    model::{Ballot, CandidateId, Poll, PollId, PollStatus, VoterId, VoterRecord},
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: VoterId,
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub token: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    async fn sign_out(&self, token: &str) -> Result<(), AuthError>;

    /// The identity behind a session token, or `None` once it is signed out or expired.
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, AuthError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    Voter(VoterId),
    Poll(PollId),
}

/// Live feed of document changes. Dropping the handle releases the subscription.
pub struct Subscription {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { receiver }
    }

    /// Waits for the next change. Returns `None` once the store is gone.
    ///
    /// A slow subscriber that falls behind skips the missed events; callers re-read the
    /// documents they care about anyway.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn voter(&self, id: &str) -> Result<Option<VoterRecord>, StoreError>;

    async fn create_voter(&self, record: &VoterRecord) -> Result<(), StoreError>;

    async fn voters(&self) -> Result<Vec<VoterRecord>, StoreError>;

    /// Writes `ballots.<poll_id>` of one voter without touching sibling fields.
    ///
    /// The write only happens if the stored ballot still equals `expected` (`None` meaning
    /// no ballot yet). Returns whether the write happened.
    async fn update_ballot(
        &self,
        voter_id: &str,
        poll_id: &str,
        expected: Option<&Ballot>,
        next: &Ballot,
    ) -> Result<bool, StoreError>;

    async fn is_admin(&self, id: &str) -> Result<bool, StoreError>;

    async fn allocate_poll_id(&self) -> Result<PollId, StoreError>;

    async fn create_poll(&self, poll: &Poll) -> Result<(), StoreError>;

    async fn poll(&self, id: &str) -> Result<Option<Poll>, StoreError>;

    /// All polls, or only those with the given status.
    async fn polls(&self, status: Option<PollStatus>) -> Result<Vec<Poll>, StoreError>;

    async fn set_poll_status(&self, poll_id: &str, status: PollStatus) -> Result<(), StoreError>;

    /// Atomically adds one approved vote to the stored counter and returns the new value.
    async fn increment_votes(
        &self,
        poll_id: &str,
        candidate_id: &CandidateId,
    ) -> Result<u32, StoreError>;

    async fn set_votes(
        &self,
        poll_id: &str,
        candidate_id: &CandidateId,
        votes: u32,
    ) -> Result<(), StoreError>;

    fn subscribe(&self) -> Subscription;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobLocation {
    pub path: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<BlobLocation, StoreError>;

    async fn public_url(&self, location: &BlobLocation) -> Result<String, StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
