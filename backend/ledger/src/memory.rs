//! In-memory collaborators, used by tests and by the server's `memory` backend.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        LazyLock, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tokio::{
    sync::{Mutex, broadcast},
    task::yield_now,
};

use crate::{
    error::{AuthError, StoreError},
    model::{Ballot, CandidateId, Poll, PollId, PollStatus, VoterId, VoterRecord},
    ports::{
        BlobLocation, BlobStore, ChangeEvent, Clock, DocumentStore, Identity, IdentityProvider,
        Session, Subscription,
    },
};

const CHANGE_CAPACITY: usize = 256;
const MIN_PASSWORD_LENGTH: usize = 6;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern"));

/// Document store kept in process. Ballot writes can be made to yield first, so that two
/// tasks both read a ballot before either writes it.
pub struct MemoryStore {
    voters: Mutex<BTreeMap<VoterId, VoterRecord>>,
    polls: Mutex<BTreeMap<PollId, Poll>>,
    admins: Mutex<HashSet<VoterId>>,
    next_poll_id: AtomicU64,
    changes: broadcast::Sender<ChangeEvent>,
    yield_before_writes: AtomicBool,
    stale_writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        Self {
            voters: Mutex::new(BTreeMap::new()),
            polls: Mutex::new(BTreeMap::new()),
            admins: Mutex::new(HashSet::new()),
            next_poll_id: AtomicU64::new(1),
            changes,
            yield_before_writes: AtomicBool::new(false),
            stale_writes: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    pub async fn add_admin(&self, id: &str) {
        self.admins.lock().await.insert(id.to_string());
    }

    pub fn yield_before_writes(&self, enabled: bool) {
        self.yield_before_writes.store(enabled, Ordering::Relaxed);
    }

    /// Ballot writes refused because the stored ballot no longer matched.
    pub fn stale_writes(&self) -> usize {
        self.stale_writes.load(Ordering::Relaxed)
    }

    fn notify(&self, event: ChangeEvent) {
        // no subscribers is fine
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn voter(&self, id: &str) -> Result<Option<VoterRecord>, StoreError> {
        Ok(self.voters.lock().await.get(id).cloned())
    }

    async fn create_voter(&self, record: &VoterRecord) -> Result<(), StoreError> {
        self.voters
            .lock()
            .await
            .insert(record.id.clone(), record.clone());

        self.notify(ChangeEvent::Voter(record.id.clone()));
        Ok(())
    }

    async fn voters(&self) -> Result<Vec<VoterRecord>, StoreError> {
        Ok(self.voters.lock().await.values().cloned().collect())
    }

    async fn update_ballot(
        &self,
        voter_id: &str,
        poll_id: &str,
        expected: Option<&Ballot>,
        next: &Ballot,
    ) -> Result<bool, StoreError> {
        if self.yield_before_writes.load(Ordering::Relaxed) {
            yield_now().await;
        }

        {
            let mut voters = self.voters.lock().await;
            let voter = voters
                .get_mut(voter_id)
                .ok_or_else(|| StoreError::Missing(format!("voters/{voter_id}")))?;

            if voter.ballots.get(poll_id) != expected {
                self.stale_writes.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }

            voter.ballots.insert(poll_id.to_string(), next.clone());
        }

        self.notify(ChangeEvent::Voter(voter_id.to_string()));
        Ok(true)
    }

    async fn is_admin(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.admins.lock().await.contains(id))
    }

    async fn allocate_poll_id(&self) -> Result<PollId, StoreError> {
        let id = self.next_poll_id.fetch_add(1, Ordering::Relaxed);
        Ok(format!("poll_{id}"))
    }

    async fn create_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        self.polls
            .lock()
            .await
            .insert(poll.id.clone(), poll.clone());

        self.notify(ChangeEvent::Poll(poll.id.clone()));
        Ok(())
    }

    async fn poll(&self, id: &str) -> Result<Option<Poll>, StoreError> {
        Ok(self.polls.lock().await.get(id).cloned())
    }

    async fn polls(&self, status: Option<PollStatus>) -> Result<Vec<Poll>, StoreError> {
        let mut polls: Vec<Poll> = self
            .polls
            .lock()
            .await
            .values()
            .filter(|poll| status.is_none_or(|status| poll.status == status))
            .cloned()
            .collect();

        polls.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(polls)
    }

    async fn set_poll_status(&self, poll_id: &str, status: PollStatus) -> Result<(), StoreError> {
        self.polls
            .lock()
            .await
            .get_mut(poll_id)
            .ok_or_else(|| StoreError::Missing(format!("polls/{poll_id}")))?
            .status = status;

        self.notify(ChangeEvent::Poll(poll_id.to_string()));
        Ok(())
    }

    async fn increment_votes(
        &self,
        poll_id: &str,
        candidate_id: &CandidateId,
    ) -> Result<u32, StoreError> {
        let votes = {
            let mut polls = self.polls.lock().await;
            let candidate = polls
                .get_mut(poll_id)
                .and_then(|poll| poll.candidates.iter_mut().find(|c| &c.id == candidate_id))
                .ok_or_else(|| StoreError::Missing(format!("polls/{poll_id}/{candidate_id}")))?;

            candidate.approved_votes += 1;
            candidate.approved_votes
        };

        self.notify(ChangeEvent::Poll(poll_id.to_string()));
        Ok(votes)
    }

    async fn set_votes(
        &self,
        poll_id: &str,
        candidate_id: &CandidateId,
        votes: u32,
    ) -> Result<(), StoreError> {
        {
            let mut polls = self.polls.lock().await;
            let candidate = polls
                .get_mut(poll_id)
                .and_then(|poll| poll.candidates.iter_mut().find(|c| &c.id == candidate_id))
                .ok_or_else(|| StoreError::Missing(format!("polls/{poll_id}/{candidate_id}")))?;

            candidate.approved_votes = votes;
        }

        self.notify(ChangeEvent::Poll(poll_id.to_string()));
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.changes.subscribe())
    }
}

#[derive(Clone, Debug)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Blob store with switches for simulating upload and delete failures and slow uploads.
pub struct MemoryBlobStore {
    base_url: String,
    blobs: Mutex<BTreeMap<String, StoredBlob>>,
    uploads_before_failure: StdMutex<Option<usize>>,
    fail_deletes: AtomicBool,
    yield_after_uploads: AtomicBool,
    uploads: AtomicUsize,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new("memory://blobs")
    }
}

impl MemoryBlobStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            blobs: Mutex::new(BTreeMap::new()),
            uploads_before_failure: StdMutex::new(None),
            fail_deletes: AtomicBool::new(false),
            yield_after_uploads: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Lets `count` more uploads succeed, then fails every following one.
    pub fn fail_uploads_after(&self, count: usize) {
        if let Ok(mut remaining) = self.uploads_before_failure.lock() {
            *remaining = Some(count);
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    pub fn yield_after_uploads(&self, enabled: bool) {
        self.yield_after_uploads.store(enabled, Ordering::Relaxed);
    }

    pub async fn get(&self, path: &str) -> Option<StoredBlob> {
        self.blobs.lock().await.get(path).cloned()
    }

    pub async fn paths(&self) -> Vec<String> {
        self.blobs.lock().await.keys().cloned().collect()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }

    fn take_upload_permit(&self) -> bool {
        match self.uploads_before_failure.lock() {
            Ok(mut remaining) => match remaining.as_mut() {
                None => true,
                Some(0) => false,
                Some(count) => {
                    *count -= 1;
                    true
                }
            },
            Err(_) => false,
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<BlobLocation, StoreError> {
        if !self.take_upload_permit() {
            return Err(StoreError::Unavailable(format!("upload of {path} failed")));
        }

        self.blobs.lock().await.insert(
            path.to_string(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        self.uploads.fetch_add(1, Ordering::Relaxed);

        if self.yield_after_uploads.load(Ordering::Relaxed) {
            yield_now().await;
        }

        Ok(BlobLocation {
            path: path.to_string(),
        })
    }

    async fn public_url(&self, location: &BlobLocation) -> Result<String, StoreError> {
        if !self.blobs.lock().await.contains_key(&location.path) {
            return Err(StoreError::Missing(location.path.clone()));
        }

        Ok(format!("{}/{}", self.base_url, location.path))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable(format!("delete of {path} failed")));
        }

        self.blobs
            .lock()
            .await
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::Missing(path.to_string()))
    }
}

struct Account {
    password: String,
    identity: Identity,
}

/// Email/password accounts with the same error codes as the hosted provider.
#[derive(Default)]
pub struct MemoryIdentity {
    accounts: Mutex<HashMap<String, Account>>,
    sessions: Mutex<HashMap<String, Identity>>,
    next_id: AtomicU64,
}

impl MemoryIdentity {
    async fn open_session(&self, identity: Identity) -> Session {
        let token = format!(
            "session-{}-{}",
            identity.id,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );

        self.sessions
            .lock()
            .await
            .insert(token.clone(), identity.clone());

        Session { identity, token }
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = email.trim().to_lowercase();

        if !EMAIL.is_match(&email) {
            return Err(AuthError::from_code("invalid-email"));
        }
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::from_code("weak-password"));
        }

        let identity = {
            let mut accounts = self.accounts.lock().await;
            if accounts.contains_key(&email) {
                return Err(AuthError::from_code("email-already-in-use"));
            }

            let identity = Identity {
                id: format!("voter_{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
                email: email.clone(),
            };
            accounts.insert(
                email,
                Account {
                    password: password.to_string(),
                    identity: identity.clone(),
                },
            );
            identity
        };

        Ok(self.open_session(identity).await)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = email.trim().to_lowercase();

        let identity = self
            .accounts
            .lock()
            .await
            .get(&email)
            .filter(|account| account.password == password)
            .map(|account| account.identity.clone())
            .ok_or(AuthError::InvalidCredentials)?;

        Ok(self.open_session(identity).await)
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        self.sessions.lock().await.remove(token);
        Ok(())
    }

    async fn resolve(&self, token: &str) -> Result<Option<Identity>, AuthError> {
        Ok(self.sessions.lock().await.get(token).cloned())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
