use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use ledger::{
    ErrorKind, Ledger, StoreError, WorkflowError,
    authoring::{CandidateDraft, ImageUpload, PollDraft},
    memory::{ManualClock, MemoryBlobStore, MemoryStore},
    model::{BallotState, Poll, PollStatus, VoterRecord},
    ports::{ChangeEvent, DocumentStore},
};

const ADMIN: &str = "admin_1";

struct Harness {
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    clock: Arc<ManualClock>,
    ledger: Arc<Ledger>,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::new("https://blobs.test"));
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let ledger = Arc::new(Ledger::new(store.clone(), blobs.clone(), clock.clone()));

        store.add_admin(ADMIN).await;

        Self {
            store,
            blobs,
            clock,
            ledger,
        }
    }

    async fn voter(&self, id: &str) {
        let record = VoterRecord::new(
            id.to_string(),
            format!("{id}@school.test"),
            &format!(" ns/{id} "),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );
        self.store.create_voter(&record).await.unwrap();
    }

    async fn poll(&self, names: &[&str]) -> Poll {
        self.ledger
            .create_poll(ADMIN, draft("Best Club", names))
            .await
            .unwrap()
    }

    fn tick(&self) {
        self.clock.advance(Duration::seconds(1));
    }

    async fn pending(&self, voter: &str, poll: &Poll, candidate: usize) {
        self.ledger
            .cast(voter, &poll.id, &poll.candidates[candidate].id)
            .await
            .unwrap();
        self.tick();
        self.ledger
            .submit_proof(voter, &poll.id, screenshot())
            .await
            .unwrap();
        self.tick();
    }

    async fn votes(&self, poll: &Poll) -> Vec<u32> {
        self.ledger
            .poll(&poll.id)
            .await
            .unwrap()
            .candidates
            .iter()
            .map(|c| c.approved_votes)
            .collect()
    }
}

fn image(name: &str) -> ImageUpload {
    ImageUpload {
        filename: format!("{name}.png"),
        content_type: "image/png".to_string(),
        bytes: vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a],
    }
}

fn screenshot() -> ImageUpload {
    ImageUpload {
        filename: "transfer.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        bytes: vec![0xff, 0xd8, 0xff, 0xe0],
    }
}

fn draft(title: &str, names: &[&str]) -> PollDraft {
    PollDraft {
        title: title.to_string(),
        candidates: names
            .iter()
            .map(|name| CandidateDraft {
                name: name.to_string(),
                image: Some(image(name)),
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_create_poll() {
    let h = Harness::new().await;

    let poll = h.poll(&["X", "Y"]).await;

    assert_eq!(poll.title, "Best Club");
    assert_eq!(poll.status, PollStatus::Active);
    assert_eq!(poll.candidates.len(), 2);
    assert!(poll.candidates.iter().all(|c| c.approved_votes == 0));
    assert_eq!(
        poll.candidates[0].image.path,
        format!("polls/{}/{}/x.png", poll.id, poll.candidates[0].id)
    );
    assert_ne!(poll.candidates[0].id, poll.candidates[1].id);
    assert_eq!(h.blobs.paths().await.len(), 2);
    assert_eq!(h.ledger.poll(&poll.id).await.unwrap(), poll);
}

#[tokio::test]
async fn test_create_poll_boundary() {
    let h = Harness::new().await;

    let one = h.ledger.create_poll(ADMIN, draft("Solo", &["X"])).await;
    assert!(matches!(
        one,
        Err(WorkflowError::NotEnoughCandidates { found: 1 })
    ));

    let two = h.ledger.create_poll(ADMIN, draft("Duo", &["X", "Y"])).await;
    assert!(two.is_ok());
}

#[tokio::test]
async fn test_create_poll_requires_admin() {
    let h = Harness::new().await;

    let result = h.ledger.create_poll("student", draft("Best Club", &["X", "Y"])).await;

    assert!(matches!(result, Err(WorkflowError::Forbidden)));
    assert!(h.blobs.paths().await.is_empty());
}

#[tokio::test]
async fn test_create_poll_rolls_back_uploads() {
    let h = Harness::new().await;
    h.blobs.fail_uploads_after(2);

    let result = h
        .ledger
        .create_poll(ADMIN, draft("Best Club", &["X", "Y", "Z"]))
        .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Transient);
    assert!(h.blobs.paths().await.is_empty());
    assert!(h.store.polls(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cast_first_ballot() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;

    let ballot = h
        .ledger
        .cast("v1", &poll.id, &poll.candidates[0].id)
        .await
        .unwrap();

    assert_eq!(ballot.state, BallotState::PendingPayment);
    assert_eq!(ballot.candidate_id, poll.candidates[0].id);
    assert_eq!(
        h.ledger.ballot("v1", &poll.id).await.unwrap(),
        Some(ballot)
    );
}

#[tokio::test]
async fn test_cast_preconditions() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;

    assert!(matches!(
        h.ledger.cast("v1", &poll.id, "nobody").await,
        Err(WorkflowError::UnknownCandidate { .. })
    ));
    assert!(matches!(
        h.ledger.cast("v1", "missing", "x").await,
        Err(WorkflowError::PollNotFound(_))
    ));
    assert!(matches!(
        h.ledger.cast("ghost", &poll.id, &poll.candidates[0].id).await,
        Err(WorkflowError::VoterNotFound(_))
    ));

    h.ledger.close_poll(ADMIN, &poll.id).await.unwrap();

    assert!(matches!(
        h.ledger.cast("v1", &poll.id, &poll.candidates[0].id).await,
        Err(WorkflowError::PollNotActive { .. })
    ));
    assert_eq!(h.ledger.ballot("v1", &poll.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_submit_proof() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.ledger
        .cast("v1", &poll.id, &poll.candidates[0].id)
        .await
        .unwrap();

    let ballot = h
        .ledger
        .submit_proof("v1", &poll.id, screenshot())
        .await
        .unwrap();

    assert_eq!(ballot.state, BallotState::PendingApproval);
    let proof = ballot.proof.unwrap();
    assert!(!proof.url.is_empty());
    assert!(proof.path.starts_with(&format!("payments/v1_{}_", poll.id)));
    assert_eq!(
        h.blobs.get(&proof.path).await.unwrap().content_type,
        "image/jpeg"
    );
}

#[tokio::test]
async fn test_submit_proof_failure_keeps_pending_payment() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.ledger
        .cast("v1", &poll.id, &poll.candidates[0].id)
        .await
        .unwrap();
    h.blobs.fail_uploads_after(0);

    let result = h.ledger.submit_proof("v1", &poll.id, screenshot()).await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Transient);
    let ballot = h.ledger.ballot("v1", &poll.id).await.unwrap().unwrap();
    assert_eq!(ballot.state, BallotState::PendingPayment);
    assert!(ballot.proof.is_none());
}

#[tokio::test]
async fn test_submit_proof_rejects_non_image() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.ledger
        .cast("v1", &poll.id, &poll.candidates[0].id)
        .await
        .unwrap();
    let uploads = h.blobs.upload_count();

    let mut pdf = screenshot();
    pdf.content_type = "application/pdf".to_string();

    assert!(matches!(
        h.ledger.submit_proof("v1", &poll.id, pdf).await,
        Err(WorkflowError::InvalidImage(_))
    ));
    assert_eq!(h.blobs.upload_count(), uploads);
}

#[tokio::test]
async fn test_submit_proof_without_ballot() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;

    assert!(matches!(
        h.ledger.submit_proof("v1", &poll.id, screenshot()).await,
        Err(WorkflowError::BallotNotFound(_))
    ));
}

#[tokio::test]
async fn test_cast_blocked_while_pending_or_approved() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;

    let blocked = h.ledger.cast("v1", &poll.id, &poll.candidates[1].id).await;
    assert!(matches!(
        blocked,
        Err(WorkflowError::AlreadyCast(BallotState::PendingApproval))
    ));

    h.ledger.approve(ADMIN, "v1", &poll.id).await.unwrap();

    let blocked = h.ledger.cast("v1", &poll.id, &poll.candidates[1].id).await;
    assert!(matches!(
        blocked,
        Err(WorkflowError::AlreadyCast(BallotState::Approved))
    ));

    let ballot = h.ledger.ballot("v1", &poll.id).await.unwrap().unwrap();
    assert_eq!(ballot.candidate_id, poll.candidates[0].id);
    assert_eq!(ballot.state, BallotState::Approved);
}

#[tokio::test]
async fn test_approve_round_trip() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;
    let proof = h
        .ledger
        .ballot("v1", &poll.id)
        .await
        .unwrap()
        .unwrap()
        .proof
        .unwrap();

    let review = h.ledger.approve(ADMIN, "v1", &poll.id).await.unwrap();

    assert!(review.applied);
    assert_eq!(review.ballot.state, BallotState::Approved);
    assert!(review.ballot.proof.is_none());
    assert_eq!(h.votes(&poll).await, [1, 0]);
    assert!(h.blobs.get(&proof.path).await.is_none());
}

#[tokio::test]
async fn test_reject_round_trip() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 1).await;
    let proof = h
        .ledger
        .ballot("v1", &poll.id)
        .await
        .unwrap()
        .unwrap()
        .proof
        .unwrap();

    let review = h.ledger.reject(ADMIN, "v1", &poll.id).await.unwrap();

    assert!(review.applied);
    assert_eq!(review.ballot.state, BallotState::Rejected);
    assert!(review.ballot.proof.is_none());
    assert_eq!(h.votes(&poll).await, [0, 0]);
    assert!(h.blobs.get(&proof.path).await.is_none());
}

#[tokio::test]
async fn test_approve_twice_counts_once() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;

    let first = h.ledger.approve(ADMIN, "v1", &poll.id).await.unwrap();
    let second = h.ledger.approve(ADMIN, "v1", &poll.id).await.unwrap();

    assert!(first.applied);
    assert!(!second.applied);
    assert_eq!(second.ballot.state, BallotState::Approved);
    assert_eq!(h.votes(&poll).await, [1, 0]);
}

#[tokio::test]
async fn test_concurrent_approvals_count_once() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;

    // both approvals read the pending ballot before either writes
    h.store.yield_before_writes(true);

    let (a, b) = tokio::join!(
        h.ledger.approve(ADMIN, "v1", &poll.id),
        h.ledger.approve(ADMIN, "v1", &poll.id),
    );

    let a = a.unwrap();
    let b = b.unwrap();

    assert!(a.applied ^ b.applied);
    assert_eq!(a.ballot.state, BallotState::Approved);
    assert_eq!(b.ballot.state, BallotState::Approved);
    assert_eq!(h.store.stale_writes(), 1);
    assert_eq!(h.votes(&poll).await, [1, 0]);
    assert_eq!(
        h.ledger.ballot("v1", &poll.id).await.unwrap().unwrap().state,
        BallotState::Approved
    );
}

#[tokio::test]
async fn test_concurrent_approve_and_reject() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;
    h.store.yield_before_writes(true);

    let (approved, rejected) = tokio::join!(
        h.ledger.approve(ADMIN, "v1", &poll.id),
        h.ledger.reject(ADMIN, "v1", &poll.id),
    );

    let state = h.ledger.ballot("v1", &poll.id).await.unwrap().unwrap().state;
    match (approved, rejected) {
        (Ok(review), Err(WorkflowError::Conflict)) => {
            assert!(review.applied);
            assert_eq!(state, BallotState::Approved);
            assert_eq!(h.votes(&poll).await, [1, 0]);
        }
        (Err(WorkflowError::Conflict), Ok(review)) => {
            assert!(review.applied);
            assert_eq!(state, BallotState::Rejected);
            assert_eq!(h.votes(&poll).await, [0, 0]);
        }
        other => panic!("expected exactly one decision to apply, got {other:?}"),
    }
    assert_eq!(h.store.stale_writes(), 1);
}

#[tokio::test]
async fn test_duplicate_proof_in_same_millisecond_keeps_winner_blob() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.ledger
        .cast("v1", &poll.id, &poll.candidates[0].id)
        .await
        .unwrap();

    // no tick: both uploads see the same clock reading
    h.blobs.yield_after_uploads(true);

    let (a, b) = tokio::join!(
        h.ledger.submit_proof("v1", &poll.id, screenshot()),
        h.ledger.submit_proof("v1", &poll.id, screenshot()),
    );

    let (winner, loser) = if a.is_ok() { (a, b) } else { (b, a) };
    assert_eq!(winner.unwrap().state, BallotState::PendingApproval);
    assert!(matches!(loser, Err(WorkflowError::Conflict)));

    let ballot = h.ledger.ballot("v1", &poll.id).await.unwrap().unwrap();
    assert_eq!(ballot.state, BallotState::PendingApproval);

    let proof = ballot.proof.unwrap();
    assert!(h.blobs.get(&proof.path).await.is_some());

    let proofs: Vec<String> = h
        .blobs
        .paths()
        .await
        .into_iter()
        .filter(|path| path.starts_with("payments/"))
        .collect();
    assert_eq!(proofs, [proof.path]);
}

#[tokio::test]
async fn test_tally_failure_still_discards_proof() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;
    let proof = h
        .ledger
        .ballot("v1", &poll.id)
        .await
        .unwrap()
        .unwrap()
        .proof
        .unwrap();

    // the counter for the chosen candidate is gone, so the increment fails
    h.store
        .create_poll(&Poll {
            candidates: poll.candidates[1..].to_vec(),
            ..poll.clone()
        })
        .await
        .unwrap();

    let result = h.ledger.approve(ADMIN, "v1", &poll.id).await;

    assert!(matches!(
        result,
        Err(WorkflowError::Store(StoreError::Missing(_)))
    ));
    let ballot = h.ledger.ballot("v1", &poll.id).await.unwrap().unwrap();
    assert_eq!(ballot.state, BallotState::Approved);
    assert!(h.blobs.get(&proof.path).await.is_none());
}

#[tokio::test]
async fn test_decisions_require_admin_and_pending_approval() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.ledger
        .cast("v1", &poll.id, &poll.candidates[0].id)
        .await
        .unwrap();

    assert!(matches!(
        h.ledger.approve("v1", "v1", &poll.id).await,
        Err(WorkflowError::Forbidden)
    ));
    assert!(matches!(
        h.ledger.approve(ADMIN, "v1", &poll.id).await,
        Err(WorkflowError::InvalidTransition {
            from: BallotState::PendingPayment,
            ..
        })
    ));

    h.ledger
        .submit_proof("v1", &poll.id, screenshot())
        .await
        .unwrap();
    h.ledger.reject(ADMIN, "v1", &poll.id).await.unwrap();

    assert!(matches!(
        h.ledger.approve(ADMIN, "v1", &poll.id).await,
        Err(WorkflowError::InvalidTransition {
            from: BallotState::Rejected,
            ..
        })
    ));
    assert_eq!(h.votes(&poll).await, [0, 0]);
}

#[tokio::test]
async fn test_recast_after_rejection() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;
    h.ledger.reject(ADMIN, "v1", &poll.id).await.unwrap();

    let ballot = h
        .ledger
        .cast("v1", &poll.id, &poll.candidates[1].id)
        .await
        .unwrap();

    assert_eq!(ballot.state, BallotState::PendingPayment);
    assert_eq!(ballot.candidate_id, poll.candidates[1].id);
}

#[tokio::test]
async fn test_blob_delete_failure_keeps_approval() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 0).await;
    h.blobs.fail_deletes(true);

    let review = h.ledger.approve(ADMIN, "v1", &poll.id).await.unwrap();

    assert!(review.applied);
    assert!(review.ballot.proof.is_none());
    assert_eq!(h.votes(&poll).await, [1, 0]);
}

#[tokio::test]
async fn test_pending_queue_oldest_first() {
    let h = Harness::new().await;
    for voter in ["v1", "v2", "v3"] {
        h.voter(voter).await;
    }
    let poll = h.poll(&["X", "Y"]).await;

    h.pending("v3", &poll, 1).await;
    h.pending("v1", &poll, 0).await;
    h.pending("v2", &poll, 0).await;
    h.ledger.approve(ADMIN, "v1", &poll.id).await.unwrap();

    let queue = h.ledger.pending_queue(ADMIN).await.unwrap();
    let order: Vec<&str> = queue.iter().map(|p| p.voter_id.as_str()).collect();

    assert_eq!(order, ["v3", "v2"]);
    assert_eq!(queue[0].display_id, "NS/V3");
    assert_eq!(queue[0].candidate_name, "Y");
    assert_eq!(queue[0].poll_title, "Best Club");
    assert!(queue[0].cast_at < queue[1].cast_at);

    assert!(matches!(
        h.ledger.pending_queue("v1").await,
        Err(WorkflowError::Forbidden)
    ));
}

#[tokio::test]
async fn test_pending_queue_ties_are_deterministic() {
    let h = Harness::new().await;
    for voter in ["b", "a"] {
        h.voter(voter).await;
    }
    let poll = h.poll(&["X", "Y"]).await;

    for voter in ["b", "a"] {
        h.ledger
            .cast(voter, &poll.id, &poll.candidates[0].id)
            .await
            .unwrap();
        h.ledger
            .submit_proof(voter, &poll.id, screenshot())
            .await
            .unwrap();
    }

    let queue = h.ledger.pending_queue(ADMIN).await.unwrap();
    let order: Vec<&str> = queue.iter().map(|p| p.voter_id.as_str()).collect();

    assert_eq!(order, ["a", "b"]);
}

#[tokio::test]
async fn test_dashboard_and_tally() {
    let h = Harness::new().await;
    for voter in ["v1", "v2", "v3", "v4"] {
        h.voter(voter).await;
    }
    let poll = h.poll(&["X", "Y"]).await;
    let closed = h.poll(&["A", "B"]).await;
    h.ledger.close_poll(ADMIN, &closed.id).await.unwrap();

    for (voter, candidate) in [("v1", 0), ("v2", 0), ("v3", 0), ("v4", 1)] {
        h.pending(voter, &poll, candidate).await;
        h.ledger.approve(ADMIN, voter, &poll.id).await.unwrap();
    }

    let tally = h.ledger.tally(&poll.id).await.unwrap();
    assert_eq!(
        tally
            .iter()
            .map(|row| (row.name.as_str(), row.votes, row.percentage))
            .collect::<Vec<_>>(),
        [("X", 3, 75.0), ("Y", 1, 25.0)]
    );

    h.voter("v5").await;
    let dashboard = h.ledger.dashboard("v5").await.unwrap();
    assert_eq!(dashboard.len(), 1);
    assert_eq!(dashboard[0].poll.id, poll.id);
    assert_eq!(dashboard[0].status, "not_cast");

    let dashboard = h.ledger.dashboard("v1").await.unwrap();
    assert_eq!(dashboard[0].status, "approved");
}

#[tokio::test]
async fn test_reconcile_repairs_drift() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    h.pending("v1", &poll, 1).await;
    h.ledger.approve(ADMIN, "v1", &poll.id).await.unwrap();
    h.store
        .set_votes(&poll.id, &poll.candidates[0].id, 4)
        .await
        .unwrap();

    let report = h.ledger.reconcile(&poll.id, false).await.unwrap();
    assert!(!report.is_consistent());
    assert_eq!(h.votes(&poll).await, [4, 1]);

    let report = h.ledger.reconcile(&poll.id, true).await.unwrap();
    assert_eq!(report.drifted().count(), 1);
    assert_eq!(h.votes(&poll).await, [0, 1]);
    assert!(h.ledger.reconcile(&poll.id, false).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_subscription_sees_ballot_changes() {
    let h = Harness::new().await;
    h.voter("v1").await;
    let poll = h.poll(&["X", "Y"]).await;
    let mut subscription = h.ledger.subscribe();

    h.ledger
        .cast("v1", &poll.id, &poll.candidates[0].id)
        .await
        .unwrap();

    assert_eq!(
        subscription.next().await,
        Some(ChangeEvent::Voter("v1".to_string()))
    );

    subscription.unsubscribe();
}
