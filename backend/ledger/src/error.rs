use thiserror::Error;

use crate::model::{BallotState, PollStatus};

/// Failure of an external collaborator (document store, blob store).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing document: {0}")]
    Missing(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("All fields are required.")]
    MissingFields,

    #[error("Invalid email format.")]
    InvalidEmail,

    #[error("Password should be at least 6 characters.")]
    WeakPassword,

    #[error("This email is already registered.")]
    EmailInUse,

    #[error("Invalid credentials or a network error occurred.")]
    InvalidCredentials,

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Invalid credentials or a network error occurred.")]
    Provider(String),
}

impl AuthError {
    /// Maps an identity provider error code to the message shown to the user.
    pub fn from_code(code: &str) -> Self {
        match code {
            "invalid-email" => AuthError::InvalidEmail,
            "weak-password" => AuthError::WeakPassword,
            "email-already-in-use" => AuthError::EmailInUse,
            "invalid-credential" | "wrong-password" | "user-not-found" => {
                AuthError::InvalidCredentials
            }
            other => AuthError::Provider(other.to_string()),
        }
    }

    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    Conflict,
    Transient,
    Internal,
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Poll title is required.")]
    EmptyTitle,

    #[error("Please add at least two candidates with names and images (found {found}).")]
    NotEnoughCandidates { found: usize },

    #[error("Please upload a valid image file: {0}")]
    InvalidImage(String),

    #[error("Poll {0} not found")]
    PollNotFound(String),

    #[error("Poll {poll_id} is {status:?}")]
    PollNotActive { poll_id: String, status: PollStatus },

    #[error("Candidate {candidate_id} is not part of poll {poll_id}")]
    UnknownCandidate {
        poll_id: String,
        candidate_id: String,
    },

    #[error("Voter {0} not found")]
    VoterNotFound(String),

    #[error("No ballot for poll {0}")]
    BallotNotFound(String),

    #[error("You have already cast and submitted payment for this poll. Status: {0}")]
    AlreadyCast(BallotState),

    #[error("Cannot {event} a ballot that is {from}")]
    InvalidTransition {
        from: BallotState,
        event: &'static str,
    },

    #[error("Admin capability required")]
    Forbidden,

    #[error("Ballot changed concurrently, please retry")]
    Conflict,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::EmptyTitle
            | WorkflowError::NotEnoughCandidates { .. }
            | WorkflowError::InvalidImage(_)
            | WorkflowError::UnknownCandidate { .. } => ErrorKind::Validation,
            WorkflowError::PollNotFound(_)
            | WorkflowError::VoterNotFound(_)
            | WorkflowError::BallotNotFound(_) => ErrorKind::NotFound,
            WorkflowError::PollNotActive { .. }
            | WorkflowError::AlreadyCast(_)
            | WorkflowError::InvalidTransition { .. }
            | WorkflowError::Conflict => ErrorKind::Conflict,
            WorkflowError::Forbidden => ErrorKind::Forbidden,
            WorkflowError::Auth(
                AuthError::MissingFields | AuthError::InvalidEmail | AuthError::WeakPassword,
            ) => ErrorKind::Validation,
            WorkflowError::Auth(AuthError::EmailInUse) => ErrorKind::Conflict,
            WorkflowError::Auth(AuthError::Provider(_)) => ErrorKind::Transient,
            WorkflowError::Auth(_) => ErrorKind::Auth,
            WorkflowError::Store(StoreError::Missing(_)) => ErrorKind::NotFound,
            WorkflowError::Store(StoreError::Malformed(_)) => ErrorKind::Internal,
            WorkflowError::Store(_) => ErrorKind::Transient,
        }
    }
}
