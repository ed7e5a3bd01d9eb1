//! # Authentication
//!
//! Accounts live with the identity provider; the ledger only keeps a voter record per
//! account and derives the admin capability from the store's admin set.
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};

use crate::{
    error::{AuthError, WorkflowError},
    model::VoterRecord,
    ports::{Clock, DocumentStore, Identity, IdentityProvider, Session},
};

#[derive(Clone, Debug, Default)]
pub struct SignUp {
    pub email: String,
    pub password: String,
    pub display_id: String,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AuthState {
    pub identity: Identity,
    pub is_admin: bool,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedIn {
    pub token: String,
    #[serde(flatten)]
    pub state: AuthState,
}

pub struct AuthService {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            store,
            clock,
        }
    }

    /// Creates the account and its voter record.
    pub async fn sign_up(&self, request: SignUp) -> Result<SignedIn, WorkflowError> {
        if request.email.trim().is_empty()
            || request.password.is_empty()
            || request.display_id.trim().is_empty()
        {
            return Err(AuthError::MissingFields.into());
        }

        let session = self
            .identity
            .sign_up(&request.email, &request.password)
            .await?;

        let record = VoterRecord::new(
            session.identity.id.clone(),
            session.identity.email.clone(),
            &request.display_id,
            self.clock.now(),
        );
        // The account already exists at this point. If the record write fails the account is
        // left without a voter record: voter operations answer VoterNotFound and signing up
        // again answers EmailInUse until an operator creates the record.
        self.store.create_voter(&record).await.inspect_err(|e| {
            error!("Account {} created without voter record: {e}", record.id)
        })?;

        info!("Registered voter {} ({})", record.id, record.display_id);
        self.signed_in(session).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn, WorkflowError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields.into());
        }

        let session = self.identity.sign_in(email, password).await?;
        self.signed_in(session).await
    }

    pub async fn sign_out(&self, token: &str) -> Result<(), WorkflowError> {
        Ok(self.identity.sign_out(token).await?)
    }

    /// Resolves a bearer token into the caller's identity and capabilities.
    pub async fn authenticate(&self, token: &str) -> Result<AuthState, WorkflowError> {
        let identity = self
            .identity
            .resolve(token)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        Ok(self.state_for(identity).await)
    }

    async fn signed_in(&self, session: Session) -> Result<SignedIn, WorkflowError> {
        Ok(SignedIn {
            token: session.token,
            state: self.state_for(session.identity).await,
        })
    }

    /// A failing admin lookup downgrades to a regular voter.
    async fn state_for(&self, identity: Identity) -> AuthState {
        let is_admin = match self.store.is_admin(&identity.id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                error!("Admin check failed for {}: {e}", identity.id);
                false
            }
        };

        AuthState { identity, is_admin }
    }
}

/// A single signed-in client. Observers follow sign in and sign out through
/// [`AuthSession::on_auth_change`].
pub struct AuthSession {
    service: Arc<AuthService>,
    token: Mutex<Option<String>>,
    state: watch::Sender<Option<AuthState>>,
}

impl AuthSession {
    pub fn new(service: Arc<AuthService>) -> Self {
        let (state, _) = watch::channel(None);

        Self {
            service,
            token: Mutex::new(None),
            state,
        }
    }

    pub fn on_auth_change(&self) -> watch::Receiver<Option<AuthState>> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Option<AuthState> {
        self.state.borrow().clone()
    }

    pub async fn token(&self) -> Option<String> {
        self.token.lock().await.clone()
    }

    pub async fn sign_up(&self, request: SignUp) -> Result<AuthState, WorkflowError> {
        let signed_in = self.service.sign_up(request).await?;
        Ok(self.enter(signed_in).await)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthState, WorkflowError> {
        let signed_in = self.service.sign_in(email, password).await?;
        Ok(self.enter(signed_in).await)
    }

    pub async fn sign_out(&self) -> Result<(), WorkflowError> {
        let token = self.token.lock().await.take();
        self.state.send_replace(None);

        if let Some(token) = token {
            self.service.sign_out(&token).await?;
        }

        Ok(())
    }

    async fn enter(&self, signed_in: SignedIn) -> AuthState {
        *self.token.lock().await = Some(signed_in.token);
        self.state.send_replace(Some(signed_in.state.clone()));

        signed_in.state
    }
}
