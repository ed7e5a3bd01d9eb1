use std::sync::Arc;

use chrono::{TimeZone, Utc};
use ledger::{
    AuthError, WorkflowError,
    auth::{AuthService, AuthSession, SignUp},
    memory::{ManualClock, MemoryIdentity, MemoryStore},
    ports::DocumentStore,
};

fn service() -> (Arc<MemoryStore>, Arc<AuthService>) {
    let store = Arc::new(MemoryStore::default());
    let clock = Arc::new(ManualClock::new(
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    ));
    let service = AuthService::new(Arc::new(MemoryIdentity::default()), store.clone(), clock);

    (store, Arc::new(service))
}

fn signup(email: &str, password: &str, display_id: &str) -> SignUp {
    SignUp {
        email: email.to_string(),
        password: password.to_string(),
        display_id: display_id.to_string(),
    }
}

fn auth_error(result: Result<impl std::fmt::Debug, WorkflowError>) -> AuthError {
    match result {
        Err(WorkflowError::Auth(error)) => error,
        other => panic!("expected auth error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sign_up_creates_voter_record() {
    let (store, service) = service();

    let signed_in = service
        .sign_up(signup("Ada@School.test", "secret1", " ns/2021/001 "))
        .await
        .unwrap();

    assert!(!signed_in.token.is_empty());
    assert!(!signed_in.state.is_admin);

    let record = store
        .voter(&signed_in.state.identity.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.email, "ada@school.test");
    assert_eq!(record.display_id, "NS/2021/001");
    assert!(record.ballots.is_empty());
}

#[tokio::test]
async fn test_sign_up_errors() {
    let (_, service) = service();

    assert_eq!(
        auth_error(service.sign_up(signup("a@school.test", "secret1", "  ")).await),
        AuthError::MissingFields
    );
    assert_eq!(
        auth_error(service.sign_up(signup("not-an-email", "secret1", "N1")).await),
        AuthError::InvalidEmail
    );
    assert_eq!(
        auth_error(service.sign_up(signup("a@school.test", "12345", "N1")).await),
        AuthError::WeakPassword
    );

    service
        .sign_up(signup("a@school.test", "secret1", "N1"))
        .await
        .unwrap();

    let duplicate = auth_error(service.sign_up(signup("a@school.test", "secret2", "N2")).await);
    assert_eq!(duplicate, AuthError::EmailInUse);
    assert_eq!(duplicate.user_message(), "This email is already registered.");
}

#[tokio::test]
async fn test_sign_in_and_authenticate() {
    let (store, service) = service();
    let created = service
        .sign_up(signup("admin@school.test", "secret1", "STAFF1"))
        .await
        .unwrap();
    store.add_admin(&created.state.identity.id).await;

    assert_eq!(
        auth_error(service.sign_in("admin@school.test", "wrong!").await),
        AuthError::InvalidCredentials
    );

    let signed_in = service.sign_in("admin@school.test", "secret1").await.unwrap();
    assert!(signed_in.state.is_admin);

    let state = service.authenticate(&signed_in.token).await.unwrap();
    assert_eq!(state.identity.id, created.state.identity.id);
    assert!(state.is_admin);

    service.sign_out(&signed_in.token).await.unwrap();
    assert_eq!(
        auth_error(service.authenticate(&signed_in.token).await),
        AuthError::Unauthenticated
    );
}

#[tokio::test]
async fn test_session_reports_auth_changes() {
    let (_, service) = service();
    let session = AuthSession::new(service);
    let mut changes = session.on_auth_change();

    assert_eq!(*changes.borrow_and_update(), None);

    let state = session
        .sign_up(signup("ada@school.test", "secret1", "N1"))
        .await
        .unwrap();

    changes.changed().await.unwrap();
    assert_eq!(changes.borrow_and_update().as_ref(), Some(&state));
    assert!(session.token().await.is_some());

    session.sign_out().await.unwrap();

    changes.changed().await.unwrap();
    assert_eq!(*changes.borrow_and_update(), None);
    assert_eq!(session.current(), None);
    assert!(session.token().await.is_none());
}
