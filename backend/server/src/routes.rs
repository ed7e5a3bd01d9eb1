use std::{sync::Arc, time::Duration};

use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use ledger::{
    auth::{SignUp, SignedIn},
    model::{Ballot, Poll},
    tally::{RecountReport, TallyRow},
    workflow::{PendingReview, PollView, Review},
};
use serde::Deserialize;
use tokio::time::timeout;

use crate::{
    error::AppError,
    state::State as AppState,
    utils::{bearer_token, caller, image_from_body, read_poll_draft},
};

type Shared = State<Arc<AppState>>;

#[derive(Deserialize)]
pub struct SignUpPayload {
    email: String,
    password: String,
    display_id: String,
}

#[derive(Deserialize)]
pub struct SignInPayload {
    email: String,
    password: String,
}

#[derive(Deserialize)]
pub struct CastPayload {
    candidate_id: String,
}

#[derive(Deserialize)]
pub struct PendingQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
pub struct ReconcileQuery {
    #[serde(default)]
    repair: bool,
}

pub async fn signup_handler(
    State(state): Shared,
    Json(payload): Json<SignUpPayload>,
) -> Result<(StatusCode, Json<SignedIn>), AppError> {
    let signed_in = state
        .auth
        .sign_up(SignUp {
            email: payload.email,
            password: payload.password,
            display_id: payload.display_id,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(signed_in)))
}

pub async fn signin_handler(
    State(state): Shared,
    Json(payload): Json<SignInPayload>,
) -> Result<Json<SignedIn>, AppError> {
    Ok(Json(
        state
            .auth
            .sign_in(&payload.email, &payload.password)
            .await?,
    ))
}

pub async fn signout_handler(
    State(state): Shared,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.auth.sign_out(bearer_token(&headers)?).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn polls_handler(
    State(state): Shared,
    headers: HeaderMap,
) -> Result<Json<Vec<PollView>>, AppError> {
    let caller = caller(&state, &headers).await?;

    Ok(Json(state.ledger.dashboard(&caller.identity.id).await?))
}

pub async fn cast_handler(
    State(state): Shared,
    Path(poll_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CastPayload>,
) -> Result<Json<Ballot>, AppError> {
    let caller = caller(&state, &headers).await?;

    Ok(Json(
        state
            .ledger
            .cast(&caller.identity.id, &poll_id, &payload.candidate_id)
            .await?,
    ))
}

pub async fn proof_handler(
    State(state): Shared,
    Path(poll_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Ballot>, AppError> {
    let caller = caller(&state, &headers).await?;
    let image = image_from_body(&headers, body);

    Ok(Json(
        state
            .ledger
            .submit_proof(&caller.identity.id, &poll_id, image)
            .await?,
    ))
}

pub async fn tally_handler(
    State(state): Shared,
    Path(poll_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<TallyRow>>, AppError> {
    caller(&state, &headers).await?;

    Ok(Json(state.ledger.tally(&poll_id).await?))
}

pub async fn admin_polls_handler(
    State(state): Shared,
    headers: HeaderMap,
) -> Result<Json<Vec<Poll>>, AppError> {
    let caller = caller(&state, &headers).await?;

    Ok(Json(state.ledger.all_polls(&caller.identity.id).await?))
}

pub async fn create_poll_handler(
    State(state): Shared,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Poll>), AppError> {
    let caller = caller(&state, &headers).await?;
    state.ledger.require_admin(&caller.identity.id).await?;

    let draft = read_poll_draft(multipart).await?;
    let poll = state.ledger.create_poll(&caller.identity.id, draft).await?;

    Ok((StatusCode::CREATED, Json(poll)))
}

pub async fn close_poll_handler(
    State(state): Shared,
    Path(poll_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Poll>, AppError> {
    let caller = caller(&state, &headers).await?;

    Ok(Json(
        state
            .ledger
            .close_poll(&caller.identity.id, &poll_id)
            .await?,
    ))
}

/// With `?wait=true` the response is held until the next ballot or poll change (or the
/// long-poll timeout), so the admin view refreshes without polling in a tight loop.
pub async fn pending_handler(
    State(state): Shared,
    Query(query): Query<PendingQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<PendingReview>>, AppError> {
    let caller = caller(&state, &headers).await?;
    state.ledger.require_admin(&caller.identity.id).await?;

    if query.wait {
        let mut subscription = state.ledger.subscribe();
        let wait = Duration::from_secs(state.config.long_poll_secs);
        let _ = timeout(wait, subscription.next()).await;
    }

    Ok(Json(state.ledger.pending_queue(&caller.identity.id).await?))
}

pub async fn approve_handler(
    State(state): Shared,
    Path((voter_id, poll_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Review>, AppError> {
    let caller = caller(&state, &headers).await?;

    Ok(Json(
        state
            .ledger
            .approve(&caller.identity.id, &voter_id, &poll_id)
            .await?,
    ))
}

pub async fn reject_handler(
    State(state): Shared,
    Path((voter_id, poll_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Review>, AppError> {
    let caller = caller(&state, &headers).await?;

    Ok(Json(
        state
            .ledger
            .reject(&caller.identity.id, &voter_id, &poll_id)
            .await?,
    ))
}

pub async fn reconcile_handler(
    State(state): Shared,
    Path(poll_id): Path<String>,
    Query(query): Query<ReconcileQuery>,
    headers: HeaderMap,
) -> Result<Json<RecountReport>, AppError> {
    let caller = caller(&state, &headers).await?;
    state.ledger.require_admin(&caller.identity.id).await?;

    Ok(Json(state.ledger.reconcile(&poll_id, query.repair).await?))
}
