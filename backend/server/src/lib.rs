//! Backend for a dues-backed student poll.
//!
//! Students sign up with their registration number, pick a candidate in an active poll and
//! upload a screenshot of their dues payment. An admin reviews the screenshot and approves
//! or rejects the ballot, only approved ballots count.
//!
//!
//!
//! # General Infrastructure
//! - Axum server behind the reverse proxy, JSON everywhere except uploads
//! - Redis holds voters, polls and tallies, see [`database`]
//! - Screenshots and candidate images live in an HTTP bucket, see [`storage`]
//! - Accounts live with the hosted identity service, see [`identity`]
//! - `STORE_BACKEND=memory` swaps all three for in-process versions
//!
//!
//!
//! # Routes
//!
//! Every route except sign up and sign in expects `Authorization: Bearer <token>`.
//!
//! | Method | Path | Who |
//! |---|---|---|
//! | POST | `/auth/signup`, `/auth/signin`, `/auth/signout` | anyone |
//! | GET | `/polls` | voter |
//! | POST | `/polls/{poll}/ballot` | voter |
//! | POST | `/polls/{poll}/proof` | voter, raw image body |
//! | GET | `/polls/{poll}/tally` | voter |
//! | GET, POST | `/admin/polls` | admin, multipart on POST |
//! | POST | `/admin/polls/{poll}/close` | admin |
//! | GET | `/admin/polls/{poll}/reconcile` | admin |
//! | GET | `/admin/pending` | admin |
//! | POST | `/admin/pending/{voter}/{poll}/approve`, `.../reject` | admin |
//!
//!
//!
//! # Notes
//!
//! ## Approval
//! Approving writes the ballot first, then bumps the tally. A crash in between leaves an
//! approved ballot that is not counted yet. Run `reconcile` (or the admin endpoint) to
//! recompute tallies from ballot states.
//!
//! ## Admins
//! Admins are the members of the Redis `admins` set. Grant with `reconcile grant-admin <id>`.
//!
//!
//!
//! # Setup
//!
//! Run without any external service.
//! ```sh
//! STORE_BACKEND=memory RUST_LOG=info cargo run -p duespoll
//! ```
//!
//! Check tallies against ballots.
//! ```sh
//! cargo run -p reconcile -- check
//! ```
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod config;
pub mod database;
pub mod error;
pub mod identity;
pub mod routes;
pub mod state;
pub mod storage;
pub mod utils;

use config::Config;
use routes::{
    admin_polls_handler, approve_handler, cast_handler, close_poll_handler, create_poll_handler,
    pending_handler, polls_handler, proof_handler, reconcile_handler, reject_handler,
    signin_handler, signout_handler, signup_handler, tally_handler,
};
use state::State;

pub fn app(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/auth/signup", post(signup_handler))
        .route("/auth/signin", post(signin_handler))
        .route("/auth/signout", post(signout_handler))
        .route("/polls", get(polls_handler))
        .route("/polls/{poll_id}/ballot", post(cast_handler))
        .route("/polls/{poll_id}/proof", post(proof_handler))
        .route("/polls/{poll_id}/tally", get(tally_handler))
        .route("/admin/polls", get(admin_polls_handler).post(create_poll_handler))
        .route("/admin/polls/{poll_id}/close", post(close_poll_handler))
        .route("/admin/polls/{poll_id}/reconcile", get(reconcile_handler))
        .route("/admin/pending", get(pending_handler))
        .route(
            "/admin/pending/{voter_id}/{poll_id}/approve",
            post(approve_handler),
        )
        .route(
            "/admin/pending/{voter_id}/{poll_id}/reject",
            post(reject_handler),
        )
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    if let Err(e) = run().await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }

    info!("Server shut down");
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = State::new(config).await?;

    info!("Starting server...");

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => error!("Failed to install Ctrl+C handler: {e}"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
