//! # Identity
//!
//! Client for the hosted email/password identity service.
//!
//! - `POST /signup`, `POST /signin`: `{ email, password }` to `{ id, email, token }`
//! - `POST /signout`, `GET /session`: bearer token
//! - Failures answer with `{ code }`, e.g. `weak-password`
use async_trait::async_trait;
use ledger::{
    AuthError,
    ports::{Identity, IdentityProvider, Session},
};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct SessionPayload {
    id: String,
    email: String,
    token: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    code: String,
}

pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
}

impl HttpIdentityProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn credentials(&self, path: &str, email: &str, password: &str) -> Result<Session, AuthError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(&Credentials { email, password })
            .send()
            .await
            .map_err(provider_error)?;

        let payload: SessionPayload = checked(response).await?.json().await.map_err(provider_error)?;

        Ok(Session {
            identity: Identity {
                id: payload.id,
                email: payload.email,
            },
            token: payload.token,
        })
    }
}

fn provider_error(e: reqwest::Error) -> AuthError {
    warn!("Identity provider unreachable: {e}");
    AuthError::Provider(e.to_string())
}

/// Turns an error response into the provider's error code.
async fn checked(response: Response) -> Result<Response, AuthError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    match response.json::<ErrorPayload>().await {
        Ok(payload) => Err(AuthError::from_code(&payload.code)),
        Err(_) if status == StatusCode::UNAUTHORIZED => Err(AuthError::InvalidCredentials),
        Err(_) => Err(AuthError::Provider(status.to_string())),
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.credentials("signup", email, password).await
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.credentials("signin", email, password).await
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let response = self
            .client
            .post(self.endpoint("signout"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(provider_error)?;

        checked(response).await.map(|_| ())
    }

    async fn resolve(&self, token: &str) -> Result<Option<Identity>, AuthError> {
        let response = self
            .client
            .get(self.endpoint("session"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(provider_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let identity = checked(response)
            .await?
            .json::<Identity>()
            .await
            .map_err(provider_error)?;

        Ok(Some(identity))
    }
}
