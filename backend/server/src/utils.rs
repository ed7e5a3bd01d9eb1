use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::Multipart,
    http::{
        HeaderMap,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
};
use ledger::{
    auth::AuthState,
    authoring::{CandidateDraft, ImageUpload, PollDraft},
};

use crate::{
    error::AppError::{self, MalformedPayload},
    state::State,
};

pub const FILENAME_HEADER: &str = "x-filename";

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AppError::MissingToken)
}

pub async fn caller(state: &Arc<State>, headers: &HeaderMap) -> Result<AuthState, AppError> {
    let token = bearer_token(headers)?;
    Ok(state.auth.authenticate(token).await?)
}

/// A proof upload is the raw image body, typed by its `Content-Type`.
pub fn image_from_body(headers: &HeaderMap, body: Bytes) -> ImageUpload {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    ImageUpload {
        filename: header(FILENAME_HEADER),
        content_type: header(CONTENT_TYPE.as_str()),
        bytes: body.to_vec(),
    }
}

/// Splits `name_3` / `image_3` into the field kind and candidate position.
fn candidate_field(name: &str) -> Option<(&str, usize)> {
    let (kind, index) = name.rsplit_once('_')?;
    let index = index.parse().ok()?;

    match kind {
        "name" | "image" => Some((kind, index)),
        _ => None,
    }
}

/// Reads the poll form: a `title` field plus `name_<n>` and `image_<n>` per candidate.
pub async fn read_poll_draft(mut multipart: Multipart) -> Result<PollDraft, AppError> {
    let mut title = String::new();
    let mut candidates: BTreeMap<usize, CandidateDraft> = BTreeMap::new();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name == "title" {
            title = field.text().await?;
            continue;
        }

        let Some((kind, index)) = candidate_field(&name) else {
            return Err(MalformedPayload(format!("unexpected field {name}")));
        };

        let draft = candidates.entry(index).or_default();
        if kind == "name" {
            draft.name = field.text().await?;
        } else {
            let filename = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().unwrap_or_default().to_string();
            let bytes = field.bytes().await?;

            draft.image = Some(ImageUpload {
                filename,
                content_type,
                bytes: bytes.to_vec(),
            });
        }
    }

    Ok(PollDraft {
        title,
        candidates: candidates.into_values().collect(),
    })
}
