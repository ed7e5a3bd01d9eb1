//! # Poll Authoring
//!
//! Validation and blob paths for admin-created polls and voter payment proofs.
//!
//! ## Paths
//! - Payment proofs: `payments/<voter>_<poll>_<millis>_<attempt>`
//! - Candidate images: `polls/<poll>/<candidate>/<filename>`
use std::sync::LazyLock;

use regex::Regex;

use crate::error::WorkflowError;

pub const MIN_CANDIDATES: usize = 2;

static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_]+").expect("separators"));
static UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9.\- ]").expect("unsafe characters"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" +").expect("spaces"));

/// An uploaded file as received from the client.
#[derive(Clone, Debug)]
pub struct ImageUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !self.content_type.starts_with("image/") {
            return Err(WorkflowError::InvalidImage(format!(
                "{} has type {}",
                self.display_name(),
                self.content_type
            )));
        }
        if self.bytes.is_empty() {
            return Err(WorkflowError::InvalidImage(format!(
                "{} is empty",
                self.display_name()
            )));
        }

        Ok(())
    }

    fn display_name(&self) -> &str {
        if self.filename.is_empty() {
            "upload"
        } else {
            &self.filename
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CandidateDraft {
    pub name: String,
    pub image: Option<ImageUpload>,
}

#[derive(Clone, Debug, Default)]
pub struct PollDraft {
    pub title: String,
    pub candidates: Vec<CandidateDraft>,
}

/// A draft that passed validation: trimmed title and only complete candidate rows.
#[derive(Debug)]
pub struct ValidDraft {
    pub title: String,
    pub candidates: Vec<(String, ImageUpload)>,
}

impl PollDraft {
    /// Rows without a name or an image are dropped, like empty rows left in the form.
    pub fn validate(self) -> Result<ValidDraft, WorkflowError> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(WorkflowError::EmptyTitle);
        }

        let candidates: Vec<(String, ImageUpload)> = self
            .candidates
            .into_iter()
            .filter_map(|draft| {
                let name = draft.name.trim().to_string();
                match draft.image {
                    Some(image) if !name.is_empty() => Some((name, image)),
                    _ => None,
                }
            })
            .collect();

        if candidates.len() < MIN_CANDIDATES {
            return Err(WorkflowError::NotEnoughCandidates {
                found: candidates.len(),
            });
        }

        for (_, image) in &candidates {
            image.validate()?;
        }

        Ok(ValidDraft { title, candidates })
    }
}

/// `attempt` tells apart uploads made in the same millisecond.
pub fn proof_path(voter_id: &str, poll_id: &str, millis: i64, attempt: u64) -> String {
    format!("payments/{voter_id}_{poll_id}_{millis}_{attempt}")
}

pub fn candidate_id(position: usize, millis: i64) -> String {
    format!("candidate_{}_{millis}", position + 1)
}

pub fn candidate_image_path(poll_id: &str, candidate_id: &str, filename: &str) -> String {
    // `.` and `..` would be collapsed as dot segments once the path becomes a URL
    let filename = match sanitize_filename(filename) {
        name if name.chars().all(|c| c == '.') => "image".to_string(),
        name => name,
    };

    format!("polls/{poll_id}/{candidate_id}/{filename}")
}

/// Keeps blob paths to letters, digits, dots and dashes.
pub fn sanitize_filename(input: &str) -> String {
    let spaced = SEPARATORS.replace_all(input, " ");
    let cleaned = UNSAFE.replace_all(&spaced, "");
    let collapsed = SPACES.replace_all(cleaned.trim(), " ");

    collapsed.replace(' ', "-").to_lowercase()
}
