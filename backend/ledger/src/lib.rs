//! # Ledger
//!
//! Vote payment approval for dues-backed polls.
//!
//! A voter casts for a candidate, uploads a payment screenshot, and an admin approves or
//! rejects it. Only approved ballots count toward a poll's tally.
//!
//! ## Modules
//! - [`machine`]: pure ballot transitions
//! - [`workflow`]: the [`Ledger`] applying transitions against the injected stores
//! - [`tally`]: vote shares and recounting from ballot states
//! - [`authoring`]: poll drafts, uploads and blob paths
//! - [`auth`]: sign up, sign in and admin capability
//! - [`ports`]: identity, document and blob collaborators
//! - [`memory`]: in-memory collaborators
pub mod auth;
pub mod authoring;
pub mod error;
pub mod machine;
pub mod memory;
pub mod model;
pub mod ports;
pub mod tally;
pub mod workflow;

pub use error::{AuthError, ErrorKind, StoreError, WorkflowError};
pub use workflow::Ledger;
