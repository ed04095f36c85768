// src/poll.rs
//! Vote admission.
//!
//! Stores call [`admit`] from inside the transaction that inserts the vote, so
//! the duplicate check and the insert are serialized per poll.

use crate::error::{AppError, AppResult};
use crate::identity::VoterIdentity;
use crate::models::{Poll, RecordedVoter};

/// Decides whether `identity` may vote on `poll` given the identities already
/// recorded for it. Returns the identity fields to persist with the new vote.
pub fn admit(
    poll: &Poll,
    identity: &VoterIdentity,
    prior: &[RecordedVoter],
) -> AppResult<RecordedVoter> {
    if !poll.enforce_unique {
        return Ok(RecordedVoter::default());
    }

    if prior.iter().any(|voter| identity.matches(voter)) {
        return Err(AppError::DuplicateVote);
    }

    Ok(identity.to_recorded())
}
