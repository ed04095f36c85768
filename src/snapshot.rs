// src/snapshot.rs
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::{AppError, AppResult};
use crate::models::{OptionCount, PollAggregate};
use crate::store::VoteStore;

/// Distinct-voter count, or `Unlimited` when the poll does not track voters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterCount {
    Counted(i64),
    Unlimited,
}

impl Serialize for VoterCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            VoterCount::Counted(n) => serializer.serialize_i64(*n),
            VoterCount::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionTally {
    pub id: i64,
    pub value: String,
    pub votes: i64,
}

/// Point-in-time aggregated view of a poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub enforce_unique: bool,
    pub created: DateTime<Utc>,
    pub modified: Option<DateTime<Utc>>,
    pub options: Vec<OptionTally>,
    pub total_votes: i64,
    pub voters: VoterCount,
    pub latest_vote: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn from_aggregate(aggregate: PollAggregate) -> Self {
        let PollAggregate {
            poll,
            options,
            voters,
            latest_vote,
        } = aggregate;

        let options: Vec<OptionTally> = options
            .into_iter()
            .map(|OptionCount { id, value, votes }| OptionTally { id, value, votes })
            .collect();
        let total_votes = options.iter().map(|o| o.votes).sum();

        let voters = if poll.enforce_unique {
            let distinct: HashSet<_> = voters.iter().filter(|v| !v.is_empty()).collect();
            VoterCount::Counted(distinct.len() as i64)
        } else {
            VoterCount::Unlimited
        };

        Self {
            id: poll.id,
            name: poll.name,
            description: poll.description,
            enforce_unique: poll.enforce_unique,
            created: poll.created,
            modified: poll.modified,
            options,
            total_votes,
            voters,
            latest_vote,
        }
    }

    pub fn votes_for(&self, value: &str) -> Option<i64> {
        self.options.iter().find(|o| o.value == value).map(|o| o.votes)
    }
}

/// Reads the poll from the store in one consistent pass and aggregates it.
pub async fn build(store: &dyn VoteStore, poll_id: i64) -> AppResult<Snapshot> {
    let aggregate = store
        .load_aggregate(poll_id)
        .await?
        .ok_or_else(|| AppError::poll_not_found(poll_id))?;

    Ok(Snapshot::from_aggregate(aggregate))
}
