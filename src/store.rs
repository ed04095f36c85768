// src/store.rs
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};
use crate::identity::VoterIdentity;
use crate::models::{
    NewPoll, OptionCount, Poll, PollAggregate, PollOption, PollUpdate, RecordedVoter, Vote,
};
use crate::poll;

/// Durable home of polls, options and votes.
///
/// `cast_vote` must run the admission check and the insert atomically,
/// serialized per poll. `load_aggregate` must read one consistent state.
#[async_trait]
pub trait VoteStore: Send + Sync {
    async fn create_poll(&self, poll: NewPoll) -> AppResult<Poll>;

    async fn update_poll(&self, poll_id: i64, update: PollUpdate) -> AppResult<()>;

    async fn delete_poll(&self, poll_id: i64) -> AppResult<()>;

    async fn cast_vote(
        &self,
        poll_id: i64,
        option: &str,
        identity: &VoterIdentity,
    ) -> AppResult<Vote>;

    async fn load_aggregate(&self, poll_id: i64) -> AppResult<Option<PollAggregate>>;
}

#[derive(Default)]
struct Tables {
    polls: BTreeMap<i64, Poll>,
    options: BTreeMap<i64, PollOption>,
    votes: BTreeMap<i64, Vote>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_option(&mut self, poll_id: i64, value: String) {
        let id = self.next_id();
        self.options.insert(
            id,
            PollOption {
                id,
                poll_id,
                value,
                created: Utc::now(),
            },
        );
    }
}

/// In-process store. One lock covers every operation, which serializes vote
/// admission across all polls.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VoteStore for MemoryStore {
    async fn create_poll(&self, new: NewPoll) -> AppResult<Poll> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let id = tables.next_id();

        let poll = Poll {
            id,
            name: new.name,
            description: new.description,
            enforce_unique: new.enforce_unique,
            owner_id: new.owner_id,
            created: now,
            modified: Some(now),
        };
        tables.polls.insert(id, poll.clone());

        for value in new.options {
            tables.insert_option(id, value);
        }

        Ok(poll)
    }

    async fn update_poll(&self, poll_id: i64, update: PollUpdate) -> AppResult<()> {
        let mut tables = self.tables.lock().await;

        let poll = tables
            .polls
            .get_mut(&poll_id)
            .ok_or_else(|| AppError::poll_not_found(poll_id))?;
        poll.name = update.name;
        poll.description = update.description;
        poll.modified = Some(Utc::now());

        let dropped: Vec<i64> = tables
            .options
            .values()
            .filter(|o| o.poll_id == poll_id && !update.options.contains(&o.value))
            .map(|o| o.id)
            .collect();
        for id in &dropped {
            tables.options.remove(id);
        }
        tables.votes.retain(|_, v| !dropped.contains(&v.poll_option_id));

        let remaining: Vec<String> = tables
            .options
            .values()
            .filter(|o| o.poll_id == poll_id)
            .map(|o| o.value.clone())
            .collect();
        for value in update.options {
            if !remaining.contains(&value) {
                tables.insert_option(poll_id, value);
            }
        }

        Ok(())
    }

    async fn delete_poll(&self, poll_id: i64) -> AppResult<()> {
        let mut tables = self.tables.lock().await;

        if tables.polls.remove(&poll_id).is_none() {
            return Err(AppError::poll_not_found(poll_id));
        }
        tables.options.retain(|_, o| o.poll_id != poll_id);
        tables.votes.retain(|_, v| v.poll_id != poll_id);

        Ok(())
    }

    async fn cast_vote(
        &self,
        poll_id: i64,
        option: &str,
        identity: &VoterIdentity,
    ) -> AppResult<Vote> {
        let mut tables = self.tables.lock().await;

        let target = tables
            .polls
            .get(&poll_id)
            .ok_or_else(|| AppError::poll_not_found(poll_id))?;
        let option_id = tables
            .options
            .values()
            .find(|o| o.poll_id == poll_id && o.value == option)
            .map(|o| o.id)
            .ok_or_else(|| AppError::option_not_found(option))?;

        let prior: Vec<_> = if target.enforce_unique {
            tables
                .votes
                .values()
                .filter(|v| v.poll_id == poll_id)
                .map(|v| RecordedVoter {
                    user_id: v.voter_user_id,
                    address_hash: v.voter_address_hash.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };
        let recorded = poll::admit(target, identity, &prior)?;

        let id = tables.next_id();
        let vote = Vote {
            id,
            poll_id,
            poll_option_id: option_id,
            voter_user_id: recorded.user_id,
            voter_address_hash: recorded.address_hash,
            created: Utc::now(),
        };
        tables.votes.insert(id, vote.clone());

        Ok(vote)
    }

    async fn load_aggregate(&self, poll_id: i64) -> AppResult<Option<PollAggregate>> {
        let tables = self.tables.lock().await;

        let Some(poll) = tables.polls.get(&poll_id).cloned() else {
            return Ok(None);
        };

        let options = tables
            .options
            .values()
            .filter(|o| o.poll_id == poll_id)
            .map(|o| OptionCount {
                id: o.id,
                value: o.value.clone(),
                votes: tables
                    .votes
                    .values()
                    .filter(|v| v.poll_option_id == o.id)
                    .count() as i64,
            })
            .collect();

        let votes = tables.votes.values().filter(|v| v.poll_id == poll_id);
        let latest_vote = votes.clone().map(|v| v.created).max();
        let voters = if poll.enforce_unique {
            votes
                .map(|v| RecordedVoter {
                    user_id: v.voter_user_id,
                    address_hash: v.voter_address_hash.clone(),
                })
                .filter(|v| !v.is_empty())
                .collect()
        } else {
            Vec::new()
        };

        Ok(Some(PollAggregate {
            poll,
            options,
            voters,
            latest_vote,
        }))
    }
}
