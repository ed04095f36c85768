// services.rs
use tracing::info;

use crate::error::AppResult;
use crate::identity::VoterIdentity;
use crate::models::{validate_option_value, NewPoll, Poll, PollUpdate, Vote};
use crate::snapshot::{self, Snapshot};
use crate::state::AppState;

/// Admits and records a vote, then schedules a live update for the poll.
/// The broadcast runs in the background; the caller gets its answer as soon as
/// the vote is committed.
pub async fn submit_vote(
    state: &AppState,
    poll_id: i64,
    option: &str,
    identity: &VoterIdentity,
) -> AppResult<Vote> {
    validate_option_value(option)?;

    let vote = state.store.cast_vote(poll_id, option, identity).await?;
    info!(poll_id, vote_id = vote.id, option_id = vote.poll_option_id, "vote accepted");

    state.live.spawn_publish(poll_id);
    Ok(vote)
}

pub async fn create_poll(state: &AppState, poll: NewPoll) -> AppResult<Poll> {
    let created = state.store.create_poll(poll).await?;
    info!(poll_id = created.id, enforce_unique = created.enforce_unique, "poll created");
    Ok(created)
}

pub async fn update_poll(state: &AppState, poll_id: i64, update: PollUpdate) -> AppResult<()> {
    state.store.update_poll(poll_id, update).await?;
    info!(poll_id, "poll updated");

    state.live.spawn_publish(poll_id);
    Ok(())
}

pub async fn delete_poll(state: &AppState, poll_id: i64) -> AppResult<()> {
    state.store.delete_poll(poll_id).await?;
    let closed = state.live.close_poll(poll_id).await;
    info!(poll_id, closed_subscribers = closed, "poll deleted");
    Ok(())
}

pub async fn current_snapshot(state: &AppState, poll_id: i64) -> AppResult<Snapshot> {
    snapshot::build(state.store.as_ref(), poll_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::AppError;
    use crate::live::Notice;
    use crate::snapshot::VoterCount;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(Arc::new(MemoryStore::new()), Config::default())
    }

    async fn lunch(state: &AppState, enforce_unique: bool) -> i64 {
        create_poll(
            state,
            NewPoll {
                name: "Lunch?".into(),
                description: String::new(),
                options: vec!["Pizza".into(), "Salad".into()],
                enforce_unique,
                owner_id: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn anon(hash: &str) -> VoterIdentity {
        VoterIdentity {
            user_id: None,
            address_hash: hash.into(),
        }
    }

    async fn next_snapshot(sub: &mut crate::live::Subscription) -> Arc<Snapshot> {
        match sub.recv().await {
            Some(Notice::Snapshot(s)) => s,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lunch_scenario_end_to_end() {
        let state = state();
        let poll_id = lunch(&state, true).await;
        let mut sub = state.live.subscribe(poll_id).await.unwrap();
        assert_eq!(next_snapshot(&mut sub).await.total_votes, 0);

        submit_vote(&state, poll_id, "Pizza", &anon("H1")).await.unwrap();
        let s = next_snapshot(&mut sub).await;
        assert_eq!(s.votes_for("Pizza"), Some(1));
        assert_eq!(s.votes_for("Salad"), Some(0));
        assert_eq!(s.total_votes, 1);
        assert_eq!(s.voters, VoterCount::Counted(1));

        let retry = submit_vote(&state, poll_id, "Salad", &anon("H1")).await;
        assert!(matches!(retry, Err(AppError::DuplicateVote)));

        submit_vote(&state, poll_id, "Salad", &anon("H2")).await.unwrap();
        let s = next_snapshot(&mut sub).await;
        assert_eq!(s.votes_for("Pizza"), Some(1));
        assert_eq!(s.votes_for("Salad"), Some(1));
        assert_eq!(s.total_votes, 2);
        assert_eq!(s.voters, VoterCount::Counted(2));
        assert!(s.latest_vote.is_some());
    }

    #[tokio::test]
    async fn open_poll_accepts_repeat_voters() {
        let state = state();
        let poll_id = lunch(&state, false).await;

        for _ in 0..25 {
            submit_vote(&state, poll_id, "Salad", &anon("H1")).await.unwrap();
        }

        let s = current_snapshot(&state, poll_id).await.unwrap();
        assert_eq!(s.total_votes, 25);
        assert_eq!(s.voters, VoterCount::Unlimited);
    }

    #[tokio::test]
    async fn invalid_option_values_are_rejected_before_the_store() {
        let state = state();
        let poll_id = lunch(&state, false).await;

        assert!(matches!(
            submit_vote(&state, poll_id, "", &anon("H1")).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            submit_vote(&state, poll_id, "Tacos", &anon("H1")).await,
            Err(AppError::NotFound { .. })
        ));
        assert_eq!(current_snapshot(&state, poll_id).await.unwrap().total_votes, 0);
    }

    #[tokio::test]
    async fn update_pushes_and_delete_closes_subscribers() {
        let state = state();
        let poll_id = lunch(&state, false).await;
        let mut sub = state.live.subscribe(poll_id).await.unwrap();
        next_snapshot(&mut sub).await;

        update_poll(
            &state,
            poll_id,
            PollUpdate {
                name: "Dinner?".into(),
                description: String::new(),
                options: vec!["Soup".into(), "Salad".into()],
            },
        )
        .await
        .unwrap();
        let s = next_snapshot(&mut sub).await;
        assert_eq!(s.name, "Dinner?");
        assert_eq!(s.votes_for("Pizza"), None);

        delete_poll(&state, poll_id).await.unwrap();
        assert!(matches!(sub.recv().await, Some(Notice::Error(_))));
        assert!(sub.recv().await.is_none());
    }
}
