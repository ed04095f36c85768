// src/db.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Pool, Postgres};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::identity::VoterIdentity;
use crate::models::{
    NewPoll, OptionCount, Poll, PollAggregate, PollUpdate, RecordedVoter, Vote,
};
use crate::poll;
use crate::store::VoteStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS polls (
    id bigserial PRIMARY KEY,
    name varchar(140) NOT NULL,
    description varchar(500) NOT NULL,
    enforce_unique boolean NOT NULL DEFAULT FALSE,
    owner_id bigint,
    created timestamptz NOT NULL,
    modified timestamptz
);

CREATE TABLE IF NOT EXISTS poll_options (
    id bigserial PRIMARY KEY,
    poll_id bigint NOT NULL REFERENCES polls (id) ON DELETE CASCADE,
    value varchar(140) NOT NULL,
    created timestamptz NOT NULL,
    UNIQUE (poll_id, value)
);

CREATE TABLE IF NOT EXISTS poll_votes (
    id bigserial PRIMARY KEY,
    poll_id bigint NOT NULL REFERENCES polls (id) ON DELETE CASCADE,
    poll_option_id bigint NOT NULL REFERENCES poll_options (id) ON DELETE CASCADE,
    voter_user_id bigint,
    voter_address_hash text,
    created timestamptz NOT NULL
);

CREATE INDEX IF NOT EXISTS poll_votes_poll_id_idx ON poll_votes (poll_id);
"#;

const POLL_COLUMNS: &str = "id, name, description, enforce_unique, owner_id, created, modified";

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<Pool<Postgres>, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Creates the tables if they do not exist yet.
pub async fn bootstrap(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema ready");
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VoteStore for PgStore {
    async fn create_poll(&self, new: NewPoll) -> AppResult<Poll> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Poll>(&format!(
            "INSERT INTO polls (name, description, enforce_unique, owner_id, created, modified)
             VALUES ($1, $2, $3, $4, NOW(), NOW())
             RETURNING {POLL_COLUMNS}"
        ))
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.enforce_unique)
        .bind(new.owner_id)
        .fetch_one(&mut *tx)
        .await?;

        for option in &new.options {
            sqlx::query("INSERT INTO poll_options (poll_id, value, created) VALUES ($1, $2, NOW())")
                .bind(created.id)
                .bind(option)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn update_poll(&self, poll_id: i64, update: PollUpdate) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE polls SET name = $1, description = $2, modified = NOW() WHERE id = $3",
        )
        .bind(&update.name)
        .bind(&update.description)
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::poll_not_found(poll_id));
        }

        // Votes on removed options go with them through the cascade.
        sqlx::query("DELETE FROM poll_options WHERE poll_id = $1 AND NOT (value = ANY($2))")
            .bind(poll_id)
            .bind(&update.options)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO poll_options (poll_id, value, created)
             SELECT $1, v, NOW() FROM UNNEST($2::text[]) AS v
             ON CONFLICT (poll_id, value) DO NOTHING",
        )
        .bind(poll_id)
        .bind(&update.options)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_poll(&self, poll_id: i64) -> AppResult<()> {
        let deleted = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(AppError::poll_not_found(poll_id));
        }
        Ok(())
    }

    async fn cast_vote(
        &self,
        poll_id: i64,
        option: &str,
        identity: &VoterIdentity,
    ) -> AppResult<Vote> {
        let mut tx = self.pool.begin().await?;

        // The row lock serializes admission for this poll until commit.
        let target = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1 FOR UPDATE"
        ))
        .bind(poll_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::poll_not_found(poll_id))?;

        let option_id: i64 =
            sqlx::query_scalar("SELECT id FROM poll_options WHERE poll_id = $1 AND value = $2")
                .bind(poll_id)
                .bind(option)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::option_not_found(option))?;

        let prior = if target.enforce_unique {
            sqlx::query_as::<_, RecordedVoter>(
                "SELECT voter_user_id AS user_id, voter_address_hash AS address_hash
                 FROM poll_votes
                 WHERE poll_id = $1 AND (voter_user_id = $2 OR voter_address_hash = $3)",
            )
            .bind(poll_id)
            .bind(identity.user_id)
            .bind(&identity.address_hash)
            .fetch_all(&mut *tx)
            .await?
        } else {
            Vec::new()
        };

        // Dropping `tx` on rejection rolls the transaction back.
        let recorded = poll::admit(&target, identity, &prior)?;

        let vote = sqlx::query_as::<_, Vote>(
            "INSERT INTO poll_votes (poll_id, poll_option_id, voter_user_id, voter_address_hash, created)
             VALUES ($1, $2, $3, $4, NOW())
             RETURNING id, poll_id, poll_option_id, voter_user_id, voter_address_hash, created",
        )
        .bind(poll_id)
        .bind(option_id)
        .bind(recorded.user_id)
        .bind(recorded.address_hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(vote)
    }

    async fn load_aggregate(&self, poll_id: i64) -> AppResult<Option<PollAggregate>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let Some(poll) = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(poll_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let options = sqlx::query_as::<_, OptionCount>(
            "SELECT poll_options.id, poll_options.value, COUNT(poll_votes.id) AS votes
             FROM poll_options
             LEFT JOIN poll_votes ON poll_options.id = poll_votes.poll_option_id
             WHERE poll_options.poll_id = $1
             GROUP BY poll_options.id
             ORDER BY poll_options.id",
        )
        .bind(poll_id)
        .fetch_all(&mut *tx)
        .await?;

        let latest_vote: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT created FROM poll_votes WHERE poll_id = $1 ORDER BY created DESC LIMIT 1",
        )
        .bind(poll_id)
        .fetch_optional(&mut *tx)
        .await?;

        let voters = if poll.enforce_unique {
            sqlx::query_as::<_, RecordedVoter>(
                "SELECT DISTINCT voter_user_id AS user_id, voter_address_hash AS address_hash
                 FROM poll_votes
                 WHERE poll_id = $1
                   AND (voter_user_id IS NOT NULL OR voter_address_hash IS NOT NULL)",
            )
            .bind(poll_id)
            .fetch_all(&mut *tx)
            .await?
        } else {
            Vec::new()
        };

        tx.commit().await?;

        Ok(Some(PollAggregate {
            poll,
            options,
            voters,
            latest_vote,
        }))
    }
}
