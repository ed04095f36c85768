// models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub const MAX_NAME_LEN: usize = 140;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_OPTION_LEN: usize = 140;
pub const MIN_OPTIONS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub enforce_unique: bool,
    pub owner_id: Option<i64>,
    pub created: DateTime<Utc>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollOption {
    pub id: i64,
    pub poll_id: i64,
    pub value: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub id: i64,
    pub poll_id: i64,
    pub poll_option_id: i64,
    pub voter_user_id: Option<i64>,
    pub voter_address_hash: Option<String>,
    pub created: DateTime<Utc>,
}

/// The identity fields persisted alongside a vote. Both are empty when the poll
/// does not enforce uniqueness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct RecordedVoter {
    pub user_id: Option<i64>,
    pub address_hash: Option<String>,
}

impl RecordedVoter {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.address_hash.is_none()
    }
}

/// Option row joined with its vote count.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OptionCount {
    pub id: i64,
    pub value: String,
    pub votes: i64,
}

/// Everything the snapshot builder needs, read at one consistent point in time.
#[derive(Debug, Clone)]
pub struct PollAggregate {
    pub poll: Poll,
    pub options: Vec<OptionCount>,
    /// Identity pairs of recorded votes; only loaded when the poll enforces uniqueness.
    pub voters: Vec<RecordedVoter>,
    pub latest_vote: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<String>,
    #[serde(default)]
    pub enforce_unique: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePollRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub option: String,
}

/// Validated input for creating a poll.
#[derive(Debug, Clone)]
pub struct NewPoll {
    pub name: String,
    pub description: String,
    pub options: Vec<String>,
    pub enforce_unique: bool,
    pub owner_id: Option<i64>,
}

/// Validated input for replacing a poll's text and option set.
#[derive(Debug, Clone)]
pub struct PollUpdate {
    pub name: String,
    pub description: String,
    pub options: Vec<String>,
}

impl CreatePollRequest {
    pub fn validate(self, owner_id: Option<i64>) -> AppResult<NewPoll> {
        validate_name(&self.name)?;
        let description = validate_description(self.description)?;
        validate_options(&self.options)?;

        Ok(NewPoll {
            name: self.name,
            description,
            options: self.options,
            enforce_unique: self.enforce_unique,
            owner_id,
        })
    }
}

impl UpdatePollRequest {
    pub fn validate(self) -> AppResult<PollUpdate> {
        validate_name(&self.name)?;
        let description = validate_description(self.description)?;
        validate_options(&self.options)?;

        Ok(PollUpdate {
            name: self.name,
            description,
            options: self.options,
        })
    }
}

fn validate_name(name: &str) -> AppResult<()> {
    if name.is_empty() || !name.is_ascii() || name.len() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "name must be 1-{MAX_NAME_LEN} ASCII characters"
        )));
    }
    Ok(())
}

fn validate_description(description: Option<String>) -> AppResult<String> {
    let description = description.unwrap_or_default();
    if !description.is_ascii() || description.len() > MAX_DESCRIPTION_LEN {
        return Err(AppError::Validation(format!(
            "description must be at most {MAX_DESCRIPTION_LEN} ASCII characters"
        )));
    }
    Ok(description)
}

fn validate_options(options: &[String]) -> AppResult<()> {
    if options.len() < MIN_OPTIONS {
        return Err(AppError::Validation(format!(
            "a poll needs at least {MIN_OPTIONS} options"
        )));
    }

    for (i, option) in options.iter().enumerate() {
        validate_option_value(option)?;
        if options[..i].contains(option) {
            return Err(AppError::Validation(format!(
                "option \"{option}\" is listed twice"
            )));
        }
    }

    Ok(())
}

/// Checks a single option value as submitted with a vote or a poll definition.
pub fn validate_option_value(value: &str) -> AppResult<()> {
    let len = value.chars().count();
    if len == 0 || len > MAX_OPTION_LEN {
        return Err(AppError::Validation(format!(
            "option must be 1-{MAX_OPTION_LEN} characters"
        )));
    }
    Ok(())
}
