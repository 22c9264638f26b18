use thiserror::Error;

/// Failures reported by a `PollStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("requester is not the owner of this row")]
    Forbidden,

    #[error("unique constraint violated")]
    UniqueViolation,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed row: {0}")]
    Malformed(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Outcomes of a vote submission that are surfaced to the caller.
///
/// `PollClosed`, `AlreadyVoted`, and `InvalidSelection` are user-visible and
/// non-retryable. Subscription drops and aggregation failures never appear
/// here; they are recovered internally by the sync controller and the tally
/// engine.
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("voting is closed for this poll")]
    PollClosed,

    #[error("this identity has already voted on this poll")]
    AlreadyVoted,

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CreatePollError {
    #[error("invalid poll: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
