use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::VoterIdentity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub allow_multiple_selections: bool,
    pub show_results_before_voting: bool,
    pub allow_vote_changes: bool,
}

/// A poll as stored. Immutable after creation except for deletion by its
/// creator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub settings: PollSettings,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Poll {
    /// A poll with no end timestamp never closes.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        match self.ends_at {
            None => true,
            Some(ends_at) => ends_at > now,
        }
    }
}

/// One voter's recorded selections for one poll. At most one row exists per
/// (poll, voter key) pair; the store's uniqueness constraint enforces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub voter: VoterIdentity,
    pub selections: Vec<usize>,
    pub created_at: DateTime<Utc>,
}

/// One option's derived standing within a tally. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TallyEntry {
    pub option_index: usize,
    pub option_text: String,
    pub count: u64,
    pub percentage: f64,
}

/// The complete derived per-option counts and percentages for a poll at a
/// point in time. For single-selection polls the counts sum to
/// `total_ballots`; for multi-selection polls they may exceed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TallySet {
    pub entries: Vec<TallyEntry>,
    pub total_ballots: u64,
}

/// An incremental change to a poll's ballot set, as delivered by the store's
/// change-notification channel.
#[derive(Debug, Clone)]
pub enum BallotChange {
    Insert(Ballot),
    Update { old: Ballot, new: Ballot },
    Delete(Ballot),
}

impl BallotChange {
    pub fn poll_id(&self) -> Uuid {
        match self {
            BallotChange::Insert(b) => b.poll_id,
            BallotChange::Update { new, .. } => new.poll_id,
            BallotChange::Delete(b) => b.poll_id,
        }
    }
}

/// Change to the poll index itself, for list-level subscribers.
#[derive(Debug, Clone)]
pub enum PollChange {
    Created(Poll),
    Deleted(Uuid),
}
