use std::sync::Arc;

use chrono::Utc;
use evlog::meta;

use crate::db::schema::{Ballot, Poll};
use crate::db::store::PollStore;
use crate::error::{StoreError, VoteError};
use crate::identity::{MarkerStore, VoterIdentity};
use crate::runtime::get_logger;

/// Records one ballot per eligible identity.
///
/// The recorder only writes; it never pushes tallies to other viewers. A
/// successful submission fires the store's change notification, which every
/// live sync controller subscribed to the poll observes independently.
pub struct BallotRecorder<S> {
    store: Arc<S>,
    markers: Arc<dyn MarkerStore>,
}

impl<S: PollStore> BallotRecorder<S> {
    pub fn new(store: Arc<S>, markers: Arc<dyn MarkerStore>) -> Self {
        Self { store, markers }
    }

    /// Submits `selections` for `voter` on `poll`.
    ///
    /// Selection validation happens before any store call. The store's
    /// uniqueness constraint is the arbiter of duplicates: its rejection
    /// becomes `AlreadyVoted`, or an update-in-place of the existing row
    /// when the poll allows vote changes.
    pub async fn submit(
        &self,
        poll: &Poll,
        voter: &VoterIdentity,
        selections: &[usize],
    ) -> Result<Ballot, VoteError> {
        let selections = validate_selections(poll, selections)?;

        if !poll.is_open(Utc::now()) {
            return Err(VoteError::PollClosed);
        }

        let ballot = match self.store.insert_ballot(poll.id, voter, &selections).await {
            Ok(v) => v,
            Err(StoreError::UniqueViolation) => {
                if !poll.settings.allow_vote_changes {
                    get_logger().debug("Duplicate ballot rejected.", meta! {
                        "PollID" => poll.id,
                        "VoterKey" => voter.key(),
                    });
                    return Err(VoteError::AlreadyVoted);
                }

                self.store.update_ballot(poll.id, voter, &selections).await?
            }
            Err(e) => return Err(e.into()),
        };

        // The local marker is what lets an anonymous reload answer
        // `has_voted` without network access.
        if voter.is_anonymous() {
            self.markers.set_marker(poll.id, &selections);
        }

        Ok(ballot)
    }
}

/// Normalizes and checks a selection set: deduplicated ascending indices,
/// non-empty, all in range, single unless the poll allows multiple.
fn validate_selections(poll: &Poll, selections: &[usize]) -> Result<Vec<usize>, VoteError> {
    let mut selections = selections.to_vec();
    selections.sort_unstable();
    selections.dedup();

    if selections.is_empty() {
        return Err(VoteError::InvalidSelection("no option selected".to_owned()));
    }

    if let Some(&out_of_range) = selections.iter().find(|&&i| i >= poll.options.len()) {
        return Err(VoteError::InvalidSelection(format!(
            "option index {} out of range for {} options",
            out_of_range,
            poll.options.len()
        )));
    }

    if !poll.settings.allow_multiple_selections && selections.len() != 1 {
        return Err(VoteError::InvalidSelection(
            "this poll allows exactly one selection".to_owned(),
        ));
    }

    Ok(selections)
}
