use std::cmp::Reverse;
use std::sync::Arc;

use evlog::meta;
use itertools::Itertools;

use crate::db::schema::{Ballot, BallotChange, Poll, TallyEntry, TallySet};
use crate::db::store::PollStore;
use crate::error::StoreError;
use crate::runtime::get_logger;

/// Tally with every count at zero, for a poll nobody has voted on yet.
pub fn empty_tally(poll: &Poll) -> TallySet {
    from_counts(poll, vec![0; poll.options.len()], 0)
}

/// Builds a `TallySet` from raw per-option counts, deriving every percentage
/// fresh. This is the single place percentages are computed.
pub fn from_counts(poll: &Poll, counts: Vec<u64>, total_ballots: u64) -> TallySet {
    let entries = poll
        .options
        .iter()
        .enumerate()
        .map(|(i, text)| TallyEntry {
            option_index: i,
            option_text: text.clone(),
            count: counts.get(i).copied().unwrap_or(0),
            percentage: percentage(counts.get(i).copied().unwrap_or(0), total_ballots),
        })
        .collect();

    TallySet { entries, total_ballots }
}

/// Client-side recompute from raw ballots: every selected index of every
/// ballot increments that option's count. Total is the number of ballots,
/// not the number of increments; for multi-selection polls these differ.
pub fn tally_ballots(poll: &Poll, ballots: &[Ballot]) -> TallySet {
    let mut counts = vec![0u64; poll.options.len()];

    for ballot in ballots {
        for &index in &ballot.selections {
            if let Some(count) = counts.get_mut(index) {
                *count += 1;
            }
        }
    }

    from_counts(poll, counts, ballots.len() as u64)
}

/// Applies one change notification to a tally. An update is treated as a
/// delete of the old selections followed by an insert of the new ones, so
/// the total is unchanged. Percentages are re-derived from the new counts
/// rather than adjusted incrementally, which avoids rounding drift.
pub fn apply_delta(poll: &Poll, current: &TallySet, change: &BallotChange) -> TallySet {
    let mut counts: Vec<u64> = current.entries.iter().map(|e| e.count).collect();
    counts.resize(poll.options.len(), 0);
    let mut total = current.total_ballots;

    match change {
        BallotChange::Insert(ballot) => {
            increment(&mut counts, &ballot.selections);
            total += 1;
        }
        BallotChange::Delete(ballot) => {
            decrement(&mut counts, &ballot.selections);
            total = total.saturating_sub(1);
        }
        BallotChange::Update { old, new } => {
            decrement(&mut counts, &old.selections);
            increment(&mut counts, &new.selections);
        }
    }

    from_counts(poll, counts, total)
}

fn increment(counts: &mut [u64], selections: &[usize]) {
    for &index in selections {
        if let Some(count) = counts.get_mut(index) {
            *count += 1;
        }
    }
}

fn decrement(counts: &mut [u64], selections: &[usize]) {
    for &index in selections {
        if let Some(count) = counts.get_mut(index) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Entries sorted for display: descending count, ties keep the option's
/// original index order.
pub fn display_order(tally: &TallySet) -> Vec<TallyEntry> {
    tally
        .entries
        .iter()
        .cloned()
        .sorted_by_key(|e| Reverse(e.count))
        .collect()
}

fn percentage(count: u64, total_ballots: u64) -> f64 {
    if total_ballots == 0 {
        return 0.0;
    }

    round1(count as f64 / total_ballots as f64 * 100.0)
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Computes the initial tally for a poll view.
///
/// Two strategies behind one decision point: the preferred path is a single
/// server-side aggregation call; when that fails the engine fetches the raw
/// ballots and recomputes locally. The failure is recovered here and never
/// surfaced to the viewer.
pub struct TallyEngine<S> {
    store: Arc<S>,
}

impl<S: PollStore> TallyEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn compute_initial(&self, poll: &Poll) -> Result<TallySet, StoreError> {
        match self.store.aggregate_ballots(poll).await {
            Ok(tally) => Ok(tally),
            Err(e) => {
                get_logger().debug("Server-side aggregation unavailable; recomputing client-side.", meta! {
                    "PollID" => poll.id,
                    "Error" => e,
                });

                let ballots = self.store.list_ballots(poll.id).await?;
                Ok(tally_ballots(poll, &ballots))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::db::schema::PollSettings;
    use crate::identity::VoterIdentity;

    fn test_poll(options: &[&str], multi: bool) -> Poll {
        Poll {
            id: Uuid::new_v4(),
            question: "?".to_owned(),
            options: options.iter().map(|s| s.to_string()).collect(),
            settings: PollSettings {
                allow_multiple_selections: multi,
                ..PollSettings::default()
            },
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            ends_at: None,
        }
    }

    fn test_ballot(poll: &Poll, selections: &[usize]) -> Ballot {
        Ballot {
            id: Uuid::new_v4(),
            poll_id: poll.id,
            voter: VoterIdentity::Device(format!("{:016x}", rand::random::<u64>())),
            selections: selections.to_vec(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_poll_has_zero_percentages() {
        let poll = test_poll(&["A", "B", "C"], false);
        let tally = empty_tally(&poll);

        assert_eq!(tally.total_ballots, 0);
        for entry in &tally.entries {
            assert_eq!(entry.count, 0);
            assert_eq!(entry.percentage, 0.0);
        }
    }

    #[test]
    fn red_blue_scenario() {
        let poll = test_poll(&["Red", "Blue"], false);
        let ballots = vec![
            test_ballot(&poll, &[0]),
            test_ballot(&poll, &[1]),
            test_ballot(&poll, &[0]),
        ];

        let tally = tally_ballots(&poll, &ballots);

        assert_eq!(tally.total_ballots, 3);
        assert_eq!(tally.entries[0].count, 2);
        assert_eq!(tally.entries[0].percentage, 66.7);
        assert_eq!(tally.entries[1].count, 1);
        assert_eq!(tally.entries[1].percentage, 33.3);
    }

    #[test]
    fn multi_select_counts_ballots_not_increments() {
        let poll = test_poll(&["A", "B", "C"], true);
        let ballots = vec![test_ballot(&poll, &[0, 2])];

        let tally = tally_ballots(&poll, &ballots);

        assert_eq!(tally.total_ballots, 1);
        let counts: Vec<u64> = tally.entries.iter().map(|e| e.count).collect();
        assert_eq!(counts, vec![1, 0, 1]);
        let pcts: Vec<f64> = tally.entries.iter().map(|e| e.percentage).collect();
        assert_eq!(pcts, vec![100.0, 0.0, 100.0]);
    }

    #[test]
    fn single_select_counts_sum_to_total() {
        let poll = test_poll(&["A", "B", "C", "D"], false);
        let ballots: Vec<Ballot> = (0..17).map(|i| test_ballot(&poll, &[i % 4])).collect();

        let tally = tally_ballots(&poll, &ballots);

        let sum: u64 = tally.entries.iter().map(|e| e.count).sum();
        assert_eq!(sum, tally.total_ballots);
        assert_eq!(tally.total_ballots, 17);

        let pct_sum: f64 = tally.entries.iter().map(|e| e.percentage).sum();
        assert!((pct_sum - 100.0).abs() < 0.5, "pct sum {} too far from 100", pct_sum);
    }

    #[test]
    fn insert_delta_matches_recompute() {
        let poll = test_poll(&["A", "B"], false);
        let b1 = test_ballot(&poll, &[0]);
        let b2 = test_ballot(&poll, &[1]);

        let mut tally = empty_tally(&poll);
        tally = apply_delta(&poll, &tally, &BallotChange::Insert(b1.clone()));
        tally = apply_delta(&poll, &tally, &BallotChange::Insert(b2.clone()));

        assert_eq!(tally, tally_ballots(&poll, &[b1, b2]));
    }

    #[test]
    fn update_delta_moves_count_and_keeps_total() {
        let poll = test_poll(&["A", "B"], false);
        let old = test_ballot(&poll, &[0]);
        let mut new = old.clone();
        new.selections = vec![1];

        let before = apply_delta(&poll, &empty_tally(&poll), &BallotChange::Insert(old.clone()));
        let after = apply_delta(&poll, &before, &BallotChange::Update { old, new });

        assert_eq!(after.total_ballots, before.total_ballots);
        assert_eq!(after.entries[0].count, 0);
        assert_eq!(after.entries[1].count, 1);
    }

    #[test]
    fn delete_delta_floors_at_zero() {
        let poll = test_poll(&["A", "B"], false);
        let ghost = test_ballot(&poll, &[0]);

        let tally = apply_delta(&poll, &empty_tally(&poll), &BallotChange::Delete(ghost));

        assert_eq!(tally.total_ballots, 0);
        assert_eq!(tally.entries[0].count, 0);
        assert_eq!(tally.entries[0].percentage, 0.0);
    }

    #[test]
    fn out_of_range_selection_is_ignored() {
        let poll = test_poll(&["A", "B"], false);
        let bad = test_ballot(&poll, &[7]);

        let tally = tally_ballots(&poll, &[bad]);

        assert_eq!(tally.total_ballots, 1);
        assert_eq!(tally.entries[0].count, 0);
        assert_eq!(tally.entries[1].count, 0);
    }

    #[test]
    fn display_order_is_descending_with_stable_ties() {
        let poll = test_poll(&["A", "B", "C", "D"], false);
        let ballots = vec![
            test_ballot(&poll, &[1]),
            test_ballot(&poll, &[1]),
            test_ballot(&poll, &[0]),
            test_ballot(&poll, &[3]),
        ];

        let ordered = display_order(&tally_ballots(&poll, &ballots));
        let indices: Vec<usize> = ordered.iter().map(|e| e.option_index).collect();

        // B first, then the 1-count tie A/D in index order, then C.
        assert_eq!(indices, vec![1, 0, 3, 2]);
    }
}
