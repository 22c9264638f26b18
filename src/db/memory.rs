use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::db::schema::{Ballot, BallotChange, Poll, PollChange, TallySet};
use crate::db::store::{BallotSubscription, NewPoll, PollStore, PollSubscription};
use crate::error::StoreError;
use crate::identity::VoterIdentity;
use crate::tally;

/// In-process `PollStore` with the same observable behavior as the Postgres
/// implementation: the (poll, voter key) uniqueness invariant, commit-order
/// change feeds, and a server-side aggregate.
///
/// Backs the test suite, which also uses it to fault-inject: aggregation can
/// be switched off to force the client-side fallback, and a poll's ballot
/// feed can be severed to simulate a dropped connection.
pub struct MemoryStore {
    polls: DashMap<Uuid, Poll>,
    ballots: DashMap<Uuid, Vec<Ballot>>,
    ballot_channels: DashMap<Uuid, broadcast::Sender<BallotChange>>,
    poll_channel: broadcast::Sender<PollChange>,
    fail_aggregation: AtomicBool,
    find_ballot_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (poll_channel, _) = broadcast::channel(64);

        Self {
            polls: DashMap::new(),
            ballots: DashMap::new(),
            ballot_channels: DashMap::new(),
            poll_channel,
            fail_aggregation: AtomicBool::new(false),
            find_ballot_calls: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `aggregate_ballots` fail until reset, forcing callers onto the
    /// client-side recompute path.
    pub fn set_fail_aggregation(&self, fail: bool) {
        self.fail_aggregation.store(fail, Ordering::SeqCst);
    }

    /// Severs every open ballot feed for this poll. Changes committed while
    /// no feed exists are never replayed, exactly like a dropped connection.
    pub fn drop_ballot_feed(&self, poll_id: Uuid) {
        self.ballot_channels.remove(&poll_id);
    }

    /// Number of `find_ballot` calls served so far.
    pub fn find_ballot_calls(&self) -> usize {
        self.find_ballot_calls.load(Ordering::SeqCst)
    }

    fn notify_ballot(&self, change: BallotChange) {
        if let Some(tx) = self.ballot_channels.get(&change.poll_id()) {
            let _ = tx.send(change);
        }
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn insert_poll(&self, poll: NewPoll, created_by: Uuid) -> Result<Poll, StoreError> {
        let poll = Poll {
            id: Uuid::new_v4(),
            question: poll.question,
            options: poll.options,
            settings: poll.settings,
            created_by,
            created_at: Utc::now(),
            ends_at: poll.ends_at,
        };

        self.polls.insert(poll.id, poll.clone());
        let _ = self.poll_channel.send(PollChange::Created(poll.clone()));

        Ok(poll)
    }

    async fn get_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        Ok(self.polls.get(&id).map(|e| e.value().clone()))
    }

    async fn delete_poll(&self, id: Uuid, requester: Uuid) -> Result<(), StoreError> {
        let poll = match self.polls.get(&id) {
            None => return Err(StoreError::NotFound),
            Some(e) => e.value().clone(),
        };

        if poll.created_by != requester {
            return Err(StoreError::Forbidden);
        }

        self.polls.remove(&id);
        self.ballots.remove(&id);
        self.ballot_channels.remove(&id);
        let _ = self.poll_channel.send(PollChange::Deleted(id));

        Ok(())
    }

    async fn list_polls(&self) -> Result<Vec<Poll>, StoreError> {
        let mut polls: Vec<Poll> = self.polls.iter().map(|e| e.value().clone()).collect();
        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(polls)
    }

    async fn insert_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
        selections: &[usize],
    ) -> Result<Ballot, StoreError> {
        if !self.polls.contains_key(&poll_id) {
            return Err(StoreError::NotFound);
        }

        let ballot = Ballot {
            id: Uuid::new_v4(),
            poll_id,
            voter: voter.clone(),
            selections: selections.to_vec(),
            created_at: Utc::now(),
        };

        {
            let mut rows = self.ballots.entry(poll_id).or_insert_with(Vec::new);

            if rows.iter().any(|b| b.voter.key() == voter.key()) {
                return Err(StoreError::UniqueViolation);
            }

            rows.push(ballot.clone());
        }

        self.notify_ballot(BallotChange::Insert(ballot.clone()));

        Ok(ballot)
    }

    async fn update_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
        selections: &[usize],
    ) -> Result<Ballot, StoreError> {
        let (old, new) = {
            let mut rows = match self.ballots.get_mut(&poll_id) {
                None => return Err(StoreError::NotFound),
                Some(v) => v,
            };

            let row = match rows.iter_mut().find(|b| b.voter.key() == voter.key()) {
                None => return Err(StoreError::NotFound),
                Some(v) => v,
            };

            let old = row.clone();
            row.selections = selections.to_vec();
            (old, row.clone())
        };

        self.notify_ballot(BallotChange::Update { old, new: new.clone() });

        Ok(new)
    }

    async fn find_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
    ) -> Result<Option<Ballot>, StoreError> {
        self.find_ballot_calls.fetch_add(1, Ordering::SeqCst);

        let rows = match self.ballots.get(&poll_id) {
            None => return Ok(None),
            Some(v) => v,
        };

        Ok(rows.iter().find(|b| b.voter.key() == voter.key()).cloned())
    }

    async fn list_ballots(&self, poll_id: Uuid) -> Result<Vec<Ballot>, StoreError> {
        Ok(self
            .ballots
            .get(&poll_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn aggregate_ballots(&self, poll: &Poll) -> Result<TallySet, StoreError> {
        if self.fail_aggregation.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("aggregation disabled".to_owned()));
        }

        let ballots = self.list_ballots(poll.id).await?;
        Ok(tally::tally_ballots(poll, &ballots))
    }

    async fn subscribe_ballots(&self, poll_id: Uuid) -> Result<BallotSubscription, StoreError> {
        let sender = self
            .ballot_channels
            .entry(poll_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();

        let mut source = sender.subscribe();
        let (tx, rx) = mpsc::channel(256);

        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(change) => {
                        if tx.send(change).await.is_err() {
                            return;
                        }
                    }
                    // Lagging means changes were missed; end the feed so the
                    // subscriber reconciles instead of trusting a gap.
                    Err(broadcast::error::RecvError::Lagged(_)) => return,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(BallotSubscription::new(rx, Some(forwarder)))
    }

    async fn subscribe_polls(&self) -> Result<PollSubscription, StoreError> {
        let mut source = self.poll_channel.subscribe();
        let (tx, rx) = mpsc::channel(64);

        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(change) => {
                        if tx.send(change).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => return,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(PollSubscription::new(rx, Some(forwarder)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::PollSettings;

    fn new_poll(question: &str) -> NewPoll {
        NewPoll {
            question: question.to_owned(),
            options: vec!["A".to_owned(), "B".to_owned()],
            settings: PollSettings::default(),
            ends_at: None,
        }
    }

    #[tokio::test]
    async fn second_ballot_for_same_identity_is_a_unique_violation() {
        let store = MemoryStore::new();
        let poll = store.insert_poll(new_poll("?"), Uuid::new_v4()).await.unwrap();
        let voter = VoterIdentity::Device("aaaa".to_owned());

        store.insert_ballot(poll.id, &voter, &[0]).await.unwrap();
        let second = store.insert_ballot(poll.id, &voter, &[1]).await;

        assert!(matches!(second, Err(StoreError::UniqueViolation)));
        assert_eq!(store.list_ballots(poll.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_poll_verifies_creator() {
        let store = MemoryStore::new();
        let creator = Uuid::new_v4();
        let poll = store.insert_poll(new_poll("?"), creator).await.unwrap();

        let stranger = store.delete_poll(poll.id, Uuid::new_v4()).await;
        assert!(matches!(stranger, Err(StoreError::Forbidden)));

        store.delete_poll(poll.id, creator).await.unwrap();
        assert!(store.get_poll(poll.id).await.unwrap().is_none());

        let gone = store.delete_poll(poll.id, creator).await;
        assert!(matches!(gone, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn ballot_feed_delivers_changes_in_order() {
        let store = MemoryStore::new();
        let poll = store.insert_poll(new_poll("?"), Uuid::new_v4()).await.unwrap();

        let mut sub = store.subscribe_ballots(poll.id).await.unwrap();

        let a = VoterIdentity::Device("aaaa".to_owned());
        let b = VoterIdentity::Device("bbbb".to_owned());
        store.insert_ballot(poll.id, &a, &[0]).await.unwrap();
        store.insert_ballot(poll.id, &b, &[1]).await.unwrap();

        let first = sub.next_change().await.unwrap();
        let second = sub.next_change().await.unwrap();

        match (first, second) {
            (BallotChange::Insert(x), BallotChange::Insert(y)) => {
                assert_eq!(x.voter, a);
                assert_eq!(y.voter, b);
            }
            other => panic!("expected two inserts, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn poll_feed_reports_creation_and_deletion() {
        let store = MemoryStore::new();
        let creator = Uuid::new_v4();

        let mut sub = store.subscribe_polls().await.unwrap();

        let poll = store.insert_poll(new_poll("?"), creator).await.unwrap();
        store.delete_poll(poll.id, creator).await.unwrap();

        match sub.next_change().await.unwrap() {
            PollChange::Created(p) => assert_eq!(p.id, poll.id),
            other => panic!("expected created, got {:?}", other),
        }
        match sub.next_change().await.unwrap() {
            PollChange::Deleted(id) => assert_eq!(id, poll.id),
            other => panic!("expected deleted, got {:?}", other),
        }
    }
}
