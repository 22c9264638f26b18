use std::pin::Pin;
use std::task::{Context, Poll as TaskPoll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::schema::{Ballot, BallotChange, Poll, PollChange, PollSettings, TallySet};
use crate::error::StoreError;
use crate::identity::VoterIdentity;

/// Creation request for a poll; validated by `PollService` before it reaches
/// a store.
#[derive(Debug, Clone)]
pub struct NewPoll {
    pub question: String,
    pub options: Vec<String>,
    pub settings: PollSettings,
    pub ends_at: Option<DateTime<Utc>>,
}

/// The external persistent store the application is layered on.
///
/// The store is authoritative for everything: it owns all Poll and Ballot
/// rows, its uniqueness constraint on (poll, voter key) is the sole arbiter
/// of conflicting concurrent submissions, and its notification channel is
/// how one viewer's vote reaches every other viewer.
#[async_trait]
pub trait PollStore: Send + Sync + 'static {
    async fn insert_poll(&self, poll: NewPoll, created_by: Uuid) -> Result<Poll, StoreError>;

    async fn get_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError>;

    /// Fails with `Forbidden` unless `requester` is the poll's creator.
    async fn delete_poll(&self, id: Uuid, requester: Uuid) -> Result<(), StoreError>;

    async fn list_polls(&self) -> Result<Vec<Poll>, StoreError>;

    /// Fails with `UniqueViolation` when a ballot already exists for this
    /// (poll, voter key) pair.
    async fn insert_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
        selections: &[usize],
    ) -> Result<Ballot, StoreError>;

    /// Replaces the selections of the existing ballot for this identity.
    /// Only called when the poll's settings allow vote changes.
    async fn update_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
        selections: &[usize],
    ) -> Result<Ballot, StoreError>;

    async fn find_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
    ) -> Result<Option<Ballot>, StoreError>;

    async fn list_ballots(&self, poll_id: Uuid) -> Result<Vec<Ballot>, StoreError>;

    /// Server-side aggregation: per-option counts and percentages computed
    /// in one call without transferring every ballot. Callers fall back to
    /// `list_ballots` plus a client-side recompute when this fails.
    async fn aggregate_ballots(&self, poll: &Poll) -> Result<TallySet, StoreError>;

    /// Opens a change feed scoped to one poll's ballots. Within a single
    /// live feed, changes arrive in commit order.
    async fn subscribe_ballots(&self, poll_id: Uuid) -> Result<BallotSubscription, StoreError>;

    /// Change feed for poll creation/deletion, for list views.
    async fn subscribe_polls(&self) -> Result<PollSubscription, StoreError>;
}

/// Live feed of ballot changes for one poll. Dropping it releases the
/// underlying listener.
pub struct BallotSubscription {
    rx: mpsc::Receiver<BallotChange>,
    forwarder: Option<JoinHandle<()>>,
}

impl BallotSubscription {
    pub fn new(rx: mpsc::Receiver<BallotChange>, forwarder: Option<JoinHandle<()>>) -> Self {
        Self { rx, forwarder }
    }

    /// Next change in commit order; `None` once the feed has dropped.
    pub async fn next_change(&mut self) -> Option<BallotChange> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for BallotSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

impl Stream for BallotSubscription {
    type Item = BallotChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Live feed of poll creation/deletion events.
pub struct PollSubscription {
    rx: mpsc::Receiver<PollChange>,
    forwarder: Option<JoinHandle<()>>,
}

impl PollSubscription {
    pub fn new(rx: mpsc::Receiver<PollChange>, forwarder: Option<JoinHandle<()>>) -> Self {
        Self { rx, forwarder }
    }

    pub async fn next_change(&mut self) -> Option<PollChange> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for PollSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

impl Stream for PollSubscription {
    type Item = PollChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
