//! Vote-aggregation and real-time consistency core for a polling
//! application.
//!
//! The store ([`db::store::PollStore`]) is authoritative for all Poll and
//! Ballot rows; this crate layers four pieces on top of it:
//!
//! - [`identity::VoterResolver`] — which identity is voting, and has it
//!   voted already;
//! - [`recorder::BallotRecorder`] — records one ballot per identity,
//!   treating the store's uniqueness rejection as a first-class outcome;
//! - [`tally`] — per-option counts and percentages, with a server-side
//!   preferred path and a client-side fallback;
//! - [`sync::LiveTally`] — keeps a tally current across concurrent viewers
//!   by applying the store's change notifications, reconciling with a full
//!   recompute whenever the feed drops.

pub mod db;
pub mod error;
pub mod identity;
pub mod polls;
pub mod recorder;
pub mod runtime;
pub mod sync;
pub mod tally;

pub use crate::db::schema::{Ballot, BallotChange, Poll, PollChange, PollSettings, TallyEntry, TallySet};
pub use crate::db::store::{BallotSubscription, NewPoll, PollStore, PollSubscription};
pub use crate::error::{CreatePollError, StoreError, VoteError};
pub use crate::identity::{IdentityProvider, MarkerStore, VoterIdentity, VoterResolver};
pub use crate::polls::PollService;
pub use crate::recorder::BallotRecorder;
pub use crate::sync::{ConnectionState, LiveTally, TallySnapshot};
