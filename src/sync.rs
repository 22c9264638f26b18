use std::sync::Arc;
use std::time::Duration;

use evlog::meta;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db::schema::{Poll, TallySet};
use crate::db::store::PollStore;
use crate::runtime::get_logger;
use crate::tally::{self, TallyEngine};

const BACKOFF_STEP: Duration = Duration::from_millis(250);
const BACKOFF_CEILING: Duration = Duration::from_secs(10);
const BACKOFF_JITTER_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Syncing,
    Live,
    Reconciling,
}

/// What a poll view renders: the current tally plus how much to trust it.
#[derive(Debug, Clone)]
pub struct TallySnapshot {
    pub results: TallySet,
    pub connection: ConnectionState,
}

impl TallySnapshot {
    pub fn total_votes(&self) -> u64 {
        self.results.total_ballots
    }
}

/// Live view of one poll's tally.
///
/// Opening spawns a single background task that owns the subscription and
/// applies deltas strictly sequentially, publishing snapshots through a
/// watch channel. Dropping (or `close`) aborts the task, which releases the
/// subscription on every exit path and discards any in-flight initial
/// compute before it can touch state nobody is watching.
pub struct LiveTally {
    rx: watch::Receiver<TallySnapshot>,
    task: JoinHandle<()>,
}

impl LiveTally {
    pub fn open<S: PollStore>(store: Arc<S>, poll: Poll) -> Self {
        let initial = TallySnapshot {
            results: tally::empty_tally(&poll),
            connection: ConnectionState::Disconnected,
        };
        let (tx, rx) = watch::channel(initial);

        let task = tokio::spawn(run(store, poll, tx));

        Self { rx, task }
    }

    /// Current snapshot without waiting.
    pub fn snapshot(&self) -> TallySnapshot {
        self.rx.borrow().clone()
    }

    /// A receiver for awaiting snapshot changes.
    pub fn watch(&self) -> watch::Receiver<TallySnapshot> {
        self.rx.clone()
    }

    pub fn close(self) {}
}

impl Drop for LiveTally {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S: PollStore>(store: Arc<S>, poll: Poll, tx: watch::Sender<TallySnapshot>) {
    let engine = TallyEngine::new(store.clone());
    let mut attempt: u32 = 0;
    let mut first_connect = true;

    loop {
        let phase = if first_connect {
            ConnectionState::Syncing
        } else {
            ConnectionState::Reconciling
        };
        if !publish_state(&tx, phase) {
            return;
        }

        // The feed opens before the initial fetch, so no change committed
        // after the fetch can be missed. A change committed in between may be
        // counted twice transiently; the next reconciliation heals it.
        let mut sub = match store.subscribe_ballots(poll.id).await {
            Ok(v) => v,
            Err(e) => {
                get_logger().debug("Failed to open ballot feed; will retry.", meta! {
                    "PollID" => poll.id,
                    "Error" => e,
                });
                attempt += 1;
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
        };

        let results = match engine.compute_initial(&poll).await {
            Ok(v) => v,
            Err(e) => {
                get_logger().debug("Initial tally fetch failed; will retry.", meta! {
                    "PollID" => poll.id,
                    "Error" => e,
                });
                attempt += 1;
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
        };
        attempt = 0;

        if first_connect {
            get_logger().info("Live tally open.", meta! {
                "PollID" => poll.id,
                "TotalBallots" => results.total_ballots,
            });
        } else {
            get_logger().info("Live tally reconciled after dropped feed.", meta! {
                "PollID" => poll.id,
                "TotalBallots" => results.total_ballots,
            });
        }
        first_connect = false;

        if !publish(&tx, results, ConnectionState::Live) {
            return;
        }

        // One change at a time, in commit order, each applied to completion
        // before the next is read.
        while let Some(change) = sub.next_change().await {
            let current = tx.borrow().results.clone();
            let updated = tally::apply_delta(&poll, &current, &change);

            if !publish(&tx, updated, ConnectionState::Live) {
                return;
            }
        }

        // The feed ended: deltas accumulated so far can no longer be trusted,
        // so the next pass recomputes from the store instead of resuming.
        get_logger().debug("Ballot feed dropped; reconciling.", meta! {
            "PollID" => poll.id,
        });
        attempt += 1;
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}

fn publish(tx: &watch::Sender<TallySnapshot>, results: TallySet, connection: ConnectionState) -> bool {
    tx.send(TallySnapshot { results, connection }).is_ok()
}

fn publish_state(tx: &watch::Sender<TallySnapshot>, connection: ConnectionState) -> bool {
    let results = tx.borrow().results.clone();
    publish(tx, results, connection)
}

/// Incremental backoff with jitter. No hard ceiling on retries, only on the
/// per-attempt delay.
fn backoff_delay(attempt: u32) -> Duration {
    let stepped = BACKOFF_STEP * attempt.min(40);
    let capped = stepped.min(BACKOFF_CEILING);
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);

    capped + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= BACKOFF_STEP);
        assert!(first < BACKOFF_STEP + Duration::from_millis(BACKOFF_JITTER_MS));

        let huge = backoff_delay(1_000);
        assert!(huge <= BACKOFF_CEILING + Duration::from_millis(BACKOFF_JITTER_MS));
    }
}
