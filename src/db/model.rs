use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evlog::meta;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{query, PgPool, Row};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::db::dbclient::DBClient;
use crate::db::schema::{Ballot, BallotChange, Poll, PollChange, PollSettings, TallySet};
use crate::db::store::{BallotSubscription, NewPoll, PollStore, PollSubscription};
use crate::error::StoreError;
use crate::identity::VoterIdentity;
use crate::runtime::get_logger;
use crate::tally;

const BALLOT_CHANNEL: &str = "livepoll_ballots";
const POLL_CHANNEL: &str = "livepoll_polls";

/// `PollStore` backed by PostgreSQL.
///
/// The unique index on `ballot (id_poll, voter_key)` is the authoritative
/// one-ballot-per-identity arbiter; change feeds ride on `LISTEN`/`NOTIFY`
/// payloads emitted by row-level triggers (see `migrations/`).
pub struct PgStore {
    client: DBClient,
}

impl PgStore {
    pub fn new(client: DBClient) -> Self {
        Self { client }
    }

    fn conn(&self) -> &PgPool {
        self.client.conn()
    }
}

fn poll_from_row(row: &PgRow) -> Result<Poll, StoreError> {
    let options: Vec<String> = serde_json::from_value(row.try_get("options")?)?;

    Ok(Poll {
        id: row.try_get("id")?,
        question: row.try_get("question")?,
        options,
        settings: PollSettings {
            allow_multiple_selections: row.try_get("allow_multiple")?,
            show_results_before_voting: row.try_get("show_results_early")?,
            allow_vote_changes: row.try_get("allow_vote_changes")?,
        },
        created_by: row.try_get("id_created_by")?,
        created_at: row.try_get("time_created")?,
        ends_at: row.try_get("time_ends")?,
    })
}

fn ballot_from_row(row: &PgRow) -> Result<Ballot, StoreError> {
    let voter_key: String = row.try_get("voter_key")?;
    let voter = VoterIdentity::from_key(&voter_key)
        .ok_or_else(|| StoreError::Malformed(format!("voter key '{}'", voter_key)))?;
    let selections: Vec<usize> = serde_json::from_value(row.try_get("selections")?)?;

    Ok(Ballot {
        id: row.try_get("id")?,
        poll_id: row.try_get("id_poll")?,
        voter,
        selections,
        created_at: row.try_get("time_created")?,
    })
}

fn map_insert_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation;
        }
    }

    StoreError::Database(e)
}

fn selections_json(selections: &[usize]) -> serde_json::Value {
    serde_json::json!(selections)
}

#[async_trait]
impl PollStore for PgStore {
    async fn insert_poll(&self, poll: NewPoll, created_by: Uuid) -> Result<Poll, StoreError> {
        let id = Uuid::new_v4();

        let row = query(
            "INSERT INTO poll (id, question, options, allow_multiple, show_results_early, allow_vote_changes, id_created_by, time_created, time_ends)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8)
             RETURNING time_created;",
        )
        .bind(id)
        .bind(&poll.question)
        .bind(serde_json::json!(poll.options))
        .bind(poll.settings.allow_multiple_selections)
        .bind(poll.settings.show_results_before_voting)
        .bind(poll.settings.allow_vote_changes)
        .bind(created_by)
        .bind(poll.ends_at)
        .fetch_one(self.conn())
        .await?;

        Ok(Poll {
            id,
            question: poll.question,
            options: poll.options,
            settings: poll.settings,
            created_by,
            created_at: row.try_get("time_created")?,
            ends_at: poll.ends_at,
        })
    }

    async fn get_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        let row = query("SELECT * FROM poll WHERE id = $1;")
            .bind(id)
            .fetch_optional(self.conn())
            .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(poll_from_row(&row)?)),
        }
    }

    async fn delete_poll(&self, id: Uuid, requester: Uuid) -> Result<(), StoreError> {
        let existing = match self.get_poll(id).await? {
            None => return Err(StoreError::NotFound),
            Some(v) => v,
        };

        if existing.created_by != requester {
            return Err(StoreError::Forbidden);
        }

        query("DELETE FROM poll WHERE id = $1;")
            .bind(id)
            .execute(self.conn())
            .await?;

        Ok(())
    }

    async fn list_polls(&self) -> Result<Vec<Poll>, StoreError> {
        let mut stream = query("SELECT * FROM poll ORDER BY time_created DESC;").fetch(self.conn());

        let mut result = Vec::new();
        while let Some(row) = stream.try_next().await? {
            result.push(poll_from_row(&row)?);
        }

        Ok(result)
    }

    async fn insert_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
        selections: &[usize],
    ) -> Result<Ballot, StoreError> {
        let id = Uuid::new_v4();

        let row = query(
            "INSERT INTO ballot (id, id_poll, voter_key, selections, time_created)
             VALUES ($1, $2, $3, $4, NOW())
             RETURNING time_created;",
        )
        .bind(id)
        .bind(poll_id)
        .bind(voter.key())
        .bind(selections_json(selections))
        .fetch_one(self.conn())
        .await
        .map_err(map_insert_err)?;

        Ok(Ballot {
            id,
            poll_id,
            voter: voter.clone(),
            selections: selections.to_vec(),
            created_at: row.try_get("time_created")?,
        })
    }

    async fn update_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
        selections: &[usize],
    ) -> Result<Ballot, StoreError> {
        let row = query(
            "UPDATE ballot SET selections = $3
             WHERE id_poll = $1 AND voter_key = $2
             RETURNING id, time_created;",
        )
        .bind(poll_id)
        .bind(voter.key())
        .bind(selections_json(selections))
        .fetch_optional(self.conn())
        .await?;

        let row = match row {
            None => return Err(StoreError::NotFound),
            Some(v) => v,
        };

        Ok(Ballot {
            id: row.try_get("id")?,
            poll_id,
            voter: voter.clone(),
            selections: selections.to_vec(),
            created_at: row.try_get("time_created")?,
        })
    }

    async fn find_ballot(
        &self,
        poll_id: Uuid,
        voter: &VoterIdentity,
    ) -> Result<Option<Ballot>, StoreError> {
        let row = query("SELECT * FROM ballot WHERE id_poll = $1 AND voter_key = $2;")
            .bind(poll_id)
            .bind(voter.key())
            .fetch_optional(self.conn())
            .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(ballot_from_row(&row)?)),
        }
    }

    async fn list_ballots(&self, poll_id: Uuid) -> Result<Vec<Ballot>, StoreError> {
        let mut stream = query("SELECT * FROM ballot WHERE id_poll = $1 ORDER BY time_created;")
            .bind(poll_id)
            .fetch(self.conn());

        let mut result = Vec::new();
        while let Some(row) = stream.try_next().await? {
            result.push(ballot_from_row(&row)?);
        }

        Ok(result)
    }

    async fn aggregate_ballots(&self, poll: &Poll) -> Result<TallySet, StoreError> {
        let mut stream = query("SELECT option_index, vote_count, total_ballots FROM poll_results($1);")
            .bind(poll.id)
            .fetch(self.conn());

        let mut counts = vec![0u64; poll.options.len()];
        let mut total = 0u64;

        while let Some(row) = stream.try_next().await? {
            let index: i32 = row.try_get("option_index")?;
            let count: i64 = row.try_get("vote_count")?;
            total = row.try_get::<i64, _>("total_ballots")? as u64;

            if let Some(slot) = counts.get_mut(index as usize) {
                *slot = count as u64;
            }
        }

        Ok(tally::from_counts(poll, counts, total))
    }

    async fn subscribe_ballots(&self, poll_id: Uuid) -> Result<BallotSubscription, StoreError> {
        let mut listener = PgListener::connect_with(self.conn()).await?;
        listener.listen(BALLOT_CHANNEL).await?;

        let (tx, rx) = mpsc::channel(256);

        let forwarder = tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(v) => v,
                    Err(e) => {
                        get_logger().debug("Ballot listener connection lost.", meta! {
                            "PollID" => poll_id,
                            "Error" => e,
                        });
                        return;
                    }
                };

                let change = match parse_ballot_notification(notification.payload()) {
                    Ok(v) => v,
                    Err(e) => {
                        get_logger().debug("Discarding malformed ballot notification.", meta! {
                            "PollID" => poll_id,
                            "Error" => e,
                        });
                        continue;
                    }
                };

                if change.poll_id() != poll_id {
                    continue;
                }

                if tx.send(change).await.is_err() {
                    return;
                }
            }
        });

        Ok(BallotSubscription::new(rx, Some(forwarder)))
    }

    async fn subscribe_polls(&self) -> Result<PollSubscription, StoreError> {
        let mut listener = PgListener::connect_with(self.conn()).await?;
        listener.listen(POLL_CHANNEL).await?;

        let (tx, rx) = mpsc::channel(64);

        let forwarder = tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(v) => v,
                    Err(e) => {
                        get_logger().debug("Poll listener connection lost.", meta! {
                            "Error" => e,
                        });
                        return;
                    }
                };

                let change = match parse_poll_notification(notification.payload()) {
                    Ok(v) => v,
                    Err(e) => {
                        get_logger().debug("Discarding malformed poll notification.", meta! {
                            "Error" => e,
                        });
                        continue;
                    }
                };

                if tx.send(change).await.is_err() {
                    return;
                }
            }
        });

        Ok(PollSubscription::new(rx, Some(forwarder)))
    }
}

#[derive(Deserialize)]
struct BallotNotifyRow {
    id: Uuid,
    id_poll: Uuid,
    voter_key: String,
    selections: Vec<usize>,
    time_created: DateTime<Utc>,
}

impl BallotNotifyRow {
    fn into_ballot(self) -> Result<Ballot, StoreError> {
        let voter = VoterIdentity::from_key(&self.voter_key)
            .ok_or_else(|| StoreError::Malformed(format!("voter key '{}'", self.voter_key)))?;

        Ok(Ballot {
            id: self.id,
            poll_id: self.id_poll,
            voter,
            selections: self.selections,
            created_at: self.time_created,
        })
    }
}

#[derive(Deserialize)]
struct BallotNotifyEnvelope {
    op: String,
    row: BallotNotifyRow,
    old: Option<BallotNotifyRow>,
}

fn parse_ballot_notification(payload: &str) -> Result<BallotChange, StoreError> {
    let envelope: BallotNotifyEnvelope = serde_json::from_str(payload)?;

    match envelope.op.as_str() {
        "insert" => Ok(BallotChange::Insert(envelope.row.into_ballot()?)),
        "update" => {
            let old = envelope
                .old
                .ok_or_else(|| StoreError::Malformed("update without old row".to_owned()))?;
            Ok(BallotChange::Update {
                old: old.into_ballot()?,
                new: envelope.row.into_ballot()?,
            })
        }
        "delete" => Ok(BallotChange::Delete(envelope.row.into_ballot()?)),
        other => Err(StoreError::Malformed(format!("unknown op '{}'", other))),
    }
}

#[derive(Deserialize)]
struct PollNotifyRow {
    id: Uuid,
    question: String,
    options: Vec<String>,
    allow_multiple: bool,
    show_results_early: bool,
    allow_vote_changes: bool,
    id_created_by: Uuid,
    time_created: DateTime<Utc>,
    time_ends: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct PollNotifyEnvelope {
    op: String,
    row: PollNotifyRow,
}

fn parse_poll_notification(payload: &str) -> Result<PollChange, StoreError> {
    let envelope: PollNotifyEnvelope = serde_json::from_str(payload)?;
    let row = envelope.row;

    match envelope.op.as_str() {
        "insert" => Ok(PollChange::Created(Poll {
            id: row.id,
            question: row.question,
            options: row.options,
            settings: PollSettings {
                allow_multiple_selections: row.allow_multiple,
                show_results_before_voting: row.show_results_early,
                allow_vote_changes: row.allow_vote_changes,
            },
            created_by: row.id_created_by,
            created_at: row.time_created,
            ends_at: row.time_ends,
        })),
        "delete" => Ok(PollChange::Deleted(row.id)),
        other => Err(StoreError::Malformed(format!("unknown op '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_insert_notification() {
        let payload = r#"{
            "op": "insert",
            "row": {
                "id": "7f6cdfc3-59ca-4761-a1f8-7b9b2f66a17b",
                "id_poll": "f5d3c9f2-0a52-4e2a-9f50-3a2fa1c7e8de",
                "voter_key": "device:a1b2c3d4e5f60718",
                "selections": [0, 2],
                "time_created": "2026-08-29T10:00:00.123456+00:00"
            }
        }"#;

        let change = parse_ballot_notification(payload).unwrap();
        match change {
            BallotChange::Insert(ballot) => {
                assert_eq!(ballot.selections, vec![0, 2]);
                assert!(ballot.voter.is_anonymous());
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn parses_update_notification_with_old_row() {
        let payload = r#"{
            "op": "update",
            "old": {
                "id": "7f6cdfc3-59ca-4761-a1f8-7b9b2f66a17b",
                "id_poll": "f5d3c9f2-0a52-4e2a-9f50-3a2fa1c7e8de",
                "voter_key": "user:57b3e28f-9f1a-4a3e-8a11-b8d3f76b1a52",
                "selections": [0],
                "time_created": "2026-08-29T10:00:00+00:00"
            },
            "row": {
                "id": "7f6cdfc3-59ca-4761-a1f8-7b9b2f66a17b",
                "id_poll": "f5d3c9f2-0a52-4e2a-9f50-3a2fa1c7e8de",
                "voter_key": "user:57b3e28f-9f1a-4a3e-8a11-b8d3f76b1a52",
                "selections": [1],
                "time_created": "2026-08-29T10:00:00+00:00"
            }
        }"#;

        let change = parse_ballot_notification(payload).unwrap();
        match change {
            BallotChange::Update { old, new } => {
                assert_eq!(old.selections, vec![0]);
                assert_eq!(new.selections, vec![1]);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_op() {
        let payload = r#"{
            "op": "truncate",
            "row": {
                "id": "7f6cdfc3-59ca-4761-a1f8-7b9b2f66a17b",
                "id_poll": "f5d3c9f2-0a52-4e2a-9f50-3a2fa1c7e8de",
                "voter_key": "device:a1b2c3d4e5f60718",
                "selections": [],
                "time_created": "2026-08-29T10:00:00+00:00"
            }
        }"#;

        assert!(parse_ballot_notification(payload).is_err());
    }
}
