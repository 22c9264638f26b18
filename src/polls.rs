use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::schema::Poll;
use crate::db::store::{NewPoll, PollStore, PollSubscription};
use crate::error::{CreatePollError, StoreError};

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 10;
pub const MAX_OPTION_LEN: usize = 100;

/// Poll lifecycle: created by an authenticated identity, read by anyone,
/// deleted only by its creator.
pub struct PollService<S> {
    store: Arc<S>,
}

impl<S: PollStore> PollService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn create(&self, mut poll: NewPoll, created_by: Uuid) -> Result<Poll, CreatePollError> {
        poll.question = poll.question.trim().to_owned();
        poll.options = poll.options.iter().map(|o| o.trim().to_owned()).collect();

        validate(&poll)?;

        Ok(self.store.insert_poll(poll, created_by).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        self.store.get_poll(id).await
    }

    pub async fn list(&self) -> Result<Vec<Poll>, StoreError> {
        self.store.list_polls().await
    }

    pub async fn delete(&self, id: Uuid, requester: Uuid) -> Result<(), StoreError> {
        self.store.delete_poll(id, requester).await
    }

    pub async fn watch(&self) -> Result<PollSubscription, StoreError> {
        self.store.subscribe_polls().await
    }
}

fn validate(poll: &NewPoll) -> Result<(), CreatePollError> {
    if poll.question.is_empty() {
        return Err(CreatePollError::Invalid("question must not be empty".to_owned()));
    }

    if poll.options.len() < MIN_OPTIONS || poll.options.len() > MAX_OPTIONS {
        return Err(CreatePollError::Invalid(format!(
            "polls must have between {} and {} options; got {}",
            MIN_OPTIONS,
            MAX_OPTIONS,
            poll.options.len()
        )));
    }

    for (i, option) in poll.options.iter().enumerate() {
        if option.is_empty() {
            return Err(CreatePollError::Invalid(format!("option {} is empty", i + 1)));
        }
        if option.chars().count() > MAX_OPTION_LEN {
            return Err(CreatePollError::Invalid(format!(
                "option {} exceeds {} characters",
                i + 1,
                MAX_OPTION_LEN
            )));
        }
    }

    if let Some(ends_at) = poll.ends_at {
        if ends_at <= Utc::now() {
            return Err(CreatePollError::Invalid("end time must be in the future".to_owned()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::schema::PollSettings;

    fn service() -> PollService<MemoryStore> {
        PollService::new(Arc::new(MemoryStore::new()))
    }

    fn request(options: &[&str]) -> NewPoll {
        NewPoll {
            question: "Lunch spot?".to_owned(),
            options: options.iter().map(|s| s.to_string()).collect(),
            settings: PollSettings::default(),
            ends_at: None,
        }
    }

    #[tokio::test]
    async fn create_trims_and_stores() {
        let service = service();
        let mut req = request(&["  Tacos ", "Ramen"]);
        req.question = " Lunch spot? ".to_owned();

        let poll = service.create(req, Uuid::new_v4()).await.unwrap();

        assert_eq!(poll.question, "Lunch spot?");
        assert_eq!(poll.options, vec!["Tacos".to_owned(), "Ramen".to_owned()]);
    }

    #[tokio::test]
    async fn rejects_too_few_and_too_many_options() {
        let service = service();

        let one = service.create(request(&["Only"]), Uuid::new_v4()).await;
        assert!(matches!(one, Err(CreatePollError::Invalid(_))));

        let labels: Vec<String> = (0..11).map(|i| format!("opt {}", i)).collect();
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        let eleven = service.create(request(&refs), Uuid::new_v4()).await;
        assert!(matches!(eleven, Err(CreatePollError::Invalid(_))));
    }

    #[tokio::test]
    async fn rejects_blank_and_oversized_options() {
        let service = service();

        let blank = service.create(request(&["A", "   "]), Uuid::new_v4()).await;
        assert!(matches!(blank, Err(CreatePollError::Invalid(_))));

        let long = "x".repeat(101);
        let oversized = service.create(request(&["A", &long]), Uuid::new_v4()).await;
        assert!(matches!(oversized, Err(CreatePollError::Invalid(_))));
    }

    #[tokio::test]
    async fn rejects_end_time_in_the_past() {
        let service = service();
        let mut req = request(&["A", "B"]);
        req.ends_at = Some(Utc::now() - Duration::hours(1));

        let result = service.create(req, Uuid::new_v4()).await;
        assert!(matches!(result, Err(CreatePollError::Invalid(_))));
    }
}
