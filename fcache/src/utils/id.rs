use crate::models::{EntityId, MutationType};
use uuid::Uuid;

/// Dead-letter key for a relation mutation, e.g. `RELATION_ADD:1:2`.
///
/// Re-emitting the same logical mutation yields the same key, so the unique
/// index on `event_id` collapses duplicates into one row.
pub fn relation_event_id(mutation: MutationType, owner_id: EntityId, target_id: EntityId) -> String {
    format!("{}:{}:{}", mutation.as_str(), owner_id, target_id)
}

/// Fresh key for a score increment. Repeated increments are distinct events.
pub fn score_event_id() -> String {
    format!("{}:{}", MutationType::ScoreUp.as_str(), Uuid::new_v4())
}

/// Random owner token for distributed locks held by one process.
pub fn lock_owner_token() -> String {
    Uuid::new_v4().to_string()
}
