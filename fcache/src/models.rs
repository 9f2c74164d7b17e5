use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::CacheError;

/// Identifier of a member, post or paper in the source of truth.
pub type EntityId = i64;

/// One owner's full friend set, carried through the rebuild relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRecord {
    pub owner_id: EntityId,
    pub related_ids: BTreeSet<EntityId>,
}

impl ResyncRecord {
    pub fn new(owner_id: EntityId, related_ids: BTreeSet<EntityId>) -> Self {
        Self {
            owner_id,
            related_ids,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    RelationAdd,
    RelationRemove,
    ScoreUp,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::RelationAdd => "RELATION_ADD",
            MutationType::RelationRemove => "RELATION_REMOVE",
            MutationType::ScoreUp => "SCORE_UP",
        }
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RELATION_ADD" => Ok(MutationType::RelationAdd),
            "RELATION_REMOVE" => Ok(MutationType::RelationRemove),
            "SCORE_UP" => Ok(MutationType::ScoreUp),
            other => Err(CacheError::InvalidArg(format!("unknown mutation type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DlqStatus {
    Pending,
    Processed,
    Failed,
}

impl DlqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqStatus::Pending => "PENDING",
            DlqStatus::Processed => "PROCESSED",
            DlqStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqStatus {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DlqStatus::Pending),
            "PROCESSED" => Ok(DlqStatus::Processed),
            "FAILED" => Ok(DlqStatus::Failed),
            other => Err(CacheError::InvalidArg(format!("unknown dead-letter status: {}", other))),
        }
    }
}

/// A mutation that could not be applied to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: i64,
    pub event_id: String,
    pub mutation_type: MutationType,
    pub owner_id: EntityId,
    pub target_id: EntityId,
    pub score_delta: Option<f64>,
    pub status: DlqStatus,
    pub retry_count: u32,
    pub created_at: i64, // Unix timestamp
    pub updated_at: i64,
    pub last_error: Option<String>,
}

/// Insert payload for the dead-letter store; the store assigns id, status and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDlqEntry {
    pub event_id: String,
    pub mutation_type: MutationType,
    pub owner_id: EntityId,
    pub target_id: EntityId,
    pub score_delta: Option<f64>,
    pub last_error: Option<String>,
}

/// A ranking structure kept in the remote store.
///
/// Spelled `post` / `paper` everywhere; the long form is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RankingDomain {
    #[serde(rename = "post", alias = "post_realtime")]
    PostRealtime,
    #[serde(rename = "paper", alias = "paper_realtime")]
    PaperRealtime,
}

impl RankingDomain {
    pub const ALL: [RankingDomain; 2] = [RankingDomain::PostRealtime, RankingDomain::PaperRealtime];

    pub fn name(&self) -> &'static str {
        match self {
            RankingDomain::PostRealtime => "post",
            RankingDomain::PaperRealtime => "paper",
        }
    }
}

impl fmt::Display for RankingDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RankingDomain {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" | "post_realtime" => Ok(RankingDomain::PostRealtime),
            "paper" | "paper_realtime" => Ok(RankingDomain::PaperRealtime),
            other => Err(CacheError::InvalidArg(format!("unknown ranking domain: {}", other))),
        }
    }
}

/// Activity that moves an entity's popularity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    View,
    Like,
    Unlike,
    Comment,
    MessageCreated,
}

impl ActivityKind {
    pub fn weight(&self) -> f64 {
        match self {
            ActivityKind::View => 1.0,
            ActivityKind::Like => 3.0,
            ActivityKind::Unlike => -3.0,
            ActivityKind::Comment => 2.0,
            ActivityKind::MessageCreated => 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularityEntry {
    pub entity_id: String,
    pub score: f64,
}

/// Domain mutations fed to the incremental processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    RelationAdded {
        owner_id: EntityId,
        target_id: EntityId,
    },
    RelationRemoved {
        owner_id: EntityId,
        target_id: EntityId,
    },
    InteractionScored {
        #[serde(default = "crate::utils::id::score_event_id")]
        event_id: String,
        owner_id: EntityId,
        target_id: EntityId,
        delta: f64,
    },
    ContentActivity {
        domain: RankingDomain,
        entity_id: EntityId,
        activity: ActivityKind,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::RelationAdded { .. } => "relation_added",
            DomainEvent::RelationRemoved { .. } => "relation_removed",
            DomainEvent::InteractionScored { .. } => "interaction_scored",
            DomainEvent::ContentActivity { .. } => "content_activity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    DeadLettered,
    DeadLetterFailed,
    BestEffort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    pub pages: u64,
    pub records: u64,
    pub skipped_empty: u64,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Waiting,
    Batching,
    Flushing,
    Done,
    Interrupted,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub batches: u64,
    pub flushed_records: u64,
    pub failed_records: u64,
    pub final_state: ConsumerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub producer: ProducerReport,
    pub consumer: ConsumerReport,
    pub started_at: i64,
    pub finished_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecayOutcome {
    pub rescaled: u64,
    pub pruned: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: u64,
    pub processed: u64,
    pub failed: u64,
    pub exhausted: u64,
}
