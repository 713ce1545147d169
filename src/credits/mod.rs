use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod authority;
pub mod gate;
pub mod ledger;
pub mod pg;
pub mod tiers;

pub use authority::{CreditService, ReconciliationReport};
pub use gate::{ActionGate, GatedAction};
pub use ledger::{LedgerDelta, LedgerStore, MemoryLedger};
pub use pg::PgLedger;

/// Subscription tier of a (user, organization) pair. The tier decides the
/// monthly credit allotment and the per-tier caps (see `tiers`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Business,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            "business" => Some(Self::Business),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tenant credit balance. available_credits is stored redundantly so the
/// store can compare-and-decrement in one step; it must always equal
/// total_credits - used_credits and never go negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub total_credits: i64,
    pub used_credits: i64,
    pub available_credits: i64,
    pub subscription_tier: SubscriptionTier,
    pub credits_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record of one ledger mutation. credits_used is signed:
/// positive for a spend, negative for a grant or reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub action_type: String,
    pub credits_used: i64,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The billable actions and their deploy-time credit prices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    EmailClassification,
    EmailDraftShort,
    EmailDraftLong,
    SenderResearchBasic,
    SenderResearchDeep,
    WorkflowExecution,
    FollowUpSchedule,
}

/// Draft responses below this rendered length bill at the short-draft price.
pub const SHORT_DRAFT_MAX_CHARS: usize = 500;

impl ActionKind {
    pub fn cost(&self) -> i64 {
        match self {
            Self::EmailClassification => 1,
            Self::EmailDraftShort => 3,
            Self::EmailDraftLong => 7,
            Self::SenderResearchBasic => 2,
            Self::SenderResearchDeep => 5,
            Self::WorkflowExecution => 2,
            Self::FollowUpSchedule => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailClassification => "email_classification",
            Self::EmailDraftShort => "email_draft_short",
            Self::EmailDraftLong => "email_draft_long",
            Self::SenderResearchBasic => "sender_research_basic",
            Self::SenderResearchDeep => "sender_research_deep",
            Self::WorkflowExecution => "workflow_execution",
            Self::FollowUpSchedule => "follow_up_schedule",
        }
    }

    pub fn draft_for(body_chars: usize) -> Self {
        if body_chars < SHORT_DRAFT_MAX_CHARS {
            Self::EmailDraftShort
        } else {
            Self::EmailDraftLong
        }
    }

    pub fn research_for(deep: bool) -> Self {
        if deep {
            Self::SenderResearchDeep
        } else {
            Self::SenderResearchBasic
        }
    }
}

/// action_type tag recorded on monthly-reset audit transactions.
pub const RESET_ACTION_TYPE: &str = "monthly_reset";
/// action_type tag recorded on plain grants.
pub const GRANT_ACTION_TYPE: &str = "credit_grant";

#[derive(Debug, thiserror::Error)]
pub enum CreditsError {
    #[error("insufficient credits: {available} available, {requested} requested")]
    InsufficientCredits { available: i64, requested: i64 },
    #[error("no credit balance for user {user_id} in org {org_id}")]
    BalanceNotFound { user_id: Uuid, org_id: Uuid },
    #[error("credit amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("conflicting ledger write")]
    WriteConflict,
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl From<diesel::result::Error> for CreditsError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::SerializationFailure,
                _,
            ) => Self::WriteConflict,
            other => Self::Storage(other.to_string()),
        }
    }
}
