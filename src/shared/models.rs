use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credits::{CreditBalance, CreditTransaction, SubscriptionTier};
use crate::email::EmailAccount;
use crate::scheduler::{DigestSchedule, FollowUpKind, FollowUpSchedule};

#[derive(Debug, Clone, Queryable, Insertable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = user_credits)]
pub struct UserCreditRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub total_credits: i64,
    pub used_credits: i64,
    pub available_credits: i64,
    pub subscription_tier: String,
    pub credits_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserCreditRow> for CreditBalance {
    fn from(row: UserCreditRow) -> Self {
        CreditBalance {
            id: row.id,
            user_id: row.user_id,
            org_id: row.org_id,
            total_credits: row.total_credits,
            used_credits: row.used_credits,
            available_credits: row.available_credits,
            subscription_tier: SubscriptionTier::parse(&row.subscription_tier)
                .unwrap_or_default(),
            credits_reset_at: row.credits_reset_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<&CreditBalance> for UserCreditRow {
    fn from(balance: &CreditBalance) -> Self {
        UserCreditRow {
            id: balance.id,
            user_id: balance.user_id,
            org_id: balance.org_id,
            total_credits: balance.total_credits,
            used_credits: balance.used_credits,
            available_credits: balance.available_credits,
            subscription_tier: balance.subscription_tier.as_str().to_string(),
            credits_reset_at: balance.credits_reset_at,
            created_at: balance.created_at,
            updated_at: balance.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = credit_transactions)]
pub struct CreditTransactionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub action_type: String,
    pub credits_used: i64,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<CreditTransactionRow> for CreditTransaction {
    fn from(row: CreditTransactionRow) -> Self {
        CreditTransaction {
            id: row.id,
            user_id: row.user_id,
            org_id: row.org_id,
            action_type: row.action_type,
            credits_used: row.credits_used,
            description: row.description,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

impl From<&CreditTransaction> for CreditTransactionRow {
    fn from(tx: &CreditTransaction) -> Self {
        CreditTransactionRow {
            id: tx.id,
            user_id: tx.user_id,
            org_id: tx.org_id,
            action_type: tx.action_type.clone(),
            credits_used: tx.credits_used,
            description: tx.description.clone(),
            metadata: tx.metadata.clone(),
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = digest_schedules)]
pub struct DigestScheduleRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub account_id: Uuid,
    pub recipient_email: String,
    pub criteria_type: String,
    pub schedule_time: String,
    pub time_zone: String,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DigestScheduleRow> for DigestSchedule {
    fn from(row: DigestScheduleRow) -> Self {
        DigestSchedule {
            id: row.id,
            org_id: row.org_id,
            account_id: row.account_id,
            recipient_email: row.recipient_email,
            criteria_type: row.criteria_type,
            schedule_time: row.schedule_time,
            time_zone: row.time_zone,
            is_active: row.is_active,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = follow_up_schedules)]
pub struct FollowUpScheduleRow {
    pub id: Uuid,
    pub email_id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub recipient_email: String,
    pub follow_up_type: String,
    pub template_message: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FollowUpScheduleRow> for FollowUpSchedule {
    fn from(row: FollowUpScheduleRow) -> Self {
        FollowUpSchedule {
            id: row.id,
            email_id: row.email_id,
            user_id: row.user_id,
            org_id: row.org_id,
            recipient_email: row.recipient_email,
            kind: FollowUpKind::parse(&row.follow_up_type).unwrap_or_default(),
            template_message: row.template_message,
            scheduled_time: row.scheduled_time,
            is_completed: row.is_completed,
            completed_at: row.completed_at,
            is_cancelled: row.is_cancelled,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<&FollowUpSchedule> for FollowUpScheduleRow {
    fn from(follow_up: &FollowUpSchedule) -> Self {
        FollowUpScheduleRow {
            id: follow_up.id,
            email_id: follow_up.email_id,
            user_id: follow_up.user_id,
            org_id: follow_up.org_id,
            recipient_email: follow_up.recipient_email.clone(),
            follow_up_type: follow_up.kind.as_str().to_string(),
            template_message: follow_up.template_message.clone(),
            scheduled_time: follow_up.scheduled_time,
            is_completed: follow_up.is_completed,
            completed_at: follow_up.completed_at,
            is_cancelled: follow_up.is_cancelled,
            cancelled_at: follow_up.cancelled_at,
            cancellation_reason: follow_up.cancellation_reason.clone(),
            retry_count: follow_up.retry_count,
            max_retries: follow_up.max_retries,
            created_at: follow_up.created_at,
            updated_at: follow_up.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = email_accounts)]
pub struct EmailAccountRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub address: String,
    pub refresh_token: String,
    pub is_active: bool,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<EmailAccountRow> for EmailAccount {
    fn from(row: EmailAccountRow) -> Self {
        EmailAccount {
            id: row.id,
            user_id: row.user_id,
            org_id: row.org_id,
            address: row.address,
            refresh_token: row.refresh_token,
            is_active: row.is_active,
            last_fetched_at: row.last_fetched_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub mod schema {
    diesel::table! {
        user_credits (id) {
            id -> Uuid,
            user_id -> Uuid,
            org_id -> Uuid,
            total_credits -> Int8,
            used_credits -> Int8,
            available_credits -> Int8,
            subscription_tier -> Varchar,
            credits_reset_at -> Timestamptz,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        credit_transactions (id) {
            id -> Uuid,
            user_id -> Uuid,
            org_id -> Uuid,
            action_type -> Varchar,
            credits_used -> Int8,
            description -> Nullable<Text>,
            metadata -> Jsonb,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        digest_schedules (id) {
            id -> Uuid,
            org_id -> Uuid,
            account_id -> Uuid,
            recipient_email -> Varchar,
            criteria_type -> Varchar,
            schedule_time -> Varchar,
            time_zone -> Varchar,
            is_active -> Bool,
            last_run_at -> Nullable<Timestamptz>,
            next_run_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        follow_up_schedules (id) {
            id -> Uuid,
            email_id -> Uuid,
            user_id -> Uuid,
            org_id -> Uuid,
            recipient_email -> Varchar,
            follow_up_type -> Varchar,
            template_message -> Nullable<Text>,
            scheduled_time -> Timestamptz,
            is_completed -> Bool,
            completed_at -> Nullable<Timestamptz>,
            is_cancelled -> Bool,
            cancelled_at -> Nullable<Timestamptz>,
            cancellation_reason -> Nullable<Text>,
            retry_count -> Int4,
            max_retries -> Int4,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        email_accounts (id) {
            id -> Uuid,
            user_id -> Uuid,
            org_id -> Uuid,
            address -> Varchar,
            refresh_token -> Text,
            is_active -> Bool,
            last_fetched_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }
}

pub use schema::*;
