use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::credits::{CreditBalance, CreditTransaction, CreditsError, SubscriptionTier};

/// One ledger mutation. Every variant is applied as a single atomic step:
/// the balance change and the transaction append happen together or not at
/// all.
#[derive(Debug, Clone, Copy)]
pub enum LedgerDelta {
    /// Deduct `cost` if available_credits covers it; reject otherwise.
    Spend { cost: i64 },
    /// Add `amount` to total and available. Creates the balance if absent.
    Grant { amount: i64 },
    /// Overwrite the balance with the tier's monthly allotment and advance
    /// credits_reset_at by one month. Unused credits do not roll over.
    Reset { tier: SubscriptionTier },
}

/// Durable storage for credit balances and their transaction log, keyed by
/// (user_id, org_id). `apply_delta` is the sole mutation entry point; callers
/// never read-modify-write. Implementations must make concurrent spends
/// against the same key linearizable.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_balance(&self, user_id: Uuid, org_id: Uuid)
        -> Result<CreditBalance, CreditsError>;

    async fn apply_delta(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        delta: LedgerDelta,
        action_type: &str,
        description: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<CreditBalance, CreditsError>;

    async fn list_transactions(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Vec<CreditTransaction>, CreditsError>;

    async fn balances_due_for_reset(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditBalance>, CreditsError>;
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<(Uuid, Uuid), CreditBalance>,
    transactions: Vec<CreditTransaction>,
}

/// In-process ledger. All mutation happens under the single write lock, so
/// per-key mutation is linearizable by construction. Used by tests and by
/// single-node deployments that run without Postgres.
pub struct MemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn advance_one_month(at: DateTime<Utc>) -> DateTime<Utc> {
    at.checked_add_months(Months::new(1))
        .unwrap_or_else(|| at + Duration::days(30))
}

fn new_balance(user_id: Uuid, org_id: Uuid, now: DateTime<Utc>) -> CreditBalance {
    CreditBalance {
        id: Uuid::new_v4(),
        user_id,
        org_id,
        total_credits: 0,
        used_credits: 0,
        available_credits: 0,
        subscription_tier: SubscriptionTier::Free,
        credits_reset_at: advance_one_month(now),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_balance(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<CreditBalance, CreditsError> {
        let state = self.state.read().await;
        state
            .balances
            .get(&(user_id, org_id))
            .cloned()
            .ok_or(CreditsError::BalanceNotFound { user_id, org_id })
    }

    async fn apply_delta(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        delta: LedgerDelta,
        action_type: &str,
        description: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<CreditBalance, CreditsError> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let credits_used = match delta {
            LedgerDelta::Spend { cost } => {
                let balance = state
                    .balances
                    .get_mut(&(user_id, org_id))
                    .ok_or(CreditsError::BalanceNotFound { user_id, org_id })?;
                if balance.available_credits < cost {
                    return Err(CreditsError::InsufficientCredits {
                        available: balance.available_credits,
                        requested: cost,
                    });
                }
                balance.available_credits -= cost;
                balance.used_credits += cost;
                balance.updated_at = now;
                cost
            }
            LedgerDelta::Grant { amount } => {
                let balance = state
                    .balances
                    .entry((user_id, org_id))
                    .or_insert_with(|| new_balance(user_id, org_id, now));
                balance.total_credits += amount;
                balance.available_credits += amount;
                balance.updated_at = now;
                -amount
            }
            LedgerDelta::Reset { tier } => {
                let allotment = tier.monthly_credits();
                let balance = state
                    .balances
                    .get_mut(&(user_id, org_id))
                    .ok_or(CreditsError::BalanceNotFound { user_id, org_id })?;
                balance.total_credits = allotment;
                balance.used_credits = 0;
                balance.available_credits = allotment;
                balance.subscription_tier = tier;
                balance.credits_reset_at = advance_one_month(balance.credits_reset_at);
                balance.updated_at = now;
                -allotment
            }
        };

        state.transactions.push(CreditTransaction {
            id: Uuid::new_v4(),
            user_id,
            org_id,
            action_type: action_type.to_string(),
            credits_used,
            description,
            metadata,
            created_at: now,
        });

        Ok(state.balances[&(user_id, org_id)].clone())
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Vec<CreditTransaction>, CreditsError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id && tx.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn balances_due_for_reset(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditBalance>, CreditsError> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .values()
            .filter(|b| b.credits_reset_at <= now)
            .cloned()
            .collect())
    }
}
