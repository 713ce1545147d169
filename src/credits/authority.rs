use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::credits::{
    CreditBalance, CreditTransaction, CreditsError, LedgerDelta, LedgerStore, SubscriptionTier,
    GRANT_ACTION_TYPE, RESET_ACTION_TYPE,
};

const WRITE_CONFLICT_ATTEMPTS: u32 = 3;

/// Result of replaying the transaction log against the stored balance.
#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub spent_since_reset: i64,
    pub granted_since_reset: i64,
    pub balance: CreditBalance,
    pub consistent: bool,
}

/// Single source of truth for affordability checks. All spends, grants and
/// resets go through here; write conflicts from the store are retried
/// internally and never surfaced to callers.
pub struct CreditService {
    ledger: Arc<dyn LedgerStore>,
}

impl CreditService {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    async fn apply_with_retry(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        delta: LedgerDelta,
        action_type: &str,
        description: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<CreditBalance, CreditsError> {
        let mut attempt = 0;
        loop {
            match self
                .ledger
                .apply_delta(
                    user_id,
                    org_id,
                    delta,
                    action_type,
                    description.clone(),
                    metadata.clone(),
                )
                .await
            {
                Err(CreditsError::WriteConflict) if attempt < WRITE_CONFLICT_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(
                        "ledger write conflict for user {} org {}, retry {}",
                        user_id,
                        org_id,
                        attempt
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(20 * attempt as u64))
                        .await;
                }
                other => return other,
            }
        }
    }

    /// Atomically check-and-deduct `cost` credits. A rejected spend mutates
    /// nothing and writes no transaction row.
    pub async fn try_deduct(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        cost: i64,
        action_type: &str,
        description: Option<String>,
    ) -> Result<CreditBalance, CreditsError> {
        if cost <= 0 {
            return Err(CreditsError::InvalidAmount(cost));
        }
        let balance = self
            .apply_with_retry(
                user_id,
                org_id,
                LedgerDelta::Spend { cost },
                action_type,
                description,
                json!({}),
            )
            .await?;
        tracing::debug!(
            "deducted {} credits for {} (user {}, org {}), {} remaining",
            cost,
            action_type,
            user_id,
            org_id,
            balance.available_credits
        );
        Ok(balance)
    }

    /// Add credits to a pair, creating the balance (free tier) on first use.
    pub async fn grant(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        amount: i64,
        description: Option<String>,
    ) -> Result<CreditBalance, CreditsError> {
        if amount <= 0 {
            return Err(CreditsError::InvalidAmount(amount));
        }
        self.apply_with_retry(
            user_id,
            org_id,
            LedgerDelta::Grant { amount },
            GRANT_ACTION_TYPE,
            description,
            json!({}),
        )
        .await
    }

    /// Overwrite the balance with the tier's monthly allotment. Unused
    /// credits are dropped, used_credits restarts at zero, and the reset
    /// timestamp advances one month.
    pub async fn reset_monthly(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        tier: SubscriptionTier,
    ) -> Result<CreditBalance, CreditsError> {
        let balance = self
            .apply_with_retry(
                user_id,
                org_id,
                LedgerDelta::Reset { tier },
                RESET_ACTION_TYPE,
                Some(format!("Monthly reset to {} allotment", tier)),
                json!({ "tier": tier.as_str() }),
            )
            .await?;
        tracing::info!(
            "reset credits for user {} org {} to {} ({})",
            user_id,
            org_id,
            balance.available_credits,
            tier
        );
        Ok(balance)
    }

    pub async fn get_balance(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<CreditBalance, CreditsError> {
        self.ledger.get_balance(user_id, org_id).await
    }

    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Vec<CreditTransaction>, CreditsError> {
        self.ledger.list_transactions(user_id, org_id).await
    }

    pub async fn balances_due_for_reset(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditBalance>, CreditsError> {
        self.ledger.balances_due_for_reset(now).await
    }

    /// Replay the transaction log since the most recent reset and compare it
    /// to the stored balance. The log is the source of truth if they ever
    /// diverge.
    pub async fn reconcile(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<ReconciliationReport, CreditsError> {
        let balance = self.ledger.get_balance(user_id, org_id).await?;
        let transactions = self.ledger.list_transactions(user_id, org_id).await?;

        let since_reset = transactions
            .iter()
            .rposition(|tx| tx.action_type == RESET_ACTION_TYPE)
            .map(|idx| &transactions[idx..])
            .unwrap_or(&transactions[..]);

        let spent: i64 = since_reset
            .iter()
            .filter(|tx| tx.credits_used > 0)
            .map(|tx| tx.credits_used)
            .sum();
        let granted: i64 = since_reset
            .iter()
            .filter(|tx| tx.credits_used < 0)
            .map(|tx| -tx.credits_used)
            .sum();

        let consistent = spent == balance.used_credits
            && granted == balance.total_credits
            && balance.available_credits == balance.total_credits - balance.used_credits;

        Ok(ReconciliationReport {
            user_id,
            org_id,
            spent_since_reset: spent,
            granted_since_reset: granted,
            balance,
            consistent,
        })
    }
}
