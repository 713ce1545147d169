use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use uuid::Uuid;

use crate::credits::{
    CreditBalance, CreditTransaction, CreditsError, LedgerDelta, LedgerStore, SubscriptionTier,
};
use crate::shared::models::{CreditTransactionRow, UserCreditRow};
use crate::shared::utils::DbPool;

/// Postgres-backed ledger. Deduction is a single conditional UPDATE so the
/// compare-and-decrement happens inside the database; the transaction row is
/// written in the same database transaction as the balance change.
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<PgConnection>>, CreditsError> {
        self.pool
            .get()
            .map_err(|e| CreditsError::Storage(e.to_string()))
    }
}

fn advance_one_month(at: DateTime<Utc>) -> DateTime<Utc> {
    at.checked_add_months(Months::new(1))
        .unwrap_or_else(|| at + Duration::days(30))
}

fn insert_transaction(
    conn: &mut PgConnection,
    owner: Uuid,
    org: Uuid,
    action: &str,
    credits: i64,
    description: Option<String>,
    metadata: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), diesel::result::Error> {
    use crate::shared::models::schema::credit_transactions::dsl as tx;

    let row = CreditTransactionRow {
        id: Uuid::new_v4(),
        user_id: owner,
        org_id: org,
        action_type: action.to_string(),
        credits_used: credits,
        description,
        metadata,
        created_at: now,
    };
    diesel::insert_into(tx::credit_transactions)
        .values(&row)
        .execute(conn)?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn get_balance(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<CreditBalance, CreditsError> {
        use crate::shared::models::schema::user_credits::dsl as uc;

        let mut conn = self.conn()?;
        let row = uc::user_credits
            .filter(uc::user_id.eq(user_id))
            .filter(uc::org_id.eq(org_id))
            .first::<UserCreditRow>(&mut conn)
            .optional()?
            .ok_or(CreditsError::BalanceNotFound { user_id, org_id })?;
        Ok(row.into())
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
        use crate::shared::models::schema::user_credits::dsl as uc;

        let mut conn = self.conn()?;
        let now = Utc::now();

        let row = conn.transaction::<UserCreditRow, CreditsError, _>(|conn| {
            let (row, credits_used) = match delta {
                LedgerDelta::Spend { cost } => {
                    // Compare-and-decrement in one statement; zero rows means
                    // the balance is missing or cannot cover the cost.
                    let updated = diesel::update(
                        uc::user_credits
                            .filter(uc::user_id.eq(user_id))
                            .filter(uc::org_id.eq(org_id))
                            .filter(uc::available_credits.ge(cost)),
                    )
                    .set((
                        uc::available_credits.eq(uc::available_credits - cost),
                        uc::used_credits.eq(uc::used_credits + cost),
                        uc::updated_at.eq(now),
                    ))
                    .get_result::<UserCreditRow>(conn)
                    .optional()?;

                    match updated {
                        Some(row) => (row, cost),
                        None => {
                            let existing = uc::user_credits
                                .filter(uc::user_id.eq(user_id))
                                .filter(uc::org_id.eq(org_id))
                                .first::<UserCreditRow>(conn)
                                .optional()?;
                            return Err(match existing {
                                Some(row) => CreditsError::InsufficientCredits {
                                    available: row.available_credits,
                                    requested: cost,
                                },
                                None => CreditsError::BalanceNotFound { user_id, org_id },
                            });
                        }
                    }
                }
                LedgerDelta::Grant { amount } => {
                    let fresh = UserCreditRow {
                        id: Uuid::new_v4(),
                        user_id,
                        org_id,
                        total_credits: amount,
                        used_credits: 0,
                        available_credits: amount,
                        subscription_tier: SubscriptionTier::Free.as_str().to_string(),
                        credits_reset_at: advance_one_month(now),
                        created_at: now,
                        updated_at: now,
                    };
                    let row = diesel::insert_into(uc::user_credits)
                        .values(&fresh)
                        .on_conflict((uc::user_id, uc::org_id))
                        .do_update()
                        .set((
                            uc::total_credits.eq(uc::total_credits + amount),
                            uc::available_credits.eq(uc::available_credits + amount),
                            uc::updated_at.eq(now),
                        ))
                        .get_result::<UserCreditRow>(conn)?;
                    (row, -amount)
                }
                LedgerDelta::Reset { tier } => {
                    let current = uc::user_credits
                        .filter(uc::user_id.eq(user_id))
                        .filter(uc::org_id.eq(org_id))
                        .for_update()
                        .first::<UserCreditRow>(conn)
                        .optional()?
                        .ok_or(CreditsError::BalanceNotFound { user_id, org_id })?;

                    let allotment = tier.monthly_credits();
                    let row = diesel::update(uc::user_credits.filter(uc::id.eq(current.id)))
                        .set((
                            uc::total_credits.eq(allotment),
                            uc::used_credits.eq(0_i64),
                            uc::available_credits.eq(allotment),
                            uc::subscription_tier.eq(tier.as_str()),
                            uc::credits_reset_at.eq(advance_one_month(current.credits_reset_at)),
                            uc::updated_at.eq(now),
                        ))
                        .get_result::<UserCreditRow>(conn)?;
                    (row, -allotment)
                }
            };

            insert_transaction(
                conn,
                user_id,
                org_id,
                action_type,
                credits_used,
                description,
                metadata,
                now,
            )?;
            Ok(row)
        })?;

        Ok(row.into())
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Vec<CreditTransaction>, CreditsError> {
        use crate::shared::models::schema::credit_transactions::dsl as tx;

        let mut conn = self.conn()?;
        let rows = tx::credit_transactions
            .filter(tx::user_id.eq(user_id))
            .filter(tx::org_id.eq(org_id))
            .order(tx::created_at.asc())
            .load::<CreditTransactionRow>(&mut conn)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn balances_due_for_reset(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditBalance>, CreditsError> {
        use crate::shared::models::schema::user_credits::dsl as uc;

        let mut conn = self.conn()?;
        let rows = uc::user_credits
            .filter(uc::credits_reset_at.le(now))
            .order(uc::credits_reset_at.asc())
            .load::<UserCreditRow>(&mut conn)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
