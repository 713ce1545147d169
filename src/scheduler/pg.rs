use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use uuid::Uuid;

use crate::email::EmailAccount;
use crate::scheduler::{DigestSchedule, FollowUpSchedule, ScheduleStore, SchedulerError};
use crate::shared::models::{DigestScheduleRow, EmailAccountRow, FollowUpScheduleRow};
use crate::shared::utils::DbPool;

/// Postgres-backed schedule store.
pub struct PgScheduleStore {
    pool: DbPool,
}

impl PgScheduleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<PgConnection>>, SchedulerError> {
        self.pool
            .get()
            .map_err(|e| SchedulerError::Storage(e.to_string()))
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn active_digests(&self) -> Result<Vec<DigestSchedule>, SchedulerError> {
        use crate::shared::models::schema::digest_schedules::dsl as ds;

        let mut conn = self.conn()?;
        let rows = ds::digest_schedules
            .filter(ds::is_active.eq(true))
            .load::<DigestScheduleRow>(&mut conn)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_digest_run(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        use crate::shared::models::schema::digest_schedules::dsl as ds;

        let mut conn = self.conn()?;
        diesel::update(ds::digest_schedules.filter(ds::id.eq(id)))
            .set((
                ds::last_run_at.eq(Some(run_at)),
                ds::next_run_at.eq(next_run_at),
                ds::updated_at.eq(run_at),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn due_follow_ups(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FollowUpSchedule>, SchedulerError> {
        use crate::shared::models::schema::follow_up_schedules::dsl as fu;

        let mut conn = self.conn()?;
        let rows = fu::follow_up_schedules
            .filter(fu::scheduled_time.le(now))
            .filter(fu::is_completed.eq(false))
            .filter(fu::is_cancelled.eq(false))
            .order(fu::scheduled_time.asc())
            .load::<FollowUpScheduleRow>(&mut conn)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_follow_up(
        &self,
        follow_up: FollowUpSchedule,
    ) -> Result<FollowUpSchedule, SchedulerError> {
        use crate::shared::models::schema::follow_up_schedules::dsl as fu;

        let mut conn = self.conn()?;
        let row = FollowUpScheduleRow::from(&follow_up);
        let inserted = diesel::insert_into(fu::follow_up_schedules)
            .values(&row)
            .get_result::<FollowUpScheduleRow>(&mut conn)?;
        Ok(inserted.into())
    }

    async fn count_open_follow_ups(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<u32, SchedulerError> {
        use crate::shared::models::schema::follow_up_schedules::dsl as fu;

        let mut conn = self.conn()?;
        let count: i64 = fu::follow_up_schedules
            .filter(fu::user_id.eq(user_id))
            .filter(fu::org_id.eq(org_id))
            .filter(fu::is_completed.eq(false))
            .filter(fu::is_cancelled.eq(false))
            .count()
            .get_result(&mut conn)?;
        Ok(count as u32)
    }

    async fn complete_follow_up(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        use crate::shared::models::schema::follow_up_schedules::dsl as fu;

        let mut conn = self.conn()?;
        diesel::update(fu::follow_up_schedules.filter(fu::id.eq(id)))
            .set((
                fu::is_completed.eq(true),
                fu::completed_at.eq(Some(at)),
                fu::updated_at.eq(at),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn record_follow_up_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<FollowUpSchedule, SchedulerError> {
        use crate::shared::models::schema::follow_up_schedules::dsl as fu;

        let mut conn = self.conn()?;
        // The retry/cancel transition lives on the domain type; load under a
        // row lock so concurrent failure reports cannot lose an attempt.
        let row = conn.transaction::<FollowUpScheduleRow, diesel::result::Error, _>(|conn| {
            let current = fu::follow_up_schedules
                .filter(fu::id.eq(id))
                .for_update()
                .first::<FollowUpScheduleRow>(conn)?;

            let mut entry = FollowUpSchedule::from(current);
            entry.record_failure(at, reason);
            let row = FollowUpScheduleRow::from(&entry);

            diesel::update(fu::follow_up_schedules.filter(fu::id.eq(id)))
                .set((
                    fu::retry_count.eq(row.retry_count),
                    fu::is_cancelled.eq(row.is_cancelled),
                    fu::cancelled_at.eq(row.cancelled_at),
                    fu::cancellation_reason.eq(row.cancellation_reason.clone()),
                    fu::updated_at.eq(at),
                ))
                .execute(conn)?;
            Ok(row)
        })?;
        Ok(row.into())
    }

    async fn active_accounts(&self) -> Result<Vec<EmailAccount>, SchedulerError> {
        use crate::shared::models::schema::email_accounts::dsl as ea;

        let mut conn = self.conn()?;
        let rows = ea::email_accounts
            .filter(ea::is_active.eq(true))
            .load::<EmailAccountRow>(&mut conn)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn account(&self, id: Uuid) -> Result<Option<EmailAccount>, SchedulerError> {
        use crate::shared::models::schema::email_accounts::dsl as ea;

        let mut conn = self.conn()?;
        let row = ea::email_accounts
            .filter(ea::id.eq(id))
            .first::<EmailAccountRow>(&mut conn)
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn mark_account_fetched(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        use crate::shared::models::schema::email_accounts::dsl as ea;

        let mut conn = self.conn()?;
        diesel::update(ea::email_accounts.filter(ea::id.eq(id)))
            .set((ea::last_fetched_at.eq(Some(at)), ea::updated_at.eq(at)))
            .execute(&mut conn)?;
        Ok(())
    }
}
