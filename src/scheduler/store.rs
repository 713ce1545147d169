use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::email::EmailAccount;
use crate::scheduler::{DigestSchedule, FollowUpSchedule, SchedulerError};

/// Storage for schedule entries and connected accounts. Run markers
/// (last_run_at, completion, retry bookkeeping) are only written through
/// here, after the corresponding dispatch outcome is known.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn active_digests(&self) -> Result<Vec<DigestSchedule>, SchedulerError>;

    async fn mark_digest_run(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError>;

    /// Follow-ups eligible at `now`: scheduled_time reached, not completed,
    /// not cancelled.
    async fn due_follow_ups(&self, now: DateTime<Utc>)
        -> Result<Vec<FollowUpSchedule>, SchedulerError>;

    async fn insert_follow_up(
        &self,
        follow_up: FollowUpSchedule,
    ) -> Result<FollowUpSchedule, SchedulerError>;

    async fn count_open_follow_ups(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<u32, SchedulerError>;

    async fn complete_follow_up(&self, id: Uuid, at: DateTime<Utc>)
        -> Result<(), SchedulerError>;

    /// Record one failed dispatch attempt and return the updated entry,
    /// cancelled when its retries are exhausted.
    async fn record_follow_up_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<FollowUpSchedule, SchedulerError>;

    async fn active_accounts(&self) -> Result<Vec<EmailAccount>, SchedulerError>;

    async fn account(&self, id: Uuid) -> Result<Option<EmailAccount>, SchedulerError>;

    async fn mark_account_fetched(&self, id: Uuid, at: DateTime<Utc>)
        -> Result<(), SchedulerError>;
}

#[derive(Default)]
struct ScheduleState {
    digests: Vec<DigestSchedule>,
    follow_ups: Vec<FollowUpSchedule>,
    accounts: Vec<EmailAccount>,
}

/// In-process schedule store, used by tests and single-node deployments.
pub struct MemoryScheduleStore {
    state: Arc<RwLock<ScheduleState>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ScheduleState::default())),
        }
    }

    pub async fn insert_digest(&self, digest: DigestSchedule) {
        let mut state = self.state.write().await;
        state.digests.push(digest);
    }

    pub async fn insert_account(&self, account: EmailAccount) {
        let mut state = self.state.write().await;
        state.accounts.push(account);
    }

    pub async fn digest(&self, id: Uuid) -> Option<DigestSchedule> {
        let state = self.state.read().await;
        state.digests.iter().find(|d| d.id == id).cloned()
    }

    pub async fn follow_up(&self, id: Uuid) -> Option<FollowUpSchedule> {
        let state = self.state.read().await;
        state.follow_ups.iter().find(|f| f.id == id).cloned()
    }
}

impl Default for MemoryScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn active_digests(&self) -> Result<Vec<DigestSchedule>, SchedulerError> {
        let state = self.state.read().await;
        Ok(state
            .digests
            .iter()
            .filter(|d| d.is_active)
            .cloned()
            .collect())
    }

    async fn mark_digest_run(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        let digest = state
            .digests
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| SchedulerError::Storage(format!("digest {} not found", id)))?;
        digest.last_run_at = Some(run_at);
        digest.next_run_at = next_run_at;
        digest.updated_at = run_at;
        Ok(())
    }

    async fn due_follow_ups(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FollowUpSchedule>, SchedulerError> {
        let state = self.state.read().await;
        Ok(state
            .follow_ups
            .iter()
            .filter(|f| !f.is_completed && !f.is_cancelled && f.scheduled_time <= now)
            .cloned()
            .collect())
    }

    async fn insert_follow_up(
        &self,
        follow_up: FollowUpSchedule,
    ) -> Result<FollowUpSchedule, SchedulerError> {
        let mut state = self.state.write().await;
        state.follow_ups.push(follow_up.clone());
        Ok(follow_up)
    }

    async fn count_open_follow_ups(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<u32, SchedulerError> {
        let state = self.state.read().await;
        Ok(state
            .follow_ups
            .iter()
            .filter(|f| {
                f.user_id == user_id && f.org_id == org_id && !f.is_completed && !f.is_cancelled
            })
            .count() as u32)
    }

    async fn complete_follow_up(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        let follow_up = state
            .follow_ups
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| SchedulerError::Storage(format!("follow-up {} not found", id)))?;
        follow_up.mark_completed(at);
        Ok(())
    }

    async fn record_follow_up_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<FollowUpSchedule, SchedulerError> {
        let mut state = self.state.write().await;
        let follow_up = state
            .follow_ups
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| SchedulerError::Storage(format!("follow-up {} not found", id)))?;
        follow_up.record_failure(at, reason);
        Ok(follow_up.clone())
    }

    async fn active_accounts(&self) -> Result<Vec<EmailAccount>, SchedulerError> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .iter()
            .filter(|a| a.is_active)
            .cloned()
            .collect())
    }

    async fn account(&self, id: Uuid) -> Result<Option<EmailAccount>, SchedulerError> {
        let state = self.state.read().await;
        Ok(state.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn mark_account_fetched(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| SchedulerError::Storage(format!("account {} not found", id)))?;
        account.last_fetched_at = Some(at);
        account.updated_at = at;
        Ok(())
    }
}
