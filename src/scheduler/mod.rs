use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::credits::authority::CreditService;
use crate::credits::gate::ActionGate;
use crate::credits::{ActionKind, CreditsError, SubscriptionTier};
use crate::email::{EmailFetcher, MessageClassifier, MessageSender};

pub mod due;
pub mod jobs;
pub mod pg;
pub mod store;

pub use jobs::JobReport;
pub use pg::PgScheduleStore;
pub use store::{MemoryScheduleStore, ScheduleStore};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpKind {
    Reminder,
    CheckIn,
    Closing,
    #[default]
    Custom,
}

impl FollowUpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::CheckIn => "check_in",
            Self::Closing => "closing",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reminder" => Some(Self::Reminder),
            "check_in" => Some(Self::CheckIn),
            "closing" => Some(Self::Closing),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Observable lifecycle state of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Due,
    Completed,
    Cancelled,
}

/// A recurring daily digest: at schedule_time in the entry's timezone,
/// summarize the linked mailbox and send the digest to the recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSchedule {
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

/// A one-shot follow-up message due at an absolute time. Dispatch failures
/// are retried until retry_count exceeds max_retries, then the entry is
/// cancelled and never selected again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpSchedule {
    pub id: Uuid,
    pub email_id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub recipient_email: String,
    pub kind: FollowUpKind,
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

impl FollowUpSchedule {
    pub fn state(&self, now: DateTime<Utc>) -> EntryState {
        if self.is_cancelled {
            EntryState::Cancelled
        } else if self.is_completed {
            EntryState::Completed
        } else if self.scheduled_time <= now {
            EntryState::Due
        } else {
            EntryState::Pending
        }
    }

    /// Record one failed dispatch attempt. The entry stays retryable until
    /// the attempt count exceeds max_retries, then it is cancelled with the
    /// last failure as the reason.
    pub fn record_failure(&mut self, now: DateTime<Utc>, reason: &str) {
        self.retry_count += 1;
        self.updated_at = now;
        if self.retry_count > self.max_retries {
            self.is_cancelled = true;
            self.cancelled_at = Some(now);
            self.cancellation_reason = Some(format!(
                "retries exhausted after {} attempts: {}",
                self.retry_count, reason
            ));
        }
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.is_completed = true;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Request to create a follow-up. Creation is a gated, credit-consuming
/// action and is capped per subscription tier.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFollowUpRequest {
    pub email_id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub recipient_email: String,
    pub kind: FollowUpKind,
    pub template_message: Option<String>,
    pub scheduled_time: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("schedule storage error: {0}")]
    Storage(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("invalid cadence expression {expr:?}: {reason}")]
    InvalidCadence { expr: String, reason: String },
    #[error("follow-up limit reached for tier {tier}: {limit}")]
    FollowUpLimitReached { tier: SubscriptionTier, limit: u32 },
    #[error(transparent)]
    Credits(#[from] CreditsError),
}

impl From<diesel::result::Error> for SchedulerError {
    fn from(e: diesel::result::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    FetchAccounts,
    Digests,
    FollowUps,
    MonthlyReset,
}

struct PeriodicJob {
    name: &'static str,
    kind: JobKind,
    schedule: Schedule,
    last_run: Option<DateTime<Utc>>,
}

impl PeriodicJob {
    fn new(name: &'static str, kind: JobKind, expr: &str) -> Result<Self, SchedulerError> {
        let schedule = Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCadence {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name,
            kind,
            schedule,
            last_run: None,
        })
    }

    /// Due on the first tick after start, then whenever a cron firing time
    /// has passed since the last run.
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => self
                .schedule
                .after(&last)
                .next()
                .map(|t| t <= now)
                .unwrap_or(false),
        }
    }
}

/// Periodic driver for background work: mailbox fetches, daily digests,
/// follow-up dispatch and monthly credit resets. All due decisions are made
/// from the `now` passed into `tick`, so a tick is deterministic.
pub struct SchedulerService {
    store: Arc<dyn ScheduleStore>,
    credits: Arc<CreditService>,
    gate: Arc<ActionGate>,
    fetcher: Option<Arc<dyn EmailFetcher>>,
    sender: Option<Arc<dyn MessageSender>>,
    classifier: Option<Arc<dyn MessageClassifier>>,
    config: SchedulerConfig,
    jobs: Vec<PeriodicJob>,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        credits: Arc<CreditService>,
        gate: Arc<ActionGate>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let jobs = vec![
            PeriodicJob::new("fetch_accounts", JobKind::FetchAccounts, &config.fetch_cron)?,
            PeriodicJob::new("digests", JobKind::Digests, &config.digest_cron)?,
            PeriodicJob::new("follow_ups", JobKind::FollowUps, &config.follow_up_cron)?,
            PeriodicJob::new("monthly_reset", JobKind::MonthlyReset, &config.reset_cron)?,
        ];
        Ok(Self {
            store,
            credits,
            gate,
            fetcher: None,
            sender: None,
            classifier: None,
            config,
            jobs,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn EmailFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn MessageClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Create a follow-up: enforce the tier cap, charge one credit, insert.
    /// The insert runs behind the gate, so a storage failure after the
    /// charge keeps the charge.
    pub async fn schedule_follow_up(
        &self,
        request: CreateFollowUpRequest,
        now: DateTime<Utc>,
    ) -> Result<FollowUpSchedule, SchedulerError> {
        let balance = self
            .credits
            .get_balance(request.user_id, request.org_id)
            .await?;
        let tier = balance.subscription_tier;
        let limit = tier.max_follow_ups();
        let open = self
            .store
            .count_open_follow_ups(request.user_id, request.org_id)
            .await?;
        if open >= limit {
            return Err(SchedulerError::FollowUpLimitReached { tier, limit });
        }

        let follow_up = FollowUpSchedule {
            id: Uuid::new_v4(),
            email_id: request.email_id,
            user_id: request.user_id,
            org_id: request.org_id,
            recipient_email: request.recipient_email.clone(),
            kind: request.kind,
            template_message: request.template_message.clone(),
            scheduled_time: request.scheduled_time,
            is_completed: false,
            completed_at: None,
            is_cancelled: false,
            cancelled_at: None,
            cancellation_reason: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        };

        let description = format!("Scheduled {} follow-up", request.kind.as_str());
        let outcome = self
            .gate
            .run(
                request.user_id,
                request.org_id,
                ActionKind::FollowUpSchedule,
                &description,
                self.store.insert_follow_up(follow_up),
            )
            .await?;
        outcome.result
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let due: Vec<(usize, JobKind, &'static str)> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_due(now))
            .map(|(idx, job)| (idx, job.kind, job.name))
            .collect();

        for (idx, kind, name) in due {
            match self.run_job(kind, now).await {
                Ok(report) => {
                    if report.processed > 0 || report.failed > 0 {
                        info!(
                            "{} job: {} processed, {} failed, {} skipped",
                            name, report.processed, report.failed, report.skipped
                        );
                    }
                    self.jobs[idx].last_run = Some(now);
                }
                Err(e) => {
                    // last_run stays unset so the job fires again next tick.
                    error!("{} job failed: {}", name, e);
                }
            }
        }
    }

    async fn run_job(&self, kind: JobKind, now: DateTime<Utc>) -> Result<JobReport, SchedulerError> {
        match kind {
            JobKind::FetchAccounts => {
                let (Some(fetcher), Some(classifier)) = (&self.fetcher, &self.classifier) else {
                    debug!("fetch job skipped: fetch/classify capabilities not configured");
                    return Ok(JobReport::default());
                };
                jobs::run_fetch_job(
                    self.store.as_ref(),
                    fetcher.as_ref(),
                    classifier.as_ref(),
                    &self.gate,
                    self.config.fetch_lookback_hours,
                    now,
                )
                .await
            }
            JobKind::Digests => {
                let (Some(fetcher), Some(sender)) = (&self.fetcher, &self.sender) else {
                    debug!("digest job skipped: email capabilities not configured");
                    return Ok(JobReport::default());
                };
                jobs::run_digest_job(
                    self.store.as_ref(),
                    fetcher.as_ref(),
                    sender.as_ref(),
                    &self.config,
                    now,
                )
                .await
            }
            JobKind::FollowUps => {
                let Some(sender) = &self.sender else {
                    debug!("follow-up job skipped: send capability not configured");
                    return Ok(JobReport::default());
                };
                jobs::run_follow_up_job(self.store.as_ref(), sender.as_ref(), now).await
            }
            JobKind::MonthlyReset => jobs::run_reset_job(&self.credits, now).await,
        }
    }

    pub async fn spawn(mut self) -> Result<(), SchedulerError> {
        info!("Scheduler started, tick every {}s", self.config.tick_secs);
        if self.fetcher.is_none() {
            warn!("no fetch capability configured, mailbox fetch and digests disabled");
        }
        if self.sender.is_none() {
            warn!("no send capability configured, digests and follow-ups disabled");
        }

        let mut ticker = interval(TokioDuration::from_secs(self.config.tick_secs));
        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }
}
