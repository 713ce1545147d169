use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::credits::authority::CreditService;
use crate::credits::gate::ActionGate;
use crate::credits::{ActionKind, CreditsError};
use crate::email::{EmailFetcher, MessageClassifier, MessageSender, MessageSummary, OutboundMessage};
use crate::scheduler::{due, DigestSchedule, FollowUpKind, FollowUpSchedule, ScheduleStore, SchedulerError};

/// Per-run tally logged after each job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

fn render_digest(schedule: &DigestSchedule, summaries: &[MessageSummary]) -> OutboundMessage {
    let mut body = format!(
        "Your {} digest ({} messages)\n\n",
        schedule.criteria_type,
        summaries.len()
    );
    for summary in summaries {
        body.push_str(&format!(
            "From: {}\nSubject: {}\n{}\n\n",
            summary.from_email, summary.subject, summary.summary
        ));
    }
    OutboundMessage {
        to: schedule.recipient_email.clone(),
        subject: format!("Inbox digest: {}", schedule.criteria_type),
        body,
    }
}

fn render_follow_up(follow_up: &FollowUpSchedule) -> OutboundMessage {
    let body = follow_up
        .template_message
        .clone()
        .unwrap_or_else(|| default_follow_up_body(follow_up.kind).to_string());
    OutboundMessage {
        to: follow_up.recipient_email.clone(),
        subject: "Following up".to_string(),
        body,
    }
}

fn default_follow_up_body(kind: FollowUpKind) -> &'static str {
    match kind {
        FollowUpKind::Reminder => {
            "Just a quick reminder about my earlier note. Happy to answer any questions."
        }
        FollowUpKind::CheckIn => {
            "Checking in to see whether you had a chance to look at my last message."
        }
        FollowUpKind::Closing => {
            "Closing the loop on this thread. Feel free to reach out if anything changes."
        }
        FollowUpKind::Custom => "Following up on my earlier message.",
    }
}

/// Send every due digest. An empty summary batch still marks the run so the
/// entry does not refire within the same window.
pub async fn run_digest_job(
    store: &dyn ScheduleStore,
    fetcher: &dyn EmailFetcher,
    sender: &dyn MessageSender,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<JobReport, SchedulerError> {
    let window = Duration::minutes(config.digest_window_minutes);
    let cooldown = Duration::hours(config.digest_cooldown_hours);
    let mut report = JobReport::default();

    for schedule in store.active_digests().await? {
        if !due::digest_due(&schedule, now, window, cooldown) {
            continue;
        }

        let Some(account) = store.account(schedule.account_id).await? else {
            warn!(
                "digest {} references missing account {}",
                schedule.id, schedule.account_id
            );
            report.skipped += 1;
            continue;
        };
        if !account.is_active {
            report.skipped += 1;
            continue;
        }

        let next_run = due::next_digest_run(&schedule, now);
        let summaries = match fetcher
            .fetch_and_summarize(&account, &schedule.criteria_type, config.digest_batch_size)
            .await
        {
            Ok(summaries) => summaries,
            Err(e) => {
                error!("digest {} fetch failed: {}", schedule.id, e);
                report.failed += 1;
                continue;
            }
        };

        if summaries.is_empty() {
            info!("digest {}: no messages matched, skipping send", schedule.id);
            store.mark_digest_run(schedule.id, now, next_run).await?;
            report.skipped += 1;
            continue;
        }

        match sender.send(&render_digest(&schedule, &summaries)).await {
            Ok(()) => {
                store.mark_digest_run(schedule.id, now, next_run).await?;
                report.processed += 1;
            }
            Err(e) => {
                // last_run_at stays untouched; the entry can retry while its
                // window is still open, otherwise it waits for the next day.
                error!("digest {} send failed: {}", schedule.id, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Dispatch every due follow-up. Failures count against the entry's retry
/// budget; exhausted entries are cancelled by the store.
pub async fn run_follow_up_job(
    store: &dyn ScheduleStore,
    sender: &dyn MessageSender,
    now: DateTime<Utc>,
) -> Result<JobReport, SchedulerError> {
    let mut report = JobReport::default();

    for follow_up in store.due_follow_ups(now).await? {
        match sender.send(&render_follow_up(&follow_up)).await {
            Ok(()) => {
                store.complete_follow_up(follow_up.id, now).await?;
                report.processed += 1;
            }
            Err(e) => {
                let updated = store
                    .record_follow_up_failure(follow_up.id, now, &e.to_string())
                    .await?;
                if updated.is_cancelled {
                    error!(
                        "follow-up {} cancelled after {} attempts: {}",
                        updated.id, updated.retry_count, e
                    );
                } else {
                    warn!(
                        "follow-up {} failed (attempt {}/{}): {}",
                        updated.id, updated.retry_count, updated.max_retries, e
                    );
                }
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Pull new mail for every connected account and classify each message
/// through the gate. Classification is billed per message; an exhausted
/// balance stops classification for that account until credits return.
pub async fn run_fetch_job(
    store: &dyn ScheduleStore,
    fetcher: &dyn EmailFetcher,
    classifier: &dyn MessageClassifier,
    gate: &ActionGate,
    lookback_hours: i64,
    now: DateTime<Utc>,
) -> Result<JobReport, SchedulerError> {
    let mut report = JobReport::default();

    for account in store.active_accounts().await? {
        let after = account
            .last_fetched_at
            .unwrap_or(now - Duration::hours(lookback_hours));

        let messages = match fetcher.fetch_new(&account, after).await {
            Ok(messages) => messages,
            Err(e) => {
                error!("fetch failed for account {}: {}", account.address, e);
                report.failed += 1;
                continue;
            }
        };

        for (idx, message) in messages.iter().enumerate() {
            let subject = message.subject.as_deref().unwrap_or("(no subject)");
            let outcome = gate
                .run(
                    account.user_id,
                    account.org_id,
                    ActionKind::EmailClassification,
                    &format!("Classified email: {}", subject),
                    classifier.classify(message),
                )
                .await;

            match outcome {
                Ok(gated) => {
                    if gated.succeeded() {
                        report.processed += 1;
                    } else {
                        // Charged but the classifier errored; the message
                        // stays unclassified and the charge stands.
                        report.failed += 1;
                    }
                }
                Err(CreditsError::InsufficientCredits { available, .. }) => {
                    warn!(
                        "classification stopped for {}: {} credits left",
                        account.address, available
                    );
                    report.skipped += messages.len() - idx;
                    break;
                }
                Err(e) => {
                    error!("classification charge failed for {}: {}", account.address, e);
                    report.failed += 1;
                }
            }
        }

        store.mark_account_fetched(account.id, now).await?;
    }

    Ok(report)
}

/// Reset every balance whose reset timestamp has passed. A failed reset is
/// logged and left due so the next run picks it up again.
pub async fn run_reset_job(
    credits: &CreditService,
    now: DateTime<Utc>,
) -> Result<JobReport, SchedulerError> {
    let mut report = JobReport::default();

    for balance in credits.balances_due_for_reset(now).await? {
        match credits
            .reset_monthly(balance.user_id, balance.org_id, balance.subscription_tier)
            .await
        {
            Ok(_) => report.processed += 1,
            Err(e) => {
                error!(
                    "monthly reset failed for user {} org {}: {}",
                    balance.user_id, balance.org_id, e
                );
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::MemoryLedger;
    use crate::email::{
        CapabilityError, Classification, EmailAccount, EmailCategory, InboundMessage,
    };
    use crate::scheduler::MemoryScheduleStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, m, 0).unwrap()
    }

    struct StubFetcher {
        messages: Vec<InboundMessage>,
        summaries: Vec<MessageSummary>,
        fail: bool,
    }

    #[async_trait]
    impl EmailFetcher for StubFetcher {
        async fn fetch_new(
            &self,
            _account: &EmailAccount,
            _after: DateTime<Utc>,
        ) -> Result<Vec<InboundMessage>, CapabilityError> {
            if self.fail {
                return Err(CapabilityError::AuthRevoked);
            }
            Ok(self.messages.clone())
        }

        async fn fetch_and_summarize(
            &self,
            _account: &EmailAccount,
            _criteria_type: &str,
            _max_results: usize,
        ) -> Result<Vec<MessageSummary>, CapabilityError> {
            if self.fail {
                return Err(CapabilityError::AuthRevoked);
            }
            Ok(self.summaries.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutboundMessage>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, message: &OutboundMessage) -> Result<(), CapabilityError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CapabilityError::Upstream("smtp 451".to_string()));
            }
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    struct StubClassifier;

    #[async_trait]
    impl MessageClassifier for StubClassifier {
        async fn classify(
            &self,
            _message: &InboundMessage,
        ) -> Result<Classification, CapabilityError> {
            Ok(Classification {
                category: EmailCategory::Fyi,
                confidence_score: 0.9,
                reasoning: None,
            })
        }
    }

    fn account(user: Uuid, org: Uuid) -> EmailAccount {
        let now = utc(15, 0, 0);
        EmailAccount {
            id: Uuid::new_v4(),
            user_id: user,
            org_id: org,
            address: "owner@example.com".to_string(),
            refresh_token: "tok".to_string(),
            is_active: true,
            last_fetched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn digest(account_id: Uuid) -> DigestSchedule {
        let now = utc(1, 0, 0);
        DigestSchedule {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            account_id,
            recipient_email: "owner@example.com".to_string(),
            criteria_type: "unread".to_string(),
            schedule_time: "09:00".to_string(),
            time_zone: "UTC".to_string(),
            is_active: true,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn message(subject: &str) -> InboundMessage {
        InboundMessage {
            provider_message_id: Uuid::new_v4().to_string(),
            provider_thread_id: "t1".to_string(),
            subject: Some(subject.to_string()),
            from_email: "sender@example.com".to_string(),
            from_name: None,
            body_plain: Some("hello".to_string()),
            received_at: utc(15, 8, 0),
        }
    }

    fn follow_up(user: Uuid, org: Uuid, at: DateTime<Utc>) -> FollowUpSchedule {
        FollowUpSchedule {
            id: Uuid::new_v4(),
            email_id: Uuid::new_v4(),
            user_id: user,
            org_id: org,
            recipient_email: "prospect@example.com".to_string(),
            kind: FollowUpKind::CheckIn,
            template_message: None,
            scheduled_time: at,
            is_completed: false,
            completed_at: None,
            is_cancelled: false,
            cancelled_at: None,
            cancellation_reason: None,
            retry_count: 0,
            max_retries: 3,
            created_at: at,
            updated_at: at,
        }
    }

    fn credit_service() -> Arc<CreditService> {
        Arc::new(CreditService::new(Arc::new(MemoryLedger::new())))
    }

    #[tokio::test]
    async fn test_digest_dispatch_marks_run() {
        let store = MemoryScheduleStore::new();
        let acct = account(Uuid::new_v4(), Uuid::new_v4());
        let entry = digest(acct.id);
        let entry_id = entry.id;
        store.insert_account(acct).await;
        store.insert_digest(entry).await;

        let fetcher = StubFetcher {
            messages: vec![],
            summaries: vec![MessageSummary {
                subject: "Q2 numbers".to_string(),
                from_email: "cfo@example.com".to_string(),
                summary: "Revenue up 12%".to_string(),
            }],
            fail: false,
        };
        let sender = RecordingSender::default();

        let now = utc(15, 9, 2);
        let report = run_digest_job(&store, &fetcher, &sender, &SchedulerConfig::default(), now)
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("Q2 numbers"));

        let updated = store.digest(entry_id).await.unwrap();
        assert_eq!(updated.last_run_at, Some(now));
        assert_eq!(updated.next_run_at, Some(utc(16, 9, 0)));
    }

    #[tokio::test]
    async fn test_digest_cooldown_prevents_second_send() {
        let store = MemoryScheduleStore::new();
        let acct = account(Uuid::new_v4(), Uuid::new_v4());
        let entry = digest(acct.id);
        store.insert_account(acct).await;
        store.insert_digest(entry).await;

        let fetcher = StubFetcher {
            messages: vec![],
            summaries: vec![MessageSummary {
                subject: "s".to_string(),
                from_email: "f@example.com".to_string(),
                summary: "x".to_string(),
            }],
            fail: false,
        };
        let sender = RecordingSender::default();
        let config = SchedulerConfig::default();

        run_digest_job(&store, &fetcher, &sender, &config, utc(15, 9, 1))
            .await
            .unwrap();
        // A later tick inside the same window must not send twice.
        let report = run_digest_job(&store, &fetcher, &sender, &config, utc(15, 9, 4))
            .await
            .unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(sender.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_digest_empty_batch_marks_run_without_send() {
        let store = MemoryScheduleStore::new();
        let acct = account(Uuid::new_v4(), Uuid::new_v4());
        let entry = digest(acct.id);
        let entry_id = entry.id;
        store.insert_account(acct).await;
        store.insert_digest(entry).await;

        let fetcher = StubFetcher {
            messages: vec![],
            summaries: vec![],
            fail: false,
        };
        let sender = RecordingSender::default();

        let now = utc(15, 9, 0);
        let report = run_digest_job(&store, &fetcher, &sender, &SchedulerConfig::default(), now)
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert!(sender.sent.lock().await.is_empty());
        // The run marker still advances so the window is not retried today.
        assert_eq!(store.digest(entry_id).await.unwrap().last_run_at, Some(now));
    }

    #[tokio::test]
    async fn test_digest_fetch_failure_leaves_entry_due() {
        let store = MemoryScheduleStore::new();
        let acct = account(Uuid::new_v4(), Uuid::new_v4());
        let entry = digest(acct.id);
        let entry_id = entry.id;
        store.insert_account(acct).await;
        store.insert_digest(entry).await;

        let fetcher = StubFetcher {
            messages: vec![],
            summaries: vec![],
            fail: true,
        };
        let sender = RecordingSender::default();

        let report = run_digest_job(
            &store,
            &fetcher,
            &sender,
            &SchedulerConfig::default(),
            utc(15, 9, 0),
        )
        .await
        .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(store.digest(entry_id).await.unwrap().last_run_at, None);
    }

    #[tokio::test]
    async fn test_follow_up_success_completes_entry() {
        let store = MemoryScheduleStore::new();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        let entry = follow_up(user, org, utc(15, 8, 0));
        let id = entry.id;
        store.insert_follow_up(entry).await.unwrap();

        let sender = RecordingSender::default();
        let report = run_follow_up_job(&store, &sender, utc(15, 9, 0))
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        let updated = store.follow_up(id).await.unwrap();
        assert!(updated.is_completed);
        assert_eq!(updated.completed_at, Some(utc(15, 9, 0)));

        let sent = sender.sent.lock().await;
        assert_eq!(sent[0].to, "prospect@example.com");
        assert!(sent[0].body.contains("Checking in"));
    }

    #[tokio::test]
    async fn test_follow_up_retries_then_cancels() {
        let store = MemoryScheduleStore::new();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        let entry = follow_up(user, org, utc(15, 8, 0));
        let id = entry.id;
        store.insert_follow_up(entry).await.unwrap();

        let sender = RecordingSender {
            sent: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(usize::MAX),
        };

        // max_retries = 3: attempts 1..=3 keep the entry retryable, the
        // fourth cancels it, and later runs never select it again.
        for attempt in 1..=4 {
            let report = run_follow_up_job(&store, &sender, utc(15, 9, attempt))
                .await
                .unwrap();
            assert_eq!(report.failed, 1);
        }
        let updated = store.follow_up(id).await.unwrap();
        assert!(updated.is_cancelled);
        assert_eq!(updated.retry_count, 4);

        let report = run_follow_up_job(&store, &sender, utc(15, 10, 0))
            .await
            .unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_fetch_job_classifies_and_charges() {
        let store = MemoryScheduleStore::new();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        let acct = account(user, org);
        let acct_id = acct.id;
        store.insert_account(acct).await;

        let credits = credit_service();
        credits.grant(user, org, 10, None).await.unwrap();
        let gate = ActionGate::new(Arc::clone(&credits));

        let fetcher = StubFetcher {
            messages: vec![message("a"), message("b"), message("c")],
            summaries: vec![],
            fail: false,
        };

        let now = utc(15, 9, 0);
        let report = run_fetch_job(&store, &fetcher, &StubClassifier, &gate, 24, now)
            .await
            .unwrap();

        assert_eq!(report.processed, 3);
        let balance = credits.get_balance(user, org).await.unwrap();
        assert_eq!(balance.available_credits, 7);

        let marked = store.account(acct_id).await.unwrap().unwrap();
        assert_eq!(marked.last_fetched_at, Some(now));
    }

    #[tokio::test]
    async fn test_fetch_job_stops_classifying_when_credits_run_out() {
        let store = MemoryScheduleStore::new();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_account(account(user, org)).await;

        let credits = credit_service();
        credits.grant(user, org, 2, None).await.unwrap();
        let gate = ActionGate::new(Arc::clone(&credits));

        let fetcher = StubFetcher {
            messages: vec![message("a"), message("b"), message("c"), message("d")],
            summaries: vec![],
            fail: false,
        };

        let report = run_fetch_job(&store, &fetcher, &StubClassifier, &gate, 24, utc(15, 9, 0))
            .await
            .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped, 2);
        let balance = credits.get_balance(user, org).await.unwrap();
        assert_eq!(balance.available_credits, 0);
    }

    #[tokio::test]
    async fn test_reset_job_catches_up_due_balances() {
        let credits = credit_service();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        credits.grant(user, org, 400, None).await.unwrap();
        credits
            .try_deduct(user, org, 5, "sender_research_deep", None)
            .await
            .unwrap();

        // Not yet due.
        let report = run_reset_job(&credits, Utc::now()).await.unwrap();
        assert_eq!(report.processed, 0);

        // Two months from now the balance is overdue; one run resets it.
        let later = Utc::now() + Duration::days(62);
        let report = run_reset_job(&credits, later).await.unwrap();
        assert_eq!(report.processed, 1);

        let balance = credits.get_balance(user, org).await.unwrap();
        assert_eq!(balance.available_credits, 400);
        assert_eq!(balance.used_credits, 0);
    }
}
