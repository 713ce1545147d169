#[cfg(test)]
mod credit_flow_integration_tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Months, TimeZone, Utc};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use inboxserver::config::SchedulerConfig;
    use inboxserver::credits::authority::CreditService;
    use inboxserver::credits::gate::ActionGate;
    use inboxserver::credits::{ActionKind, CreditsError, MemoryLedger, SubscriptionTier};
    use inboxserver::email::{
        CapabilityError, Classification, EmailAccount, EmailCategory, EmailFetcher,
        InboundMessage, MessageClassifier, MessageSender, MessageSummary, OutboundMessage,
    };
    use inboxserver::scheduler::{jobs, DigestSchedule, MemoryScheduleStore};

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, m, 0).unwrap()
    }

    fn credit_service() -> Arc<CreditService> {
        Arc::new(CreditService::new(Arc::new(MemoryLedger::new())))
    }

    struct FixedFetcher {
        summaries: Vec<MessageSummary>,
        messages: Vec<InboundMessage>,
    }

    #[async_trait]
    impl EmailFetcher for FixedFetcher {
        async fn fetch_new(
            &self,
            _account: &EmailAccount,
            _after: DateTime<Utc>,
        ) -> Result<Vec<InboundMessage>, CapabilityError> {
            Ok(self.messages.clone())
        }

        async fn fetch_and_summarize(
            &self,
            _account: &EmailAccount,
            _criteria_type: &str,
            _max_results: usize,
        ) -> Result<Vec<MessageSummary>, CapabilityError> {
            Ok(self.summaries.clone())
        }
    }

    #[derive(Default)]
    struct CapturingSender {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl MessageSender for CapturingSender {
        async fn send(&self, message: &OutboundMessage) -> Result<(), CapabilityError> {
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    struct FixedClassifier;

    #[async_trait]
    impl MessageClassifier for FixedClassifier {
        async fn classify(
            &self,
            _message: &InboundMessage,
        ) -> Result<Classification, CapabilityError> {
            Ok(Classification {
                category: EmailCategory::Urgent,
                confidence_score: 0.95,
                reasoning: Some("deadline mentioned".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_free_tier_spend_scenario_end_to_end() {
        let credits = credit_service();
        let gate = ActionGate::new(Arc::clone(&credits));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());

        credits.grant(user, org, 400, Some("Onboarding".to_string())).await.unwrap();

        let classify = gate
            .run(user, org, ActionKind::EmailClassification, "Classify", async {
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(classify.credits_remaining, 399);

        let draft = gate
            .run(user, org, ActionKind::EmailDraftShort, "Draft", async {
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(draft.credits_remaining, 396);

        let research = gate
            .run(user, org, ActionKind::SenderResearchBasic, "Research", async {
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(research.credits_remaining, 394);

        let txs = credits.list_transactions(user, org).await.unwrap();
        let spends: Vec<i64> = txs
            .iter()
            .filter(|tx| tx.credits_used > 0)
            .map(|tx| tx.credits_used)
            .collect();
        assert_eq!(spends, vec![1, 3, 2]);

        let report = credits.reconcile(user, org).await.unwrap();
        assert!(report.consistent);
    }

    #[tokio::test]
    async fn test_concurrent_deduction_is_atomic() {
        let credits = credit_service();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        credits.grant(user, org, 5, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let credits = Arc::clone(&credits);
            handles.push(tokio::spawn(async move {
                credits
                    .try_deduct(user, org, 3, "email_draft_short", None)
                    .await
            }));
        }

        let outcomes: Vec<bool> = {
            let mut v = Vec::new();
            for handle in handles {
                v.push(handle.await.unwrap().is_ok());
            }
            v
        };
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

        let balance = credits.get_balance(user, org).await.unwrap();
        assert_eq!(balance.available_credits, 2);
        assert_eq!(balance.used_credits, 3);
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected_without_trace() {
        let credits = credit_service();
        let gate = ActionGate::new(Arc::clone(&credits));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        credits.grant(user, org, 1, None).await.unwrap();

        let result = gate
            .run(user, org, ActionKind::EmailDraftShort, "Draft", async {
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(
            result,
            Err(CreditsError::InsufficientCredits { available: 1, requested: 3 })
        ));

        let balance = credits.get_balance(user, org).await.unwrap();
        assert_eq!(balance.available_credits, 1);
        let spends = credits
            .list_transactions(user, org)
            .await
            .unwrap()
            .into_iter()
            .filter(|tx| tx.credits_used > 0)
            .count();
        assert_eq!(spends, 0);
    }

    #[tokio::test]
    async fn test_monthly_reset_advances_exactly_one_month() {
        let credits = credit_service();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        credits.grant(user, org, 30_000, None).await.unwrap();
        credits
            .try_deduct(user, org, 30_000, "workflow_execution", None)
            .await
            .unwrap();

        let before = credits.get_balance(user, org).await.unwrap();
        let after = credits
            .reset_monthly(user, org, SubscriptionTier::Business)
            .await
            .unwrap();

        assert_eq!(after.total_credits, 30_000);
        assert_eq!(after.used_credits, 0);
        assert_eq!(after.available_credits, 30_000);
        assert_eq!(
            after.credits_reset_at,
            before
                .credits_reset_at
                .checked_add_months(Months::new(1))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_digest_pipeline_with_daily_cooldown() {
        let store = MemoryScheduleStore::new();
        let now = utc(15, 9, 1);

        let account = EmailAccount {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            address: "owner@example.com".to_string(),
            refresh_token: "tok".to_string(),
            is_active: true,
            last_fetched_at: None,
            created_at: now,
            updated_at: now,
        };
        let digest = DigestSchedule {
            id: Uuid::new_v4(),
            org_id: account.org_id,
            account_id: account.id,
            recipient_email: "owner@example.com".to_string(),
            criteria_type: "unread".to_string(),
            schedule_time: "09:00".to_string(),
            time_zone: "UTC".to_string(),
            is_active: true,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_account(account).await;
        store.insert_digest(digest).await;

        let fetcher = FixedFetcher {
            summaries: vec![MessageSummary {
                subject: "Contract".to_string(),
                from_email: "legal@example.com".to_string(),
                summary: "Signature needed by Friday".to_string(),
            }],
            messages: vec![],
        };
        let sender = CapturingSender::default();
        let config = SchedulerConfig::default();

        // Day one: fires inside the window.
        let report = jobs::run_digest_job(&store, &fetcher, &sender, &config, utc(15, 9, 1))
            .await
            .unwrap();
        assert_eq!(report.processed, 1);

        // Same window, later tick: cooldown holds it back.
        let report = jobs::run_digest_job(&store, &fetcher, &sender, &config, utc(15, 9, 4))
            .await
            .unwrap();
        assert_eq!(report.processed, 0);

        // Next day, same window: fires again.
        let report = jobs::run_digest_job(&store, &fetcher, &sender, &config, utc(16, 9, 2))
            .await
            .unwrap();
        assert_eq!(report.processed, 1);

        assert_eq!(sender.sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_classify_charges_autonomously() {
        let store = MemoryScheduleStore::new();
        let credits = credit_service();
        let gate = ActionGate::new(Arc::clone(&credits));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        credits.grant(user, org, 400, None).await.unwrap();

        let now = utc(15, 8, 0);
        store
            .insert_account(EmailAccount {
                id: Uuid::new_v4(),
                user_id: user,
                org_id: org,
                address: "owner@example.com".to_string(),
                refresh_token: "tok".to_string(),
                is_active: true,
                last_fetched_at: None,
                created_at: now,
                updated_at: now,
            })
            .await;

        let fetcher = FixedFetcher {
            summaries: vec![],
            messages: vec![
                InboundMessage {
                    provider_message_id: "m1".to_string(),
                    provider_thread_id: "t1".to_string(),
                    subject: Some("Invoice overdue".to_string()),
                    from_email: "billing@example.com".to_string(),
                    from_name: None,
                    body_plain: Some("Please pay".to_string()),
                    received_at: now,
                },
                InboundMessage {
                    provider_message_id: "m2".to_string(),
                    provider_thread_id: "t2".to_string(),
                    subject: Some("Lunch?".to_string()),
                    from_email: "friend@example.com".to_string(),
                    from_name: None,
                    body_plain: Some("Tacos".to_string()),
                    received_at: now,
                },
            ],
        };

        let report =
            jobs::run_fetch_job(&store, &fetcher, &FixedClassifier, &gate, 24, utc(15, 9, 0))
                .await
                .unwrap();
        assert_eq!(report.processed, 2);

        // The scheduler went through the same ledger path as interactive
        // callers: one classification charge per message.
        let balance = credits.get_balance(user, org).await.unwrap();
        assert_eq!(balance.available_credits, 398);
        let txs = credits.list_transactions(user, org).await.unwrap();
        let classifications = txs
            .iter()
            .filter(|tx| tx.action_type == "email_classification")
            .count();
        assert_eq!(classifications, 2);
    }

    #[tokio::test]
    async fn test_reset_catch_up_after_downtime() {
        let credits = credit_service();
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());
        credits.grant(user, org, 400, None).await.unwrap();

        // Simulate the scheduler being down past the reset date.
        let later = Utc::now() + Duration::days(45);
        let report = jobs::run_reset_job(&credits, later).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let balance = credits.get_balance(user, org).await.unwrap();
        assert_eq!(
            balance.available_credits,
            SubscriptionTier::Free.monthly_credits()
        );
    }
}
