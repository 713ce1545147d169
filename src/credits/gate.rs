use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::credits::{ActionKind, CreditService, CreditsError};

/// Outcome of a gated action. The charge is committed before the action
/// runs, so `result` may carry the action's own failure while the credits
/// stay spent; billing and execution outcomes are reported independently.
#[derive(Debug)]
pub struct GatedAction<T, E> {
    pub credits_used: i64,
    pub credits_remaining: i64,
    pub result: Result<T, E>,
}

impl<T, E> GatedAction<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Enforcement point for credit-consuming work. Charges the action's price
/// up front and only then runs it; a rejected charge means the action is
/// never attempted. There is no automatic refund when the action itself
/// fails after the charge.
pub struct ActionGate {
    credits: Arc<CreditService>,
}

impl ActionGate {
    pub fn new(credits: Arc<CreditService>) -> Self {
        Self { credits }
    }

    pub fn credits(&self) -> &CreditService {
        &self.credits
    }

    pub async fn run<T, E, Fut>(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        kind: ActionKind,
        description: &str,
        action: Fut,
    ) -> Result<GatedAction<T, E>, CreditsError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let cost = kind.cost();
        let balance = self
            .credits
            .try_deduct(
                user_id,
                org_id,
                cost,
                kind.as_str(),
                Some(description.to_string()),
            )
            .await?;

        let result = action.await;
        if let Err(e) = &result {
            tracing::warn!(
                "{} failed after charging {} credits (user {}, org {}): {}",
                kind.as_str(),
                cost,
                user_id,
                org_id,
                e
            );
        }

        Ok(GatedAction {
            credits_used: cost,
            credits_remaining: balance.available_credits,
            result,
        })
    }
}
