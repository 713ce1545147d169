use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A connected mailbox. The refresh token is an opaque credential handed to
/// the fetch capability; token exchange happens behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccount {
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

/// A message pulled from a mailbox, already decoded by the fetch capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub body_plain: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// One summarized message inside a digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub subject: String,
    pub from_email: String,
    pub summary: String,
}

/// A rendered message handed to the send capability for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmailCategory {
    Urgent,
    Fyi,
    Archive,
}

/// Result of classifying one inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: EmailCategory,
    pub confidence_score: f32,
    pub reasoning: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("authorization expired or revoked")]
    AuthRevoked,
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Read side of the mailbox integration. Implementations own the provider
/// protocol; callers only see decoded messages.
#[async_trait]
pub trait EmailFetcher: Send + Sync {
    async fn fetch_new(
        &self,
        account: &EmailAccount,
        after: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, CapabilityError>;

    async fn fetch_and_summarize(
        &self,
        account: &EmailAccount,
        criteria_type: &str,
        max_results: usize,
    ) -> Result<Vec<MessageSummary>, CapabilityError>;
}

/// Delivery side of the mailbox integration.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), CapabilityError>;
}

/// AI classification capability for inbound messages.
#[async_trait]
pub trait MessageClassifier: Send + Sync {
    async fn classify(
        &self,
        message: &InboundMessage,
    ) -> Result<Classification, CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_serialization() {
        for category in [EmailCategory::Urgent, EmailCategory::Fyi, EmailCategory::Archive] {
            let serialized = serde_json::to_string(&category).unwrap();
            let deserialized: EmailCategory = serde_json::from_str(&serialized).unwrap();
            assert_eq!(category, deserialized);
        }
        assert_eq!(
            serde_json::to_string(&EmailCategory::Urgent).unwrap(),
            "\"urgent\""
        );
    }

    #[test]
    fn test_capability_error_display() {
        assert_eq!(
            CapabilityError::AuthRevoked.to_string(),
            "authorization expired or revoked"
        );
        assert_eq!(
            CapabilityError::Upstream("503".to_string()).to_string(),
            "upstream error: 503"
        );
    }
}
