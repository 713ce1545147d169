use crate::credits::SubscriptionTier;

/// Limits attached to a subscription tier. Allotment changes take effect at
/// the tenant's next monthly reset, never retroactively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub monthly_credits: i64,
    pub max_workflows: u32,
    pub max_follow_ups: u32,
}

pub fn limits_for(tier: SubscriptionTier) -> TierLimits {
    match tier {
        SubscriptionTier::Free => TierLimits {
            monthly_credits: 400,
            max_workflows: 3,
            max_follow_ups: 10,
        },
        SubscriptionTier::Pro => TierLimits {
            monthly_credits: 5_000,
            max_workflows: 50,
            max_follow_ups: 100,
        },
        SubscriptionTier::Business => TierLimits {
            monthly_credits: 30_000,
            max_workflows: 500,
            max_follow_ups: 1_000,
        },
    }
}

impl SubscriptionTier {
    pub fn monthly_credits(&self) -> i64 {
        limits_for(*self).monthly_credits
    }

    pub fn max_workflows(&self) -> u32 {
        limits_for(*self).max_workflows
    }

    pub fn max_follow_ups(&self) -> u32 {
        limits_for(*self).max_follow_ups
    }
}
