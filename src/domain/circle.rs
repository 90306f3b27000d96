use super::money::Money;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happens to a cycle whose deadline passes with contributions missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionPolicy {
    /// Wait for every member, bounded by the strict-wait cap.
    StrictWait,
    GraceThenProceed,
    GraceThenCover,
    ImmediateProceed,
    ImmediateCover,
}

impl ContributionPolicy {
    /// Whether the reserve fund backstops the shortfall once waiting is over.
    pub fn covers_from_reserve(&self) -> bool {
        match self {
            Self::GraceThenCover | Self::ImmediateCover => true,
            Self::StrictWait | Self::GraceThenProceed | Self::ImmediateProceed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrictWait => "strict_wait",
            Self::GraceThenProceed => "grace_then_proceed",
            Self::GraceThenCover => "grace_then_cover",
            Self::ImmediateProceed => "immediate_proceed",
            Self::ImmediateCover => "immediate_cover",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleStatus {
    Forming,
    Active,
    Paused,
    Completed,
    Cancelled,
}

/// Aggregates persisted when the last cycle of a circle closes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircleStats {
    pub cycles_completed: u32,
    pub total_collected: Money,
    pub total_paid_out: Money,
    pub total_platform_fees: Money,
    pub total_reserve_covered: Money,
    pub total_defaults: u32,
}

/// A rotating savings circle.
///
/// The engine reads the policy fields and only ever writes the cycle pointer,
/// the status and the completion fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub id: Uuid,
    pub community_id: Uuid,
    pub name: String,
    pub contribution_amount: Money,
    pub total_cycles: u32,
    pub incomplete_contribution_policy: ContributionPolicy,
    #[serde(default)]
    pub grace_period_days: u32,
    /// Percentage of the collected pool kept as platform fee.
    #[serde(default)]
    pub platform_fee_percent: Decimal,
    #[serde(default)]
    pub current_cycle_number: u32,
    #[serde(default)]
    pub current_cycle_id: Option<Uuid>,
    pub status: CircleStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: Option<CircleStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Completed,
    Left,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub circle_id: Uuid,
    pub user_id: Uuid,
    pub status: MembershipStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn active(circle_id: Uuid, user_id: Uuid) -> Self {
        Self {
            circle_id,
            user_id,
            status: MembershipStatus::Active,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutSlot {
    pub cycle_number: u32,
    pub user_id: Uuid,
}

/// The predetermined sequence of recipients of a circle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutOrder {
    pub circle_id: Uuid,
    pub finalized: bool,
    pub entries: Vec<PayoutSlot>,
}

impl PayoutOrder {
    pub fn recipient_for(&self, cycle_number: u32) -> Option<Uuid> {
        self.entries
            .iter()
            .find(|slot| slot.cycle_number == cycle_number)
            .map(|slot| slot.user_id)
    }
}

/// A member vouching for another member of the same circle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vouch {
    pub voucher_id: Uuid,
    pub vouchee_id: Uuid,
    pub circle_id: Uuid,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub is_primary: bool,
    pub status: PaymentMethodStatus,
}

impl PaymentMethod {
    pub fn usable_for_payout(&self) -> bool {
        self.is_primary && self.status == PaymentMethodStatus::Active
    }
}
