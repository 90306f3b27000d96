use super::circle::{Circle, Membership, PaymentMethod, PayoutOrder, Vouch};
use super::contribution::CycleContribution;
use super::cycle::{CircleCycle, CycleStatus};
use super::ledger::{
    CycleEvent, EngineRun, MemberDefault, Reminder, ReserveDebit, ReserveFund,
};
use super::money::Money;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Decides how much to debit given the balance observed under the store's lock.
pub type ReserveDecision = Box<dyn FnOnce(Money) -> Money + Send>;

/// Circles and the membership data the engine reads around them.
#[async_trait]
pub trait CircleStore: Send + Sync {
    async fn get_circle(&self, circle_id: Uuid) -> Result<Option<Circle>>;
    async fn save_circle(&self, circle: Circle) -> Result<()>;
    async fn memberships(&self, circle_id: Uuid) -> Result<Vec<Membership>>;
    async fn save_membership(&self, membership: Membership) -> Result<()>;
    async fn payout_order(&self, circle_id: Uuid) -> Result<Option<PayoutOrder>>;
    async fn save_payout_order(&self, order: PayoutOrder) -> Result<()>;
    async fn vouches_for(&self, circle_id: Uuid, vouchee_id: Uuid) -> Result<Vec<Vouch>>;
    async fn save_vouch(&self, vouch: Vouch) -> Result<()>;
    async fn payment_methods(&self, user_id: Uuid) -> Result<Vec<PaymentMethod>>;
    async fn save_payment_method(&self, method: PaymentMethod) -> Result<()>;

    async fn active_memberships(&self, circle_id: Uuid) -> Result<Vec<Membership>> {
        Ok(self
            .memberships(circle_id)
            .await?
            .into_iter()
            .filter(Membership::is_active)
            .collect())
    }

    async fn primary_payment_method(&self, user_id: Uuid) -> Result<Option<PaymentMethod>> {
        Ok(self
            .payment_methods(user_id)
            .await?
            .into_iter()
            .find(PaymentMethod::usable_for_payout))
    }
}

/// Cycles and their contribution rows.
#[async_trait]
pub trait CycleStore: Send + Sync {
    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CircleCycle>>;
    async fn find_cycle(&self, circle_id: Uuid, cycle_number: u32) -> Result<Option<CircleCycle>>;
    async fn cycles_with_status(&self, status: CycleStatus) -> Result<Vec<CircleCycle>>;
    async fn cycles_for_circle(&self, circle_id: Uuid) -> Result<Vec<CircleCycle>>;
    /// Fails with `Duplicate` if the (circle, cycle number) pair exists.
    async fn insert_cycle(&self, cycle: CircleCycle) -> Result<()>;
    /// Compare-and-swap: writes `cycle` only if the stored status still
    /// equals `expected`. Returns whether the write happened.
    async fn update_cycle(&self, cycle: CircleCycle, expected: CycleStatus) -> Result<bool>;

    async fn contributions(&self, cycle_id: Uuid) -> Result<Vec<CycleContribution>>;
    async fn find_contribution(
        &self,
        cycle_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<CycleContribution>>;
    /// Fails with `Duplicate` if the (cycle, member) pair exists.
    async fn insert_contribution(&self, contribution: CycleContribution) -> Result<()>;
    async fn save_contribution(&self, contribution: CycleContribution) -> Result<()>;
}

/// Write-once records and the reserve fund.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fails with `Duplicate` if the contribution already has a default.
    async fn record_default(&self, default: MemberDefault) -> Result<()>;
    async fn defaults_for_circle(&self, circle_id: Uuid) -> Result<Vec<MemberDefault>>;

    async fn append_event(&self, event: CycleEvent) -> Result<()>;
    async fn events_for_circle(&self, circle_id: Uuid) -> Result<Vec<CycleEvent>>;

    async fn reserve_fund(&self, community_id: Uuid) -> Result<Option<ReserveFund>>;
    async fn save_reserve_fund(&self, fund: ReserveFund) -> Result<()>;
    /// Reads the balance, asks `decide` for the debit and applies it in one
    /// atomic step. The applied debit is clamped to `[0, balance]`.
    async fn debit_reserve(
        &self,
        community_id: Uuid,
        decide: ReserveDecision,
        at: DateTime<Utc>,
    ) -> Result<ReserveDebit>;

    async fn save_run(&self, run: EngineRun) -> Result<()>;
    async fn latest_run(&self) -> Result<Option<EngineRun>>;

    async fn save_reminder(&self, reminder: Reminder) -> Result<()>;
    async fn reminders_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<Reminder>>;
    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>>;
}

/// The abstract transactional datastore the engine runs against.
pub trait Datastore: CircleStore + CycleStore + LedgerStore {}

impl<T: CircleStore + CycleStore + LedgerStore> Datastore for T {}

pub type DatastoreBox = Arc<dyn Datastore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CycleStarted,
    PayoutRecipient,
    ContributionReminder,
    ContributionReceived,
    ContributionLate,
    PayoutDelayed,
    MemberDefaulted,
    PayoutInitiated,
    PayoutCompleted,
    PayoutFailed,
    CycleAdvanced,
    NextRecipient,
    CircleCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: Uuid, notification: Notification) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreReason {
    LateContribution,
    MemberDefault,
    VouchedMemberDefault,
    OnTimeContribution,
    CircleCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreAdjustment {
    pub reason: ScoreReason,
    pub points: i32,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait ScoreService: Send + Sync {
    async fn adjust(&self, user_id: Uuid, adjustment: ScoreAdjustment) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PayoutFailed,
    PayoutStuck,
    EngineRunAborted,
    EngineRunsMissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsAlert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub cycle_id: Option<Uuid>,
    pub data: serde_json::Value,
}

/// Operations alerting channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: OpsAlert) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub cycle_id: Uuid,
    pub recipient_id: Uuid,
    pub payment_method_id: Uuid,
    pub amount: Money,
    /// Stable per cycle and attempt so a provider can drop duplicates.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutHandle {
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Completed {
        amount: Money,
        completed_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
}

/// Money movement. Initiation returns immediately; completion is observed
/// later by polling `transfer_status` or through the payout webhook.
#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    async fn initiate(&self, request: PayoutRequest) -> Result<PayoutHandle>;
    async fn transfer_status(&self, transaction_id: &str) -> Result<TransferStatus>;
}

pub type NotificationSinkBox = Arc<dyn NotificationSink>;
pub type ScoreServiceBox = Arc<dyn ScoreService>;
pub type AlertSinkBox = Arc<dyn AlertSink>;
pub type PaymentAdapterBox = Arc<dyn PaymentAdapter>;
