use super::contribution::CycleContribution;
use super::money::Money;
use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Scheduled,
    Collecting,
    DeadlineReached,
    GracePeriod,
    ReadyPayout,
    PayoutPending,
    PayoutRetry,
    PayoutCompleted,
    PayoutFailed,
    Closed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Collecting => "collecting",
            Self::DeadlineReached => "deadline_reached",
            Self::GracePeriod => "grace_period",
            Self::ReadyPayout => "ready_payout",
            Self::PayoutPending => "payout_pending",
            Self::PayoutRetry => "payout_retry",
            Self::PayoutCompleted => "payout_completed",
            Self::PayoutFailed => "payout_failed",
            Self::Closed => "closed",
        }
    }

    /// The edges of the cycle state machine.
    ///
    /// Everything moves forward except `payout_retry -> ready_payout`, which
    /// is only reachable from `payout_pending`.
    pub fn can_transition_to(&self, next: CycleStatus) -> bool {
        use CycleStatus::*;
        matches!(
            (self, next),
            (Scheduled, Collecting)
                | (Collecting, DeadlineReached)
                | (DeadlineReached, GracePeriod)
                | (DeadlineReached, ReadyPayout)
                | (GracePeriod, ReadyPayout)
                | (ReadyPayout, PayoutPending)
                | (ReadyPayout, PayoutFailed)
                | (ReadyPayout, PayoutCompleted)
                | (PayoutPending, PayoutCompleted)
                | (PayoutPending, PayoutFailed)
                | (PayoutPending, PayoutRetry)
                | (PayoutRetry, ReadyPayout)
                | (PayoutCompleted, Closed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::PayoutFailed)
    }

    /// Contributions can still be received in these states.
    pub fn accepts_contributions(&self) -> bool {
        matches!(
            self,
            Self::Collecting | Self::DeadlineReached | Self::GracePeriod
        )
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One collection-then-payout iteration of a circle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleCycle {
    pub id: Uuid,
    pub circle_id: Uuid,
    pub cycle_number: u32,
    pub status: CycleStatus,
    pub start_date: NaiveDate,
    pub contribution_deadline: DateTime<Utc>,
    #[serde(default)]
    pub grace_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_payout_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expected_amount: Money,
    #[serde(default)]
    pub collected_amount: Money,
    #[serde(default)]
    pub platform_fee: Money,
    #[serde(default)]
    pub payout_amount: Money,
    #[serde(default)]
    pub late_fees: Money,
    #[serde(default)]
    pub reserve_covered_amount: Money,
    #[serde(default)]
    pub recipient_user_id: Option<Uuid>,
    #[serde(default)]
    pub contributions_expected: u32,
    #[serde(default)]
    pub contributions_received: u32,
    #[serde(default)]
    pub default_count: u32,
    #[serde(default)]
    pub payout_attempts: u32,
    #[serde(default)]
    pub last_payout_error: Option<String>,
    #[serde(default)]
    pub payout_transaction_id: Option<String>,
    #[serde(default)]
    pub payout_initiated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stuck_alerted: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CircleCycle {
    /// A cycle row as circle setup creates it, ahead of time.
    pub fn scheduled(
        circle_id: Uuid,
        cycle_number: u32,
        start_date: NaiveDate,
        contribution_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            circle_id,
            cycle_number,
            status: CycleStatus::Scheduled,
            start_date,
            contribution_deadline,
            grace_period_end: None,
            actual_payout_date: None,
            closed_at: None,
            expected_amount: Money::ZERO,
            collected_amount: Money::ZERO,
            platform_fee: Money::ZERO,
            payout_amount: Money::ZERO,
            late_fees: Money::ZERO,
            reserve_covered_amount: Money::ZERO,
            recipient_user_id: None,
            contributions_expected: 0,
            contributions_received: 0,
            default_count: 0,
            payout_attempts: 0,
            last_payout_error: None,
            payout_transaction_id: None,
            payout_initiated_at: None,
            stuck_alerted: false,
            updated_at: None,
        }
    }

    /// Moves to `next`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, next: CycleStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Some(now);
        Ok(())
    }

    /// Re-derives the running totals from the contribution rows.
    ///
    /// Only completed and covered contributions count toward the pool.
    pub fn recompute_totals(&mut self, contributions: &[CycleContribution]) {
        self.collected_amount = contributions.iter().map(|c| c.pooled_amount()).sum();
        self.late_fees = contributions.iter().map(|c| c.late_fee).sum();
        self.reserve_covered_amount = contributions.iter().map(|c| c.covered_amount).sum();
        self.contributions_received = contributions
            .iter()
            .filter(|c| c.status.counts_toward_pool())
            .count() as u32;
    }

    /// Fixes the fee and the recipient's share from the collected pool.
    pub fn settle_amounts(&mut self, platform_fee_percent: Decimal) {
        self.platform_fee = self.collected_amount.percent(platform_fee_percent);
        self.payout_amount = self.collected_amount - self.platform_fee;
    }
}
