use super::cycle::CircleCycle;
use super::money::{Amount, Money};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Pending,
    Partial,
    Completed,
    Late,
    Missed,
    Excused,
    Covered,
}

impl ContributionStatus {
    /// No further money is expected for this contribution in its cycle.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Excused | Self::Covered)
    }

    pub fn counts_toward_pool(&self) -> bool {
        matches!(self, Self::Completed | Self::Covered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageSource {
    Reserve,
}

/// A member's required payment into one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleContribution {
    pub id: Uuid,
    pub cycle_id: Uuid,
    pub circle_id: Uuid,
    pub user_id: Uuid,
    pub expected_amount: Money,
    #[serde(default)]
    pub contributed_amount: Money,
    pub status: ContributionStatus,
    pub due_date: DateTime<Utc>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub was_on_time: bool,
    #[serde(default)]
    pub days_late: u32,
    #[serde(default)]
    pub late_fee: Money,
    #[serde(default)]
    pub in_grace_period: bool,
    #[serde(default)]
    pub covered_by: Option<CoverageSource>,
    #[serde(default)]
    pub covered_amount: Money,
    /// Payment transaction ids already applied, for webhook replay detection.
    #[serde(default)]
    pub transaction_ids: Vec<String>,
}

/// Result of applying one payment to a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentApplication {
    Applied { completed: bool },
    AlreadyApplied,
    AlreadyResolved,
}

impl CycleContribution {
    pub fn new(cycle: &CircleCycle, user_id: Uuid, expected_amount: Money) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id: cycle.id,
            circle_id: cycle.circle_id,
            user_id,
            expected_amount,
            contributed_amount: Money::ZERO,
            status: ContributionStatus::Pending,
            due_date: cycle.contribution_deadline,
            paid_at: None,
            was_on_time: false,
            days_late: 0,
            late_fee: Money::ZERO,
            in_grace_period: false,
            covered_by: None,
            covered_amount: Money::ZERO,
            transaction_ids: Vec::new(),
        }
    }

    pub fn missing_amount(&self) -> Money {
        self.expected_amount.saturating_sub(self.contributed_amount)
    }

    /// Credits a payment. `contributed_amount` only ever grows.
    ///
    /// A contribution completes once it reaches its expected amount; a late
    /// completion records days late and assesses `late_fee_percent`.
    pub fn apply_payment(
        &mut self,
        transaction_id: &str,
        amount: Amount,
        received_at: DateTime<Utc>,
        late_fee_percent: Decimal,
    ) -> PaymentApplication {
        if self.transaction_ids.iter().any(|t| t == transaction_id) {
            return PaymentApplication::AlreadyApplied;
        }
        if self.status.is_resolved() || self.status == ContributionStatus::Missed {
            return PaymentApplication::AlreadyResolved;
        }

        self.transaction_ids.push(transaction_id.to_string());
        self.contributed_amount += amount.into();

        if self.contributed_amount >= self.expected_amount {
            let on_time = received_at <= self.due_date;
            self.status = ContributionStatus::Completed;
            self.paid_at = Some(received_at);
            self.was_on_time = on_time;
            self.in_grace_period = false;
            if !on_time {
                let late = received_at - self.due_date;
                // Any started day counts as a day late.
                let days = late.num_days() + i64::from(late.num_seconds() % 86_400 != 0);
                self.days_late = u32::try_from(days).unwrap_or(u32::MAX);
                self.late_fee = self.expected_amount.percent(late_fee_percent);
            }
            PaymentApplication::Applied { completed: true }
        } else {
            if self.status == ContributionStatus::Pending {
                self.status = ContributionStatus::Partial;
            }
            PaymentApplication::Applied { completed: false }
        }
    }

    /// Marks the gap as paid by the community reserve.
    pub fn cover_from_reserve(&mut self) -> Money {
        let gap = self.missing_amount();
        self.covered_amount = gap;
        self.contributed_amount += gap;
        self.covered_by = Some(CoverageSource::Reserve);
        self.status = ContributionStatus::Covered;
        self.in_grace_period = false;
        gap
    }

    /// Puts `amount` of reserve money toward a gap it cannot close. The
    /// contribution stays unresolved and defaults on the rest.
    pub fn cover_part_from_reserve(&mut self, amount: Money) {
        let amount = amount.min(self.missing_amount());
        self.covered_amount += amount;
        self.contributed_amount += amount;
        self.covered_by = Some(CoverageSource::Reserve);
    }

    /// What this contribution adds to the cycle pool. Reserve money always
    /// counts; a member's own money only once the contribution is settled.
    pub fn pooled_amount(&self) -> Money {
        if self.status.counts_toward_pool() {
            self.contributed_amount
        } else {
            self.covered_amount
        }
    }
}

/// Payload of the contribution-received webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionReceived {
    pub cycle_id: Uuid,
    pub user_id: Uuid,
    pub amount: Amount,
    pub transaction_id: String,
    pub received_at: DateTime<Utc>,
}
