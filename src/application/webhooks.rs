//! Out-of-band entry points called by the payment provider.
//!
//! Both handlers are idempotent: a redelivered payload against state that
//! already reflects it is acknowledged without side effects.

use super::context::{Applied, EngineContext};
use super::payout::SettlementTracker;
use crate::domain::contribution::{ContributionReceived, PaymentApplication};
use crate::domain::cycle::CycleStatus;
use crate::domain::ledger::CycleEventKind;
use crate::domain::money::Money;
use crate::domain::ports::{Notification, NotificationKind};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    /// Already reflected in stored state; acknowledged as a no-op.
    Duplicate,
}

pub struct WebhookHandler<'a> {
    ctx: &'a EngineContext,
}

impl<'a> WebhookHandler<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn process_contribution_received(
        &self,
        payload: ContributionReceived,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        let mut cycle = self.ctx.load_cycle(payload.cycle_id).await?;
        let mut contribution = self
            .ctx
            .store
            .find_contribution(payload.cycle_id, payload.user_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(
                    "contribution",
                    format!("{}/{}", payload.cycle_id, payload.user_id),
                )
            })?;

        if contribution
            .transaction_ids
            .iter()
            .any(|t| t == &payload.transaction_id)
            || cycle.status == CycleStatus::Closed
        {
            return Ok(WebhookOutcome::Duplicate);
        }
        if !cycle.status.accepts_contributions() {
            return Err(EngineError::ValidationError(format!(
                "cycle {} no longer accepts contributions (status {})",
                cycle.id, cycle.status
            )));
        }

        match contribution.apply_payment(
            &payload.transaction_id,
            payload.amount,
            payload.received_at,
            self.ctx.config.late_fee_percent,
        ) {
            PaymentApplication::AlreadyApplied | PaymentApplication::AlreadyResolved => {
                return Ok(WebhookOutcome::Duplicate);
            }
            PaymentApplication::Applied { .. } => {}
        }
        self.ctx.store.save_contribution(contribution.clone()).await?;

        let contributions = self.ctx.load_contributions(&cycle).await?;
        let observed = cycle.status;
        cycle.recompute_totals(&contributions);
        cycle.updated_at = Some(now);
        if self.ctx.persist(&cycle, observed).await? == Applied::LostRace {
            // The contribution row is saved; the next sweep re-sums totals.
            tracing::warn!(cycle_id = %cycle.id, "cycle totals not refreshed after contribution");
        }

        tracing::info!(
            cycle_id = %cycle.id,
            user_id = %contribution.user_id,
            amount = %payload.amount.value(),
            status = ?contribution.status,
            "contribution received"
        );
        self.ctx
            .events
            .record_for(
                &cycle,
                CycleEventKind::ContributionReceived,
                json!({
                    "user_id": contribution.user_id,
                    "transaction_id": payload.transaction_id,
                    "amount": payload.amount,
                    "contribution_status": contribution.status,
                    "was_on_time": contribution.was_on_time,
                    "late_fee": contribution.late_fee,
                }),
                now,
            )
            .await?;
        self.ctx
            .effects
            .notify(
                contribution.user_id,
                Notification::new(
                    NotificationKind::ContributionReceived,
                    "Contribution received",
                    format!(
                        "We received {}. You have paid {} of {}.",
                        Money::from(payload.amount),
                        contribution.contributed_amount,
                        contribution.expected_amount
                    ),
                )
                .with_data(json!({ "cycle_id": cycle.id, "transaction_id": payload.transaction_id })),
            )
            .await;
        Ok(WebhookOutcome::Applied)
    }

    pub async fn process_payout_completed(
        &self,
        cycle_id: Uuid,
        transaction_id: &str,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        let mut cycle = self.ctx.load_cycle(cycle_id).await?;
        match cycle.status {
            CycleStatus::PayoutCompleted | CycleStatus::Closed => Ok(WebhookOutcome::Duplicate),
            CycleStatus::PayoutPending => {
                if let Some(expected) = &cycle.payout_transaction_id
                    && expected != transaction_id
                {
                    return Err(EngineError::ValidationError(format!(
                        "transaction {transaction_id} does not match pending payout {expected} of cycle {cycle_id}"
                    )));
                }
                match SettlementTracker::new(self.ctx)
                    .complete(&mut cycle, transaction_id, amount, now, now)
                    .await?
                {
                    Applied::Yes => Ok(WebhookOutcome::Applied),
                    Applied::LostRace => Ok(WebhookOutcome::Duplicate),
                }
            }
            other => Err(EngineError::InvalidTransition {
                from: other,
                to: CycleStatus::PayoutCompleted,
            }),
        }
    }
}
