//! Payout initiation and settlement tracking.
//!
//! `ready_payout -> payout_pending -> {payout_completed | payout_failed}`,
//! with `payout_pending -> payout_retry -> ready_payout` as the one way back.
//! Initiation never waits for money to move; completion is observed by
//! polling the adapter or through the payout webhook.

use super::context::{Applied, EngineContext};
use crate::domain::circle::Circle;
use crate::domain::contribution::CycleContribution;
use crate::domain::cycle::{CircleCycle, CycleStatus};
use crate::domain::ledger::{CycleEventKind, Phase, RunReport};
use crate::domain::money::Money;
use crate::domain::ports::{
    AlertKind, Notification, NotificationKind, OpsAlert, PayoutRequest, Priority, Severity,
    TransferStatus,
};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiationOutcome {
    Initiated { transaction_id: String },
    /// Nothing was collected, so there is nothing to transfer.
    NothingToPay,
    WillRetry { attempts: u32 },
    Failed { attempts: u32 },
    LostRace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Failed,
    Pending,
    Stuck,
    LostRace,
}

pub struct PayoutInitiator<'a> {
    ctx: &'a EngineContext,
}

impl<'a> PayoutInitiator<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// The ready-payout transition: fixes fee and payout amount from the
    /// re-summed contributions.
    pub async fn mark_ready(
        &self,
        circle: &Circle,
        cycle: &mut CircleCycle,
        contributions: &[CycleContribution],
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        cycle.recompute_totals(contributions);
        cycle.settle_amounts(circle.platform_fee_percent);
        let applied = self
            .ctx
            .advance_status(cycle, CycleStatus::ReadyPayout, now)
            .await?;
        if applied == Applied::LostRace {
            return Ok(applied);
        }

        tracing::info!(
            cycle_id = %cycle.id,
            collected = %cycle.collected_amount,
            fee = %cycle.platform_fee,
            payout = %cycle.payout_amount,
            "cycle ready for payout"
        );
        self.ctx
            .events
            .record_for(
                cycle,
                CycleEventKind::ReadyForPayout,
                json!({
                    "collected_amount": cycle.collected_amount,
                    "platform_fee": cycle.platform_fee,
                    "payout_amount": cycle.payout_amount,
                    "reserve_covered_amount": cycle.reserve_covered_amount,
                    "default_count": cycle.default_count,
                }),
                now,
            )
            .await?;
        Ok(Applied::Yes)
    }

    pub async fn initiate_payouts(&self, now: DateTime<Utc>, report: &mut RunReport) -> Result<()> {
        let ready = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::ReadyPayout)
            .await?;

        for cycle in ready {
            let cycle_id = cycle.id;
            match self.initiate(cycle, now).await {
                Ok(InitiationOutcome::Initiated { .. }) => report.payouts_initiated += 1,
                Ok(InitiationOutcome::NothingToPay) => report.payouts_completed += 1,
                Ok(InitiationOutcome::WillRetry { attempts } | InitiationOutcome::Failed { attempts }) => {
                    report.push_error(
                        Phase::InitiatePayouts,
                        Some(cycle_id),
                        format!("payout initiation failed (attempt {attempts})"),
                    );
                }
                Ok(InitiationOutcome::LostRace) => {}
                Err(e) => {
                    tracing::warn!(%cycle_id, error = %e, "payout initiation errored");
                    report.push_error(Phase::InitiatePayouts, Some(cycle_id), e);
                }
            }
        }
        Ok(())
    }

    /// One initiation attempt for a `ready_payout` cycle.
    pub async fn initiate(&self, mut cycle: CircleCycle, now: DateTime<Utc>) -> Result<InitiationOutcome> {
        let recipient = cycle
            .recipient_user_id
            .ok_or_else(|| EngineError::ValidationError(format!("cycle {} has no recipient", cycle.id)))?;

        if !cycle.payout_amount.is_positive() {
            cycle.actual_payout_date = Some(now);
            if self
                .ctx
                .advance_status(&mut cycle, CycleStatus::PayoutCompleted, now)
                .await?
                == Applied::LostRace
            {
                return Ok(InitiationOutcome::LostRace);
            }
            self.ctx
                .events
                .record_for(
                    &cycle,
                    CycleEventKind::PayoutCompleted,
                    json!({ "amount": Money::ZERO, "reason": "nothing_collected" }),
                    now,
                )
                .await?;
            return Ok(InitiationOutcome::NothingToPay);
        }

        let attempt = match self.ctx.store.primary_payment_method(recipient).await? {
            Some(method) => {
                let request = PayoutRequest {
                    cycle_id: cycle.id,
                    recipient_id: recipient,
                    payment_method_id: method.id,
                    amount: cycle.payout_amount,
                    idempotency_key: format!("payout-{}-{}", cycle.id, cycle.payout_attempts + 1),
                };
                self.ctx.payments.initiate(request).await
            }
            None => Err(EngineError::PaymentError(
                "recipient has no active primary payment method".to_string(),
            )),
        };

        cycle.payout_attempts += 1;
        match attempt {
            Ok(handle) => {
                cycle.payout_transaction_id = Some(handle.transaction_id.clone());
                cycle.payout_initiated_at = Some(now);
                cycle.last_payout_error = None;
                cycle.stuck_alerted = false;
                if self
                    .ctx
                    .advance_status(&mut cycle, CycleStatus::PayoutPending, now)
                    .await?
                    == Applied::LostRace
                {
                    return Ok(InitiationOutcome::LostRace);
                }
                tracing::info!(
                    cycle_id = %cycle.id,
                    transaction_id = %handle.transaction_id,
                    amount = %cycle.payout_amount,
                    attempt = cycle.payout_attempts,
                    "payout initiated"
                );
                self.ctx
                    .events
                    .record_for(
                        &cycle,
                        CycleEventKind::PayoutInitiated,
                        json!({
                            "transaction_id": handle.transaction_id,
                            "amount": cycle.payout_amount,
                            "attempt": cycle.payout_attempts,
                        }),
                        now,
                    )
                    .await?;
                self.ctx
                    .effects
                    .notify(
                        recipient,
                        Notification::new(
                            NotificationKind::PayoutInitiated,
                            "Your payout is on its way",
                            format!("A payout of {} has been initiated.", cycle.payout_amount),
                        )
                        .with_data(json!({ "cycle_id": cycle.id, "amount": cycle.payout_amount })),
                    )
                    .await;
                Ok(InitiationOutcome::Initiated {
                    transaction_id: handle.transaction_id,
                })
            }
            Err(e) => self.record_failed_attempt(cycle, e, now).await,
        }
    }

    async fn record_failed_attempt(
        &self,
        mut cycle: CircleCycle,
        error: EngineError,
        now: DateTime<Utc>,
    ) -> Result<InitiationOutcome> {
        let message = error.to_string();
        cycle.last_payout_error = Some(message.clone());
        let attempts = cycle.payout_attempts;
        tracing::warn!(cycle_id = %cycle.id, attempts, error = %message, "payout attempt failed");

        if attempts < self.ctx.config.max_payout_attempts {
            if self.ctx.persist(&cycle, CycleStatus::ReadyPayout).await? == Applied::LostRace {
                return Ok(InitiationOutcome::LostRace);
            }
            self.ctx
                .events
                .record_for(
                    &cycle,
                    CycleEventKind::PayoutAttemptFailed,
                    json!({ "attempt": attempts, "error": message }),
                    now,
                )
                .await?;
            return Ok(InitiationOutcome::WillRetry { attempts });
        }

        if self
            .ctx
            .advance_status(&mut cycle, CycleStatus::PayoutFailed, now)
            .await?
            == Applied::LostRace
        {
            return Ok(InitiationOutcome::LostRace);
        }
        fail_payout_effects(self.ctx, &cycle, &message, now).await?;
        Ok(InitiationOutcome::Failed { attempts })
    }
}

/// Event, ops alert and recipient notice for a cycle that reached `payout_failed`.
async fn fail_payout_effects(
    ctx: &EngineContext,
    cycle: &CircleCycle,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    ctx.events
        .record_for(
            cycle,
            CycleEventKind::PayoutFailed,
            json!({ "attempts": cycle.payout_attempts, "error": reason }),
            now,
        )
        .await?;
    ctx.effects
        .alert(
            OpsAlert::new(
                AlertKind::PayoutFailed,
                Severity::Critical,
                format!(
                    "payout of cycle {} failed after {} attempt(s): {}",
                    cycle.id, cycle.payout_attempts, reason
                ),
            )
            .for_cycle(cycle.id)
            .with_data(json!({
                "circle_id": cycle.circle_id,
                "amount": cycle.payout_amount,
                "recipient": cycle.recipient_user_id,
            })),
        )
        .await;
    let Some(recipient) = cycle.recipient_user_id else {
        return Ok(());
    };
    ctx.effects
        .notify(
            recipient,
            Notification::new(
                NotificationKind::PayoutFailed,
                "Payout problem",
                "We could not send your payout. Our team has been alerted and will contact you.",
            )
            .with_priority(Priority::High)
            .with_data(json!({ "cycle_id": cycle.id })),
        )
        .await;
    Ok(())
}

pub struct SettlementTracker<'a> {
    ctx: &'a EngineContext,
}

impl<'a> SettlementTracker<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn poll_payouts(&self, now: DateTime<Utc>, report: &mut RunReport) -> Result<()> {
        let pending = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::PayoutPending)
            .await?;

        for cycle in pending.into_iter().filter(|c| c.payout_transaction_id.is_some()) {
            let cycle_id = cycle.id;
            match self.poll(cycle, now).await {
                Ok(PollOutcome::Completed) => report.payouts_completed += 1,
                Ok(PollOutcome::Failed) => report.push_error(
                    Phase::PollPayouts,
                    Some(cycle_id),
                    "payment provider reported the payout as failed",
                ),
                Ok(PollOutcome::Pending | PollOutcome::Stuck | PollOutcome::LostRace) => {}
                Err(e) => {
                    tracing::warn!(%cycle_id, error = %e, "payout status poll failed");
                    report.push_error(Phase::PollPayouts, Some(cycle_id), e);
                }
            }
        }
        Ok(())
    }

    pub async fn poll(&self, mut cycle: CircleCycle, now: DateTime<Utc>) -> Result<PollOutcome> {
        let Some(transaction_id) = cycle.payout_transaction_id.clone() else {
            return Ok(PollOutcome::Pending);
        };

        match self.ctx.payments.transfer_status(&transaction_id).await? {
            TransferStatus::Completed {
                amount,
                completed_at,
            } => {
                let applied = self
                    .complete(&mut cycle, &transaction_id, amount, completed_at, now)
                    .await?;
                Ok(match applied {
                    Applied::Yes => PollOutcome::Completed,
                    Applied::LostRace => PollOutcome::LostRace,
                })
            }
            TransferStatus::Failed { reason } => {
                cycle.last_payout_error = Some(reason.clone());
                if self
                    .ctx
                    .advance_status(&mut cycle, CycleStatus::PayoutFailed, now)
                    .await?
                    == Applied::LostRace
                {
                    return Ok(PollOutcome::LostRace);
                }
                fail_payout_effects(self.ctx, &cycle, &reason, now).await?;
                Ok(PollOutcome::Failed)
            }
            TransferStatus::Pending => self.check_stuck(cycle, &transaction_id, now).await,
        }
    }

    /// Alert-only staleness probe; never changes the status.
    async fn check_stuck(
        &self,
        mut cycle: CircleCycle,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome> {
        let since = cycle
            .payout_initiated_at
            .or(cycle.updated_at)
            .unwrap_or(now);
        let hours = self.ctx.config.stuck_payout_hours;
        let threshold = Duration::try_hours(hours).ok_or_else(|| {
            EngineError::ValidationError(format!("stuck_payout_hours {hours} is out of range"))
        })?;
        if cycle.stuck_alerted || now - since <= threshold {
            return Ok(PollOutcome::Pending);
        }

        cycle.stuck_alerted = true;
        if self.ctx.persist(&cycle, CycleStatus::PayoutPending).await? == Applied::LostRace {
            return Ok(PollOutcome::LostRace);
        }
        let hours = (now - since).num_hours();
        self.ctx
            .events
            .record_for(
                &cycle,
                CycleEventKind::PayoutStuck,
                json!({ "transaction_id": transaction_id, "pending_hours": hours }),
                now,
            )
            .await?;
        self.ctx
            .effects
            .alert(
                OpsAlert::new(
                    AlertKind::PayoutStuck,
                    Severity::Warning,
                    format!("payout {transaction_id} of cycle {} pending for {hours}h", cycle.id),
                )
                .for_cycle(cycle.id)
                .with_data(json!({ "transaction_id": transaction_id, "pending_hours": hours })),
            )
            .await;
        Ok(PollOutcome::Stuck)
    }

    /// Marks a pending payout as settled. Shared by polling and the webhook.
    pub async fn complete(
        &self,
        cycle: &mut CircleCycle,
        transaction_id: &str,
        amount: Money,
        completed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        cycle.actual_payout_date = Some(completed_at);
        if cycle.payout_transaction_id.is_none() {
            cycle.payout_transaction_id = Some(transaction_id.to_string());
        }
        if self
            .ctx
            .advance_status(cycle, CycleStatus::PayoutCompleted, now)
            .await?
            == Applied::LostRace
        {
            return Ok(Applied::LostRace);
        }

        if amount != cycle.payout_amount {
            tracing::warn!(
                cycle_id = %cycle.id,
                reported = %amount,
                expected = %cycle.payout_amount,
                "settled amount differs from payout amount"
            );
        }
        tracing::info!(cycle_id = %cycle.id, %transaction_id, %amount, "payout completed");
        self.ctx
            .events
            .record_for(
                cycle,
                CycleEventKind::PayoutCompleted,
                json!({
                    "transaction_id": transaction_id,
                    "amount": amount,
                    "expected_amount": cycle.payout_amount,
                }),
                now,
            )
            .await?;
        if let Some(recipient) = cycle.recipient_user_id {
            self.ctx
                .effects
                .notify(
                    recipient,
                    Notification::new(
                        NotificationKind::PayoutCompleted,
                        "Payout received",
                        format!("Your payout of {amount} has arrived."),
                    )
                    .with_data(json!({ "cycle_id": cycle.id, "amount": amount })),
                )
                .await;
        }
        Ok(Applied::Yes)
    }

    /// Ops action for a stuck payout: walks the retry edge back to
    /// `ready_payout` so the next run initiates a fresh attempt.
    pub async fn requeue_payout(&self, cycle_id: Uuid, now: DateTime<Utc>) -> Result<CircleCycle> {
        let mut cycle = self.ctx.load_cycle(cycle_id).await?;
        if cycle.status != CycleStatus::PayoutPending {
            return Err(EngineError::InvalidTransition {
                from: cycle.status,
                to: CycleStatus::PayoutRetry,
            });
        }
        if cycle.payout_attempts >= self.ctx.config.max_payout_attempts {
            return Err(EngineError::ValidationError(format!(
                "cycle {cycle_id} has used all {} payout attempts",
                cycle.payout_attempts
            )));
        }

        let abandoned = cycle.payout_transaction_id.take();
        if self
            .ctx
            .advance_status(&mut cycle, CycleStatus::PayoutRetry, now)
            .await?
            == Applied::LostRace
        {
            return Err(EngineError::StoreError(format!(
                "cycle {cycle_id} changed while requeueing"
            )));
        }
        cycle.payout_initiated_at = None;
        cycle.stuck_alerted = false;
        if self
            .ctx
            .advance_status(&mut cycle, CycleStatus::ReadyPayout, now)
            .await?
            == Applied::LostRace
        {
            return Err(EngineError::StoreError(format!(
                "cycle {cycle_id} changed while requeueing"
            )));
        }
        tracing::info!(%cycle_id, ?abandoned, "payout requeued");
        self.ctx
            .events
            .record_for(
                &cycle,
                CycleEventKind::PayoutRequeued,
                json!({ "abandoned_transaction_id": abandoned, "attempts": cycle.payout_attempts }),
                now,
            )
            .await?;
        Ok(cycle)
    }
}
