use super::closer::CycleCloser;
use super::context::EngineContext;
use super::deadline::DeadlineProcessor;
use super::health::{HealthMonitor, HealthReport};
use super::payout::{PayoutInitiator, SettlementTracker};
use super::reminders::ReminderDispatcher;
use super::starter::CycleStarter;
use super::webhooks::{WebhookHandler, WebhookOutcome};
use crate::config::EngineConfig;
use crate::domain::contribution::ContributionReceived;
use crate::domain::cycle::CircleCycle;
use crate::domain::ledger::{EngineRun, Phase, RunReport};
use crate::domain::money::Money;
use crate::domain::ports::{
    AlertKind, AlertSinkBox, DatastoreBox, NotificationSinkBox, OpsAlert, PaymentAdapterBox,
    ScoreServiceBox, Severity,
};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

/// The cycle progression engine.
///
/// `CycleEngine` is invoked by an external scheduler. Each invocation runs
/// every phase in a fixed order over whatever the datastore currently holds,
/// so a run that dies halfway is simply resumed by the next one. It owns
/// only injected handles and immutable configuration.
pub struct CycleEngine {
    ctx: EngineContext,
}

impl CycleEngine {
    /// Creates a new `CycleEngine`.
    ///
    /// # Arguments
    ///
    /// * `store` - The transactional datastore holding circles and cycles.
    /// * `payments` - The payment provider adapter used for payouts.
    /// * `notifier`, `scores`, `alerts` - Fire-and-forget collaborators.
    /// * `config` - Policy tunables.
    pub fn new(
        store: DatastoreBox,
        payments: PaymentAdapterBox,
        notifier: NotificationSinkBox,
        scores: ScoreServiceBox,
        alerts: AlertSinkBox,
        config: EngineConfig,
    ) -> Self {
        Self {
            ctx: EngineContext::new(store, payments, notifier, scores, alerts, config),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub async fn run(&self) -> Result<RunReport> {
        self.run_at(Utc::now()).await
    }

    /// One scheduler invocation evaluated at `now`.
    ///
    /// Per-cycle failures are collected in the report. A phase-level failure
    /// aborts the rest of the run, is persisted on the run record and raised
    /// as an ops alert, and is returned as the error.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let mut run = EngineRun::begin(now);
        let mut report = RunReport::default();
        tracing::info!(run_id = %run.id, %now, "engine run started");

        let outcome = self.run_phases(now, &mut report).await;
        let finished_at = now.max(Utc::now());

        match outcome {
            Ok(()) => {
                run.finish(report.clone(), None, finished_at);
                tracing::info!(
                    run_id = %run.id,
                    started = report.cycles_started,
                    deadlines = report.deadlines_processed,
                    grace_started = report.grace_periods_started,
                    grace_ended = report.grace_periods_ended,
                    payouts_initiated = report.payouts_initiated,
                    payouts_completed = report.payouts_completed,
                    closed = report.cycles_closed,
                    errors = report.errors.len(),
                    "engine run finished"
                );
                self.ctx.store.save_run(run).await?;
                Ok(report)
            }
            Err((phase, e)) => {
                let reason = format!("{phase}: {e}");
                run.finish(report, Some(reason.clone()), finished_at);
                let run_id = run.id;
                if let Err(save_err) = self.ctx.store.save_run(run).await {
                    tracing::error!(%run_id, error = %save_err, "could not persist aborted run");
                }
                self.ctx
                    .effects
                    .alert(
                        OpsAlert::new(
                            AlertKind::EngineRunAborted,
                            Severity::Critical,
                            format!("engine run {run_id} aborted in {reason}"),
                        )
                        .with_data(json!({ "run_id": run_id, "phase": phase })),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> std::result::Result<(), (Phase, EngineError)> {
        let ctx = &self.ctx;
        let tag = |phase: Phase| move |e: EngineError| (phase, e);

        CycleStarter::new(ctx)
            .start_due_cycles(now, report)
            .await
            .map_err(tag(Phase::StartCycles))?;
        let deadlines = DeadlineProcessor::new(ctx);
        deadlines
            .process_deadlines(now, report)
            .await
            .map_err(tag(Phase::Deadlines))?;
        deadlines
            .process_grace_periods(now, report)
            .await
            .map_err(tag(Phase::GracePeriods))?;
        PayoutInitiator::new(ctx)
            .initiate_payouts(now, report)
            .await
            .map_err(tag(Phase::InitiatePayouts))?;
        SettlementTracker::new(ctx)
            .poll_payouts(now, report)
            .await
            .map_err(tag(Phase::PollPayouts))?;
        CycleCloser::new(ctx)
            .close_completed_cycles(now, report)
            .await
            .map_err(tag(Phase::CloseCycles))?;
        ReminderDispatcher::new(ctx)
            .dispatch_due(now, report)
            .await
            .map_err(tag(Phase::Reminders))?;
        Ok(())
    }

    /// Contribution webhook. Replays of a transaction id are no-ops.
    pub async fn process_contribution_received(
        &self,
        payload: ContributionReceived,
    ) -> Result<WebhookOutcome> {
        WebhookHandler::new(&self.ctx)
            .process_contribution_received(payload, Utc::now())
            .await
    }

    /// Payout settlement webhook. Redelivery after completion is a no-op.
    pub async fn process_payout_completed(
        &self,
        cycle_id: Uuid,
        transaction_id: &str,
        amount: Money,
    ) -> Result<WebhookOutcome> {
        WebhookHandler::new(&self.ctx)
            .process_payout_completed(cycle_id, transaction_id, amount, Utc::now())
            .await
    }

    pub async fn requeue_payout(&self, cycle_id: Uuid) -> Result<CircleCycle> {
        SettlementTracker::new(&self.ctx)
            .requeue_payout(cycle_id, Utc::now())
            .await
    }

    pub async fn health_check(&self) -> Result<HealthReport> {
        HealthMonitor::new(&self.ctx).check(Utc::now()).await
    }
}
