//! Health probe over engine runs and payouts.
//!
//! Integrity anomalies are reported and alerted on, never remediated.

use super::context::EngineContext;
use crate::domain::cycle::CycleStatus;
use crate::domain::ledger::RunStatus;
use crate::domain::ports::{AlertKind, OpsAlert, Severity};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub runs_missed: bool,
    pub stuck_payouts: Vec<Uuid>,
    pub failed_payouts: Vec<Uuid>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        !self.runs_missed
            && self.last_run_status != Some(RunStatus::Aborted)
            && self.stuck_payouts.is_empty()
            && self.failed_payouts.is_empty()
    }
}

pub struct HealthMonitor<'a> {
    ctx: &'a EngineContext,
}

impl<'a> HealthMonitor<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn check(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let config = &self.ctx.config;
        let last_run = self.ctx.store.latest_run().await?;
        let tolerance = config
            .run_interval_minutes
            .checked_mul(config.missed_run_tolerance.max(1))
            .and_then(Duration::try_minutes)
            .ok_or_else(|| EngineError::ValidationError("missed-run tolerance is out of range".to_string()))?;
        let runs_missed = match &last_run {
            Some(run) => now - run.started_at > tolerance,
            None => true,
        };

        let stuck_after = Duration::try_hours(config.stuck_payout_hours).ok_or_else(|| {
            EngineError::ValidationError("stuck_payout_hours is out of range".to_string())
        })?;
        let stuck_payouts = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::PayoutPending)
            .await?
            .into_iter()
            .filter(|c| {
                c.payout_initiated_at
                    .is_some_and(|at| now - at > stuck_after)
            })
            .map(|c| c.id)
            .collect();
        let failed_payouts = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::PayoutFailed)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let report = HealthReport {
            last_run_at: last_run.as_ref().map(|r| r.started_at),
            last_run_status: last_run.as_ref().map(|r| r.status),
            runs_missed,
            stuck_payouts,
            failed_payouts,
        };

        if report.runs_missed {
            self.ctx
                .effects
                .alert(
                    OpsAlert::new(
                        AlertKind::EngineRunsMissed,
                        Severity::Critical,
                        match report.last_run_at {
                            Some(at) => format!("no engine run since {at}"),
                            None => "the engine has never run".to_string(),
                        },
                    )
                    .with_data(json!({ "last_run_at": report.last_run_at })),
                )
                .await;
        }
        if !report.is_healthy() {
            tracing::warn!(
                runs_missed = report.runs_missed,
                stuck = report.stuck_payouts.len(),
                failed = report.failed_payouts.len(),
                "engine health degraded"
            );
        }
        Ok(report)
    }
}
