//! Write-once records: defaults, audit events, engine runs and reminders,
//! plus the community reserve fund.

use super::circle::ContributionPolicy;
use super::contribution::CycleContribution;
use super::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Snapshot of a contribution that ended its cycle unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDefault {
    pub id: Uuid,
    pub circle_id: Uuid,
    pub cycle_id: Uuid,
    pub contribution_id: Uuid,
    pub user_id: Uuid,
    pub expected_amount: Money,
    pub contributed_amount: Money,
    pub missing_amount: Money,
    pub covered_by_reserve: bool,
    pub policy: ContributionPolicy,
    #[serde(default)]
    pub penalized_vouchers: Vec<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

impl MemberDefault {
    /// `original_missing` is the gap before any reserve coverage.
    pub fn snapshot(
        contribution: &CycleContribution,
        original_missing: Money,
        policy: ContributionPolicy,
        penalized_vouchers: Vec<Uuid>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            circle_id: contribution.circle_id,
            cycle_id: contribution.cycle_id,
            contribution_id: contribution.id,
            user_id: contribution.user_id,
            expected_amount: contribution.expected_amount,
            contributed_amount: contribution.contributed_amount - contribution.covered_amount,
            missing_amount: original_missing,
            covered_by_reserve: contribution.covered_by.is_some(),
            policy,
            penalized_vouchers,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveFund {
    pub community_id: Uuid,
    pub balance: Money,
    #[serde(default)]
    pub total_debited: Money,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outcome of an atomic reserve debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveDebit {
    pub balance_before: Money,
    pub debited: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleEventKind {
    CycleStarted,
    CycleStartFailed,
    ContributionReceived,
    DeadlineReached,
    GracePeriodStarted,
    GracePeriodEnded,
    ReserveCoverageApplied,
    ReserveCoveragePartial,
    ReserveCoverageDenied,
    MemberDefaulted,
    ReadyForPayout,
    PayoutInitiated,
    PayoutAttemptFailed,
    PayoutFailed,
    PayoutStuck,
    PayoutRequeued,
    PayoutCompleted,
    CycleClosed,
    CircleAdvanced,
    CircleCompleted,
    ReminderSent,
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEvent {
    pub id: Uuid,
    pub circle_id: Uuid,
    pub cycle_id: Option<Uuid>,
    pub kind: CycleEventKind,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    StartCycles,
    Deadlines,
    GracePeriods,
    InitiatePayouts,
    PollPayouts,
    CloseCycles,
    Reminders,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartCycles => "start_cycles",
            Self::Deadlines => "deadlines",
            Self::GracePeriods => "grace_periods",
            Self::InitiatePayouts => "initiate_payouts",
            Self::PollPayouts => "poll_payouts",
            Self::CloseCycles => "close_cycles",
            Self::Reminders => "reminders",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseError {
    pub phase: Phase,
    pub cycle_id: Option<Uuid>,
    pub message: String,
}

/// Counters returned by one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunReport {
    pub cycles_started: u32,
    pub deadlines_processed: u32,
    pub grace_periods_started: u32,
    pub grace_periods_ended: u32,
    pub payouts_initiated: u32,
    pub payouts_completed: u32,
    pub cycles_closed: u32,
    pub reminders_sent: u32,
    pub errors: Vec<PhaseError>,
}

impl RunReport {
    pub fn push_error(&mut self, phase: Phase, cycle_id: Option<Uuid>, message: impl ToString) {
        self.errors.push(PhaseError {
            phase,
            cycle_id,
            message: message.to_string(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

/// Persisted record of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub report: RunReport,
    pub abort_reason: Option<String>,
}

impl EngineRun {
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            finished_at: None,
            duration_ms: 0,
            status: RunStatus::Running,
            report: RunReport::default(),
            abort_reason: None,
        }
    }

    pub fn finish(&mut self, report: RunReport, abort_reason: Option<String>, finished_at: DateTime<Utc>) {
        self.report = report;
        self.status = if abort_reason.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        self.abort_reason = abort_reason;
        self.finished_at = Some(finished_at);
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Skipped,
}

/// A contribution reminder scheduled when a cycle starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub cycle_id: Uuid,
    pub contribution_id: Uuid,
    pub user_id: Uuid,
    pub send_at: DateTime<Utc>,
    pub days_before_deadline: i64,
    pub status: ReminderStatus,
}
