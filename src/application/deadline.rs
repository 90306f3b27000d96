//! Deadline and grace-period handling.
//!
//! Once a collecting cycle passes its deadline, the circle's
//! `ContributionPolicy` decides whether members get a grace window, whether
//! the reserve backstops the gap, and when defaults are recorded. Grace
//! cycles are re-swept on every run until they resolve or expire.

use super::context::{Applied, EngineContext, days_from};
use super::payout::PayoutInitiator;
use super::reserve::ReserveCoverage;
use crate::domain::circle::{Circle, ContributionPolicy};
use crate::domain::contribution::{ContributionStatus, CycleContribution};
use crate::domain::cycle::{CircleCycle, CycleStatus};
use crate::domain::ledger::{CycleEventKind, MemberDefault, Phase, RunReport};
use crate::domain::money::Money;
use crate::domain::ports::{Notification, NotificationKind, Priority, ScoreReason};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    ReadyForPayout,
    GraceOpened,
    ProceededWithDefaults,
    LostRace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceOutcome {
    /// Every contribution came in during grace.
    Resolved,
    /// The window expired and End-Grace ran.
    Expired,
    Waiting,
    LostRace,
}

/// How unresolved contributions are settled when waiting is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Settlement {
    cover: bool,
    /// Record defaults even for contributions the reserve covered.
    default_covered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortfallSummary {
    pub defaults: u32,
    pub reserve_debited: Money,
}

pub struct DeadlineProcessor<'a> {
    ctx: &'a EngineContext,
}

impl<'a> DeadlineProcessor<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Deadline sweep over `collecting` cycles past their deadline, plus any
    /// cycle a failed run left in `deadline_reached`.
    pub async fn process_deadlines(&self, now: DateTime<Utc>, report: &mut RunReport) -> Result<()> {
        let mut due: Vec<CircleCycle> = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::Collecting)
            .await?
            .into_iter()
            .filter(|cycle| cycle.contribution_deadline <= now)
            .collect();
        due.extend(
            self.ctx
                .store
                .cycles_with_status(CycleStatus::DeadlineReached)
                .await?,
        );

        for cycle in due {
            let cycle_id = cycle.id;
            match self.process_deadline(cycle, now).await {
                Ok(DeadlineOutcome::LostRace) => {}
                Ok(outcome) => {
                    report.deadlines_processed += 1;
                    if outcome == DeadlineOutcome::GraceOpened {
                        report.grace_periods_started += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(%cycle_id, error = %e, "deadline processing failed");
                    report.push_error(Phase::Deadlines, Some(cycle_id), e);
                }
            }
        }
        Ok(())
    }

    /// Grace sweep over `grace_period` cycles.
    pub async fn process_grace_periods(
        &self,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<()> {
        let cycles = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::GracePeriod)
            .await?;

        for cycle in cycles {
            let cycle_id = cycle.id;
            match self.sweep_grace(cycle, now).await {
                Ok(GraceOutcome::Resolved | GraceOutcome::Expired) => report.grace_periods_ended += 1,
                Ok(GraceOutcome::Waiting | GraceOutcome::LostRace) => {}
                Err(e) => {
                    tracing::warn!(%cycle_id, error = %e, "grace period processing failed");
                    report.push_error(Phase::GracePeriods, Some(cycle_id), e);
                }
            }
        }
        Ok(())
    }

    pub async fn process_deadline(
        &self,
        mut cycle: CircleCycle,
        now: DateTime<Utc>,
    ) -> Result<DeadlineOutcome> {
        let circle = self.ctx.load_circle(cycle.circle_id).await?;
        let contributions = self.ctx.load_contributions(&cycle).await?;

        let grace_end = self.grace_end(&circle, &cycle)?;

        cycle.recompute_totals(&contributions);
        let resumed = cycle.status == CycleStatus::DeadlineReached;
        if resumed {
            tracing::info!(cycle_id = %cycle.id, "resuming deadline processing");
        } else if self
            .ctx
            .advance_status(&mut cycle, CycleStatus::DeadlineReached, now)
            .await?
            == Applied::LostRace
        {
            return Ok(DeadlineOutcome::LostRace);
        }

        let unresolved = contributions.iter().filter(|c| !c.status.is_resolved()).count();
        if !resumed || !self.deadline_recorded(&cycle).await? {
            self.ctx
                .events
                .record_for(
                    &cycle,
                    CycleEventKind::DeadlineReached,
                    json!({
                        "contributions_received": cycle.contributions_received,
                        "contributions_expected": cycle.contributions_expected,
                        "unresolved": unresolved,
                        "policy": circle.incomplete_contribution_policy.as_str(),
                    }),
                    now,
                )
                .await?;
        }

        if unresolved == 0 {
            PayoutInitiator::new(self.ctx)
                .mark_ready(&circle, &mut cycle, &contributions, now)
                .await?;
            return Ok(DeadlineOutcome::ReadyForPayout);
        }

        match circle.incomplete_contribution_policy {
            ContributionPolicy::StrictWait
            | ContributionPolicy::GraceThenProceed
            | ContributionPolicy::GraceThenCover => {
                let end = grace_end.ok_or_else(|| {
                    EngineError::ValidationError(format!("cycle {} has no grace window", cycle.id))
                })?;
                self.open_grace(&circle, &mut cycle, contributions, end, now).await
            }
            ContributionPolicy::ImmediateProceed => {
                let settlement = Settlement {
                    cover: false,
                    default_covered: false,
                };
                self.proceed_now(&circle, &mut cycle, contributions, settlement, now)
                    .await
            }
            ContributionPolicy::ImmediateCover => {
                let settlement = Settlement {
                    cover: true,
                    default_covered: true,
                };
                self.proceed_now(&circle, &mut cycle, contributions, settlement, now)
                    .await
            }
        }
    }

    /// When a grace window opened now would close, if the policy has one.
    fn grace_end(&self, circle: &Circle, cycle: &CircleCycle) -> Result<Option<DateTime<Utc>>> {
        let days = match circle.incomplete_contribution_policy {
            ContributionPolicy::StrictWait => self.ctx.config.strict_wait_max_days,
            ContributionPolicy::GraceThenProceed | ContributionPolicy::GraceThenCover => {
                circle.grace_period_days
            }
            ContributionPolicy::ImmediateProceed | ContributionPolicy::ImmediateCover => {
                return Ok(None);
            }
        };
        days_from(cycle.contribution_deadline, i64::from(days)).map(Some)
    }

    async fn deadline_recorded(&self, cycle: &CircleCycle) -> Result<bool> {
        Ok(self
            .ctx
            .store
            .events_for_circle(cycle.circle_id)
            .await?
            .iter()
            .any(|e| e.cycle_id == Some(cycle.id) && e.kind == CycleEventKind::DeadlineReached))
    }

    async fn proceed_now(
        &self,
        circle: &Circle,
        cycle: &mut CircleCycle,
        contributions: Vec<CycleContribution>,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> Result<DeadlineOutcome> {
        let (summary, applied) = self
            .settle_and_proceed(circle, cycle, contributions, settlement, now)
            .await?;
        if applied == Applied::LostRace {
            return Ok(DeadlineOutcome::LostRace);
        }
        tracing::info!(
            cycle_id = %cycle.id,
            defaults = summary.defaults,
            reserve_debited = %summary.reserve_debited,
            "proceeding to payout without grace"
        );
        Ok(DeadlineOutcome::ProceededWithDefaults)
    }

    pub async fn sweep_grace(&self, mut cycle: CircleCycle, now: DateTime<Utc>) -> Result<GraceOutcome> {
        let contributions = self.ctx.load_contributions(&cycle).await?;
        let all_resolved = contributions.iter().all(|c| c.status.is_resolved());
        let expired = cycle
            .grace_period_end
            .is_none_or(|end| end <= now);
        if !all_resolved && !expired {
            return Ok(GraceOutcome::Waiting);
        }

        let circle = self.ctx.load_circle(cycle.circle_id).await?;
        if all_resolved {
            let applied = PayoutInitiator::new(self.ctx)
                .mark_ready(&circle, &mut cycle, &contributions, now)
                .await?;
            if applied == Applied::LostRace {
                return Ok(GraceOutcome::LostRace);
            }
            self.ctx
                .events
                .record_for(
                    &cycle,
                    CycleEventKind::GracePeriodEnded,
                    json!({ "reason": "all_contributions_received", "defaults": 0 }),
                    now,
                )
                .await?;
            return Ok(GraceOutcome::Resolved);
        }

        self.end_grace(&circle, &mut cycle, contributions, now).await
    }

    /// End-Grace: settles what is still unpaid once and moves to payout.
    pub async fn end_grace(
        &self,
        circle: &Circle,
        cycle: &mut CircleCycle,
        contributions: Vec<CycleContribution>,
        now: DateTime<Utc>,
    ) -> Result<GraceOutcome> {
        let settlement = Settlement {
            cover: circle.incomplete_contribution_policy.covers_from_reserve(),
            default_covered: false,
        };
        let (summary, applied) = self
            .settle_and_proceed(circle, cycle, contributions, settlement, now)
            .await?;
        if applied == Applied::LostRace {
            return Ok(GraceOutcome::LostRace);
        }
        tracing::info!(
            cycle_id = %cycle.id,
            defaults = summary.defaults,
            collected = %cycle.collected_amount,
            "grace period ended"
        );
        self.ctx
            .events
            .record_for(
                cycle,
                CycleEventKind::GracePeriodEnded,
                json!({
                    "reason": "expired",
                    "defaults": summary.defaults,
                    "reserve_debited": summary.reserve_debited,
                }),
                now,
            )
            .await?;
        Ok(GraceOutcome::Expired)
    }

    async fn open_grace(
        &self,
        circle: &Circle,
        cycle: &mut CircleCycle,
        contributions: Vec<CycleContribution>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeadlineOutcome> {
        cycle.grace_period_end = Some(end);
        if self
            .ctx
            .advance_status(cycle, CycleStatus::GracePeriod, now)
            .await?
            == Applied::LostRace
        {
            return Ok(DeadlineOutcome::LostRace);
        }

        let mut unpaid = Vec::new();
        for mut contribution in contributions.into_iter().filter(|c| !c.status.is_resolved()) {
            contribution.status = ContributionStatus::Late;
            contribution.in_grace_period = true;
            self.ctx.store.save_contribution(contribution.clone()).await?;
            unpaid.push(contribution);
        }

        tracing::info!(
            cycle_id = %cycle.id,
            unpaid = unpaid.len(),
            grace_period_end = %end,
            "grace period started"
        );
        self.ctx
            .events
            .record_for(
                cycle,
                CycleEventKind::GracePeriodStarted,
                json!({
                    "grace_period_end": end,
                    "policy": circle.incomplete_contribution_policy.as_str(),
                    "unpaid_members": unpaid.iter().map(|c| c.user_id).collect::<Vec<_>>(),
                }),
                now,
            )
            .await?;

        let penalty = self.ctx.config.score.late_contribution;
        for contribution in &unpaid {
            self.ctx
                .effects
                .notify(
                    contribution.user_id,
                    Notification::new(
                        NotificationKind::ContributionLate,
                        "Contribution overdue",
                        format!(
                            "Your contribution of {} to {} is late. Pay before {} to avoid a default.",
                            contribution.missing_amount(),
                            circle.name,
                            end.format("%Y-%m-%d %H:%M UTC")
                        ),
                    )
                    .with_priority(Priority::High)
                    .with_data(json!({ "cycle_id": cycle.id, "grace_period_end": end })),
                )
                .await;
            self.ctx
                .effects
                .adjust_score(
                    contribution.user_id,
                    ScoreReason::LateContribution,
                    penalty,
                    json!({ "cycle_id": cycle.id, "contribution_id": contribution.id }),
                )
                .await;
        }

        if let Some(recipient) = cycle.recipient_user_id {
            self.ctx
                .effects
                .notify(
                    recipient,
                    Notification::new(
                        NotificationKind::PayoutDelayed,
                        "Your payout is delayed",
                        format!(
                            "{} member(s) of {} have not paid yet; the payout waits until {} at the latest.",
                            unpaid.len(),
                            circle.name,
                            end.format("%Y-%m-%d")
                        ),
                    )
                    .with_data(json!({ "cycle_id": cycle.id, "grace_period_end": end })),
                )
                .await;
        }

        Ok(DeadlineOutcome::GraceOpened)
    }

    /// Covers (if asked), records defaults and transitions to ready-payout.
    async fn settle_and_proceed(
        &self,
        circle: &Circle,
        cycle: &mut CircleCycle,
        contributions: Vec<CycleContribution>,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> Result<(ShortfallSummary, Applied)> {
        let (mut settled, mut unresolved): (Vec<_>, Vec<_>) = contributions
            .into_iter()
            .partition(|c| c.status.is_resolved());
        let original_missing: HashMap<Uuid, Money> = unresolved
            .iter()
            .map(|c| (c.id, c.missing_amount()))
            .collect();

        let mut summary = ShortfallSummary::default();
        if settlement.cover {
            let coverage = ReserveCoverage::new(self.ctx)
                .cover(circle, cycle, &mut unresolved, now)
                .await?;
            summary.reserve_debited = coverage.debited;
        }

        for contribution in unresolved.iter_mut() {
            let covered = contribution.status.is_resolved();
            if covered && !settlement.default_covered {
                continue;
            }
            if !covered {
                contribution.status = ContributionStatus::Missed;
                contribution.in_grace_period = false;
                self.ctx.store.save_contribution(contribution.clone()).await?;
            }
            // A fully covered row defaults on its whole original gap, anything
            // else on what the reserve left open.
            let missing = if covered {
                original_missing
                    .get(&contribution.id)
                    .copied()
                    .unwrap_or_else(|| contribution.missing_amount())
            } else {
                contribution.missing_amount()
            };
            if self
                .record_member_default(circle, cycle, contribution, missing, now)
                .await?
            {
                summary.defaults += 1;
            }
        }

        settled.append(&mut unresolved);
        cycle.default_count = self
            .ctx
            .store
            .defaults_for_circle(circle.id)
            .await?
            .iter()
            .filter(|d| d.cycle_id == cycle.id)
            .count() as u32;
        let applied = PayoutInitiator::new(self.ctx)
            .mark_ready(circle, cycle, &settled, now)
            .await?;
        Ok((summary, applied))
    }

    /// Writes the default snapshot and applies its penalties exactly once.
    /// Returns `false` if the contribution already had a default.
    async fn record_member_default(
        &self,
        circle: &Circle,
        cycle: &CircleCycle,
        contribution: &CycleContribution,
        missing: Money,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let vouchers: Vec<Uuid> = self
            .ctx
            .store
            .vouches_for(circle.id, contribution.user_id)
            .await?
            .into_iter()
            .filter(|v| v.active)
            .map(|v| v.voucher_id)
            .collect();

        let default = MemberDefault::snapshot(
            contribution,
            missing,
            circle.incomplete_contribution_policy,
            vouchers.clone(),
            now,
        );
        let default_id = default.id;
        match self.ctx.store.record_default(default).await {
            Ok(()) => {}
            Err(EngineError::Duplicate { .. }) => {
                tracing::debug!(contribution_id = %contribution.id, "default already recorded");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            cycle_id = %cycle.id,
            user_id = %contribution.user_id,
            %missing,
            vouchers = vouchers.len(),
            "member default recorded"
        );
        self.ctx
            .events
            .record_for(
                cycle,
                CycleEventKind::MemberDefaulted,
                json!({
                    "default_id": default_id,
                    "user_id": contribution.user_id,
                    "missing_amount": missing,
                    "covered_by_reserve": contribution.covered_by.is_some(),
                    "vouchers": vouchers,
                }),
                now,
            )
            .await?;

        let scores = self.ctx.config.score;
        let meta = json!({ "cycle_id": cycle.id, "default_id": default_id });
        self.ctx
            .effects
            .adjust_score(
                contribution.user_id,
                ScoreReason::MemberDefault,
                scores.member_default,
                meta.clone(),
            )
            .await;
        self.ctx
            .effects
            .notify(
                contribution.user_id,
                Notification::new(
                    NotificationKind::MemberDefaulted,
                    "Contribution default recorded",
                    format!(
                        "Your contribution of {} to {} for cycle {} was not received and has been recorded as a default.",
                        missing, circle.name, cycle.cycle_number
                    ),
                )
                .with_priority(Priority::High)
                .with_data(meta.clone()),
            )
            .await;
        for voucher in vouchers {
            self.ctx
                .effects
                .adjust_score(
                    voucher,
                    ScoreReason::VouchedMemberDefault,
                    scores.voucher_penalty,
                    json!({
                        "cycle_id": cycle.id,
                        "default_id": default_id,
                        "defaulter": contribution.user_id,
                    }),
                )
                .await;
        }
        Ok(true)
    }
}
