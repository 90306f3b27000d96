use super::context::{Applied, EngineContext};
use crate::domain::circle::{Circle, CircleStats, CircleStatus, MembershipStatus};
use crate::domain::contribution::ContributionStatus;
use crate::domain::cycle::{CircleCycle, CycleStatus};
use crate::domain::ledger::{CycleEventKind, Phase, RunReport};
use crate::domain::ports::{Notification, NotificationKind, Priority, ScoreReason};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Advanced { next_cycle_number: u32 },
    CircleCompleted,
    LostRace,
}

/// Finalizes paid-out cycles and moves their circle forward.
pub struct CycleCloser<'a> {
    ctx: &'a EngineContext,
}

impl<'a> CycleCloser<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn close_completed_cycles(
        &self,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<()> {
        let completed = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::PayoutCompleted)
            .await?;

        for cycle in completed {
            let cycle_id = cycle.id;
            match self.close_cycle(cycle, now).await {
                Ok(CloseOutcome::LostRace) => {}
                Ok(_) => report.cycles_closed += 1,
                Err(e) => {
                    tracing::warn!(%cycle_id, error = %e, "closing cycle failed");
                    report.push_error(Phase::CloseCycles, Some(cycle_id), e);
                }
            }
        }
        Ok(())
    }

    /// The circle is moved on first, so a failure there leaves the cycle in
    /// `payout_completed` for the next run; both circle steps are idempotent.
    pub async fn close_cycle(&self, mut cycle: CircleCycle, now: DateTime<Utc>) -> Result<CloseOutcome> {
        let mut circle = self.ctx.load_circle(cycle.circle_id).await?;
        let last_cycle = cycle.cycle_number >= circle.total_cycles;

        let outcome = if last_cycle {
            self.complete_circle(&mut circle, &cycle, now).await?;
            CloseOutcome::CircleCompleted
        } else {
            let next = self.advance_circle(&mut circle, &cycle, now).await?;
            CloseOutcome::Advanced {
                next_cycle_number: next,
            }
        };

        cycle.closed_at = Some(now);
        if self
            .ctx
            .advance_status(&mut cycle, CycleStatus::Closed, now)
            .await?
            == Applied::LostRace
        {
            return Ok(CloseOutcome::LostRace);
        }

        let contributions = self.ctx.load_contributions(&cycle).await?;
        let on_time: Vec<_> = contributions
            .iter()
            .filter(|c| c.status == ContributionStatus::Completed && c.was_on_time)
            .collect();
        for contribution in &on_time {
            self.ctx
                .effects
                .adjust_score(
                    contribution.user_id,
                    ScoreReason::OnTimeContribution,
                    self.ctx.config.score.on_time_contribution,
                    json!({ "cycle_id": cycle.id, "contribution_id": contribution.id }),
                )
                .await;
        }

        tracing::info!(
            cycle_id = %cycle.id,
            cycle_number = cycle.cycle_number,
            defaults = cycle.default_count,
            ?outcome,
            "cycle closed"
        );
        self.ctx
            .events
            .record_for(
                &cycle,
                CycleEventKind::CycleClosed,
                json!({
                    "default_count": cycle.default_count,
                    "on_time_contributions": on_time.len(),
                    "payout_amount": cycle.payout_amount,
                }),
                now,
            )
            .await?;
        Ok(outcome)
    }

    /// Moves the circle pointer to the row after `cycle`. Returns the new
    /// cycle number; a no-op if the pointer already moved past `cycle`.
    async fn advance_circle(
        &self,
        circle: &mut Circle,
        cycle: &CircleCycle,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let next_number = cycle.cycle_number + 1;
        if circle.current_cycle_number >= next_number {
            return Ok(circle.current_cycle_number);
        }
        let next = self
            .ctx
            .store
            .find_cycle(circle.id, next_number)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("cycle", format!("{} #{next_number}", circle.id))
            })?;

        circle.current_cycle_number = next.cycle_number;
        circle.current_cycle_id = Some(next.id);
        self.ctx.store.save_circle(circle.clone()).await?;

        self.ctx
            .events
            .record(
                circle.id,
                Some(next.id),
                CycleEventKind::CircleAdvanced,
                json!({
                    "from_cycle_number": cycle.cycle_number,
                    "to_cycle_number": next.cycle_number,
                    "start_date": next.start_date,
                }),
                now,
            )
            .await?;

        let next_recipient = self
            .ctx
            .store
            .payout_order(circle.id)
            .await?
            .and_then(|order| order.recipient_for(next.cycle_number));
        let members = self.ctx.store.active_memberships(circle.id).await?;
        for member in members {
            let notification = if Some(member.user_id) == next_recipient {
                Notification::new(
                    NotificationKind::NextRecipient,
                    "You are next",
                    format!(
                        "{}: you receive the pool of cycle {}, starting {}.",
                        circle.name, next.cycle_number, next.start_date
                    ),
                )
                .with_priority(Priority::High)
            } else {
                Notification::new(
                    NotificationKind::CycleAdvanced,
                    format!("Cycle {} complete", cycle.cycle_number),
                    format!(
                        "{}: cycle {} starts {}.",
                        circle.name, next.cycle_number, next.start_date
                    ),
                )
            };
            self.ctx
                .effects
                .notify(
                    member.user_id,
                    notification.with_data(json!({ "circle_id": circle.id, "cycle_id": next.id })),
                )
                .await;
        }
        Ok(next.cycle_number)
    }

    /// Marks the circle completed and rewards members who never defaulted.
    async fn complete_circle(
        &self,
        circle: &mut Circle,
        cycle: &CircleCycle,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if circle.status == CircleStatus::Completed {
            return Ok(());
        }

        let cycles = self.ctx.store.cycles_for_circle(circle.id).await?;
        let defaults = self.ctx.store.defaults_for_circle(circle.id).await?;
        // The closing cycle is still `payout_completed` in the store.
        let paid: Vec<&CircleCycle> = cycles
            .iter()
            .filter(|c| c.id == cycle.id || c.status == CycleStatus::Closed)
            .collect();
        let stats = CircleStats {
            cycles_completed: paid.len() as u32,
            total_collected: paid.iter().map(|c| c.collected_amount).sum(),
            total_paid_out: paid.iter().map(|c| c.payout_amount).sum(),
            total_platform_fees: paid.iter().map(|c| c.platform_fee).sum(),
            total_reserve_covered: paid.iter().map(|c| c.reserve_covered_amount).sum(),
            total_defaults: defaults.len() as u32,
        };

        let memberships = self.ctx.store.memberships(circle.id).await?;
        let mut finishing = Vec::new();
        for mut membership in memberships.into_iter().filter(|m| m.is_active()) {
            membership.status = MembershipStatus::Completed;
            membership.completed_at = Some(now);
            finishing.push(membership.user_id);
            self.ctx.store.save_membership(membership).await?;
        }

        circle.status = CircleStatus::Completed;
        circle.completed_at = Some(now);
        circle.stats = Some(stats.clone());
        self.ctx.store.save_circle(circle.clone()).await?;

        tracing::info!(
            circle_id = %circle.id,
            cycles = stats.cycles_completed,
            defaults = stats.total_defaults,
            "circle completed"
        );
        self.ctx
            .events
            .record(
                circle.id,
                Some(cycle.id),
                CycleEventKind::CircleCompleted,
                serde_json::to_value(&stats)?,
                now,
            )
            .await?;

        let defaulters: HashSet<_> = defaults.iter().map(|d| d.user_id).collect();
        for user_id in finishing.iter().filter(|u| !defaulters.contains(u)) {
            self.ctx
                .effects
                .adjust_score(
                    *user_id,
                    ScoreReason::CircleCompleted,
                    self.ctx.config.score.circle_completion_bonus,
                    json!({ "circle_id": circle.id }),
                )
                .await;
        }
        let notification = Notification::new(
            NotificationKind::CircleCompleted,
            format!("{} is complete", circle.name),
            format!(
                "All {} cycles of {} are done. Thank you for saving together.",
                stats.cycles_completed, circle.name
            ),
        )
        .with_data(json!({ "circle_id": circle.id, "stats": stats }));
        self.ctx
            .effects
            .notify_all(finishing.iter().copied(), &notification)
            .await;
        Ok(())
    }
}
