use super::context::{Applied, EngineContext, days_from};
use crate::domain::circle::{Circle, CircleStatus, Membership};
use crate::domain::contribution::CycleContribution;
use crate::domain::cycle::{CircleCycle, CycleStatus};
use crate::domain::ledger::{CycleEventKind, Phase, Reminder, ReminderStatus, RunReport};
use crate::domain::ports::{Notification, NotificationKind, Priority};
use crate::error::{EngineError, Result, SetupError};
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

/// Opens collection on scheduled cycles whose start date has arrived.
pub struct CycleStarter<'a> {
    ctx: &'a EngineContext,
}

impl<'a> CycleStarter<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn start_due_cycles(&self, now: DateTime<Utc>, report: &mut RunReport) -> Result<()> {
        let today = now.date_naive();
        let due: Vec<CircleCycle> = self
            .ctx
            .store
            .cycles_with_status(CycleStatus::Scheduled)
            .await?
            .into_iter()
            .filter(|cycle| cycle.start_date <= today)
            .collect();

        for cycle in due {
            let cycle_id = cycle.id;
            let circle_id = cycle.circle_id;
            match self.start_cycle(cycle, now).await {
                Ok(Applied::Yes) => report.cycles_started += 1,
                Ok(Applied::LostRace) => {}
                Err(e) => {
                    tracing::warn!(%cycle_id, error = %e, "cycle start failed");
                    let recorded = self
                        .ctx
                        .events
                        .record(
                            circle_id,
                            Some(cycle_id),
                            CycleEventKind::CycleStartFailed,
                            json!({ "error": e.to_string() }),
                            now,
                        )
                        .await;
                    if let Err(log_err) = recorded {
                        tracing::error!(%cycle_id, error = %log_err, "could not record cycle_start_failed");
                    }
                    report.push_error(Phase::StartCycles, Some(cycle_id), e);
                }
            }
        }
        Ok(())
    }

    /// Starts one cycle. Setup errors leave the cycle `scheduled`.
    pub async fn start_cycle(&self, mut cycle: CircleCycle, now: DateTime<Utc>) -> Result<Applied> {
        let circle = self
            .ctx
            .store
            .get_circle(cycle.circle_id)
            .await?
            .ok_or(SetupError::CircleNotFound(cycle.circle_id))?;
        if circle.status != CircleStatus::Active {
            return Err(SetupError::CircleInactive(circle.id).into());
        }

        let members = self.ctx.store.active_memberships(circle.id).await?;
        if members.is_empty() {
            return Err(SetupError::NoActiveMembers(circle.id).into());
        }

        let order = self
            .ctx
            .store
            .payout_order(circle.id)
            .await?
            .filter(|order| order.finalized)
            .ok_or(SetupError::PayoutOrderNotFinalized(circle.id))?;
        let recipient = order
            .recipient_for(cycle.cycle_number)
            .ok_or(SetupError::MissingPayoutSlot {
                circle_id: circle.id,
                cycle_number: cycle.cycle_number,
            })?;

        let contributions = self.create_contributions(&circle, &cycle, &members).await?;

        cycle.recipient_user_id = Some(recipient);
        cycle.contributions_expected = members.len() as u32;
        cycle.expected_amount = circle.contribution_amount * cycle.contributions_expected;
        cycle.recompute_totals(&contributions);
        if self
            .ctx
            .advance_status(&mut cycle, CycleStatus::Collecting, now)
            .await?
            == Applied::LostRace
        {
            return Ok(Applied::LostRace);
        }

        tracing::info!(
            cycle_id = %cycle.id,
            circle_id = %circle.id,
            cycle_number = cycle.cycle_number,
            members = members.len(),
            "cycle started"
        );
        self.ctx
            .events
            .record_for(
                &cycle,
                CycleEventKind::CycleStarted,
                json!({
                    "recipient_user_id": recipient,
                    "members": members.len(),
                    "expected_amount": cycle.expected_amount,
                    "contribution_deadline": cycle.contribution_deadline,
                }),
                now,
            )
            .await?;

        self.notify_members(&circle, &cycle, &members, recipient).await;
        self.schedule_reminders(&cycle, &contributions, now).await?;
        Ok(Applied::Yes)
    }

    /// One contribution row per active member; rows left by an earlier,
    /// interrupted attempt are reused.
    async fn create_contributions(
        &self,
        circle: &Circle,
        cycle: &CircleCycle,
        members: &[Membership],
    ) -> Result<Vec<CycleContribution>> {
        let mut rows = self.ctx.store.contributions(cycle.id).await?;
        for member in members {
            if rows.iter().any(|c| c.user_id == member.user_id) {
                continue;
            }
            let row = CycleContribution::new(cycle, member.user_id, circle.contribution_amount);
            match self.ctx.store.insert_contribution(row.clone()).await {
                Ok(()) => rows.push(row),
                Err(EngineError::Duplicate { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(rows)
    }

    async fn notify_members(
        &self,
        circle: &Circle,
        cycle: &CircleCycle,
        members: &[Membership],
        recipient: Uuid,
    ) {
        let data = json!({
            "circle_id": circle.id,
            "cycle_id": cycle.id,
            "cycle_number": cycle.cycle_number,
            "amount": circle.contribution_amount,
            "deadline": cycle.contribution_deadline,
        });
        for member in members {
            let notification = if member.user_id == recipient {
                Notification::new(
                    NotificationKind::PayoutRecipient,
                    format!("You receive the pool of cycle {}", cycle.cycle_number),
                    format!(
                        "{}: cycle {} has started and you are this cycle's recipient.",
                        circle.name, cycle.cycle_number
                    ),
                )
                .with_priority(Priority::High)
            } else {
                Notification::new(
                    NotificationKind::CycleStarted,
                    format!("Cycle {} has started", cycle.cycle_number),
                    format!(
                        "{}: contribute {} before {}.",
                        circle.name,
                        circle.contribution_amount,
                        cycle.contribution_deadline.format("%Y-%m-%d")
                    ),
                )
            };
            self.ctx
                .effects
                .notify(member.user_id, notification.with_data(data.clone()))
                .await;
        }
    }

    /// Reminders whose send time already passed are not scheduled.
    async fn schedule_reminders(
        &self,
        cycle: &CircleCycle,
        contributions: &[CycleContribution],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let existing = self.ctx.store.reminders_for_cycle(cycle.id).await?;
        for offset in &self.ctx.config.reminder_offsets_days {
            let send_at = days_from(cycle.contribution_deadline, offset.saturating_neg())?;
            if send_at < now {
                continue;
            }
            for contribution in contributions.iter().filter(|c| !c.status.is_resolved()) {
                let already = existing.iter().any(|r| {
                    r.contribution_id == contribution.id && r.days_before_deadline == *offset
                });
                if already {
                    continue;
                }
                self.ctx
                    .store
                    .save_reminder(Reminder {
                        id: Uuid::new_v4(),
                        cycle_id: cycle.id,
                        contribution_id: contribution.id,
                        user_id: contribution.user_id,
                        send_at,
                        days_before_deadline: *offset,
                        status: ReminderStatus::Pending,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
