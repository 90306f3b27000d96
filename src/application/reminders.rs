use super::context::EngineContext;
use crate::domain::ledger::{CycleEventKind, Phase, Reminder, ReminderStatus, RunReport};
use crate::domain::ports::{Notification, NotificationKind, Priority};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde_json::json;

/// Sends reminders that came due, re-checking each contribution at send time.
pub struct ReminderDispatcher<'a> {
    ctx: &'a EngineContext,
}

impl<'a> ReminderDispatcher<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn dispatch_due(&self, now: DateTime<Utc>, report: &mut RunReport) -> Result<()> {
        for reminder in self.ctx.store.due_reminders(now).await? {
            let cycle_id = reminder.cycle_id;
            match self.dispatch(reminder, now).await {
                Ok(true) => report.reminders_sent += 1,
                Ok(false) => {}
                Err(e) => report.push_error(Phase::Reminders, Some(cycle_id), e),
            }
        }
        Ok(())
    }

    /// Returns whether the reminder was actually sent.
    async fn dispatch(&self, mut reminder: Reminder, now: DateTime<Utc>) -> Result<bool> {
        let cycle = self.ctx.store.get_cycle(reminder.cycle_id).await?;
        let contribution = self
            .ctx
            .store
            .find_contribution(reminder.cycle_id, reminder.user_id)
            .await?;

        let (Some(cycle), Some(contribution)) = (cycle, contribution) else {
            return self.skip(reminder).await;
        };
        if !cycle.status.accepts_contributions() || contribution.status.is_resolved() {
            return self.skip(reminder).await;
        }

        let when = match reminder.days_before_deadline {
            0 => "today".to_string(),
            1 => "tomorrow".to_string(),
            days => format!("in {days} days"),
        };
        self.ctx
            .effects
            .notify(
                reminder.user_id,
                Notification::new(
                    NotificationKind::ContributionReminder,
                    "Contribution reminder",
                    format!(
                        "Your contribution of {} for cycle {} is due {when}.",
                        contribution.missing_amount(),
                        cycle.cycle_number
                    ),
                )
                .with_priority(if reminder.days_before_deadline <= 1 {
                    Priority::High
                } else {
                    Priority::Normal
                })
                .with_data(json!({ "cycle_id": cycle.id, "deadline": cycle.contribution_deadline })),
            )
            .await;

        reminder.status = ReminderStatus::Sent;
        self.ctx.store.save_reminder(reminder.clone()).await?;
        self.ctx
            .events
            .record_for(
                &cycle,
                CycleEventKind::ReminderSent,
                json!({
                    "user_id": reminder.user_id,
                    "days_before_deadline": reminder.days_before_deadline,
                }),
                now,
            )
            .await?;
        Ok(true)
    }

    async fn skip(&self, mut reminder: Reminder) -> Result<bool> {
        reminder.status = ReminderStatus::Skipped;
        self.ctx.store.save_reminder(reminder).await?;
        Ok(false)
    }
}
