use super::effects::Effects;
use super::events::EventRecorder;
use crate::config::EngineConfig;
use crate::domain::circle::Circle;
use crate::domain::contribution::CycleContribution;
use crate::domain::cycle::{CircleCycle, CycleStatus};
use crate::domain::ports::{
    AlertSinkBox, DatastoreBox, NotificationSinkBox, PaymentAdapterBox, ScoreServiceBox,
};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Injected handles shared by every engine component.
///
/// Holds no mutable state of its own; everything lives in the datastore.
#[derive(Clone)]
pub struct EngineContext {
    pub store: DatastoreBox,
    pub payments: PaymentAdapterBox,
    pub effects: Effects,
    pub events: EventRecorder,
    pub config: EngineConfig,
}

/// Whether a guarded status write went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Yes,
    /// The stored status moved on since it was read; the step is skipped.
    LostRace,
}

/// `at` moved by `days`, or a validation error when the result leaves the
/// calendar range.
pub fn days_from(at: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| EngineError::ValidationError(format!("{at} moved by {days} days is out of range")))
}

impl EngineContext {
    pub fn new(
        store: DatastoreBox,
        payments: PaymentAdapterBox,
        notifier: NotificationSinkBox,
        scores: ScoreServiceBox,
        alerts: AlertSinkBox,
        config: EngineConfig,
    ) -> Self {
        Self {
            events: EventRecorder::new(store.clone()),
            effects: Effects::new(notifier, scores, alerts),
            store,
            payments,
            config,
        }
    }

    /// Applies `next` to `cycle` and persists it, guarded on the status the
    /// cycle had when it was read.
    pub async fn advance_status(
        &self,
        cycle: &mut CircleCycle,
        next: CycleStatus,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let observed = cycle.status;
        cycle.transition(next, now)?;
        self.persist(cycle, observed).await
    }

    /// Persists field changes without a status change, still guarded.
    pub async fn persist(&self, cycle: &CircleCycle, observed: CycleStatus) -> Result<Applied> {
        if self.store.update_cycle(cycle.clone(), observed).await? {
            Ok(Applied::Yes)
        } else {
            tracing::warn!(cycle_id = %cycle.id, expected = %observed, "cycle changed concurrently, skipping");
            Ok(Applied::LostRace)
        }
    }

    pub async fn load_cycle(&self, cycle_id: Uuid) -> Result<CircleCycle> {
        self.store
            .get_cycle(cycle_id)
            .await?
            .ok_or_else(|| EngineError::not_found("cycle", cycle_id))
    }

    pub async fn load_contributions(&self, cycle: &CircleCycle) -> Result<Vec<CycleContribution>> {
        self.store.contributions(cycle.id).await
    }

    pub async fn load_circle(&self, circle_id: Uuid) -> Result<Circle> {
        self.store
            .get_circle(circle_id)
            .await?
            .ok_or_else(|| EngineError::not_found("circle", circle_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_days_from_rejects_overflow() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(
            days_from(at, 7).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap()
        );
        assert_eq!(
            days_from(at, -3).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 6, 0, 0, 0).unwrap()
        );
        assert!(matches!(
            days_from(at, 200_000_000),
            Err(EngineError::ValidationError(_))
        ));
    }
}
