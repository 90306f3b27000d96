use crate::domain::cycle::CircleCycle;
use crate::domain::ledger::{CycleEvent, CycleEventKind};
use crate::domain::ports::DatastoreBox;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Appends immutable audit events to the datastore.
#[derive(Clone)]
pub struct EventRecorder {
    store: DatastoreBox,
}

impl EventRecorder {
    pub fn new(store: DatastoreBox) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        circle_id: Uuid,
        cycle_id: Option<Uuid>,
        kind: CycleEventKind,
        data: Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        tracing::debug!(%circle_id, ?cycle_id, ?kind, "recording cycle event");
        self.store
            .append_event(CycleEvent {
                id: Uuid::new_v4(),
                circle_id,
                cycle_id,
                kind,
                data,
                created_at: at,
            })
            .await
    }

    /// Records an event about `cycle`, stamping its number and status.
    pub async fn record_for(
        &self,
        cycle: &CircleCycle,
        kind: CycleEventKind,
        mut data: Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Value::Object(map) = &mut data {
            map.insert("cycle_number".into(), cycle.cycle_number.into());
            map.insert("status".into(), cycle.status.as_str().into());
        }
        self.record(cycle.circle_id, Some(cycle.id), kind, data, at)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cycle::CycleStatus;
    use crate::domain::ports::LedgerStore;
    use crate::infrastructure::in_memory::InMemoryDatastore;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_for_stamps_cycle_fields() {
        let store = Arc::new(InMemoryDatastore::new());
        let recorder = EventRecorder::new(store.clone());
        let mut cycle = CircleCycle::scheduled(
            Uuid::new_v4(),
            4,
            NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            Utc::now(),
        );
        cycle.status = CycleStatus::Collecting;

        recorder
            .record_for(&cycle, CycleEventKind::CycleStarted, json!({"members": 5}), Utc::now())
            .await
            .unwrap();

        let events = store.events_for_circle(cycle.circle_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CycleEventKind::CycleStarted);
        assert_eq!(events[0].cycle_id, Some(cycle.id));
        assert_eq!(events[0].data["cycle_number"], 4);
        assert_eq!(events[0].data["status"], "collecting");
        assert_eq!(events[0].data["members"], 5);
    }
}
