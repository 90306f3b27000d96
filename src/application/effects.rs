//! Fire-and-forget calls to notification, scoring and alerting services.
//!
//! A failing collaborator is logged and otherwise ignored; it never fails the
//! cycle step that triggered it.

use crate::domain::ports::{
    AlertKind, AlertSinkBox, Notification, NotificationKind, NotificationSinkBox, OpsAlert,
    Priority, ScoreAdjustment, ScoreReason, ScoreServiceBox, Severity,
};
use serde_json::Value;
use uuid::Uuid;

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            priority: Priority::Normal,
            data: Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

impl OpsAlert {
    pub fn new(kind: AlertKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            cycle_id: None,
            data: Value::Null,
        }
    }

    pub fn for_cycle(mut self, cycle_id: Uuid) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Clone)]
pub struct Effects {
    notifier: NotificationSinkBox,
    scores: ScoreServiceBox,
    alerts: AlertSinkBox,
}

impl Effects {
    pub fn new(notifier: NotificationSinkBox, scores: ScoreServiceBox, alerts: AlertSinkBox) -> Self {
        Self {
            notifier,
            scores,
            alerts,
        }
    }

    pub async fn notify(&self, user_id: Uuid, notification: Notification) {
        let kind = notification.kind;
        if let Err(e) = self.notifier.notify(user_id, notification).await {
            tracing::warn!(%user_id, ?kind, error = %e, "notification dropped");
        }
    }

    pub async fn notify_all<I>(&self, users: I, notification: &Notification)
    where
        I: IntoIterator<Item = Uuid>,
    {
        for user_id in users {
            self.notify(user_id, notification.clone()).await;
        }
    }

    pub async fn adjust_score(&self, user_id: Uuid, reason: ScoreReason, points: i32, metadata: Value) {
        let adjustment = ScoreAdjustment {
            reason,
            points,
            metadata,
        };
        if let Err(e) = self.scores.adjust(user_id, adjustment).await {
            tracing::warn!(%user_id, ?reason, points, error = %e, "score adjustment dropped");
        }
    }

    pub async fn alert(&self, alert: OpsAlert) {
        tracing::error!(kind = ?alert.kind, cycle_id = ?alert.cycle_id, "{}", alert.message);
        if let Err(e) = self.alerts.alert(alert).await {
            tracing::error!(error = %e, "ops alert could not be delivered");
        }
    }
}
