//! In-process stand-ins for the engine's external collaborators.
//!
//! The recording sinks keep every call they receive so tests and the CLI can
//! inspect them. `SimulatedPaymentAdapter` behaves like an asynchronous
//! payment provider whose outcomes can be scripted.

use crate::domain::money::Money;
use crate::domain::ports::{
    AlertSink, Notification, NotificationSink, OpsAlert, PaymentAdapter, PayoutHandle,
    PayoutRequest, ScoreAdjustment, ScoreService, TransferStatus,
};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Keeps every notification it is asked to deliver.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<(Uuid, Notification)>>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub async fn sent(&self) -> Vec<(Uuid, Notification)> {
        self.sent.read().await.clone()
    }

    pub async fn sent_to(&self, user_id: Uuid) -> Vec<Notification> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, notification: Notification) -> Result<()> {
        if self.failing {
            return Err(EngineError::InternalError(Box::new(std::io::Error::other(
                "notification service unavailable",
            ))));
        }
        tracing::debug!(%user_id, kind = ?notification.kind, title = %notification.title, "notification");
        self.sent.write().await.push((user_id, notification));
        Ok(())
    }
}

/// Keeps every score adjustment.
#[derive(Default, Clone)]
pub struct RecordingScoreService {
    adjustments: Arc<RwLock<Vec<(Uuid, ScoreAdjustment)>>>,
}

impl RecordingScoreService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn adjustments(&self) -> Vec<(Uuid, ScoreAdjustment)> {
        self.adjustments.read().await.clone()
    }

    /// Net points applied to `user_id`.
    pub async fn total_for(&self, user_id: Uuid) -> i32 {
        self.adjustments
            .read()
            .await
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, a)| a.points)
            .sum()
    }
}

#[async_trait]
impl ScoreService for RecordingScoreService {
    async fn adjust(&self, user_id: Uuid, adjustment: ScoreAdjustment) -> Result<()> {
        tracing::debug!(%user_id, reason = ?adjustment.reason, points = adjustment.points, "score adjusted");
        self.adjustments.write().await.push((user_id, adjustment));
        Ok(())
    }
}

/// Keeps every ops alert.
#[derive(Default, Clone)]
pub struct RecordingAlertSink {
    alerts: Arc<RwLock<Vec<OpsAlert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<OpsAlert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn alert(&self, alert: OpsAlert) -> Result<()> {
        tracing::warn!(kind = ?alert.kind, severity = ?alert.severity, message = %alert.message, "ops alert");
        self.alerts.write().await.push(alert);
        Ok(())
    }
}

#[derive(Default)]
struct Ledger {
    next_id: u64,
    by_key: HashMap<String, String>,
    transfers: HashMap<String, (PayoutRequest, TransferStatus)>,
    requests: Vec<PayoutRequest>,
    fail_next: u32,
}

/// A scriptable payment provider.
///
/// Transfers start `Pending`. With `settle_on_poll`, the first status poll
/// completes them for the requested amount; otherwise they stay pending until
/// `set_status` is called. Requests repeating an idempotency key get the
/// original transfer back.
#[derive(Default, Clone)]
pub struct SimulatedPaymentAdapter {
    ledger: Arc<RwLock<Ledger>>,
    settle_on_poll: bool,
    always_fail: bool,
}

impl SimulatedPaymentAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers settle the first time their status is polled.
    pub fn settling() -> Self {
        Self {
            settle_on_poll: true,
            ..Self::default()
        }
    }

    /// Every initiation is rejected.
    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    /// Rejects the next `count` initiations.
    pub async fn fail_next(&self, count: u32) {
        self.ledger.write().await.fail_next = count;
    }

    pub async fn set_status(&self, transaction_id: &str, status: TransferStatus) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let (_, current) = ledger
            .transfers
            .get_mut(transaction_id)
            .ok_or_else(|| EngineError::not_found("transfer", transaction_id))?;
        *current = status;
        Ok(())
    }

    /// Every accepted request, in order.
    pub async fn requests(&self) -> Vec<PayoutRequest> {
        self.ledger.read().await.requests.clone()
    }

    pub async fn amount_of(&self, transaction_id: &str) -> Option<Money> {
        self.ledger
            .read()
            .await
            .transfers
            .get(transaction_id)
            .map(|(request, _)| request.amount)
    }
}

#[async_trait]
impl PaymentAdapter for SimulatedPaymentAdapter {
    async fn initiate(&self, request: PayoutRequest) -> Result<PayoutHandle> {
        let mut ledger = self.ledger.write().await;
        if let Some(transaction_id) = ledger.by_key.get(&request.idempotency_key) {
            return Ok(PayoutHandle {
                transaction_id: transaction_id.clone(),
            });
        }
        if self.always_fail {
            return Err(EngineError::PaymentError("provider rejected the transfer".to_string()));
        }
        if ledger.fail_next > 0 {
            ledger.fail_next -= 1;
            return Err(EngineError::PaymentError("provider temporarily unavailable".to_string()));
        }

        ledger.next_id += 1;
        let transaction_id = format!("sim_po_{:06}", ledger.next_id);
        tracing::debug!(
            %transaction_id,
            cycle_id = %request.cycle_id,
            amount = %request.amount,
            "simulated payout accepted"
        );
        ledger
            .by_key
            .insert(request.idempotency_key.clone(), transaction_id.clone());
        ledger.requests.push(request.clone());
        ledger
            .transfers
            .insert(transaction_id.clone(), (request, TransferStatus::Pending));
        Ok(PayoutHandle { transaction_id })
    }

    async fn transfer_status(&self, transaction_id: &str) -> Result<TransferStatus> {
        let mut ledger = self.ledger.write().await;
        let (request, status) = ledger
            .transfers
            .get_mut(transaction_id)
            .ok_or_else(|| EngineError::not_found("transfer", transaction_id))?;
        if self.settle_on_poll && *status == TransferStatus::Pending {
            *status = TransferStatus::Completed {
                amount: request.amount,
                completed_at: Utc::now(),
            };
        }
        Ok(status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(key: &str) -> PayoutRequest {
        PayoutRequest {
            cycle_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            payment_method_id: Uuid::new_v4(),
            amount: Money::new(dec!(250)),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_same_transfer() {
        let adapter = SimulatedPaymentAdapter::new();
        let first = adapter.initiate(request("k1")).await.unwrap();
        let again = adapter.initiate(request("k1")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(adapter.requests().await.len(), 1);
        assert_eq!(
            adapter.transfer_status(&first.transaction_id).await.unwrap(),
            TransferStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let adapter = SimulatedPaymentAdapter::new();
        adapter.fail_next(1).await;
        assert!(adapter.initiate(request("a")).await.is_err());
        assert!(adapter.initiate(request("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_settling_completes_on_poll() {
        let adapter = SimulatedPaymentAdapter::settling();
        let handle = adapter.initiate(request("k")).await.unwrap();
        match adapter.transfer_status(&handle.transaction_id).await.unwrap() {
            TransferStatus::Completed { amount, .. } => assert_eq!(amount, Money::new(dec!(250))),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_notifier_errors() {
        let notifier = RecordingNotifier::failing();
        let n = Notification::new(
            crate::domain::ports::NotificationKind::CycleStarted,
            "t",
            "b",
        );
        assert!(notifier.notify(Uuid::new_v4(), n).await.is_err());
        assert!(notifier.sent().await.is_empty());
    }
}
