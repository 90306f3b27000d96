mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CircleSpec, Harness, cycle_start, deadline, money};
use cycle_engine::application::health::HealthMonitor;
use cycle_engine::application::orchestrator::CycleEngine;
use cycle_engine::config::EngineConfig;
use cycle_engine::domain::circle::{
    Circle, CircleStatus, ContributionPolicy, Membership, PaymentMethod, PayoutOrder, Vouch,
};
use cycle_engine::domain::contribution::CycleContribution;
use cycle_engine::domain::cycle::{CircleCycle, CycleStatus};
use cycle_engine::domain::ledger::{
    CycleEvent, CycleEventKind, EngineRun, MemberDefault, Phase, Reminder, ReminderStatus,
    ReserveDebit, ReserveFund, RunReport, RunStatus,
};
use cycle_engine::domain::ports::{
    AlertKind, CircleStore, CycleStore, LedgerStore, ReserveDecision,
};
use cycle_engine::error::{EngineError, Result};
use cycle_engine::infrastructure::in_memory::InMemoryDatastore;
use cycle_engine::infrastructure::simulated::{
    RecordingAlertSink, RecordingNotifier, RecordingScoreService, SimulatedPaymentAdapter,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

#[tokio::test]
async fn test_run_is_recorded() {
    let h = Harness::new();
    h.seed_circle(CircleSpec::default()).await;

    let report = h.engine.run_at(cycle_start(1)).await.unwrap();
    let run = h.store.latest_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.started_at, cycle_start(1));
    assert_eq!(run.report, report);
    assert_eq!(run.abort_reason, None);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn test_rerun_at_same_instant_does_nothing() {
    let h = Harness::new();
    h.seed_circle(CircleSpec::default()).await;

    let first = h.engine.run_at(cycle_start(1)).await.unwrap();
    assert_eq!(first.cycles_started, 1);
    let second = h.engine.run_at(cycle_start(1)).await.unwrap();
    assert_eq!(second, RunReport::default());
}

#[tokio::test]
async fn test_setup_error_isolated_to_its_circle() {
    let h = Harness::new();
    let healthy = h.seed_circle(CircleSpec::default()).await;
    let broken = h.seed_circle(CircleSpec::default()).await;
    let mut order = h
        .store
        .payout_order(broken.circle.id)
        .await
        .unwrap()
        .unwrap();
    order.finalized = false;
    h.store.save_payout_order(order).await.unwrap();

    let report = h.engine.run_at(cycle_start(1)).await.unwrap();
    assert_eq!(report.cycles_started, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].phase, Phase::StartCycles);
    assert_eq!(report.errors[0].cycle_id, Some(broken.cycle_id(1)));

    assert_eq!(h.cycle(&healthy, 1).await.status, CycleStatus::Collecting);
    assert_eq!(h.cycle(&broken, 1).await.status, CycleStatus::Scheduled);
    assert_eq!(h.event_count(&broken, CycleEventKind::CycleStartFailed).await, 1);
    assert!(
        h.store
            .contributions(broken.cycle_id(1))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_inactive_circle_does_not_start() {
    let h = Harness::new();
    let f = h.seed_circle(CircleSpec::default()).await;
    let mut circle = f.circle.clone();
    circle.status = CircleStatus::Paused;
    h.store.save_circle(circle).await.unwrap();

    let report = h.engine.run_at(cycle_start(1)).await.unwrap();
    assert_eq!(report.cycles_started, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(h.cycle(&f, 1).await.status, CycleStatus::Scheduled);
}

#[tokio::test]
async fn test_failing_notifier_does_not_block_progress() {
    let h = Harness::build(
        EngineConfig::default(),
        SimulatedPaymentAdapter::new(),
        RecordingNotifier::failing(),
    );
    let f = h.seed_circle(CircleSpec::default()).await;

    let report = h.engine.run_at(cycle_start(1)).await.unwrap();
    assert_eq!(report.cycles_started, 1);
    assert!(report.errors.is_empty());
    assert_eq!(h.cycle(&f, 1).await.status, CycleStatus::Collecting);
}

#[tokio::test]
async fn test_reminders_skip_members_who_paid() {
    let h = Harness::new();
    let f = h.seed_circle(CircleSpec::default()).await;

    // The seven-day reminder is due the moment the cycle starts.
    let report = h.engine.run_at(cycle_start(1)).await.unwrap();
    assert_eq!(report.reminders_sent, 5);

    h.pay_all(&f, 1, &f.members[..2], cycle_start(1) + Duration::days(1)).await;
    let report = h
        .engine
        .run_at(deadline(1) - Duration::days(3))
        .await
        .unwrap();
    assert_eq!(report.reminders_sent, 3);

    let reminders = h.store.reminders_for_cycle(f.cycle_id(1)).await.unwrap();
    assert_eq!(reminders.len(), 20);
    let count = |status| reminders.iter().filter(|r| r.status == status).count();
    assert_eq!(count(ReminderStatus::Sent), 8);
    assert_eq!(count(ReminderStatus::Skipped), 2);
    assert_eq!(count(ReminderStatus::Pending), 10);
    assert_eq!(h.event_count(&f, CycleEventKind::ReminderSent).await, 8);
}

#[tokio::test]
async fn test_health_flags_missed_runs() {
    let h = Harness::new();
    let now = cycle_start(1);

    let health = HealthMonitor::new(h.engine.context()).check(now).await.unwrap();
    assert!(health.runs_missed);
    assert_eq!(health.last_run_at, None);
    let alerts = h.alerts.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::EngineRunsMissed);

    h.engine.run_at(now).await.unwrap();
    let health = HealthMonitor::new(h.engine.context())
        .check(now + Duration::minutes(10))
        .await
        .unwrap();
    assert!(!health.runs_missed);
    assert!(health.is_healthy());
    assert_eq!(health.last_run_status, Some(RunStatus::Completed));

    let health = HealthMonitor::new(h.engine.context())
        .check(now + Duration::minutes(31))
        .await
        .unwrap();
    assert!(health.runs_missed);
    assert_eq!(h.alerts.alerts().await.len(), 2);
}

/// Delegates to an in-memory store but fails to list pending payouts.
/// Delegates to an in-memory store, failing the calls it is told to.
struct FaultyStore {
    inner: InMemoryDatastore,
    fail_payout_scan: bool,
    failing_debits: AtomicU32,
}

impl FaultyStore {
    fn new(inner: InMemoryDatastore) -> Self {
        Self {
            inner,
            fail_payout_scan: false,
            failing_debits: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl CircleStore for FaultyStore {
    async fn get_circle(&self, circle_id: Uuid) -> Result<Option<Circle>> {
        self.inner.get_circle(circle_id).await
    }
    async fn save_circle(&self, circle: Circle) -> Result<()> {
        self.inner.save_circle(circle).await
    }
    async fn memberships(&self, circle_id: Uuid) -> Result<Vec<Membership>> {
        self.inner.memberships(circle_id).await
    }
    async fn save_membership(&self, membership: Membership) -> Result<()> {
        self.inner.save_membership(membership).await
    }
    async fn payout_order(&self, circle_id: Uuid) -> Result<Option<PayoutOrder>> {
        self.inner.payout_order(circle_id).await
    }
    async fn save_payout_order(&self, order: PayoutOrder) -> Result<()> {
        self.inner.save_payout_order(order).await
    }
    async fn vouches_for(&self, circle_id: Uuid, vouchee_id: Uuid) -> Result<Vec<Vouch>> {
        self.inner.vouches_for(circle_id, vouchee_id).await
    }
    async fn save_vouch(&self, vouch: Vouch) -> Result<()> {
        self.inner.save_vouch(vouch).await
    }
    async fn payment_methods(&self, user_id: Uuid) -> Result<Vec<PaymentMethod>> {
        self.inner.payment_methods(user_id).await
    }
    async fn save_payment_method(&self, method: PaymentMethod) -> Result<()> {
        self.inner.save_payment_method(method).await
    }
}

#[async_trait]
impl CycleStore for FaultyStore {
    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CircleCycle>> {
        self.inner.get_cycle(cycle_id).await
    }
    async fn find_cycle(&self, circle_id: Uuid, cycle_number: u32) -> Result<Option<CircleCycle>> {
        self.inner.find_cycle(circle_id, cycle_number).await
    }
    async fn cycles_with_status(&self, status: CycleStatus) -> Result<Vec<CircleCycle>> {
        if self.fail_payout_scan && status == CycleStatus::PayoutPending {
            return Err(EngineError::StoreError("connection reset".to_string()));
        }
        self.inner.cycles_with_status(status).await
    }
    async fn cycles_for_circle(&self, circle_id: Uuid) -> Result<Vec<CircleCycle>> {
        self.inner.cycles_for_circle(circle_id).await
    }
    async fn insert_cycle(&self, cycle: CircleCycle) -> Result<()> {
        self.inner.insert_cycle(cycle).await
    }
    async fn update_cycle(&self, cycle: CircleCycle, expected: CycleStatus) -> Result<bool> {
        self.inner.update_cycle(cycle, expected).await
    }
    async fn contributions(&self, cycle_id: Uuid) -> Result<Vec<CycleContribution>> {
        self.inner.contributions(cycle_id).await
    }
    async fn find_contribution(
        &self,
        cycle_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<CycleContribution>> {
        self.inner.find_contribution(cycle_id, user_id).await
    }
    async fn insert_contribution(&self, contribution: CycleContribution) -> Result<()> {
        self.inner.insert_contribution(contribution).await
    }
    async fn save_contribution(&self, contribution: CycleContribution) -> Result<()> {
        self.inner.save_contribution(contribution).await
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn record_default(&self, default: MemberDefault) -> Result<()> {
        self.inner.record_default(default).await
    }
    async fn defaults_for_circle(&self, circle_id: Uuid) -> Result<Vec<MemberDefault>> {
        self.inner.defaults_for_circle(circle_id).await
    }
    async fn append_event(&self, event: CycleEvent) -> Result<()> {
        self.inner.append_event(event).await
    }
    async fn events_for_circle(&self, circle_id: Uuid) -> Result<Vec<CycleEvent>> {
        self.inner.events_for_circle(circle_id).await
    }
    async fn reserve_fund(&self, community_id: Uuid) -> Result<Option<ReserveFund>> {
        self.inner.reserve_fund(community_id).await
    }
    async fn save_reserve_fund(&self, fund: ReserveFund) -> Result<()> {
        self.inner.save_reserve_fund(fund).await
    }
    async fn debit_reserve(
        &self,
        community_id: Uuid,
        decide: ReserveDecision,
        at: DateTime<Utc>,
    ) -> Result<ReserveDebit> {
        let fail = self
            .failing_debits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(EngineError::StoreError("reserve ledger unavailable".to_string()));
        }
        self.inner.debit_reserve(community_id, decide, at).await
    }
    async fn save_run(&self, run: EngineRun) -> Result<()> {
        self.inner.save_run(run).await
    }
    async fn latest_run(&self) -> Result<Option<EngineRun>> {
        self.inner.latest_run().await
    }
    async fn save_reminder(&self, reminder: Reminder) -> Result<()> {
        self.inner.save_reminder(reminder).await
    }
    async fn reminders_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<Reminder>> {
        self.inner.reminders_for_cycle(cycle_id).await
    }
    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        self.inner.due_reminders(now).await
    }
}

#[tokio::test]
async fn test_phase_failure_aborts_run() {
    // Seed through a harness, then run an engine over the same tables.
    let seeded = Harness::new();
    let f = seeded.seed_circle(CircleSpec::default()).await;
    let inner = (*seeded.store).clone();
    let store = Arc::new(FaultyStore {
        fail_payout_scan: true,
        ..FaultyStore::new(inner.clone())
    });
    let alerts = RecordingAlertSink::new();
    let engine = CycleEngine::new(
        store,
        Arc::new(SimulatedPaymentAdapter::new()),
        Arc::new(RecordingNotifier::new()),
        Arc::new(RecordingScoreService::new()),
        Arc::new(alerts.clone()),
        EngineConfig::default(),
    );

    let err = engine.run_at(cycle_start(1)).await.unwrap_err();
    assert!(matches!(err, EngineError::StoreError(_)));

    let run = inner.latest_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.abort_reason.unwrap().starts_with("poll_payouts"));
    // Work done by earlier phases stays committed.
    assert_eq!(run.report.cycles_started, 1);
    assert_eq!(seeded.cycle(&f, 1).await.status, CycleStatus::Collecting);

    let alerts = alerts.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::EngineRunAborted);
}

#[tokio::test]
async fn test_failed_deadline_step_is_retried_next_run() {
    let seeded = Harness::new();
    let f = seeded
        .seed_circle(CircleSpec {
            policy: ContributionPolicy::ImmediateCover,
            reserve: Some(dec!(300)),
            ..Default::default()
        })
        .await;
    let inner = (*seeded.store).clone();
    let store = FaultyStore::new(inner.clone());
    store.failing_debits.store(1, Ordering::SeqCst);
    let engine = CycleEngine::new(
        Arc::new(store),
        Arc::new(SimulatedPaymentAdapter::new()),
        Arc::new(RecordingNotifier::new()),
        Arc::new(RecordingScoreService::new()),
        Arc::new(RecordingAlertSink::new()),
        EngineConfig::default(),
    );

    engine.run_at(cycle_start(1)).await.unwrap();
    seeded
        .pay_all(&f, 1, &f.members[..4], cycle_start(1) + Duration::days(1))
        .await;

    let first = engine.run_at(deadline(1)).await.unwrap();
    assert_eq!(first.deadlines_processed, 0);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].phase, Phase::Deadlines);
    assert_eq!(seeded.cycle(&f, 1).await.status, CycleStatus::DeadlineReached);
    assert_eq!(seeded.reserve_balance(&f).await, money(dec!(300)));

    let second = engine.run_at(deadline(1) + Duration::minutes(15)).await.unwrap();
    assert!(second.errors.is_empty());
    assert_eq!(second.deadlines_processed, 1);

    let cycle = seeded.cycle(&f, 1).await;
    assert_ne!(cycle.status, CycleStatus::DeadlineReached);
    assert_eq!(cycle.default_count, 1);
    assert_eq!(cycle.reserve_covered_amount, money(dec!(60)));
    assert_eq!(seeded.reserve_balance(&f).await, money(dec!(240)));
    assert_eq!(seeded.event_count(&f, CycleEventKind::DeadlineReached).await, 1);
    assert_eq!(inner.defaults_for_circle(f.circle.id).await.unwrap().len(), 1);

    let third = engine.run_at(deadline(1) + Duration::minutes(30)).await.unwrap();
    assert_eq!(third.deadlines_processed, 0);
    assert_eq!(seeded.reserve_balance(&f).await, money(dec!(240)));
}
