#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use cycle_engine::application::orchestrator::CycleEngine;
use cycle_engine::application::webhooks::{WebhookHandler, WebhookOutcome};
use cycle_engine::config::EngineConfig;
use cycle_engine::domain::circle::{
    Circle, CircleStatus, ContributionPolicy, Membership, PaymentMethod, PaymentMethodStatus,
    PayoutOrder, PayoutSlot, Vouch,
};
use cycle_engine::domain::contribution::ContributionReceived;
use cycle_engine::domain::cycle::CircleCycle;
use cycle_engine::domain::ledger::{CycleEventKind, ReserveFund};
use cycle_engine::domain::money::{Amount, Money};
use cycle_engine::domain::ports::{CircleStore, CycleStore, LedgerStore};
use cycle_engine::error::Result;
use cycle_engine::infrastructure::in_memory::InMemoryDatastore;
use cycle_engine::infrastructure::simulated::{
    RecordingAlertSink, RecordingNotifier, RecordingScoreService, SimulatedPaymentAdapter,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

/// Days between the start dates of consecutive cycles.
pub const CYCLE_SPACING_DAYS: i64 = 14;
/// Days from a cycle's start to its contribution deadline.
pub const COLLECTION_DAYS: i64 = 7;

/// Midnight UTC on the start date of cycle 1.
pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
}

pub fn cycle_start(cycle_number: u32) -> DateTime<Utc> {
    base() + Duration::days(CYCLE_SPACING_DAYS * i64::from(cycle_number - 1))
}

pub fn deadline(cycle_number: u32) -> DateTime<Utc> {
    cycle_start(cycle_number) + Duration::days(COLLECTION_DAYS)
}

pub fn money(v: Decimal) -> Money {
    Money::new(v)
}

pub struct CircleSpec {
    pub members: usize,
    pub amount: Decimal,
    pub total_cycles: u32,
    pub policy: ContributionPolicy,
    pub grace_period_days: u32,
    pub platform_fee_percent: Decimal,
    pub reserve: Option<Decimal>,
}

impl Default for CircleSpec {
    fn default() -> Self {
        Self {
            members: 5,
            amount: dec!(100),
            total_cycles: 5,
            policy: ContributionPolicy::GraceThenProceed,
            grace_period_days: 2,
            platform_fee_percent: dec!(2),
            reserve: None,
        }
    }
}

/// A seeded circle. `members[i]` receives the pool of cycle `i + 1`.
pub struct CircleFixture {
    pub circle: Circle,
    pub members: Vec<Uuid>,
    pub cycles: Vec<CircleCycle>,
}

impl CircleFixture {
    pub fn cycle_id(&self, cycle_number: u32) -> Uuid {
        self.cycles[(cycle_number - 1) as usize].id
    }

    pub fn recipient(&self, cycle_number: u32) -> Uuid {
        self.members[(cycle_number as usize - 1) % self.members.len()]
    }
}

pub struct Harness {
    pub store: Arc<InMemoryDatastore>,
    pub payments: SimulatedPaymentAdapter,
    pub notifier: RecordingNotifier,
    pub scores: RecordingScoreService,
    pub alerts: RecordingAlertSink,
    pub engine: CycleEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(EngineConfig::default(), SimulatedPaymentAdapter::new())
    }

    pub fn with_payments(payments: SimulatedPaymentAdapter) -> Self {
        Self::with(EngineConfig::default(), payments)
    }

    pub fn with(config: EngineConfig, payments: SimulatedPaymentAdapter) -> Self {
        Self::build(config, payments, RecordingNotifier::new())
    }

    pub fn build(
        config: EngineConfig,
        payments: SimulatedPaymentAdapter,
        notifier: RecordingNotifier,
    ) -> Self {
        let store = Arc::new(InMemoryDatastore::new());
        let scores = RecordingScoreService::new();
        let alerts = RecordingAlertSink::new();
        let engine = CycleEngine::new(
            store.clone(),
            Arc::new(payments.clone()),
            Arc::new(notifier.clone()),
            Arc::new(scores.clone()),
            Arc::new(alerts.clone()),
            config,
        );
        Self {
            store,
            payments,
            notifier,
            scores,
            alerts,
            engine,
        }
    }

    /// Seeds an active circle with a finalized payout order, one primary
    /// payment method per member and every cycle row pre-created.
    pub async fn seed_circle(&self, spec: CircleSpec) -> CircleFixture {
        let community_id = Uuid::new_v4();
        let members: Vec<Uuid> = (0..spec.members).map(|_| Uuid::new_v4()).collect();
        let mut circle = Circle {
            id: Uuid::new_v4(),
            community_id,
            name: "Test circle".to_string(),
            contribution_amount: money(spec.amount),
            total_cycles: spec.total_cycles,
            incomplete_contribution_policy: spec.policy,
            grace_period_days: spec.grace_period_days,
            platform_fee_percent: spec.platform_fee_percent,
            current_cycle_number: 1,
            current_cycle_id: None,
            status: CircleStatus::Active,
            completed_at: None,
            stats: None,
        };

        let mut cycles = Vec::new();
        for n in 1..=spec.total_cycles {
            let start = cycle_start(n);
            let row = CircleCycle::scheduled(circle.id, n, start.date_naive(), deadline(n));
            self.store.insert_cycle(row.clone()).await.unwrap();
            cycles.push(row);
        }
        circle.current_cycle_id = cycles.first().map(|c| c.id);
        self.store.save_circle(circle.clone()).await.unwrap();

        for user_id in &members {
            self.store
                .save_membership(Membership::active(circle.id, *user_id))
                .await
                .unwrap();
            self.store
                .save_payment_method(PaymentMethod {
                    id: Uuid::new_v4(),
                    user_id: *user_id,
                    is_primary: true,
                    status: PaymentMethodStatus::Active,
                })
                .await
                .unwrap();
        }
        let entries = (1..=spec.total_cycles)
            .map(|n| PayoutSlot {
                cycle_number: n,
                user_id: members[(n as usize - 1) % members.len()],
            })
            .collect();
        self.store
            .save_payout_order(PayoutOrder {
                circle_id: circle.id,
                finalized: true,
                entries,
            })
            .await
            .unwrap();

        if let Some(balance) = spec.reserve {
            self.store
                .save_reserve_fund(ReserveFund {
                    community_id,
                    balance: money(balance),
                    total_debited: Money::ZERO,
                    updated_at: None,
                })
                .await
                .unwrap();
        }

        CircleFixture {
            circle,
            members,
            cycles,
        }
    }

    pub async fn vouch(&self, fixture: &CircleFixture, voucher: Uuid, vouchee: Uuid) {
        self.store
            .save_vouch(Vouch {
                voucher_id: voucher,
                vouchee_id: vouchee,
                circle_id: fixture.circle.id,
                active: true,
            })
            .await
            .unwrap();
    }

    /// Delivers one contribution webhook, processed at `received_at`.
    pub async fn pay(
        &self,
        cycle_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        transaction_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        WebhookHandler::new(self.engine.context())
            .process_contribution_received(
                ContributionReceived {
                    cycle_id,
                    user_id,
                    amount: Amount::new(amount)?,
                    transaction_id: transaction_id.to_string(),
                    received_at,
                },
                received_at,
            )
            .await
    }

    /// Every member listed pays the full amount at `received_at`.
    pub async fn pay_all(
        &self,
        fixture: &CircleFixture,
        cycle_number: u32,
        users: &[Uuid],
        received_at: DateTime<Utc>,
    ) {
        let cycle_id = fixture.cycle_id(cycle_number);
        for (i, user) in users.iter().enumerate() {
            self.pay(
                cycle_id,
                *user,
                fixture.circle.contribution_amount.value(),
                &format!("txn-{cycle_number}-{i}-{user}"),
                received_at,
            )
            .await
            .unwrap();
        }
    }

    pub async fn cycle(&self, fixture: &CircleFixture, cycle_number: u32) -> CircleCycle {
        self.store
            .get_cycle(fixture.cycle_id(cycle_number))
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn reserve_balance(&self, fixture: &CircleFixture) -> Money {
        self.store
            .reserve_fund(fixture.circle.community_id)
            .await
            .unwrap()
            .map(|f| f.balance)
            .unwrap_or(Money::ZERO)
    }

    pub async fn event_count(&self, fixture: &CircleFixture, kind: CycleEventKind) -> usize {
        self.store
            .events_for_circle(fixture.circle.id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}
