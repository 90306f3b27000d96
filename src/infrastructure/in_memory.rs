use crate::domain::circle::{Circle, Membership, PaymentMethod, PayoutOrder, Vouch};
use crate::domain::contribution::CycleContribution;
use crate::domain::cycle::{CircleCycle, CycleStatus};
use crate::domain::ledger::{
    CycleEvent, EngineRun, MemberDefault, Reminder, ReminderStatus, ReserveDebit, ReserveFund,
};
use crate::domain::money::Money;
use crate::domain::ports::{CircleStore, CycleStore, LedgerStore, ReserveDecision};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    circles: HashMap<Uuid, Circle>,
    memberships: HashMap<(Uuid, Uuid), Membership>,
    payout_orders: HashMap<Uuid, PayoutOrder>,
    vouches: Vec<Vouch>,
    payment_methods: HashMap<Uuid, PaymentMethod>,
    cycles: HashMap<Uuid, CircleCycle>,
    contributions: HashMap<Uuid, CycleContribution>,
    defaults: HashMap<Uuid, MemberDefault>,
    events: Vec<CycleEvent>,
    reserves: HashMap<Uuid, ReserveFund>,
    runs: Vec<EngineRun>,
    reminders: HashMap<Uuid, Reminder>,
}

/// A thread-safe in-memory datastore.
///
/// All tables sit behind one `Arc<RwLock<..>>`, so every trait method is a
/// single atomic step. Ideal for testing and single-process runs where
/// persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryDatastore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryDatastore {
    /// Creates a new, empty in-memory datastore.
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_cycles(cycles: &mut [CircleCycle]) {
    cycles.sort_by(|a, b| {
        (a.start_date, a.circle_id, a.cycle_number).cmp(&(b.start_date, b.circle_id, b.cycle_number))
    });
}

#[async_trait]
impl CircleStore for InMemoryDatastore {
    async fn get_circle(&self, circle_id: Uuid) -> Result<Option<Circle>> {
        let tables = self.tables.read().await;
        Ok(tables.circles.get(&circle_id).cloned())
    }

    async fn save_circle(&self, circle: Circle) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.circles.insert(circle.id, circle);
        Ok(())
    }

    async fn memberships(&self, circle_id: Uuid) -> Result<Vec<Membership>> {
        let tables = self.tables.read().await;
        let mut members: Vec<_> = tables
            .memberships
            .values()
            .filter(|m| m.circle_id == circle_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.user_id);
        Ok(members)
    }

    async fn save_membership(&self, membership: Membership) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .memberships
            .insert((membership.circle_id, membership.user_id), membership);
        Ok(())
    }

    async fn payout_order(&self, circle_id: Uuid) -> Result<Option<PayoutOrder>> {
        let tables = self.tables.read().await;
        Ok(tables.payout_orders.get(&circle_id).cloned())
    }

    async fn save_payout_order(&self, order: PayoutOrder) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.payout_orders.insert(order.circle_id, order);
        Ok(())
    }

    async fn vouches_for(&self, circle_id: Uuid, vouchee_id: Uuid) -> Result<Vec<Vouch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .vouches
            .iter()
            .filter(|v| v.circle_id == circle_id && v.vouchee_id == vouchee_id)
            .cloned()
            .collect())
    }

    async fn save_vouch(&self, vouch: Vouch) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.vouches.iter_mut().find(|v| {
            v.circle_id == vouch.circle_id
                && v.voucher_id == vouch.voucher_id
                && v.vouchee_id == vouch.vouchee_id
        }) {
            Some(existing) => *existing = vouch,
            None => tables.vouches.push(vouch),
        }
        Ok(())
    }

    async fn payment_methods(&self, user_id: Uuid) -> Result<Vec<PaymentMethod>> {
        let tables = self.tables.read().await;
        let mut methods: Vec<_> = tables
            .payment_methods
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        methods.sort_by_key(|m| (!m.is_primary, m.id));
        Ok(methods)
    }

    async fn save_payment_method(&self, method: PaymentMethod) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.payment_methods.insert(method.id, method);
        Ok(())
    }
}

#[async_trait]
impl CycleStore for InMemoryDatastore {
    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CircleCycle>> {
        let tables = self.tables.read().await;
        Ok(tables.cycles.get(&cycle_id).cloned())
    }

    async fn find_cycle(&self, circle_id: Uuid, cycle_number: u32) -> Result<Option<CircleCycle>> {
        let tables = self.tables.read().await;
        Ok(tables
            .cycles
            .values()
            .find(|c| c.circle_id == circle_id && c.cycle_number == cycle_number)
            .cloned())
    }

    async fn cycles_with_status(&self, status: CycleStatus) -> Result<Vec<CircleCycle>> {
        let tables = self.tables.read().await;
        let mut cycles: Vec<_> = tables
            .cycles
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        sort_cycles(&mut cycles);
        Ok(cycles)
    }

    async fn cycles_for_circle(&self, circle_id: Uuid) -> Result<Vec<CircleCycle>> {
        let tables = self.tables.read().await;
        let mut cycles: Vec<_> = tables
            .cycles
            .values()
            .filter(|c| c.circle_id == circle_id)
            .cloned()
            .collect();
        sort_cycles(&mut cycles);
        Ok(cycles)
    }

    async fn insert_cycle(&self, cycle: CircleCycle) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .cycles
            .values()
            .any(|c| c.circle_id == cycle.circle_id && c.cycle_number == cycle.cycle_number)
        {
            return Err(EngineError::Duplicate {
                entity: "cycle",
                key: format!("{} #{}", cycle.circle_id, cycle.cycle_number),
            });
        }
        tables.cycles.insert(cycle.id, cycle);
        Ok(())
    }

    async fn update_cycle(&self, cycle: CircleCycle, expected: CycleStatus) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.cycles.get_mut(&cycle.id) {
            Some(stored) if stored.status == expected => {
                *stored = cycle;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::not_found("cycle", cycle.id)),
        }
    }

    async fn contributions(&self, cycle_id: Uuid) -> Result<Vec<CycleContribution>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .contributions
            .values()
            .filter(|c| c.cycle_id == cycle_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.user_id);
        Ok(rows)
    }

    async fn find_contribution(
        &self,
        cycle_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<CycleContribution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .contributions
            .values()
            .find(|c| c.cycle_id == cycle_id && c.user_id == user_id)
            .cloned())
    }

    async fn insert_contribution(&self, contribution: CycleContribution) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .contributions
            .values()
            .any(|c| c.cycle_id == contribution.cycle_id && c.user_id == contribution.user_id)
        {
            return Err(EngineError::Duplicate {
                entity: "contribution",
                key: format!("{}/{}", contribution.cycle_id, contribution.user_id),
            });
        }
        tables.contributions.insert(contribution.id, contribution);
        Ok(())
    }

    async fn save_contribution(&self, contribution: CycleContribution) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.contributions.insert(contribution.id, contribution);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryDatastore {
    async fn record_default(&self, default: MemberDefault) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.defaults.contains_key(&default.contribution_id) {
            return Err(EngineError::Duplicate {
                entity: "member default",
                key: default.contribution_id.to_string(),
            });
        }
        tables.defaults.insert(default.contribution_id, default);
        Ok(())
    }

    async fn defaults_for_circle(&self, circle_id: Uuid) -> Result<Vec<MemberDefault>> {
        let tables = self.tables.read().await;
        let mut defaults: Vec<_> = tables
            .defaults
            .values()
            .filter(|d| d.circle_id == circle_id)
            .cloned()
            .collect();
        defaults.sort_by_key(|d| d.recorded_at);
        Ok(defaults)
    }

    async fn append_event(&self, event: CycleEvent) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.events.push(event);
        Ok(())
    }

    async fn events_for_circle(&self, circle_id: Uuid) -> Result<Vec<CycleEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| e.circle_id == circle_id)
            .cloned()
            .collect())
    }

    async fn reserve_fund(&self, community_id: Uuid) -> Result<Option<ReserveFund>> {
        let tables = self.tables.read().await;
        Ok(tables.reserves.get(&community_id).cloned())
    }

    async fn save_reserve_fund(&self, fund: ReserveFund) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.reserves.insert(fund.community_id, fund);
        Ok(())
    }

    async fn debit_reserve(
        &self,
        community_id: Uuid,
        decide: ReserveDecision,
        at: DateTime<Utc>,
    ) -> Result<ReserveDebit> {
        let mut tables = self.tables.write().await;
        let balance_before = tables
            .reserves
            .get(&community_id)
            .map(|f| f.balance)
            .unwrap_or(Money::ZERO);
        let debited = decide(balance_before).max(Money::ZERO).min(balance_before);

        if debited.is_positive()
            && let Some(fund) = tables.reserves.get_mut(&community_id)
        {
            fund.balance -= debited;
            fund.total_debited += debited;
            fund.updated_at = Some(at);
        }
        Ok(ReserveDebit {
            balance_before,
            debited,
        })
    }

    async fn save_run(&self, run: EngineRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run,
            None => tables.runs.push(run),
        }
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<EngineRun>> {
        let tables = self.tables.read().await;
        Ok(tables.runs.iter().max_by_key(|r| r.started_at).cloned())
    }

    async fn save_reminder(&self, reminder: Reminder) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.reminders.insert(reminder.id, reminder);
        Ok(())
    }

    async fn reminders_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<Reminder>> {
        let tables = self.tables.read().await;
        let mut reminders: Vec<_> = tables
            .reminders
            .values()
            .filter(|r| r.cycle_id == cycle_id)
            .cloned()
            .collect();
        reminders.sort_by_key(|r| (r.send_at, r.user_id));
        Ok(reminders)
    }

    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .reminders
            .values()
            .filter(|r| r.status == ReminderStatus::Pending && r.send_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.send_at, r.user_id));
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;

    fn cycle(circle_id: Uuid, number: u32) -> CircleCycle {
        CircleCycle::scheduled(
            circle_id,
            number,
            NaiveDate::from_ymd_opt(2026, 3, number).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, number + 7, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_insert_cycle_rejects_duplicate_number() {
        let store = InMemoryDatastore::new();
        let circle_id = Uuid::new_v4();
        store.insert_cycle(cycle(circle_id, 1)).await.unwrap();

        let err = store.insert_cycle(cycle(circle_id, 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Duplicate { entity: "cycle", .. }));
        store.insert_cycle(cycle(circle_id, 2)).await.unwrap();
        assert_eq!(store.cycles_for_circle(circle_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_cycle_is_guarded_on_status() {
        let store = InMemoryDatastore::new();
        let mut row = cycle(Uuid::new_v4(), 1);
        store.insert_cycle(row.clone()).await.unwrap();

        row.status = CycleStatus::Collecting;
        assert!(store.update_cycle(row.clone(), CycleStatus::Scheduled).await.unwrap());

        row.status = CycleStatus::DeadlineReached;
        assert!(!store.update_cycle(row.clone(), CycleStatus::Scheduled).await.unwrap());
        let stored = store.get_cycle(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CycleStatus::Collecting);
    }

    #[tokio::test]
    async fn test_insert_contribution_once_per_member() {
        let store = InMemoryDatastore::new();
        let row = cycle(Uuid::new_v4(), 1);
        let user = Uuid::new_v4();
        let contribution = CycleContribution::new(&row, user, Money::new(dec!(100)));
        store.insert_contribution(contribution.clone()).await.unwrap();

        let again = CycleContribution::new(&row, user, Money::new(dec!(100)));
        assert!(store.insert_contribution(again).await.is_err());
        assert_eq!(
            store.find_contribution(row.id, user).await.unwrap(),
            Some(contribution)
        );
    }

    #[tokio::test]
    async fn test_debit_reserve_clamps_to_balance() {
        let store = InMemoryDatastore::new();
        let community = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        store
            .save_reserve_fund(ReserveFund {
                community_id: community,
                balance: Money::new(dec!(50)),
                total_debited: Money::ZERO,
                updated_at: None,
            })
            .await
            .unwrap();

        let debit = store
            .debit_reserve(community, Box::new(|_| Money::new(dec!(80))), at)
            .await
            .unwrap();
        assert_eq!(debit.balance_before, Money::new(dec!(50)));
        assert_eq!(debit.debited, Money::new(dec!(50)));

        let fund = store.reserve_fund(community).await.unwrap().unwrap();
        assert!(fund.balance.is_zero());
        assert_eq!(fund.total_debited, Money::new(dec!(50)));
    }

    #[tokio::test]
    async fn test_debit_missing_reserve_is_zero() {
        let store = InMemoryDatastore::new();
        let debit = store
            .debit_reserve(Uuid::new_v4(), Box::new(|b| b), Utc::now())
            .await
            .unwrap();
        assert!(debit.balance_before.is_zero());
        assert!(debit.debited.is_zero());
    }

    #[tokio::test]
    async fn test_record_default_is_write_once() {
        let store = InMemoryDatastore::new();
        let row = cycle(Uuid::new_v4(), 1);
        let contribution = CycleContribution::new(&row, Uuid::new_v4(), Money::new(dec!(100)));
        let default = MemberDefault::snapshot(
            &contribution,
            Money::new(dec!(100)),
            crate::domain::circle::ContributionPolicy::ImmediateProceed,
            vec![],
            Utc::now(),
        );
        store.record_default(default.clone()).await.unwrap();
        assert!(store.record_default(default).await.is_err());
        assert_eq!(store.defaults_for_circle(row.circle_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_due_reminders_only_pending_and_past() {
        let store = InMemoryDatastore::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();
        let reminder = |send_at, status| Reminder {
            id: Uuid::new_v4(),
            cycle_id: Uuid::new_v4(),
            contribution_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            send_at,
            days_before_deadline: 1,
            status,
        };
        let due = reminder(now - chrono::Duration::hours(1), ReminderStatus::Pending);
        store.save_reminder(due.clone()).await.unwrap();
        store
            .save_reminder(reminder(now + chrono::Duration::hours(1), ReminderStatus::Pending))
            .await
            .unwrap();
        store
            .save_reminder(reminder(now - chrono::Duration::hours(2), ReminderStatus::Sent))
            .await
            .unwrap();

        assert_eq!(store.due_reminders(now).await.unwrap(), vec![due]);
    }

    #[tokio::test]
    async fn test_latest_run_by_start_time() {
        let store = InMemoryDatastore::new();
        let early = EngineRun::begin(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        let late = EngineRun::begin(Utc.with_ymd_and_hms(2026, 3, 1, 0, 15, 0).unwrap());
        store.save_run(late.clone()).await.unwrap();
        store.save_run(early).await.unwrap();
        assert_eq!(store.latest_run().await.unwrap().map(|r| r.id), Some(late.id));
    }
}
