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
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CF_CIRCLES: &str = "circles";
pub const CF_MEMBERSHIPS: &str = "memberships";
pub const CF_PAYOUT_ORDERS: &str = "payout_orders";
pub const CF_VOUCHES: &str = "vouches";
pub const CF_PAYMENT_METHODS: &str = "payment_methods";
/// Cycles keyed by `circle_id/cycle_number`.
pub const CF_CYCLES: &str = "cycles";
/// Cycle id to its key in `CF_CYCLES`.
pub const CF_CYCLE_INDEX: &str = "cycle_index";
/// Contributions keyed by `cycle_id/user_id`.
pub const CF_CONTRIBUTIONS: &str = "contributions";
/// Member defaults keyed by contribution id.
pub const CF_DEFAULTS: &str = "defaults";
pub const CF_EVENTS: &str = "events";
pub const CF_RESERVES: &str = "reserves";
pub const CF_RUNS: &str = "runs";
pub const CF_REMINDERS: &str = "reminders";

const COLUMN_FAMILIES: [&str; 13] = [
    CF_CIRCLES,
    CF_MEMBERSHIPS,
    CF_PAYOUT_ORDERS,
    CF_VOUCHES,
    CF_PAYMENT_METHODS,
    CF_CYCLES,
    CF_CYCLE_INDEX,
    CF_CONTRIBUTIONS,
    CF_DEFAULTS,
    CF_EVENTS,
    CF_RESERVES,
    CF_RUNS,
    CF_REMINDERS,
];

/// A persistent datastore using RocksDB.
///
/// Each entity lives in its own column family as JSON. Keys are laid out so
/// the per-circle and per-cycle lookups are prefix scans. Read-check-write
/// operations (uniqueness, status compare-and-swap, reserve debits) run under
/// a single writer lock.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

fn cycle_key(circle_id: Uuid, cycle_number: u32) -> String {
    format!("{circle_id}/{cycle_number:010}")
}

fn contribution_key(cycle_id: Uuid, user_id: Uuid) -> String {
    format!("{cycle_id}/{user_id}")
}

fn sortable_time(at: DateTime<Utc>) -> String {
    format!("{:020}", at.timestamp_micros())
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column family.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            EngineError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn put<T: Serialize>(&self, cf: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(self.cf(cf)?, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn exists(&self, cf: &str, key: &str) -> Result<bool> {
        Ok(self.db.get_pinned_cf(self.cf(cf)?, key.as_bytes())?.is_some())
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn scan_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &str) -> Result<Vec<T>> {
        let iter = self.db.iterator_cf(
            self.cf(cf)?,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn scan_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        self.scan_prefix(cf, "")
    }

    fn cycle_key_for(&self, cycle_id: Uuid) -> Result<Option<String>> {
        self.get(CF_CYCLE_INDEX, &cycle_id.to_string())
    }
}

#[async_trait]
impl CircleStore for RocksDBStore {
    async fn get_circle(&self, circle_id: Uuid) -> Result<Option<Circle>> {
        self.get(CF_CIRCLES, &circle_id.to_string())
    }

    async fn save_circle(&self, circle: Circle) -> Result<()> {
        self.put(CF_CIRCLES, &circle.id.to_string(), &circle)
    }

    async fn memberships(&self, circle_id: Uuid) -> Result<Vec<Membership>> {
        self.scan_prefix(CF_MEMBERSHIPS, &format!("{circle_id}/"))
    }

    async fn save_membership(&self, membership: Membership) -> Result<()> {
        let key = format!("{}/{}", membership.circle_id, membership.user_id);
        self.put(CF_MEMBERSHIPS, &key, &membership)
    }

    async fn payout_order(&self, circle_id: Uuid) -> Result<Option<PayoutOrder>> {
        self.get(CF_PAYOUT_ORDERS, &circle_id.to_string())
    }

    async fn save_payout_order(&self, order: PayoutOrder) -> Result<()> {
        self.put(CF_PAYOUT_ORDERS, &order.circle_id.to_string(), &order)
    }

    async fn vouches_for(&self, circle_id: Uuid, vouchee_id: Uuid) -> Result<Vec<Vouch>> {
        self.scan_prefix(CF_VOUCHES, &format!("{circle_id}/{vouchee_id}/"))
    }

    async fn save_vouch(&self, vouch: Vouch) -> Result<()> {
        let key = format!("{}/{}/{}", vouch.circle_id, vouch.vouchee_id, vouch.voucher_id);
        self.put(CF_VOUCHES, &key, &vouch)
    }

    async fn payment_methods(&self, user_id: Uuid) -> Result<Vec<PaymentMethod>> {
        let mut methods: Vec<PaymentMethod> =
            self.scan_prefix(CF_PAYMENT_METHODS, &format!("{user_id}/"))?;
        methods.sort_by_key(|m| !m.is_primary);
        Ok(methods)
    }

    async fn save_payment_method(&self, method: PaymentMethod) -> Result<()> {
        let key = format!("{}/{}", method.user_id, method.id);
        self.put(CF_PAYMENT_METHODS, &key, &method)
    }
}

#[async_trait]
impl CycleStore for RocksDBStore {
    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CircleCycle>> {
        match self.cycle_key_for(cycle_id)? {
            Some(key) => self.get(CF_CYCLES, &key),
            None => Ok(None),
        }
    }

    async fn find_cycle(&self, circle_id: Uuid, cycle_number: u32) -> Result<Option<CircleCycle>> {
        self.get(CF_CYCLES, &cycle_key(circle_id, cycle_number))
    }

    async fn cycles_with_status(&self, status: CycleStatus) -> Result<Vec<CircleCycle>> {
        let mut cycles: Vec<CircleCycle> = self
            .scan_all::<CircleCycle>(CF_CYCLES)?
            .into_iter()
            .filter(|c| c.status == status)
            .collect();
        cycles.sort_by_key(|c| (c.start_date, c.circle_id, c.cycle_number));
        Ok(cycles)
    }

    async fn cycles_for_circle(&self, circle_id: Uuid) -> Result<Vec<CircleCycle>> {
        self.scan_prefix(CF_CYCLES, &format!("{circle_id}/"))
    }

    async fn insert_cycle(&self, cycle: CircleCycle) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = cycle_key(cycle.circle_id, cycle.cycle_number);
        if self.exists(CF_CYCLES, &key)? {
            return Err(EngineError::Duplicate {
                entity: "cycle",
                key: format!("{} #{}", cycle.circle_id, cycle.cycle_number),
            });
        }
        self.put(CF_CYCLE_INDEX, &cycle.id.to_string(), &key)?;
        self.put(CF_CYCLES, &key, &cycle)
    }

    async fn update_cycle(&self, cycle: CircleCycle, expected: CycleStatus) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = self
            .cycle_key_for(cycle.id)?
            .ok_or_else(|| EngineError::not_found("cycle", cycle.id))?;
        let stored: Option<CircleCycle> = self.get(CF_CYCLES, &key)?;
        match stored {
            Some(stored) if stored.status == expected => {
                self.put(CF_CYCLES, &key, &cycle)?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::not_found("cycle", cycle.id)),
        }
    }

    async fn contributions(&self, cycle_id: Uuid) -> Result<Vec<CycleContribution>> {
        self.scan_prefix(CF_CONTRIBUTIONS, &format!("{cycle_id}/"))
    }

    async fn find_contribution(
        &self,
        cycle_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<CycleContribution>> {
        self.get(CF_CONTRIBUTIONS, &contribution_key(cycle_id, user_id))
    }

    async fn insert_contribution(&self, contribution: CycleContribution) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = contribution_key(contribution.cycle_id, contribution.user_id);
        if self.exists(CF_CONTRIBUTIONS, &key)? {
            return Err(EngineError::Duplicate {
                entity: "contribution",
                key,
            });
        }
        self.put(CF_CONTRIBUTIONS, &key, &contribution)
    }

    async fn save_contribution(&self, contribution: CycleContribution) -> Result<()> {
        let key = contribution_key(contribution.cycle_id, contribution.user_id);
        self.put(CF_CONTRIBUTIONS, &key, &contribution)
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn record_default(&self, default: MemberDefault) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = default.contribution_id.to_string();
        if self.exists(CF_DEFAULTS, &key)? {
            return Err(EngineError::Duplicate {
                entity: "member default",
                key,
            });
        }
        self.put(CF_DEFAULTS, &key, &default)
    }

    async fn defaults_for_circle(&self, circle_id: Uuid) -> Result<Vec<MemberDefault>> {
        let mut defaults: Vec<MemberDefault> = self
            .scan_all::<MemberDefault>(CF_DEFAULTS)?
            .into_iter()
            .filter(|d| d.circle_id == circle_id)
            .collect();
        defaults.sort_by_key(|d| d.recorded_at);
        Ok(defaults)
    }

    async fn append_event(&self, event: CycleEvent) -> Result<()> {
        let key = format!(
            "{}/{}/{}",
            event.circle_id,
            sortable_time(event.created_at),
            event.id
        );
        self.put(CF_EVENTS, &key, &event)
    }

    async fn events_for_circle(&self, circle_id: Uuid) -> Result<Vec<CycleEvent>> {
        self.scan_prefix(CF_EVENTS, &format!("{circle_id}/"))
    }

    async fn reserve_fund(&self, community_id: Uuid) -> Result<Option<ReserveFund>> {
        self.get(CF_RESERVES, &community_id.to_string())
    }

    async fn save_reserve_fund(&self, fund: ReserveFund) -> Result<()> {
        self.put(CF_RESERVES, &fund.community_id.to_string(), &fund)
    }

    async fn debit_reserve(
        &self,
        community_id: Uuid,
        decide: ReserveDecision,
        at: DateTime<Utc>,
    ) -> Result<ReserveDebit> {
        let _guard = self.write_lock.lock().await;
        let key = community_id.to_string();
        let fund: Option<ReserveFund> = self.get(CF_RESERVES, &key)?;
        let balance_before = fund.as_ref().map(|f| f.balance).unwrap_or(Money::ZERO);
        let debited = decide(balance_before).max(Money::ZERO).min(balance_before);

        if debited.is_positive()
            && let Some(mut fund) = fund
        {
            fund.balance -= debited;
            fund.total_debited += debited;
            fund.updated_at = Some(at);
            self.put(CF_RESERVES, &key, &fund)?;
        }
        Ok(ReserveDebit {
            balance_before,
            debited,
        })
    }

    async fn save_run(&self, run: EngineRun) -> Result<()> {
        let key = format!("{}/{}", sortable_time(run.started_at), run.id);
        self.put(CF_RUNS, &key, &run)
    }

    async fn latest_run(&self) -> Result<Option<EngineRun>> {
        match self.db.iterator_cf(self.cf(CF_RUNS)?, IteratorMode::End).next() {
            Some(item) => {
                let (_key, value) = item?;
                Ok(Some(serde_json::from_slice(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn save_reminder(&self, reminder: Reminder) -> Result<()> {
        self.put(CF_REMINDERS, &reminder.id.to_string(), &reminder)
    }

    async fn reminders_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<Reminder>> {
        let mut reminders: Vec<Reminder> = self
            .scan_all::<Reminder>(CF_REMINDERS)?
            .into_iter()
            .filter(|r| r.cycle_id == cycle_id)
            .collect();
        reminders.sort_by_key(|r| (r.send_at, r.user_id));
        Ok(reminders)
    }

    async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let mut due: Vec<Reminder> = self
            .scan_all::<Reminder>(CF_REMINDERS)?
            .into_iter()
            .filter(|r| r.status == ReminderStatus::Pending && r.send_at <= now)
            .collect();
        due.sort_by_key(|r| (r.send_at, r.user_id));
        Ok(due)
    }
}
