//! JSON snapshot of circle setup data, used to load a datastore from a file.
//!
//! Circle setup lives outside the engine; this is how the CLI and tests hand
//! it the circles, members and pre-created cycles it works on.

use crate::domain::circle::{Circle, Membership, PaymentMethod, PayoutOrder, Vouch};
use crate::domain::cycle::CircleCycle;
use crate::domain::ledger::ReserveFund;
use crate::domain::ports::{CircleStore, CycleStore, Datastore, LedgerStore};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedState {
    pub circles: Vec<Circle>,
    pub memberships: Vec<Membership>,
    pub payout_orders: Vec<PayoutOrder>,
    pub cycles: Vec<CircleCycle>,
    pub vouches: Vec<Vouch>,
    pub payment_methods: Vec<PaymentMethod>,
    pub reserves: Vec<ReserveFund>,
}

impl SeedState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Writes everything into `store`. Circles, cycles and reserve funds that
    /// already exist are left alone: the engine owns them once seeded.
    pub async fn apply(self, store: &dyn Datastore) -> Result<()> {
        for circle in self.circles {
            if store.get_circle(circle.id).await?.is_none() {
                store.save_circle(circle).await?;
            }
        }
        for membership in self.memberships {
            store.save_membership(membership).await?;
        }
        for order in self.payout_orders {
            store.save_payout_order(order).await?;
        }
        for vouch in self.vouches {
            store.save_vouch(vouch).await?;
        }
        for method in self.payment_methods {
            store.save_payment_method(method).await?;
        }
        for fund in self.reserves {
            if store.reserve_fund(fund.community_id).await?.is_none() {
                store.save_reserve_fund(fund).await?;
            }
        }
        for cycle in self.cycles {
            match store.insert_cycle(cycle).await {
                Ok(()) | Err(EngineError::Duplicate { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
