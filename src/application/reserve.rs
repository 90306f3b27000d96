//! Reserve coverage: decides whether, and how much of, a cycle shortfall the
//! community reserve fund backstops.
//!
//! Coverage is full only when the whole gap fits within both the cap
//! (`reserve_cap_ratio` of the balance) and the balance itself. Otherwise the
//! whole capped allowance is spent: it closes gaps smallest first and the
//! remainder goes toward the next gap, which still defaults on what is left.

use super::context::EngineContext;
use crate::domain::circle::Circle;
use crate::domain::contribution::CycleContribution;
use crate::domain::cycle::CircleCycle;
use crate::domain::ledger::CycleEventKind;
use crate::domain::money::Money;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

/// The part of a shortfall the reserve will pay, given one balance reading.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoveragePlan {
    /// Contributions whose whole gap is paid.
    pub covered: Vec<Uuid>,
    /// At most one contribution that receives the leftover allowance.
    pub partial: Option<(Uuid, Money)>,
    pub amount: Money,
    pub full: bool,
}

/// Upper bound of any single debit: `min(missing, cap * balance, balance)`,
/// floored to the cent.
pub fn coverage_allowance(missing: Money, balance: Money, cap_ratio: Decimal) -> Money {
    let capped = balance
        .ratio(cap_ratio)
        .floor_cents()
        .min(balance)
        .max(Money::ZERO);
    missing.min(capped)
}

/// Plans coverage of `gaps` (contribution id, missing amount).
pub fn plan_coverage(gaps: &[(Uuid, Money)], balance: Money, cap_ratio: Decimal) -> CoveragePlan {
    let missing: Money = gaps.iter().map(|(_, gap)| *gap).sum();
    if missing.is_zero() {
        return CoveragePlan::default();
    }

    let allowance = coverage_allowance(missing, balance, cap_ratio);
    if allowance == missing {
        return CoveragePlan {
            covered: gaps.iter().map(|(id, _)| *id).collect(),
            partial: None,
            amount: missing,
            full: true,
        };
    }

    let mut sorted: Vec<&(Uuid, Money)> = gaps.iter().collect();
    sorted.sort_by_key(|(_, gap)| *gap);

    let mut plan = CoveragePlan {
        amount: allowance,
        ..CoveragePlan::default()
    };
    let mut left = allowance;
    for (id, gap) in sorted {
        if left.is_zero() {
            break;
        }
        if *gap <= left {
            left -= *gap;
            plan.covered.push(*id);
        } else {
            plan.partial = Some((*id, left));
            left = Money::ZERO;
        }
    }
    plan
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    pub missing: Money,
    pub balance_before: Money,
    pub debited: Money,
    pub covered: Vec<Uuid>,
    pub partial: Option<(Uuid, Money)>,
    pub full: bool,
}

pub struct ReserveCoverage<'a> {
    ctx: &'a EngineContext,
}

impl<'a> ReserveCoverage<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Covers what the reserve allows of `pending`, marking covered rows.
    ///
    /// Call at most once per cycle transition. The balance check and the
    /// debit happen atomically inside the datastore.
    pub async fn cover(
        &self,
        circle: &Circle,
        cycle: &CircleCycle,
        pending: &mut [CycleContribution],
        now: DateTime<Utc>,
    ) -> Result<CoverageReport> {
        let gaps: Vec<(Uuid, Money)> = pending
            .iter()
            .filter(|c| !c.status.is_resolved() && c.missing_amount().is_positive())
            .map(|c| (c.id, c.missing_amount()))
            .collect();
        let missing: Money = gaps.iter().map(|(_, gap)| *gap).sum();
        if gaps.is_empty() {
            return Ok(CoverageReport {
                missing,
                balance_before: Money::ZERO,
                debited: Money::ZERO,
                covered: Vec::new(),
                partial: None,
                full: true,
            });
        }

        let cap_ratio = self.ctx.config.reserve_cap_ratio;
        let planned = gaps.clone();
        let debit = self
            .ctx
            .store
            .debit_reserve(
                circle.community_id,
                Box::new(move |balance| plan_coverage(&planned, balance, cap_ratio).amount),
                now,
            )
            .await?;

        // Same inputs as inside the store's critical section, so same plan.
        let plan = plan_coverage(&gaps, debit.balance_before, cap_ratio);
        debug_assert_eq!(plan.amount, debit.debited);

        for contribution in pending.iter_mut() {
            if plan.covered.contains(&contribution.id) {
                contribution.cover_from_reserve();
            } else if let Some((id, amount)) = plan.partial
                && id == contribution.id
            {
                contribution.cover_part_from_reserve(amount);
            } else {
                continue;
            }
            self.ctx.store.save_contribution(contribution.clone()).await?;
        }

        let kind = if plan.full {
            CycleEventKind::ReserveCoverageApplied
        } else if plan.amount.is_positive() {
            CycleEventKind::ReserveCoveragePartial
        } else {
            CycleEventKind::ReserveCoverageDenied
        };
        tracing::info!(
            cycle_id = %cycle.id,
            community_id = %circle.community_id,
            %missing,
            debited = %debit.debited,
            balance_before = %debit.balance_before,
            ?kind,
            "reserve coverage evaluated"
        );
        self.ctx
            .events
            .record_for(
                cycle,
                kind,
                json!({
                    "community_id": circle.community_id,
                    "missing_amount": missing,
                    "balance_before": debit.balance_before,
                    "debited": debit.debited,
                    "covered_contributions": plan.covered,
                    "partially_covered": plan.partial.map(|(id, amount)| json!({
                        "contribution_id": id,
                        "amount": amount,
                    })),
                }),
                now,
            )
            .await?;

        Ok(CoverageReport {
            missing,
            balance_before: debit.balance_before,
            debited: debit.debited,
            covered: plan.covered,
            partial: plan.partial,
            full: plan.full,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(v: Decimal) -> Money {
        Money::new(v)
    }

    #[test]
    fn test_full_coverage_within_cap() {
        let gaps = vec![(Uuid::new_v4(), m(dec!(100)))];
        let plan = plan_coverage(&gaps, m(dec!(1000)), dec!(0.20));
        assert!(plan.full);
        assert_eq!(plan.amount, m(dec!(100)));
        assert_eq!(plan.covered.len(), 1);
    }

    #[test]
    fn test_cap_forces_partial_coverage() {
        // Cap is 20% of 1000 = 200; 250 missing.
        let small = Uuid::new_v4();
        let medium = Uuid::new_v4();
        let large = Uuid::new_v4();
        let gaps = vec![(large, m(dec!(100))), (small, m(dec!(50))), (medium, m(dec!(100)))];
        let plan = plan_coverage(&gaps, m(dec!(1000)), dec!(0.20));
        assert!(!plan.full);
        assert_eq!(plan.amount, m(dec!(200)));
        assert!(plan.covered.contains(&small));
        assert_eq!(plan.covered.len(), 2);
        let (rest, amount) = plan.partial.unwrap();
        assert!(rest == large || rest == medium);
        assert!(!plan.covered.contains(&rest));
        assert_eq!(amount, m(dec!(50)));
    }

    #[test]
    fn test_allowance_below_smallest_gap_goes_to_that_gap() {
        let id = Uuid::new_v4();
        let gaps = vec![(id, m(dec!(100)))];
        let plan = plan_coverage(&gaps, m(dec!(300)), dec!(0.20));
        assert!(!plan.full);
        assert_eq!(plan.amount, m(dec!(60)));
        assert!(plan.covered.is_empty());
        assert_eq!(plan.partial, Some((id, m(dec!(60)))));
    }

    #[test]
    fn test_allowance_is_floored_to_cents() {
        let gaps = vec![(Uuid::new_v4(), m(dec!(10)))];
        let plan = plan_coverage(&gaps, m(dec!(3.33)), dec!(0.20));
        assert_eq!(plan.amount, m(dec!(0.66)));
    }

    #[test]
    fn test_empty_reserve_denies() {
        let gaps = vec![(Uuid::new_v4(), m(dec!(10)))];
        let plan = plan_coverage(&gaps, Money::ZERO, dec!(0.20));
        assert_eq!(plan.amount, Money::ZERO);
        assert!(plan.covered.is_empty());
        assert_eq!(plan.partial, None);
    }

    #[test]
    fn test_allowance_is_min_of_bounds() {
        assert_eq!(coverage_allowance(m(dec!(500)), m(dec!(1000)), dec!(0.2)), m(dec!(200)));
        assert_eq!(coverage_allowance(m(dec!(50)), m(dec!(1000)), dec!(0.2)), m(dec!(50)));
        assert_eq!(coverage_allowance(m(dec!(50)), m(dec!(40)), dec!(1)), m(dec!(40)));
    }
}
