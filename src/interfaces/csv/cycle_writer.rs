use crate::domain::cycle::CircleCycle;
use crate::domain::money::Money;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

/// One output row per cycle.
#[derive(Debug, Serialize)]
struct CycleRow<'a> {
    circle_id: Uuid,
    cycle_number: u32,
    status: &'a str,
    expected: Money,
    collected: Money,
    reserve_covered: Money,
    platform_fee: Money,
    payout: Money,
    contributions: String,
    defaults: u32,
    payout_attempts: u32,
    payout_transaction_id: Option<&'a str>,
}

/// Writes a cycle summary as CSV.
pub struct CycleWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CycleWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_cycles<'a, I>(&mut self, cycles: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a CircleCycle>,
    {
        for cycle in cycles {
            self.writer.serialize(CycleRow {
                circle_id: cycle.circle_id,
                cycle_number: cycle.cycle_number,
                status: cycle.status.as_str(),
                expected: cycle.expected_amount,
                collected: cycle.collected_amount,
                reserve_covered: cycle.reserve_covered_amount,
                platform_fee: cycle.platform_fee,
                payout: cycle.payout_amount,
                contributions: format!(
                    "{}/{}",
                    cycle.contributions_received, cycle.contributions_expected
                ),
                defaults: cycle.default_count,
                payout_attempts: cycle.payout_attempts,
                payout_transaction_id: cycle.payout_transaction_id.as_deref(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
