use crate::domain::contribution::ContributionReceived;
use crate::error::{EngineError, Result};
use std::io::Read;

/// Reads contribution-received payloads from a CSV source.
///
/// Expected columns: `cycle_id, user_id, amount, transaction_id, received_at`,
/// with `received_at` in RFC 3339. Whitespace is trimmed and record lengths
/// are flexible.
pub struct ContributionReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ContributionReader<R> {
    /// Creates a new `ContributionReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes payloads.
    pub fn contributions(self) -> impl Iterator<Item = Result<ContributionReceived>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(EngineError::from))
    }
}
