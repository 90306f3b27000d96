use crate::config::ConfigError;
use crate::domain::cycle::CycleStatus;
use thiserror::Error;
use uuid::Uuid;

/// Reasons a scheduled cycle cannot be started yet.
///
/// These never change persisted state; the cycle stays `scheduled` and the
/// next run tries again.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetupError {
    #[error("circle {0} not found")]
    CircleNotFound(Uuid),
    #[error("circle {0} is not active")]
    CircleInactive(Uuid),
    #[error("circle {0} has no active members")]
    NoActiveMembers(Uuid),
    #[error("circle {0} has no finalized payout order")]
    PayoutOrderNotFinalized(Uuid),
    #[error("payout order of circle {circle_id} has no entry for cycle {cycle_number}")]
    MissingPayoutSlot { circle_id: Uuid, cycle_number: u32 },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: CycleStatus, to: CycleStatus },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("payment adapter error: {0}")]
    PaymentError(String),
    #[error("store error: {0}")]
    StoreError(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
