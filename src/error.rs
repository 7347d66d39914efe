use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by ledger operations.
///
/// Benign outcomes (a trade already allocated, a conditional update that lost
/// a race) are not errors; they come back as zero-row results instead.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("storage busy: {op} gave up after {attempts} attempts")]
    StorageBusy { op: String, attempts: u32 },

    #[error("unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("negative balance: {bucket} has {balance}, delta {delta} would go below zero")]
    NegativeBalance {
        bucket: String,
        balance: Decimal,
        delta: Decimal,
    },

    #[error("unknown trade: {0}")]
    UnknownTrade(i64),

    #[error("invalid transition for trade {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("invalid trade: {0}")]
    InvalidTrade(String),

    #[error("price unavailable for {asset}")]
    PriceUnavailable { asset: String },

    #[error("lock {path} already held (holder: {holder})")]
    AlreadyLocked { path: String, holder: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Transient lock contention inside SQLite; the only retryable class.
    pub fn is_busy(&self) -> bool {
        match self {
            LedgerError::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
