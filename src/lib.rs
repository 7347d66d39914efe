pub mod buckets;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod oracle;
pub mod queue;
pub mod reliability;
pub mod storage;
pub mod waterfall;

pub use error::{LedgerError, LedgerResult};
