use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{LedgerError, LedgerResult};
use crate::reliability::retry::RetryConfig;

/// Percentages of a realized gain routed to each destination bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Split {
    pub tax_pct: Decimal,
    pub ops_pct: Decimal,
    pub reinvest_pct: Decimal,
}

impl Default for Split {
    fn default() -> Self {
        Self {
            tax_pct: dec!(30),
            ops_pct: dec!(50),
            reinvest_pct: dec!(20),
        }
    }
}

impl Split {
    pub fn validate(&self) -> LedgerResult<()> {
        let parts = [self.tax_pct, self.ops_pct, self.reinvest_pct];
        if parts.iter().any(|p| *p < Decimal::ZERO) {
            return Err(LedgerError::Config(format!("split has a negative part: {:?}", self)));
        }
        let total: Decimal = parts.iter().sum();
        if total != Decimal::ONE_HUNDRED {
            return Err(LedgerError::Config(format!("split sums to {} not 100", total)));
        }
        Ok(())
    }
}

/// Substitute prices used when the oracle cannot price an asset.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackPolicy {
    pub table: HashMap<String, Decimal>,
    /// Generic price for assets missing from the table. `None` means the
    /// trade fails instead of executing at a made-up price.
    pub default_price: Option<Decimal>,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            table: parse_table("FET=1.50"),
            default_price: Some(Decimal::ONE),
        }
    }
}

impl FallbackPolicy {
    pub fn price_for(&self, asset: &str) -> Option<Decimal> {
        self.table.get(asset).copied().or(self.default_price)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub ledger_path: String,
    pub lock_path: String,
    pub retry: RetryConfig,
    pub busy_timeout_ms: u64,
    pub split: Split,
    pub fallback: FallbackPolicy,
    pub cost_basis: HashMap<String, Decimal>,
    pub trusted_reasons: Vec<String>,
    pub oracle_attempts: u32,
    pub oracle_backoff_ms: u64,
    pub oracle_url: String,
    pub quote_asset: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ledger_path: "./republic_ledger.sqlite".to_string(),
            lock_path: "./republic_ledger.lock".to_string(),
            retry: RetryConfig::default(),
            busy_timeout_ms: 250,
            split: Split::default(),
            fallback: FallbackPolicy::default(),
            cost_basis: HashMap::new(),
            trusted_reasons: vec!["risk_engine".to_string(), "rebalance".to_string()],
            oracle_attempts: 3,
            oracle_backoff_ms: 250,
            oracle_url: "https://api.binance.com".to_string(),
            quote_asset: "USDT".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let default_price = match std::env::var("FALLBACK_DEFAULT").as_deref() {
            Ok("none") | Ok("") => None,
            Ok(v) => v.parse().ok().or(d.fallback.default_price),
            Err(_) => d.fallback.default_price,
        };
        Self {
            ledger_path: std::env::var("LEDGER_PATH").unwrap_or(d.ledger_path),
            lock_path: std::env::var("LOCK_PATH").unwrap_or(d.lock_path),
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_ATTEMPTS", d.retry.max_attempts),
                base_delay_ms: env_parse("RETRY_BASE_MS", d.retry.base_delay_ms),
                max_delay_ms: env_parse("RETRY_MAX_MS", d.retry.max_delay_ms),
                jitter_factor: env_parse("RETRY_JITTER", d.retry.jitter_factor),
            },
            busy_timeout_ms: env_parse("BUSY_TIMEOUT_MS", d.busy_timeout_ms),
            split: Split {
                tax_pct: env_parse("SPLIT_TAX_PCT", d.split.tax_pct),
                ops_pct: env_parse("SPLIT_OPS_PCT", d.split.ops_pct),
                reinvest_pct: env_parse("SPLIT_REINVEST_PCT", d.split.reinvest_pct),
            },
            fallback: FallbackPolicy {
                table: std::env::var("FALLBACK_PRICES")
                    .map(|v| parse_table(&v))
                    .unwrap_or(d.fallback.table),
                default_price,
            },
            cost_basis: std::env::var("COST_BASIS")
                .map(|v| parse_table(&v))
                .unwrap_or(d.cost_basis),
            trusted_reasons: std::env::var("TRUSTED_REASONS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(d.trusted_reasons),
            oracle_attempts: env_parse("ORACLE_ATTEMPTS", d.oracle_attempts),
            oracle_backoff_ms: env_parse("ORACLE_BACKOFF_MS", d.oracle_backoff_ms),
            oracle_url: std::env::var("ORACLE_URL").unwrap_or(d.oracle_url),
            quote_asset: std::env::var("QUOTE_ASSET").unwrap_or(d.quote_asset),
        }
    }

    pub fn validate(&self) -> LedgerResult<()> {
        self.split.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(LedgerError::Config("RETRY_ATTEMPTS must be at least 1".into()));
        }
        if self.oracle_attempts == 0 {
            return Err(LedgerError::Config("ORACLE_ATTEMPTS must be at least 1".into()));
        }
        let prices = self.fallback.table.values().chain(self.fallback.default_price.iter());
        for p in prices {
            if *p <= Decimal::ZERO {
                return Err(LedgerError::Config(format!("fallback price {} is not positive", p)));
            }
        }
        url::Url::parse(&self.oracle_url)
            .map_err(|e| LedgerError::Config(format!("ORACLE_URL: {}", e)))?;
        Ok(())
    }

    /// Backoff for oracle lookups; shorter than storage, same shape.
    pub fn oracle_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.oracle_attempts,
            base_delay_ms: self.oracle_backoff_ms,
            max_delay_ms: self.oracle_backoff_ms.saturating_mul(8),
            jitter_factor: 0.2,
        }
    }

    pub fn is_trusted(&self, reason: &str) -> bool {
        self.trusted_reasons.iter().any(|r| r == reason)
    }
}

/// Parse `ASSET=value,ASSET=value`. Malformed entries are skipped.
pub fn parse_table(raw: &str) -> HashMap<String, Decimal> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let v: Decimal = v.trim().parse().ok()?;
            Some((k.trim().to_uppercase(), v))
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
