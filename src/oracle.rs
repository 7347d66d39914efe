use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::config::LedgerConfig;
use crate::logging::{log, obj, v_str, Domain, Level};

/// External price source. `Ok(None)` means the oracle had no price; callers
/// also treat non-positive values as missing.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_price(&self, asset: &str) -> Result<Option<Decimal>>;
}

/// Fixed price table, used offline and in tests.
#[derive(Debug, Default)]
pub struct StaticPriceOracle {
    prices: HashMap<String, Option<Decimal>>,
    calls: AtomicU64,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, asset: &str, price: Option<Decimal>) -> Self {
        self.prices.insert(asset.to_uppercase(), price);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn get_price(&self, asset: &str) -> Result<Option<Decimal>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.prices.get(&asset.to_uppercase()).copied().flatten())
    }
}

#[derive(Deserialize, Debug)]
struct TickerPrice {
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
}

/// Spot price from a Binance-compatible `/api/v3/ticker/price` endpoint.
pub struct HttpPriceOracle {
    client: Client,
    base: String,
    quote: String,
}

impl HttpPriceOracle {
    pub fn new(cfg: &LedgerConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base: cfg.oracle_url.trim_end_matches('/').to_string(),
            quote: cfg.quote_asset.to_uppercase(),
        })
    }

    fn symbol(&self, asset: &str) -> String {
        format!("{}{}", asset.to_uppercase(), self.quote)
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn get_price(&self, asset: &str) -> Result<Option<Decimal>> {
        let symbol = self.symbol(asset);
        let url = format!("{}/api/v3/ticker/price", self.base);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 400 || status.as_u16() == 404 {
            // Unknown symbol: the oracle answered, it just has no price.
            log(
                Level::Warn,
                Domain::Exec,
                "oracle_no_symbol",
                obj(&[("asset", v_str(asset)), ("symbol", v_str(&symbol))]),
            );
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("oracle returned {} for {}", status, symbol));
        }

        let ticker: TickerPrice = resp.json().await?;
        Ok(Some(ticker.price))
    }
}
