//! Multi-source price feed aggregation
//!
//! Each tick polls every (pair, source) combination under one shared
//! deadline. A source failing — timeout, bad status, malformed body,
//! non-positive price — never stops the remaining sources from running;
//! the tick only errors when nothing at all succeeded.

use async_trait::async_trait;
use chrono::Utc;
use ethers::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DexPair, PriceFeedConfig};
use crate::error::{OrchestratorError, Result};
use crate::metrics;
use crate::model::{parse_fixed, PricePoint, PRICE_DECIMALS};
use crate::store::Store;
use crate::twap::price_cache::PriceCache;

abigen!(
    FeedAggregator,
    r#"[
        function latestRoundData() view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)
        function decimals() view returns (uint8)
    ]"#
);

/// Pause between consecutive source calls to stay under rate limits
const INTER_CALL_DELAY: Duration = Duration::from_millis(100);

/// One independent price source for a set of pairs
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;
    /// Fixed-point price (18 fractional digits) for the pair
    async fn fetch(&self, pair: &str) -> Result<U256>;
}

/// Chainlink-style on-chain feed read over an EVM RPC endpoint
pub struct ChainlinkSource {
    provider: Arc<Provider<Http>>,
    feeds: HashMap<String, Address>,
}

impl ChainlinkSource {
    pub fn new(rpc_url: &str, feeds: &HashMap<String, String>) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| OrchestratorError::Config(format!("chainlink rpc: {}", e)))?;
        let mut parsed = HashMap::new();
        for (pair, address) in feeds {
            let address = address.parse::<Address>().map_err(|e| {
                OrchestratorError::Config(format!("chainlink feed {}: {}", pair, e))
            })?;
            parsed.insert(pair.clone(), address);
        }
        Ok(Self {
            provider: Arc::new(provider),
            feeds: parsed,
        })
    }
}

#[async_trait]
impl PriceSource for ChainlinkSource {
    fn name(&self) -> &str {
        "chainlink"
    }

    async fn fetch(&self, pair: &str) -> Result<U256> {
        let feed = self.feeds.get(pair).ok_or_else(|| {
            OrchestratorError::PriceUnavailable {
                pair: pair.to_string(),
            }
        })?;
        let aggregator = FeedAggregator::new(*feed, self.provider.clone());
        let decimals = aggregator.decimals().call().await.map_err(|e| {
            OrchestratorError::Chain {
                chain_id: "chainlink".into(),
                message: format!("decimals failed: {}", e),
            }
        })?;
        let (_, answer, _, _, _) =
            aggregator
                .latest_round_data()
                .call()
                .await
                .map_err(|e| OrchestratorError::Chain {
                    chain_id: "chainlink".into(),
                    message: format!("latestRoundData failed: {}", e),
                })?;
        if answer.is_negative() || answer.is_zero() {
            return Err(OrchestratorError::Validation(format!(
                "chainlink answer {} for {}",
                answer, pair
            )));
        }
        let raw = answer.into_raw();
        Ok(if (decimals as u32) <= PRICE_DECIMALS {
            raw * U256::exp10((PRICE_DECIMALS - decimals as u32) as usize)
        } else {
            raw / U256::exp10((decimals as u32 - PRICE_DECIMALS) as usize)
        })
    }
}

/// CoinGecko spot price over REST
pub struct CoinGeckoSource {
    client: reqwest::Client,
    api_key: Option<String>,
    coin_ids: HashMap<String, String>,
}

impl CoinGeckoSource {
    pub fn new(api_key: Option<String>, coin_ids: &HashMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            coin_ids: coin_ids.clone(),
        })
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &str {
        "coingecko"
    }

    async fn fetch(&self, pair: &str) -> Result<U256> {
        let coin_id = self.coin_ids.get(pair).ok_or_else(|| {
            OrchestratorError::PriceUnavailable {
                pair: pair.to_string(),
            }
        })?;
        let url = format!(
            "https://api.coingecko.com/api/v3/simple/price?ids={}&vs_currencies=usd&precision=full",
            coin_id
        );
        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }

        let response = request.send().await.map_err(|e| OrchestratorError::Chain {
            chain_id: "coingecko".into(),
            message: format!("request failed: {}", e),
        })?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Chain {
                chain_id: "coingecko".into(),
                message: format!("status {}", response.status()),
            });
        }
        let body: Value = response.json().await.map_err(|e| OrchestratorError::Chain {
            chain_id: "coingecko".into(),
            message: format!("bad body: {}", e),
        })?;

        // Keep the price lexical end to end; the JSON number is re-read as
        // its literal text, never as a float.
        let number = match body.get(coin_id).and_then(|coin| coin.get("usd")) {
            Some(Value::Number(n)) => n.clone(),
            _ => {
                return Err(OrchestratorError::PriceUnavailable {
                    pair: pair.to_string(),
                })
            }
        };
        parse_fixed(&number.to_string(), PRICE_DECIMALS)
    }
}

/// DEX quote source (1inch-style): price inferred from a one-unit quote
pub struct DexSource {
    client: reqwest::Client,
    api_key: Option<String>,
    tokens: HashMap<String, DexPair>,
}

impl DexSource {
    pub fn new(api_key: Option<String>, tokens: &HashMap<String, DexPair>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            tokens: tokens.clone(),
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct OneInchQuote {
    #[serde(rename = "toTokenAmount")]
    to_token_amount: String,
}

#[async_trait]
impl PriceSource for DexSource {
    fn name(&self) -> &str {
        "dex"
    }

    async fn fetch(&self, pair: &str) -> Result<U256> {
        let tokens = self
            .tokens
            .get(pair)
            .ok_or_else(|| OrchestratorError::PriceUnavailable {
                pair: pair.to_string(),
            })?;
        let amount_in = U256::exp10(tokens.from_decimals as usize);
        let url = format!(
            "https://api.1inch.io/v5.0/1/quote?fromTokenAddress={}&toTokenAddress={}&amount={}",
            tokens.from, tokens.to, amount_in
        );
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| OrchestratorError::Chain {
            chain_id: "dex".into(),
            message: format!("request failed: {}", e),
        })?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Chain {
                chain_id: "dex".into(),
                message: format!("status {}", response.status()),
            });
        }
        let quote: OneInchQuote = response.json().await.map_err(|e| OrchestratorError::Chain {
            chain_id: "dex".into(),
            message: format!("bad body: {}", e),
        })?;

        let out = U256::from_dec_str(&quote.to_token_amount)
            .map_err(|e| OrchestratorError::Validation(format!("bad quote amount: {}", e)))?;
        // Price per one source unit at 18 fractional digits
        Ok(out * U256::exp10(PRICE_DECIMALS as usize) / U256::exp10(tokens.to_decimals as usize))
    }
}

/// Drives all sources across all pairs once per tick
pub struct PriceFeedAggregator {
    sources: Vec<Arc<dyn PriceSource>>,
    pairs: Vec<String>,
    cache: Arc<PriceCache>,
    store: Arc<dyn Store>,
    tick_deadline: Duration,
}

impl PriceFeedAggregator {
    pub fn new(
        sources: Vec<Arc<dyn PriceSource>>,
        pairs: Vec<String>,
        cache: Arc<PriceCache>,
        store: Arc<dyn Store>,
        tick_deadline: Duration,
    ) -> Self {
        Self {
            sources,
            pairs,
            cache,
            store,
            tick_deadline,
        }
    }

    /// Build the production source set from configuration
    pub fn sources_from_config(config: &PriceFeedConfig) -> Result<Vec<Arc<dyn PriceSource>>> {
        let mut sources: Vec<Arc<dyn PriceSource>> = Vec::new();
        if let Some(rpc) = &config.chainlink_rpc_url {
            sources.push(Arc::new(ChainlinkSource::new(rpc, &config.chainlink_feeds)?));
        }
        if !config.coingecko_ids.is_empty() {
            sources.push(Arc::new(CoinGeckoSource::new(
                config.coingecko_api_key.clone(),
                &config.coingecko_ids,
            )?));
        }
        if !config.dex_tokens.is_empty() {
            sources.push(Arc::new(DexSource::new(
                config.oneinch_api_key.clone(),
                &config.dex_tokens,
            )?));
        }
        Ok(sources)
    }

    /// Run one aggregation tick. Returns the number of points written;
    /// errors only when every source on every pair failed.
    pub async fn poll_once(&self) -> Result<usize> {
        let deadline = Instant::now() + self.tick_deadline;
        let mut written = 0usize;
        let mut attempted = 0usize;
        let mut last_error: Option<OrchestratorError> = None;

        'pairs: for pair in &self.pairs {
            for source in &self.sources {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!("price feed tick deadline reached; abandoning remaining sources");
                    break 'pairs;
                }

                attempted += 1;
                match tokio::time::timeout(remaining, source.fetch(pair)).await {
                    Ok(Ok(price)) if !price.is_zero() => {
                        let point = PricePoint::new(pair, source.name(), price, Utc::now());
                        self.cache.record(point.clone());
                        if let Err(e) = self.store.store_price_point(&point).await {
                            warn!(
                                pair = %pair,
                                source = source.name(),
                                error = %e,
                                "failed to persist price point; cache write stands"
                            );
                        }
                        metrics::record_price_point(source.name());
                        written += 1;
                        debug!(pair = %pair, source = source.name(), price = %price, "price point stored");
                    }
                    Ok(Ok(_)) => {
                        metrics::record_price_source_failure(source.name());
                        last_error = Some(OrchestratorError::Validation(format!(
                            "{} returned zero price for {}",
                            source.name(),
                            pair
                        )));
                    }
                    Ok(Err(e)) => {
                        metrics::record_price_source_failure(source.name());
                        warn!(pair = %pair, source = source.name(), error = %e, "price source failed");
                        last_error = Some(e);
                    }
                    Err(_) => {
                        metrics::record_price_source_failure(source.name());
                        warn!(pair = %pair, source = source.name(), "price source timed out");
                        last_error = Some(OrchestratorError::Timeout {
                            operation: format!("{} fetch for {}", source.name(), pair),
                        });
                    }
                }

                tokio::time::sleep(INTER_CALL_DELAY).await;
            }
        }

        info!(
            written,
            attempted,
            pairs = self.pairs.len(),
            sources = self.sources.len(),
            "price feed tick complete"
        );

        if written == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(written)
    }

    /// Drop stored points older than the retention horizon
    pub async fn prune(&self, retention: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(72));
        match self.store.prune_price_points(cutoff).await {
            Ok(removed) if removed > 0 => debug!(removed, "pruned stored price points"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "price point prune failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource {
        name: &'static str,
        result: std::result::Result<u64, &'static str>,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn ok(name: &'static str, price: u64) -> Self {
            Self {
                name,
                result: Ok(price),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(name: &'static str, message: &'static str) -> Self {
            Self {
                name,
                result: Err(message),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PriceSource for StaticSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, _pair: &str) -> Result<U256> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Ok(price) => Ok(U256::from(price) * crate::model::money::PRICE_SCALE),
                Err(message) => Err(OrchestratorError::Chain {
                    chain_id: self.name.to_string(),
                    message: message.to_string(),
                }),
            }
        }
    }

    fn aggregator(
        sources: Vec<Arc<dyn PriceSource>>,
    ) -> (PriceFeedAggregator, Arc<PriceCache>, Arc<MemoryStore>) {
        let cache = Arc::new(PriceCache::new(Duration::from_secs(86_400)));
        let store = Arc::new(MemoryStore::new());
        let agg = PriceFeedAggregator::new(
            sources,
            vec!["ETH_USDC".to_string()],
            cache.clone(),
            store.clone(),
            Duration::from_secs(60),
        );
        (agg, cache, store)
    }

    #[tokio::test]
    async fn one_healthy_source_carries_the_tick() {
        let chainlink = Arc::new(StaticSource::failing("chainlink", "timeout"));
        let coingecko = Arc::new(StaticSource::failing("coingecko", "status 500"));
        let dex = Arc::new(StaticSource::ok("dex", 1999));
        let (agg, cache, store) = aggregator(vec![
            chainlink.clone(),
            coingecko.clone(),
            dex.clone(),
        ]);

        let written = agg.poll_once().await.unwrap();
        assert_eq!(written, 1);

        // every source still ran despite the failures
        assert_eq!(chainlink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coingecko.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dex.calls.load(Ordering::SeqCst), 1);

        let latest = cache.latest("ETH_USDC").unwrap();
        assert_eq!(latest.source, "dex");
        assert_eq!(
            latest.price,
            U256::from(1999u64) * crate::model::money::PRICE_SCALE
        );

        let persisted = store.latest_price("ETH_USDC", "dex").await.unwrap();
        assert!(persisted.is_some());
    }

    #[tokio::test]
    async fn tick_errors_only_when_everything_failed() {
        let (agg, cache, _) = aggregator(vec![
            Arc::new(StaticSource::failing("chainlink", "down")) as Arc<dyn PriceSource>,
            Arc::new(StaticSource::failing("coingecko", "down")),
        ]);
        assert!(agg.poll_once().await.is_err());
        assert_eq!(cache.point_count(), 0);
    }

    #[tokio::test]
    async fn zero_price_is_rejected_without_side_effects() {
        let (agg, cache, store) =
            aggregator(vec![Arc::new(StaticSource::ok("dex", 0)) as Arc<dyn PriceSource>]);
        assert!(agg.poll_once().await.is_err());
        assert_eq!(cache.point_count(), 0);
        assert!(store
            .latest_price("ETH_USDC", "dex")
            .await
            .unwrap()
            .is_none());
    }
}
