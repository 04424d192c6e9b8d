//! Refresh sources for the price feed. The feed treats a source as opaque:
//! each cycle yields either one positive sample or nothing.

use std::future::Future;

use log::warn;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

// Per-sample fluctuation applied on top of the external quote.
const FLUCTUATION_STDDEV: f64 = 0.015;
const PRICE_FLOOR: f64 = 0.01;

const COINGECKO_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd";

pub trait PriceSource: Send {
    fn fetch(&mut self) -> impl Future<Output = Option<f64>> + Send;
}

/// Random walk seeded from a starting quote: each sample is the previous one
/// times `1 + N(0, 0.015)`, floored to stay positive. Used when the process
/// runs without external market connectivity.
pub struct SyntheticSource {
    quote: f64,
    noise: Normal<f64>,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(starting_quote: f64) -> SyntheticSource {
        SyntheticSource {
            quote: starting_quote,
            noise: Normal::new(0.0, FLUCTUATION_STDDEV).unwrap(),
            rng: StdRng::from_entropy(),
        }
    }
}

impl PriceSource for SyntheticSource {
    async fn fetch(&mut self) -> Option<f64> {
        let fluctuation = self.noise.sample(&mut self.rng);
        let mut next = self.quote * (1.0 + fluctuation);
        if !(next > 0.0 && next.is_finite()) {
            next = PRICE_FLOOR;
        }
        self.quote = next;
        Some(next)
    }
}

#[derive(Deserialize)]
struct SimplePrice {
    bitcoin: UsdQuote,
}

#[derive(Deserialize)]
struct UsdQuote {
    usd: f64,
}

/// Fetches the BTC/USD quote from CoinGecko and derives the synthetic pair's
/// sample from it with the same fluctuation the offline source uses. Any
/// transport or parse failure yields nothing for the cycle.
pub struct CoinGeckoSource {
    client: reqwest::Client,
    noise: Normal<f64>,
    rng: StdRng,
}

impl CoinGeckoSource {
    pub fn new() -> CoinGeckoSource {
        CoinGeckoSource {
            client: reqwest::Client::new(),
            noise: Normal::new(0.0, FLUCTUATION_STDDEV).unwrap(),
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for CoinGeckoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceSource for CoinGeckoSource {
    async fn fetch(&mut self) -> Option<f64> {
        let response = match self.client.get(COINGECKO_URL).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("external quote fetch failed: {e}");
                return None;
            }
        };
        let quote: SimplePrice = match response.json().await {
            Ok(quote) => quote,
            Err(e) => {
                warn!("external quote unreadable: {e}");
                return None;
            }
        };
        let btc = quote.bitcoin.usd;
        if !(btc > 0.0 && btc.is_finite()) {
            warn!("external quote out of range: {btc}");
            return None;
        }
        let fluctuation = self.noise.sample(&mut self.rng);
        Some((btc * (1.0 + fluctuation)).max(PRICE_FLOOR))
    }
}
