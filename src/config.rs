use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for a broker process. Everything lives under `data_dir`
/// so a test can point a whole broker at a throwaway directory.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub data_dir: PathBuf,
    /// Cadence of the price feed refresher.
    pub price_interval: Duration,
    /// Starting quote for the synthetic price source.
    pub starting_quote: f64,
    /// Fetch the external BTC quote instead of walking a synthetic one.
    pub live_prices: bool,
    /// Append every accepted price sample to a CSV under `data_dir`.
    pub log_prices: bool,
    /// Cadence of each bot's strategy loop.
    pub bot_interval: Duration,
    /// Fraction of the USD balance a bot commits to a BUY.
    pub bot_spend_fraction: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            price_interval: Duration::from_secs(15),
            starting_quote: 100_000.0,
            live_prices: false,
            log_prices: false,
            bot_interval: Duration::from_secs(15),
            bot_spend_fraction: 1.0,
        }
    }
}

impl BrokerConfig {
    pub fn wallets_dir(&self) -> PathBuf {
        self.data_dir.join("wallets")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("transactions.csv")
    }

    pub fn counter_path(&self) -> PathBuf {
        self.data_dir.join("transaction_counter")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn price_log_path(&self) -> Option<PathBuf> {
        self.log_prices.then(|| self.data_dir.join("srd_btc_values.csv"))
    }
}
