//! Embedded automated trader. Each bot runs a Bollinger-band mean-reversion
//! loop for one client: enter long when the price closes under the lower
//! band, exit when it closes over the upper band. Position state changes only
//! when the execution queue confirms a transaction, never on the decision.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::exec::{
    self, RequestSubmitter, Transaction, TransactionRequest, TransactionStatus, TransactionType,
};
use crate::feed::{PriceFeed, DEFAULT_ASSET};
use crate::wallet::{Currency, Wallet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionState {
    None,
    Long,
    /// Reserved; the strategy never opens a short.
    Short,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradingAction {
    Hold,
    Buy,
    CloseLong,
}

#[derive(Clone, Copy, Debug)]
pub struct BollingerBands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population standard deviation (divide by n, not n-1).
pub fn std_dev(data: &[f64], mean: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let variance = data.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / data.len() as f64;
    variance.sqrt()
}

pub fn bands(window: &[f64], k: f64) -> BollingerBands {
    let middle = mean(window);
    let deviation = std_dev(window, middle);
    BollingerBands {
        middle,
        upper: middle + k * deviation,
        lower: middle - k * deviation,
    }
}

/// Strategy parameters. `period` is the observation window, `k` the band
/// width in standard deviations, `spend_fraction` the share of the USD
/// balance committed on entry.
#[derive(Clone, Copy, Debug)]
pub struct BotConfig {
    pub period: usize,
    pub k: f64,
    pub spend_fraction: f64,
    pub interval: std::time::Duration,
}

impl BotConfig {
    pub fn new(period: usize, k: f64) -> BotConfig {
        BotConfig {
            period,
            k,
            spend_fraction: 1.0,
            interval: std::time::Duration::from_secs(15),
        }
    }
}

struct BotState {
    window: VecDeque<f64>,
    position: PositionState,
    entry_price: f64,
}

pub struct Bot {
    client_id: String,
    config: BotConfig,
    wallet: Arc<Wallet>,
    feed: Arc<PriceFeed>,
    submitter: RequestSubmitter,
    state: Mutex<BotState>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Bot {
    pub fn new(
        client_id: &str,
        config: BotConfig,
        wallet: Arc<Wallet>,
        feed: Arc<PriceFeed>,
        submitter: RequestSubmitter,
    ) -> Bot {
        let (stop_tx, _) = watch::channel(false);
        Bot {
            client_id: client_id.to_string(),
            config,
            wallet,
            feed,
            submitter,
            state: Mutex::new(BotState {
                window: VecDeque::new(),
                position: PositionState::None,
                entry_price: 0.0,
            }),
            stop_tx,
            worker: Mutex::new(None),
        }
    }

    pub fn position(&self) -> PositionState {
        self.state.lock().unwrap().position
    }

    pub fn entry_price(&self) -> f64 {
        self.state.lock().unwrap().entry_price
    }

    /// Feed one observation through the strategy and return the decision.
    /// Holds until the window is full; never decides on an invalid price.
    pub fn observe_price(&self, price: f64) -> TradingAction {
        if !(price > 0.0 && price.is_finite()) {
            return TradingAction::Hold;
        }
        let mut state = self.state.lock().unwrap();
        state.window.push_back(price);
        while state.window.len() > self.config.period * 2 {
            state.window.pop_front();
        }
        if state.window.len() < self.config.period {
            debug!(
                "bot {}: window {}/{}, holding",
                self.client_id,
                state.window.len(),
                self.config.period
            );
            return TradingAction::Hold;
        }

        let window: Vec<f64> = state
            .window
            .iter()
            .skip(state.window.len() - self.config.period)
            .copied()
            .collect();
        let bands = bands(&window, self.config.k);
        debug!(
            "bot {}: price={price:.10} mid={:.10} up={:.10} low={:.10}",
            self.client_id, bands.middle, bands.upper, bands.lower
        );

        match state.position {
            PositionState::None if price <= bands.lower => {
                if self.wallet.get_balance(Currency::Usd) > 0.0 {
                    TradingAction::Buy
                } else {
                    TradingAction::Hold
                }
            }
            PositionState::Long if price >= bands.upper => {
                if self.wallet.get_balance(Currency::SrdBtc) > 0.0 {
                    TradingAction::CloseLong
                } else {
                    TradingAction::Hold
                }
            }
            _ => TradingAction::Hold,
        }
    }

    /// Advance the position state machine on a confirmed outcome. Failed
    /// transactions change nothing.
    pub fn apply_transaction(&self, tx: &Transaction) {
        if tx.status != TransactionStatus::Completed {
            debug!(
                "bot {}: transaction {} failed ({}), position unchanged",
                self.client_id, tx.id, tx.failure_reason
            );
            return;
        }
        let mut state = self.state.lock().unwrap();
        match (tx.tx_type, state.position) {
            (TransactionType::Buy, PositionState::None) => {
                state.position = PositionState::Long;
                state.entry_price = tx.unit_price;
                info!(
                    "bot {}: opened long @ {:.10}",
                    self.client_id, state.entry_price
                );
            }
            (TransactionType::Buy, PositionState::Long) => {
                // Position reinforced; the original entry price stands.
                debug!("bot {}: long reinforced by {}", self.client_id, tx.id);
            }
            (TransactionType::Sell, PositionState::Long) => {
                info!(
                    "bot {}: closed long @ {:.10} (entry was {:.10})",
                    self.client_id, tx.unit_price, state.entry_price
                );
                state.position = PositionState::None;
                state.entry_price = 0.0;
            }
            (TransactionType::Buy, PositionState::Short)
            | (TransactionType::Sell, PositionState::Short) => {
                warn!(
                    "bot {}: short positions are not traded; {} ignored",
                    self.client_id, tx.id
                );
            }
            (TransactionType::Sell, PositionState::None) => {
                warn!(
                    "bot {}: sell {} completed with no long position tracked",
                    self.client_id, tx.id
                );
            }
        }
    }

    /// One strategy iteration: read the price, decide, size, submit. An
    /// unsubmittable order is the bot's cue that the process is shutting
    /// down, reported as an error so the loop stops.
    fn tick(&self) -> Result<(), &'static str> {
        let price = self.feed.get_price(DEFAULT_ASSET);
        let action = self.observe_price(price);
        let request = match action {
            TradingAction::Hold => return Ok(()),
            TradingAction::Buy => {
                let spend = self.wallet.get_balance(Currency::Usd) * self.config.spend_fraction;
                let quantity = exec::buy_quantity(spend, price);
                TransactionRequest {
                    client_id: self.client_id.clone(),
                    tx_type: TransactionType::Buy,
                    asset: DEFAULT_ASSET.to_string(),
                    quantity,
                }
            }
            TradingAction::CloseLong => TransactionRequest {
                client_id: self.client_id.clone(),
                tx_type: TransactionType::Sell,
                asset: DEFAULT_ASSET.to_string(),
                quantity: self.wallet.get_balance(Currency::SrdBtc),
            },
        };
        info!(
            "bot {}: submitting {} for {:.10} {}",
            self.client_id,
            request.tx_type.as_str(),
            request.quantity,
            request.asset
        );
        if !self.submitter.submit(request) {
            return Err("transaction queue unavailable");
        }
        Ok(())
    }

    /// Spawn the strategy loop.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!("bot for {} already running", self.client_id);
            return;
        }
        let _ = self.stop_tx.send(false);

        let bot = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        *worker = Some(tokio::spawn(async move {
            info!(
                "bot loop started for {} (period={} k={})",
                bot.client_id, bot.config.period, bot.config.k
            );
            loop {
                if let Err(reason) = bot.tick() {
                    error!("bot {} stopping: {reason}", bot.client_id);
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(bot.config.interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("bot loop stopped for {}", bot.client_id);
        }));
    }

    /// Signal the loop and wait for it. Idempotent.
    pub async fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock().unwrap();
            worker.take()
        };
        let Some(handle) = handle else {
            return;
        };
        let _ = self.stop_tx.send(true);
        if handle.await.is_err() {
            error!("bot loop for {} terminated abnormally", self.client_id);
        }
    }
}
