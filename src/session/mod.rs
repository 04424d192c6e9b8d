//! One session per authenticated client. The session task multiplexes three
//! inputs — framed commands from the transport, finished transactions from
//! the execution queue, and the broker's shutdown signal — and owns the
//! client's wallet handle and optional bot for its whole lifetime.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::bot::{Bot, BotConfig};
use crate::exec::{
    self, RequestSubmitter, Transaction, TransactionQueue, TransactionRequest, TransactionStatus,
    TransactionType,
};
use crate::feed::{PriceFeed, DEFAULT_ASSET};
use crate::session::transport::Transport;
use crate::wallet::{Currency, Wallet};

pub mod transport;

/// How many history entries SHOW TRANSACTIONS prints.
const HISTORY_WINDOW: usize = 10;

/// Per-session knobs inherited from the broker configuration.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub bot_interval: Duration,
    pub bot_spend_fraction: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bot_interval: Duration::from_secs(15),
            bot_spend_fraction: 1.0,
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Event {
    Line(std::io::Result<Option<String>>),
    Result(Option<Transaction>),
    Shutdown,
}

pub struct Session<T: Transport> {
    client_id: String,
    transport: T,
    wallet: Arc<Wallet>,
    feed: Arc<PriceFeed>,
    queue: Arc<TransactionQueue>,
    submitter: RequestSubmitter,
    results: mpsc::UnboundedReceiver<Transaction>,
    shutdown: watch::Receiver<bool>,
    config: SessionConfig,
    bot: Option<Arc<Bot>>,
}

impl<T: Transport> Session<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: &str,
        transport: T,
        wallet: Arc<Wallet>,
        feed: Arc<PriceFeed>,
        queue: Arc<TransactionQueue>,
        results: mpsc::UnboundedReceiver<Transaction>,
        shutdown: watch::Receiver<bool>,
        config: SessionConfig,
    ) -> Session<T> {
        let submitter = queue.submitter();
        Session {
            client_id: client_id.to_string(),
            transport,
            wallet,
            feed,
            queue,
            submitter,
            results,
            shutdown,
            config,
            bot: None,
        }
    }

    /// The session task body: runs until the client quits, the transport
    /// drops, or the broker shuts down, then releases everything it owns.
    pub async fn run(mut self) {
        info!("session started for {}", self.client_id);
        loop {
            let event = {
                let transport = &mut self.transport;
                let results = &mut self.results;
                let shutdown = &mut self.shutdown;
                tokio::select! {
                    line = transport.read_line() => Event::Line(line),
                    result = results.recv() => Event::Result(result),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            Event::Shutdown
                        } else {
                            continue;
                        }
                    }
                }
            };
            match event {
                Event::Line(Ok(Some(line))) => match self.dispatch(line.trim()).await {
                    Flow::Continue => {}
                    Flow::Stop => break,
                },
                Event::Line(Ok(None)) => {
                    info!("peer closed the stream for {}", self.client_id);
                    break;
                }
                Event::Line(Err(e)) => {
                    warn!("transport read failed for {}: {e}", self.client_id);
                    break;
                }
                Event::Result(Some(tx)) => self.deliver(tx).await,
                Event::Result(None) => {
                    warn!("result channel closed for {}", self.client_id);
                    break;
                }
                Event::Shutdown => {
                    info!("broker shutdown reached session {}", self.client_id);
                    break;
                }
            }
        }
        self.cleanup().await;
    }

    async fn dispatch(&mut self, line: &str) -> Flow {
        if line.is_empty() {
            return Flow::Continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let verb = tokens[0].to_ascii_uppercase();
        let target = tokens.get(1).map(|t| t.to_ascii_uppercase());

        match verb.as_str() {
            "QUIT" => {
                self.send("OK: Disconnecting.").await;
                Flow::Stop
            }
            "SHOW" => {
                match target.as_deref() {
                    Some("WALLET") => self.show_wallet().await,
                    Some("TRANSACTIONS") => self.show_transactions().await,
                    _ => {
                        self.send("ERROR: Unknown SHOW target. Use SHOW WALLET or SHOW TRANSACTIONS.")
                            .await
                    }
                }
                Flow::Continue
            }
            "GET_PRICE" => {
                match tokens.get(1) {
                    Some(symbol) => {
                        let price = self.feed.get_price(symbol);
                        if price > 0.0 && price.is_finite() {
                            self.send(&format!("PRICE {symbol} {price:.8}")).await;
                        } else {
                            self.send(&format!(
                                "ERROR: Could not retrieve valid price for {symbol}."
                            ))
                            .await;
                        }
                    }
                    None => {
                        self.send("ERROR: Missing symbol for GET_PRICE. Use GET_PRICE <symbol>.")
                            .await
                    }
                }
                Flow::Continue
            }
            "BUY" | "SELL" => {
                self.handle_order(&verb, &tokens).await;
                Flow::Continue
            }
            "START" => {
                match target.as_deref() {
                    Some("BOT") => self.start_bot(&tokens).await,
                    _ => self.send("ERROR: Unknown START command. Use START BOT.").await,
                }
                Flow::Continue
            }
            "STOP" => match target.as_deref() {
                Some("BOT") => {
                    self.stop_bot().await;
                    Flow::Continue
                }
                Some("SESSION") => {
                    self.send("OK: Stopping session.").await;
                    Flow::Stop
                }
                _ => {
                    self.send("ERROR: Unknown STOP command. Use STOP BOT or STOP SESSION.")
                        .await;
                    Flow::Continue
                }
            },
            _ => {
                self.send(&format!(
                    "ERROR: Unknown command '{line}'. Use SHOW WALLET, SHOW TRANSACTIONS, \
                     GET_PRICE <symbol>, BUY/SELL <Asset> <Percentage>, START BOT <period> <K>, \
                     STOP BOT, STOP SESSION, or QUIT."
                ))
                .await;
                Flow::Continue
            }
        }
    }

    /// Size and submit a manual order. The percentage is of the USD balance
    /// for a BUY and of the asset balance for a SELL; a size that comes out
    /// at zero is still submitted so the client gets a FAILED result rather
    /// than silence.
    async fn handle_order(&mut self, verb: &str, tokens: &[&str]) {
        if self.bot.is_some() {
            self.send(&format!(
                "ERROR: Manual trading ({verb}) is disabled while the bot is active. \
                 Please stop the bot first."
            ))
            .await;
            return;
        }

        let (Some(asset), Some(percent_raw)) = (tokens.get(1), tokens.get(2)) else {
            self.send(&format!(
                "ERROR: Invalid syntax or value for {verb}. Use {verb} <Asset> <Percentage (1-100)>."
            ))
            .await;
            return;
        };
        let percent: f64 = match percent_raw.parse() {
            Ok(p) if (1.0..=100.0).contains(&p) => p,
            _ => {
                self.send(&format!(
                    "ERROR: Invalid syntax or value for {verb}. Use {verb} <Asset> <Percentage (1-100)>."
                ))
                .await;
                return;
            }
        };
        if !asset.eq_ignore_ascii_case(DEFAULT_ASSET) {
            self.send(&format!("ERROR: Only {DEFAULT_ASSET} is traded here.")).await;
            return;
        }

        let tx_type = if verb == "BUY" {
            TransactionType::Buy
        } else {
            TransactionType::Sell
        };
        let quantity = match tx_type {
            TransactionType::Buy => {
                let price = self.feed.get_price(DEFAULT_ASSET);
                if !(price > 0.0 && price.is_finite()) {
                    self.send("ERROR: Current price not available for BUY.").await;
                    return;
                }
                let spend = percent / 100.0 * self.wallet.get_balance(Currency::Usd);
                exec::buy_quantity(spend, price)
            }
            TransactionType::Sell => {
                percent / 100.0 * self.wallet.get_balance(Currency::SrdBtc)
            }
        };

        let submitted = self.submitter.submit(TransactionRequest {
            client_id: self.client_id.clone(),
            tx_type,
            asset: DEFAULT_ASSET.to_string(),
            quantity,
        });
        if submitted {
            self.send(&format!(
                "OK: Your {verb} request has been submitted for processing."
            ))
            .await;
        } else {
            self.send("ERROR: Order processing is unavailable.").await;
        }
    }

    async fn start_bot(&mut self, tokens: &[&str]) {
        if self.bot.is_some() {
            self.send("ERROR: Bot is already running.").await;
            return;
        }
        let period = tokens.get(2).and_then(|t| t.parse::<usize>().ok());
        let k = tokens.get(3).and_then(|t| t.parse::<f64>().ok());
        let (Some(period), Some(k)) = (period, k) else {
            self.send("ERROR: Invalid syntax or values for START BOT. Use START BOT <period> <K>.")
                .await;
            return;
        };
        if period <= 1 || !(k > 0.0 && k.is_finite()) {
            self.send("ERROR: Invalid syntax or values for START BOT. Use START BOT <period> <K>.")
                .await;
            return;
        }

        let config = BotConfig {
            period,
            k,
            spend_fraction: self.config.bot_spend_fraction,
            interval: self.config.bot_interval,
        };
        let bot = Arc::new(Bot::new(
            &self.client_id,
            config,
            Arc::clone(&self.wallet),
            Arc::clone(&self.feed),
            self.submitter.clone(),
        ));
        bot.start();
        self.bot = Some(bot);
        self.send("BOT STARTED.").await;
    }

    async fn stop_bot(&mut self) {
        match self.bot.take() {
            Some(bot) => {
                bot.stop().await;
                self.send("BOT STOPPED.").await;
            }
            None => self.send("ERROR: No bot is running.").await,
        }
    }

    async fn show_wallet(&mut self) {
        let usd = self.wallet.get_balance(Currency::Usd);
        let srd = self.wallet.get_balance(Currency::SrdBtc);
        self.send(&format!("BALANCE USD: {usd:.2}, SRD-BTC: {srd:.10}")).await;
    }

    async fn show_transactions(&mut self) {
        let history = self.wallet.history();
        let shown = history.len().min(HISTORY_WINDOW);
        self.send(&format!(
            "TRANSACTION_HISTORY (Total: {}, Showing last {shown}):",
            history.len()
        ))
        .await;
        for tx in history.iter().skip(history.len() - shown) {
            self.send(&format!("- {}", tx.summary())).await;
        }
    }

    /// Forward a finished transaction to the bot (its state machine runs on
    /// confirmations) and report it to the client. A dead transport here is
    /// logged, not fatal; the read side of the loop notices the loss.
    async fn deliver(&mut self, tx: Transaction) {
        if let Some(bot) = &self.bot {
            bot.apply_transaction(&tx);
        }
        let line = result_line(&tx);
        if let Err(e) = self.transport.write_line(&line).await {
            warn!("could not deliver {} to {}: {e}", tx.id, self.client_id);
        }
    }

    async fn send(&mut self, line: &str) {
        if let Err(e) = self.transport.write_line(line).await {
            warn!("transport write failed for {}: {e}", self.client_id);
        }
    }

    async fn cleanup(mut self) {
        if let Some(bot) = self.bot.take() {
            bot.stop().await;
        }
        if let Err(e) = self.wallet.save() {
            error!("wallet save failed at session end for {}: {e}", self.client_id);
        }
        self.queue.unregister_session(&self.client_id);
        self.transport.close().await;
        info!("session ended for {}", self.client_id);
    }
}

fn result_line(tx: &Transaction) -> String {
    let mut line = format!("TRANSACTION_RESULT ID={} STATUS={}", tx.id, tx.status.as_str());
    match tx.status {
        TransactionStatus::Completed => {
            line.push_str(&format!(
                " TYPE={} QTY={:.8} TOTAL={:.2} PRICE={:.8}",
                tx.tx_type.as_str(),
                tx.quantity,
                tx.total_amount,
                tx.unit_price
            ));
        }
        TransactionStatus::Failed => {
            line.push_str(&format!(" REASON={}", tx.failure_reason));
        }
    }
    line
}
