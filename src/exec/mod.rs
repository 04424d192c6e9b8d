//! Order execution. `TransactionQueue` serialises every state-mutating order
//! in the process through a single worker: one request at a time is validated
//! against the owning wallet under that wallet's lock, applied, persisted, and
//! the outcome is pushed back to the originating session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::exec::audit::AuditLog;
use crate::feed::PriceFeed;
use crate::wallet::{Currency, Wallet};

pub mod audit;

/// Fee charged on the USD leg of every executed order.
pub const FEE_RATE: f64 = 0.0001;

// Funds checks tolerate this much float drift so a 100% order sized against
// the same balance it is validated against cannot fail on the last bit.
const BALANCE_EPSILON: f64 = 1e-9;

/// Asset quantity purchasable with `spend` USD once the fee on the USD leg is
/// accounted for. Sizing with this keeps a full-balance BUY inside its own
/// funds check.
pub fn buy_quantity(spend: f64, unit_price: f64) -> f64 {
    spend / (unit_price * (1.0 + FEE_RATE))
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<TransactionType> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" => Some(TransactionType::Buy),
            "SELL" => Some(TransactionType::Sell),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum TransactionStatus {
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<TransactionStatus> {
        match value.to_ascii_uppercase().as_str() {
            "COMPLETED" => Some(TransactionStatus::Completed),
            "FAILED" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// Immutable record of an order's outcome. `total_amount` is the USD leg that
/// actually moved, net of fee; for FAILED transactions the amounts are zero
/// and `failure_reason` says why nothing moved.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Transaction {
    pub id: String,
    pub client_id: String,
    pub tx_type: TransactionType,
    pub asset: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_amount: f64,
    pub fee: f64,
    pub timestamp: i64,
    pub status: TransactionStatus,
    pub failure_reason: String,
}

impl Transaction {
    fn completed(
        id: String,
        request: &TransactionRequest,
        unit_price: f64,
        total_amount: f64,
        fee: f64,
        timestamp: i64,
    ) -> Transaction {
        Transaction {
            id,
            client_id: request.client_id.clone(),
            tx_type: request.tx_type,
            asset: request.asset.clone(),
            quantity: request.quantity,
            unit_price,
            total_amount,
            fee,
            timestamp,
            status: TransactionStatus::Completed,
            failure_reason: String::new(),
        }
    }

    fn failed(
        id: String,
        request: &TransactionRequest,
        unit_price: f64,
        timestamp: i64,
        reason: &str,
    ) -> Transaction {
        Transaction {
            id,
            client_id: request.client_id.clone(),
            tx_type: request.tx_type,
            asset: request.asset.clone(),
            quantity: request.quantity,
            unit_price,
            total_amount: 0.0,
            fee: 0.0,
            timestamp,
            status: TransactionStatus::Failed,
            failure_reason: reason.to_string(),
        }
    }

    /// One-line rendering used by the transaction history listing.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {} {} qty={:.8} price={:.8} total={:.2} fee={:.4} {}",
            self.id,
            self.tx_type.as_str(),
            self.asset,
            self.quantity,
            self.unit_price,
            self.total_amount,
            self.fee,
            self.status.as_str(),
        );
        if self.status == TransactionStatus::Failed && !self.failure_reason.is_empty() {
            line.push_str(" reason=");
            line.push_str(&self.failure_reason);
        }
        line
    }

    /// Serialise to the wallet-file line format.
    pub fn to_wallet_line(&self) -> String {
        format!(
            "TRANSACTION {} {} {} {} {:.10} {:.10} {:.10} {:.10} {} {}",
            self.id,
            self.client_id,
            self.tx_type.as_str(),
            self.asset,
            self.quantity,
            self.unit_price,
            self.total_amount,
            self.fee,
            self.timestamp,
            self.status.as_str(),
        )
    }

    /// Parse a `TRANSACTION …` wallet-file line. A transaction that was still
    /// pending when the file was written comes back as FAILED; any malformed
    /// line yields `None` and is the caller's to skip.
    pub fn from_wallet_line(line: &str) -> Option<Transaction> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "TRANSACTION" {
            return None;
        }
        let id = parts.next()?.to_string();
        let client_id = parts.next()?.to_string();
        let tx_type = TransactionType::parse(parts.next()?)?;
        let asset = parts.next()?.to_string();
        let quantity: f64 = parts.next()?.parse().ok()?;
        let unit_price: f64 = parts.next()?.parse().ok()?;
        let total_amount: f64 = parts.next()?.parse().ok()?;
        let fee: f64 = parts.next()?.parse().ok()?;
        let timestamp: i64 = parts.next()?.parse().ok()?;
        let status_raw = parts.next()?;

        let (status, failure_reason) = if status_raw.eq_ignore_ascii_case("PENDING") {
            warn!("transaction {id} was pending on disk, recovering it as failed");
            (TransactionStatus::Failed, "recovered pending transaction".to_string())
        } else {
            (TransactionStatus::parse(status_raw)?, String::new())
        };

        Some(Transaction {
            id,
            client_id,
            tx_type,
            asset,
            quantity,
            unit_price,
            total_amount,
            fee,
            timestamp,
            status,
            failure_reason,
        })
    }
}

/// An order as submitted by a session or bot. `quantity` is in asset units
/// for both sides; the queue derives the USD leg at execution time.
#[derive(Clone, Debug)]
pub struct TransactionRequest {
    pub client_id: String,
    pub tx_type: TransactionType,
    pub asset: String,
    pub quantity: f64,
}

/// Non-owning view of a live session held by the queue: enough to validate
/// against the right wallet and to push the outcome back.
#[derive(Clone)]
pub struct SessionHandle {
    pub wallet: Arc<Wallet>,
    pub notify: mpsc::UnboundedSender<Transaction>,
}

/// Cloneable submission side of the queue, handed to sessions and bots.
#[derive(Clone)]
pub struct RequestSubmitter {
    inner: mpsc::UnboundedSender<TransactionRequest>,
}

impl RequestSubmitter {
    /// Enqueue without blocking. Returns false if the worker is gone, which
    /// callers treat as a stop signal.
    pub fn submit(&self, request: TransactionRequest) -> bool {
        if self.inner.send(request).is_err() {
            error!("transaction queue is not accepting requests");
            return false;
        }
        true
    }
}

pub struct TransactionQueue {
    feed: Arc<PriceFeed>,
    audit: AuditLog,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    submit: mpsc::UnboundedSender<TransactionRequest>,
    backlog: Mutex<Option<mpsc::UnboundedReceiver<TransactionRequest>>>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl TransactionQueue {
    /// `last_id` is the highest numeric transaction id issued by any previous
    /// run; ids continue from there.
    pub fn new(feed: Arc<PriceFeed>, audit: AuditLog, last_id: u64) -> TransactionQueue {
        let (submit, backlog) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        TransactionQueue {
            feed,
            audit,
            sessions: Mutex::new(HashMap::new()),
            submit,
            backlog: Mutex::new(Some(backlog)),
            stop_tx,
            worker: Mutex::new(None),
            next_id: AtomicU64::new(last_id),
        }
    }

    /// Highest numeric id issued so far; persisted across runs by the broker.
    pub fn counter(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn submitter(&self) -> RequestSubmitter {
        RequestSubmitter {
            inner: self.submit.clone(),
        }
    }

    pub fn register_session(&self, client_id: &str, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(client_id.to_string(), handle);
        info!("session registered with the transaction queue: {client_id}");
    }

    pub fn unregister_session(&self, client_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.remove(client_id).is_none() {
            warn!("unregister for unknown session: {client_id}");
        } else {
            info!("session unregistered from the transaction queue: {client_id}");
        }
    }

    pub fn add_request(&self, request: TransactionRequest) {
        debug!(
            "request queued: client={} type={} qty={:.10}",
            request.client_id,
            request.tx_type.as_str(),
            request.quantity
        );
        if self.submit.send(request).is_err() {
            error!("request dropped: transaction queue worker has stopped");
        }
    }

    /// Start the single worker. The queue runs once per process: after
    /// `stop()` it cannot be started again.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!("transaction queue already running");
            return;
        }
        let Some(mut backlog) = self.backlog.lock().unwrap().take() else {
            warn!("transaction queue cannot be restarted after stop");
            return;
        };

        let queue = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        *worker = Some(tokio::spawn(async move {
            info!("transaction worker started");
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    request = backlog.recv() => match request {
                        Some(request) => queue.process(request),
                        None => break,
                    },
                }
            }
            // Whatever is still queued at this point is discarded with the
            // receiver.
            info!("transaction worker stopped");
        }));
    }

    /// Signal the worker and wait for it to finish the request in flight.
    /// Idempotent; queued but unprocessed requests are discarded.
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
            error!("transaction worker terminated abnormally");
        }
    }

    fn next_transaction_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("TX{n}")
    }

    /// Execute one request start to finish. Wallet validation, mutation, and
    /// persistence all happen under the wallet lock; the audit row and the
    /// session notification happen after it is released.
    fn process(&self, request: TransactionRequest) {
        let id = self.next_transaction_id();
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();

        let handle = self.sessions.lock().unwrap().get(&request.client_id).cloned();
        let Some(handle) = handle else {
            warn!(
                "no session registered for {}; transaction {id} failed",
                request.client_id
            );
            let tx = Transaction::failed(id, &request, 0.0, timestamp, "session unavailable");
            self.finalise(tx, None);
            return;
        };

        // Rapid-fail on a dead market before taking the wallet lock. The
        // price that counts is re-read under the lock below.
        let advisory = self.feed.get_price(&request.asset);
        if !(advisory > 0.0 && advisory.is_finite()) {
            let tx = Transaction::failed(id, &request, 0.0, timestamp, "invalid market price");
            self.finalise(tx, Some(&handle));
            return;
        }

        let tx = handle.wallet.with_state(|state| {
            let unit_price = self.feed.get_price(&request.asset);
            if !(unit_price > 0.0 && unit_price.is_finite()) {
                return Transaction::failed(id, &request, 0.0, timestamp, "invalid market price");
            }
            if !(request.quantity > 0.0 && request.quantity.is_finite()) {
                return Transaction::failed(id, &request, unit_price, timestamp, "zero quantity");
            }

            match request.tx_type {
                TransactionType::Buy => {
                    let cost = request.quantity * unit_price;
                    let fee = cost * FEE_RATE;
                    let total = cost + fee;
                    if total > state.balance(Currency::Usd) + BALANCE_EPSILON {
                        return Transaction::failed(
                            id,
                            &request,
                            unit_price,
                            timestamp,
                            "insufficient USD funds",
                        );
                    }
                    state.debit(Currency::Usd, total);
                    state.credit(Currency::SrdBtc, request.quantity);
                    let tx = Transaction::completed(id, &request, unit_price, total, fee, timestamp);
                    state.history.push(tx.clone());
                    if let Err(e) = handle.wallet.write_snapshot(state) {
                        error!(
                            "wallet save failed for {} after {}: {e}",
                            request.client_id, tx.id
                        );
                    }
                    tx
                }
                TransactionType::Sell => {
                    let gross = request.quantity * unit_price;
                    let fee = gross * FEE_RATE;
                    let total = gross - fee;
                    if request.quantity > state.balance(Currency::SrdBtc) + BALANCE_EPSILON {
                        return Transaction::failed(
                            id,
                            &request,
                            unit_price,
                            timestamp,
                            "insufficient SRD-BTC funds",
                        );
                    }
                    state.debit(Currency::SrdBtc, request.quantity);
                    state.credit(Currency::Usd, total);
                    let tx = Transaction::completed(id, &request, unit_price, total, fee, timestamp);
                    state.history.push(tx.clone());
                    if let Err(e) = handle.wallet.write_snapshot(state) {
                        error!(
                            "wallet save failed for {} after {}: {e}",
                            request.client_id, tx.id
                        );
                    }
                    tx
                }
            }
        });

        self.finalise(tx, Some(&handle));
    }

    /// Audit then notify, in that order, with no lock held.
    fn finalise(&self, tx: Transaction, handle: Option<&SessionHandle>) {
        if let Err(e) = self.audit.append(&tx) {
            error!("audit log append failed for {}: {e}", tx.id);
        }
        info!(
            "transaction {} finalised for {}: {}{}",
            tx.id,
            tx.client_id,
            tx.status.as_str(),
            if tx.failure_reason.is_empty() {
                String::new()
            } else {
                format!(" ({})", tx.failure_reason)
            }
        );
        if let Some(handle) = handle {
            if handle.notify.send(tx).is_err() {
                warn!("session dropped before its transaction result could be delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{
        buy_quantity, SessionHandle, Transaction, TransactionQueue, TransactionRequest,
        TransactionStatus, TransactionType, FEE_RATE,
    };
    use crate::exec::audit::AuditLog;
    use crate::feed::{PriceFeed, DEFAULT_ASSET};
    use crate::wallet::{Currency, Wallet};

    fn request(client_id: &str, tx_type: TransactionType, quantity: f64) -> TransactionRequest {
        TransactionRequest {
            client_id: client_id.to_string(),
            tx_type,
            asset: DEFAULT_ASSET.to_string(),
            quantity,
        }
    }

    struct Fixture {
        queue: Arc<TransactionQueue>,
        wallet: Arc<Wallet>,
        results: mpsc::UnboundedReceiver<Transaction>,
        _dir: tempfile::TempDir,
    }

    fn setup(price: f64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(PriceFeed::new(Duration::from_secs(15), None));
        feed.publish(price);
        let audit = AuditLog::new(dir.path().join("transactions.csv"));
        let queue = Arc::new(TransactionQueue::new(Arc::clone(&feed), audit, 0));
        let wallet = Arc::new(Wallet::open("ada", dir.path()).unwrap());
        let (notify, results) = mpsc::unbounded_channel();
        queue.register_session(
            "ada",
            SessionHandle {
                wallet: Arc::clone(&wallet),
                notify,
            },
        );
        queue.start();
        Fixture {
            queue,
            wallet,
            results,
            _dir: dir,
        }
    }

    async fn next_result(fixture: &mut Fixture) -> Transaction {
        tokio::time::timeout(Duration::from_secs(5), fixture.results.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_that_buy_moves_both_legs_net_of_fee() {
        let mut fixture = setup(100.0);
        let qty = buy_quantity(5000.0, 100.0);
        fixture.queue.add_request(request("ada", TransactionType::Buy, qty));

        let tx = next_result(&mut fixture).await;
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.unit_price, 100.0);
        assert!((tx.quantity * tx.unit_price + tx.fee - 5000.0).abs() < 1e-6);
        assert!((fixture.wallet.get_balance(Currency::Usd) - 5000.0).abs() < 1e-6);
        assert!((fixture.wallet.get_balance(Currency::SrdBtc) - qty).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_that_full_round_trip_costs_two_fees() {
        let mut fixture = setup(100.0);
        let qty = buy_quantity(5000.0, 100.0);
        fixture.queue.add_request(request("ada", TransactionType::Buy, qty));
        let buy = next_result(&mut fixture).await;
        assert_eq!(buy.status, TransactionStatus::Completed);

        let held = fixture.wallet.get_balance(Currency::SrdBtc);
        fixture.queue.add_request(request("ada", TransactionType::Sell, held));
        let sell = next_result(&mut fixture).await;

        assert_eq!(sell.status, TransactionStatus::Completed);
        assert_eq!(fixture.wallet.get_balance(Currency::SrdBtc), 0.0);
        let usd = fixture.wallet.get_balance(Currency::Usd);
        assert!(usd < 10_000.0);
        assert!((usd - (10_000.0 - buy.fee - sell.fee)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_that_insufficient_usd_fails_without_mutation() {
        let mut fixture = setup(1000.0);
        fixture.queue.add_request(request("ada", TransactionType::Buy, 1_000.0));

        let tx = next_result(&mut fixture).await;
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.failure_reason.contains("insufficient USD"));
        assert_eq!(fixture.wallet.get_balance(Currency::Usd), 10_000.0);
        assert_eq!(fixture.wallet.get_balance(Currency::SrdBtc), 0.0);
        assert!(fixture.wallet.history().is_empty());
    }

    #[tokio::test]
    async fn test_that_second_full_sell_fails_and_first_drains_to_zero() {
        let mut fixture = setup(100.0);
        let qty = buy_quantity(5000.0, 100.0);
        fixture.queue.add_request(request("ada", TransactionType::Buy, qty));
        next_result(&mut fixture).await;

        // Both sells sized off the same pre-trade balance, as two racing
        // submitters would.
        let held = fixture.wallet.get_balance(Currency::SrdBtc);
        fixture.queue.add_request(request("ada", TransactionType::Sell, held));
        fixture.queue.add_request(request("ada", TransactionType::Sell, held));

        let first = next_result(&mut fixture).await;
        let second = next_result(&mut fixture).await;
        assert_eq!(first.status, TransactionStatus::Completed);
        assert_eq!(fixture.wallet.get_balance(Currency::SrdBtc), 0.0);
        assert_eq!(second.status, TransactionStatus::Failed);
        assert!(second.failure_reason.contains("insufficient SRD-BTC"));
    }

    #[tokio::test]
    async fn test_that_invalid_price_fails_without_mutation() {
        let mut fixture = setup(100.0);
        // get_price returns 0.0 for an asset the feed does not publish.
        fixture.queue.add_request(TransactionRequest {
            client_id: "ada".to_string(),
            tx_type: TransactionType::Buy,
            asset: "DOGE".to_string(),
            quantity: 1.0,
        });

        let tx = next_result(&mut fixture).await;
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure_reason, "invalid market price");
        assert_eq!(fixture.wallet.get_balance(Currency::Usd), 10_000.0);
    }

    #[tokio::test]
    async fn test_that_zero_quantity_fails_explicitly() {
        let mut fixture = setup(100.0);
        fixture.queue.add_request(request("ada", TransactionType::Sell, 0.0));

        let tx = next_result(&mut fixture).await;
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure_reason, "zero quantity");
    }

    #[tokio::test]
    async fn test_that_ids_are_unique_and_monotonic_per_submission_order() {
        let mut fixture = setup(100.0);
        for _ in 0..3 {
            fixture.queue.add_request(request("ada", TransactionType::Buy, 1.0));
        }

        let mut previous = 0u64;
        for _ in 0..3 {
            let tx = next_result(&mut fixture).await;
            let n: u64 = tx.id.trim_start_matches("TX").parse().unwrap();
            assert!(n > previous);
            previous = n;
        }
        assert_eq!(fixture.queue.counter(), 3);
    }

    #[tokio::test]
    async fn test_that_unknown_client_fails_without_notification() {
        let mut fixture = setup(100.0);
        fixture.queue.add_request(request("ghost", TransactionType::Buy, 1.0));
        fixture.queue.add_request(request("ada", TransactionType::Sell, 0.0));

        // Only the known client's transaction arrives; the ghost's outcome
        // went to the audit log alone.
        let tx = next_result(&mut fixture).await;
        assert_eq!(tx.client_id, "ada");
        assert_eq!(tx.id, "TX2");
    }

    #[tokio::test]
    async fn test_that_stop_is_idempotent() {
        let fixture = setup(100.0);
        fixture.queue.stop().await;
        fixture.queue.stop().await;
    }

    #[test]
    fn test_that_buy_quantity_accounts_for_fee() {
        let qty = buy_quantity(5000.0, 100.0);
        let total = qty * 100.0 * (1.0 + FEE_RATE);
        assert!((total - 5000.0).abs() < 1e-9);
    }

    #[test]
    fn test_that_wallet_line_round_trips() {
        let tx = Transaction {
            id: "TX9".to_string(),
            client_id: "ada".to_string(),
            tx_type: TransactionType::Sell,
            asset: DEFAULT_ASSET.to_string(),
            quantity: 1.5,
            unit_price: 99.25,
            total_amount: 148.86,
            fee: 0.0148,
            timestamp: 1_700_000_000,
            status: TransactionStatus::Completed,
            failure_reason: String::new(),
        };
        let parsed = Transaction::from_wallet_line(&tx.to_wallet_line()).unwrap();
        assert_eq!(parsed.id, tx.id);
        assert_eq!(parsed.tx_type, tx.tx_type);
        assert_eq!(parsed.status, tx.status);
        assert!((parsed.quantity - tx.quantity).abs() < 1e-10);
        assert!((parsed.unit_price - tx.unit_price).abs() < 1e-10);
    }

    #[test]
    fn test_that_pending_on_disk_is_recovered_as_failed() {
        let line = "TRANSACTION TX4 ada BUY SRD-BTC 1.0 100.0 100.01 0.01 1700000000 PENDING";
        let parsed = Transaction::from_wallet_line(line).unwrap();
        assert_eq!(parsed.status, TransactionStatus::Failed);
        assert!(!parsed.failure_reason.is_empty());
    }
}
