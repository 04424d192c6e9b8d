//! Per-client wallet: balances for the two supported currencies plus the
//! executed-transaction history, guarded together by one lock and persisted
//! as a line-oriented file under the broker's wallets directory.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::exec::Transaction;

/// Every client starts with this much USD and no asset.
pub const INITIAL_USD_BALANCE: f64 = 10_000.0;

// Sub-epsilon negatives produced by float arithmetic are stored as zero.
const NEGATIVE_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Currency {
    Usd,
    SrdBtc,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::SrdBtc => "SRD-BTC",
        }
    }

    pub fn parse(value: &str) -> Option<Currency> {
        match value.to_ascii_uppercase().as_str() {
            "USD" => Some(Currency::Usd),
            "SRD-BTC" => Some(Currency::SrdBtc),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Balances and history, only ever reachable through the wallet lock.
pub struct WalletState {
    pub balances: HashMap<Currency, f64>,
    pub history: Vec<Transaction>,
}

impl WalletState {
    fn fresh() -> WalletState {
        let mut balances = HashMap::new();
        balances.insert(Currency::Usd, INITIAL_USD_BALANCE);
        balances.insert(Currency::SrdBtc, 0.0);
        WalletState {
            balances,
            history: Vec::new(),
        }
    }

    pub fn balance(&self, currency: Currency) -> f64 {
        self.balances.get(&currency).copied().unwrap_or(0.0)
    }

    pub fn credit(&mut self, currency: Currency, amount: f64) {
        *self.balances.entry(currency).or_insert(0.0) += amount;
    }

    /// Subtract `amount`, clamping float dust at zero. Callers validate
    /// funds first; a materially negative result is logged and clamped
    /// rather than stored.
    pub fn debit(&mut self, currency: Currency, amount: f64) {
        let balance = self.balances.entry(currency).or_insert(0.0);
        let next = *balance - amount;
        if next < -NEGATIVE_TOLERANCE {
            error!("debit of {amount} would leave {currency} negative ({next}); clamping to zero");
        }
        *balance = if next < 0.0 { 0.0 } else { next };
    }
}

pub struct Wallet {
    client_id: String,
    path: PathBuf,
    state: Mutex<WalletState>,
}

impl Wallet {
    /// Load the client's wallet from `wallets_dir`, creating a fresh one with
    /// the initial balances (and its file) on first authentication.
    pub fn open(client_id: &str, wallets_dir: &Path) -> io::Result<Wallet> {
        fs::create_dir_all(wallets_dir)?;
        let path = wallets_dir.join(format!("{client_id}.wallet"));

        let wallet = if path.exists() {
            let state = read_wallet_file(client_id, &path)?;
            info!(
                "wallet loaded for {client_id}: USD={:.10} SRD-BTC={:.10} transactions={}",
                state.balance(Currency::Usd),
                state.balance(Currency::SrdBtc),
                state.history.len()
            );
            Wallet {
                client_id: client_id.to_string(),
                path,
                state: Mutex::new(state),
            }
        } else {
            let wallet = Wallet {
                client_id: client_id.to_string(),
                path,
                state: Mutex::new(WalletState::fresh()),
            };
            wallet.save()?;
            info!("new wallet created for {client_id}");
            wallet
        };
        Ok(wallet)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn get_balance(&self, currency: Currency) -> f64 {
        let state = self.state.lock().unwrap();
        state.balance(currency)
    }

    /// Snapshot copy of the transaction history.
    pub fn history(&self) -> Vec<Transaction> {
        let state = self.state.lock().unwrap();
        state.history.clone()
    }

    /// Run `f` while holding the wallet lock. The execution queue is the only
    /// production caller that mutates through here; `f` must leave both
    /// balances non-negative.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut WalletState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn save(&self) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        self.write_snapshot(&state)
    }

    /// Write `state` to disk. The content goes to a temporary sibling first
    /// and is renamed into place after an fsync, so the previous file stays
    /// readable through any mid-write failure.
    pub fn write_snapshot(&self, state: &WalletState) -> io::Result<()> {
        let mut contents = String::new();
        contents.push_str(&format!(
            "{} {:.10}\n",
            Currency::Usd.as_str(),
            state.balance(Currency::Usd)
        ));
        contents.push_str(&format!(
            "{} {:.10}\n",
            Currency::SrdBtc.as_str(),
            state.balance(Currency::SrdBtc)
        ));
        for tx in &state.history {
            contents.push_str(&tx.to_wallet_line());
            contents.push('\n');
        }

        let tmp = self.path.with_extension("wallet.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Parse a wallet file. Unknown or malformed lines are skipped with a
/// warning; only I/O failure is an error.
fn read_wallet_file(client_id: &str, path: &Path) -> io::Result<WalletState> {
    let contents = fs::read_to_string(path)?;
    let mut state = WalletState::fresh();
    state.balances.insert(Currency::Usd, 0.0);

    for line in contents.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("TRANSACTION") => match Transaction::from_wallet_line(line) {
                Some(tx) if tx.client_id == client_id => state.history.push(tx),
                Some(tx) => {
                    warn!(
                        "wallet for {client_id} holds transaction {} for {}; skipped",
                        tx.id, tx.client_id
                    );
                }
                None => warn!("malformed transaction line in wallet for {client_id}: '{line}'"),
            },
            Some(token) => match (Currency::parse(token), parts.next()) {
                (Some(currency), Some(raw)) => match raw.parse::<f64>() {
                    Ok(value) => {
                        let value = if value < 0.0 && value > -NEGATIVE_TOLERANCE {
                            0.0
                        } else if value < 0.0 || !value.is_finite() {
                            warn!(
                                "wallet for {client_id} holds invalid {currency} balance {raw}; reset to zero"
                            );
                            0.0
                        } else {
                            value
                        };
                        state.balances.insert(currency, value);
                    }
                    Err(_) => warn!("unreadable {currency} balance in wallet for {client_id}: '{line}'"),
                },
                _ => warn!("unexpected line in wallet for {client_id}: '{line}'"),
            },
            None => {}
        }
    }
    Ok(state)
}
