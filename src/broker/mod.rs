//! Process-level assembly. The broker owns the price feed, the execution
//! queue, and the registry of live sessions; it authenticates fresh
//! connections, enforces one session per client, and tears everything down
//! in order on shutdown.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::broker::auth::{AuthOutcome, PasswordScheme, Sha3Scheme};
use crate::broker::users::UserStore;
use crate::config::BrokerConfig;
use crate::exec::audit::AuditLog;
use crate::exec::{SessionHandle, TransactionQueue};
use crate::feed::source::{CoinGeckoSource, SyntheticSource};
use crate::feed::PriceFeed;
use crate::session::transport::{StreamTransport, Transport};
use crate::session::{Session, SessionConfig};
use crate::wallet::Wallet;

pub mod auth;
pub mod users;

#[derive(Debug)]
pub enum BrokerError {
    Io(io::Error),
    Users(serde_json::Error),
}

impl std::error::Error for BrokerError {}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "io error: {e}"),
            BrokerError::Users(e) => write!(f, "user store error: {e}"),
        }
    }
}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Users(e)
    }
}

struct SessionSlot {
    task: JoinHandle<()>,
}

pub struct Broker {
    config: BrokerConfig,
    feed: Arc<PriceFeed>,
    queue: Arc<TransactionQueue>,
    sessions: DashMap<String, SessionSlot>,
    // Serialises connection attachment so a duplicate check and its insert
    // cannot interleave with another connection for the same client.
    attach_lock: tokio::sync::Mutex<()>,
    users: Mutex<UserStore>,
    scheme: Box<dyn PasswordScheme>,
    shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Arc<Broker>, BrokerError> {
        fs::create_dir_all(&config.data_dir)?;
        let last_id = load_counter(&config.counter_path());
        let feed = Arc::new(PriceFeed::new(config.price_interval, config.price_log_path()));
        let audit = AuditLog::new(config.audit_path());
        let queue = Arc::new(TransactionQueue::new(Arc::clone(&feed), audit, last_id));
        let users = UserStore::load(config.users_path())?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Broker {
            config,
            feed,
            queue,
            sessions: DashMap::new(),
            attach_lock: tokio::sync::Mutex::new(()),
            users: Mutex::new(users),
            scheme: Box::new(Sha3Scheme),
            shutdown_tx,
        }))
    }

    pub fn feed(&self) -> &Arc<PriceFeed> {
        &self.feed
    }

    pub fn queue(&self) -> &Arc<TransactionQueue> {
        &self.queue
    }

    /// Start the process-lifetime services: the execution worker and the
    /// price refresher.
    pub fn start(&self) {
        self.queue.start();
        if self.config.live_prices {
            self.feed.start(CoinGeckoSource::new());
        } else {
            self.feed.start(SyntheticSource::new(self.config.starting_quote));
        }
    }

    /// Accept connections until shutdown is signalled. Each connection gets
    /// its own task for the handshake and session.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("accepting connections on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {peer}");
                        let broker = Arc::clone(&self);
                        tokio::spawn(async move {
                            broker.handle_connection(StreamTransport::new(stream)).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("accept loop stopped");
        Ok(())
    }

    /// Authenticate one fresh connection and, if it holds up, attach a
    /// session to it.
    pub async fn handle_connection<T: Transport + 'static>(self: Arc<Self>, mut transport: T) {
        let Some((client_id, outcome)) =
            auth::authenticate(&mut transport, &self.users, self.scheme.as_ref()).await
        else {
            return;
        };
        self.attach_session(client_id, outcome, transport).await;
    }

    async fn attach_session<T: Transport + 'static>(
        self: Arc<Self>,
        client_id: String,
        outcome: AuthOutcome,
        mut transport: T,
    ) {
        let _guard = self.attach_lock.lock().await;

        let live = self
            .sessions
            .get(&client_id)
            .map(|slot| !slot.task.is_finished())
            .unwrap_or(false);
        if live {
            warn!("rejecting duplicate connection for {client_id}");
            let _ = transport
                .write_line("AUTH FAIL: Already connected with this ID.")
                .await;
            transport.close().await;
            return;
        }
        self.sessions.remove(&client_id);

        let wallet = match Wallet::open(&client_id, &self.config.wallets_dir()) {
            Ok(wallet) => Arc::new(wallet),
            Err(e) => {
                error!("wallet unavailable for {client_id}: {e}");
                let _ = transport
                    .write_line("AUTH FAIL: Server internal error after successful authentication.")
                    .await;
                transport.close().await;
                return;
            }
        };

        if transport
            .write_line(&format!("AUTH {}", outcome.as_str()))
            .await
            .is_err()
        {
            warn!("client vanished before its session could start: {client_id}");
            return;
        }

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        self.queue.register_session(
            &client_id,
            SessionHandle {
                wallet: Arc::clone(&wallet),
                notify: notify_tx,
            },
        );
        let session = Session::new(
            &client_id,
            transport,
            wallet,
            Arc::clone(&self.feed),
            Arc::clone(&self.queue),
            notify_rx,
            self.shutdown_tx.subscribe(),
            SessionConfig {
                bot_interval: self.config.bot_interval,
                bot_spend_fraction: self.config.bot_spend_fraction,
            },
        );
        let task = tokio::spawn(session.run());
        self.sessions.insert(client_id, SessionSlot { task });
    }

    /// Stop everything in dependency order: sessions first, then the queue,
    /// then the feed, then the persisted counters.
    pub async fn shutdown(&self) {
        info!("broker shutting down");
        let _ = self.shutdown_tx.send(true);

        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, slot)) = self.sessions.remove(&id) {
                if slot.task.await.is_err() {
                    error!("session task for {id} terminated abnormally");
                }
            }
        }

        self.queue.stop().await;
        self.feed.stop().await;

        if let Err(e) = fs::write(self.config.counter_path(), self.queue.counter().to_string()) {
            error!("transaction counter save failed: {e}");
        }
        let users = self.users.lock().unwrap();
        if let Err(e) = users.save() {
            error!("user store save failed: {e}");
        }
        info!("broker stopped");
    }
}

fn load_counter(path: &Path) -> u64 {
    match fs::read_to_string(path) {
        Ok(contents) => match contents.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("unreadable transaction counter in {}; starting from 0", path.display());
                0
            }
        },
        Err(_) => 0,
    }
}
