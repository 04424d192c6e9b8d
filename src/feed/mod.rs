//! Live price publication. One background task refreshes the last price at a
//! fixed cadence and appends it to a bounded ring of recent samples; sessions
//! and bots read both sides without ever blocking the writer for long.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::feed::source::PriceSource;

pub mod source;

/// The only asset this feed publishes.
pub const DEFAULT_ASSET: &str = "SRD-BTC";

/// One day of samples at the 15 s refresh cadence.
pub const RING_CAPACITY: usize = 5760;

const SAMPLE_TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

struct PriceRing {
    samples: Vec<f64>,
    next: usize,
}

impl PriceRing {
    fn new() -> PriceRing {
        PriceRing {
            samples: vec![0.0; RING_CAPACITY],
            next: 0,
        }
    }

    fn push(&mut self, price: f64) {
        self.samples[self.next] = price;
        self.next = (self.next + 1) % RING_CAPACITY;
    }

    // steps == 0 is the most recently written sample.
    fn sample_back(&self, steps: usize) -> f64 {
        let index = (self.next + RING_CAPACITY - 1 - steps) % RING_CAPACITY;
        self.samples[index]
    }
}

pub struct PriceFeed {
    last: Mutex<f64>,
    ring: Mutex<PriceRing>,
    interval: Duration,
    sample_log: Option<PathBuf>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PriceFeed {
    pub fn new(interval: Duration, sample_log: Option<PathBuf>) -> PriceFeed {
        let (stop_tx, _) = watch::channel(false);
        PriceFeed {
            last: Mutex::new(0.0),
            ring: Mutex::new(PriceRing::new()),
            interval,
            sample_log,
            stop_tx,
            worker: Mutex::new(None),
        }
    }

    /// Last published price, or 0.0 for an asset this feed does not publish
    /// or before the first refresh.
    pub fn get_price(&self, asset: &str) -> f64 {
        if !asset.eq_ignore_ascii_case(DEFAULT_ASSET) {
            warn!("price requested for unsupported asset: {asset}");
            return 0.0;
        }
        *self.last.lock().unwrap()
    }

    /// The sample closest to `seconds_back` in the past, quantised to the
    /// refresh interval. Requests older than the ring holds clamp to the
    /// oldest stored sample.
    pub fn get_previous_price(&self, asset: &str, seconds_back: u64) -> f64 {
        if !asset.eq_ignore_ascii_case(DEFAULT_ASSET) {
            warn!("price history requested for unsupported asset: {asset}");
            return 0.0;
        }
        if seconds_back == 0 {
            return self.get_price(asset);
        }

        let interval = self.interval.as_secs().max(1);
        let mut steps = (seconds_back / interval) as usize;
        if steps >= RING_CAPACITY {
            warn!(
                "history of {seconds_back}s exceeds the {}s the ring holds; returning oldest sample",
                RING_CAPACITY as u64 * interval
            );
            steps = RING_CAPACITY - 1;
        }
        let ring = self.ring.lock().unwrap();
        ring.sample_back(steps)
    }

    /// Publish one sample. Non-positive or non-finite values are rejected and
    /// the previous price stays in place.
    pub fn publish(&self, price: f64) -> bool {
        if !(price > 0.0 && price.is_finite()) {
            warn!("rejecting invalid price sample: {price}");
            return false;
        }
        *self.last.lock().unwrap() = price;
        self.ring.lock().unwrap().push(price);
        true
    }

    /// Spawn the refresher. Each cycle asks `source` for a sample; a failed
    /// refresh leaves the last known good price standing.
    pub fn start(self: &Arc<Self>, source: impl PriceSource + 'static) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!("price feed already running");
            return;
        }
        let _ = self.stop_tx.send(false);

        let feed = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut source = source;
        *worker = Some(tokio::spawn(async move {
            info!("price refresher started ({}s cadence)", feed.interval.as_secs());
            loop {
                match source.fetch().await {
                    Some(sample) => {
                        if feed.publish(sample) {
                            debug!("published price sample: {sample:.10}");
                            feed.log_sample(sample);
                        }
                    }
                    None => warn!("price refresh failed; keeping last published price"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(feed.interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("price refresher stopped");
        }));
    }

    /// Signal the refresher and wait for it. Idempotent.
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
            error!("price refresher terminated abnormally");
        }
    }

    fn log_sample(&self, sample: f64) {
        let Some(path) = &self.sample_log else {
            return;
        };
        if let Err(e) = append_sample(path, sample) {
            error!("price sample log append failed: {e}");
        }
    }
}

fn append_sample(path: &Path, sample: f64) -> Result<(), csv::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let needs_header = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if needs_header {
        writer.write_record(["Timestamp", "SRD-BTC_USD"])?;
    }
    let timestamp = OffsetDateTime::now_utc()
        .format(SAMPLE_TIMESTAMP_FORMAT)
        .unwrap_or_default();
    let value = format!("{sample:.10}");
    writer.write_record([timestamp.as_str(), value.as_str()])?;
    writer.flush()?;
    Ok(())
}
