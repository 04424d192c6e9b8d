//! Append-only CSV of every finalised transaction in the process.

use std::fs::OpenOptions;
use std::path::PathBuf;

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::exec::Transaction;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> AuditLog {
        AuditLog { path }
    }

    /// Append one row, writing the header first if the file is new or empty.
    /// The file is opened per call so a crash never leaves a writer with
    /// buffered rows.
    pub fn append(&self, tx: &Transaction) -> Result<(), csv::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer.write_record([
                "ID",
                "ClientID",
                "Type",
                "Asset",
                "Qty",
                "UnitPrice",
                "Total",
                "Fee",
                "Timestamp",
                "Status",
                "Reason",
            ])?;
        }

        let timestamp = OffsetDateTime::from_unix_timestamp(tx.timestamp)
            .ok()
            .and_then(|t| t.format(TIMESTAMP_FORMAT).ok())
            .unwrap_or_else(|| tx.timestamp.to_string());
        let quantity = format!("{:.10}", tx.quantity);
        let unit_price = format!("{:.10}", tx.unit_price);
        let total = format!("{:.10}", tx.total_amount);
        let fee = format!("{:.10}", tx.fee);

        writer.write_record([
            tx.id.as_str(),
            tx.client_id.as_str(),
            tx.tx_type.as_str(),
            tx.asset.as_str(),
            quantity.as_str(),
            unit_price.as_str(),
            total.as_str(),
            fee.as_str(),
            timestamp.as_str(),
            tx.status.as_str(),
            tx.failure_reason.as_str(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}
