use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tableflow::copy::{DestinationWriter, Page, Row, SourceReader, WatermarkFilter};
use tableflow::errors::FlowError;
use tableflow::registry::TableRef;
use tableflow::{storage, watermark};

/// In-memory source and destination with scripted failures.
///
/// Tables are keyed by `schema.table`. Every read is logged so tests can
/// check which tables were touched and in which order.
#[derive(Default)]
pub struct MemoryConnector {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    failing_reads: Mutex<HashSet<String>>,
    panicking_reads: Mutex<HashSet<String>>,
    lossy_writes: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Mutex<Duration>,
    reads: Mutex<Vec<String>>,
    probe_db: Mutex<Option<DatabaseConnection>>,
    max_running_entries: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub fn row(id: i64, modified_at: &str) -> Row {
    match json!({ "id": id, "modified_at": modified_at }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_rows(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_reads(&self, table: &str) {
        self.failing_reads.lock().unwrap().insert(table.to_string());
    }

    pub fn panic_on_read(&self, table: &str) {
        self.panicking_reads.lock().unwrap().insert(table.to_string());
    }

    /// Writes to `table` silently drop the last row of every batch
    pub fn lossy_writes(&self, table: &str) {
        self.lossy_writes.lock().unwrap().insert(table.to_string());
    }

    pub fn delay_reads(&self, table: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(table.to_string(), delay);
    }

    pub fn delay_all_reads(&self, delay: Duration) {
        *self.default_delay.lock().unwrap() = delay;
    }

    /// Sample the number of RUNNING execution entries on every read
    pub fn probe_running_entries(&self, db: DatabaseConnection) {
        *self.probe_db.lock().unwrap() = Some(db);
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    pub fn max_running_entries(&self) -> u64 {
        self.max_running_entries.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn passes(row: &Row, filter: Option<&WatermarkFilter>) -> bool {
        match filter {
            None => true,
            Some(f) => row
                .get(&f.column)
                .and_then(watermark::from_json)
                .map(|v| watermark::compare(&v, &f.after) == CmpOrdering::Greater)
                .unwrap_or(false),
        }
    }
}

#[async_trait]
impl SourceReader for MemoryConnector {
    async fn read_rows(&self, table: &TableRef, page: Page<'_>) -> Result<Vec<Row>, FlowError> {
        let key = table.to_string();
        self.reads.lock().unwrap().push(key.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let probe = self.probe_db.lock().unwrap().clone();
        if let Some(db) = probe {
            let running = storage::count_running_executions(&db)
                .await
                .expect("Failed to count running executions");
            self.max_running_entries.fetch_max(running, Ordering::SeqCst);
        }

        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(*self.default_delay.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panicking_reads.lock().unwrap().contains(&key) {
            panic!("scripted panic reading {}", key);
        }
        if self.failing_reads.lock().unwrap().contains(&key) {
            return Err(FlowError::DataTransfer(format!(
                "scripted read failure for {}",
                key
            )));
        }

        let mut rows: Vec<Row> = self
            .rows(&key)
            .into_iter()
            .filter(|row| Self::passes(row, page.filter))
            .collect();
        if let Some(column) = page.order_by {
            rows.sort_by(|a, b| {
                let a = a.get(column).and_then(watermark::from_json).unwrap_or_default();
                let b = b.get(column).and_then(watermark::from_json).unwrap_or_default();
                watermark::compare(&a, &b)
            });
        }
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn count_rows(
        &self,
        table: &TableRef,
        filter: Option<&WatermarkFilter>,
    ) -> Result<u64, FlowError> {
        Ok(self
            .rows(&table.to_string())
            .iter()
            .filter(|row| Self::passes(row, filter))
            .count() as u64)
    }
}

#[async_trait]
impl DestinationWriter for MemoryConnector {
    async fn truncate(&self, table: &TableRef) -> Result<(), FlowError> {
        self.tables.lock().unwrap().remove(&table.to_string());
        Ok(())
    }

    async fn append_rows(&self, table: &TableRef, rows: &[Row]) -> Result<u64, FlowError> {
        let key = table.to_string();
        let mut stored = rows.to_vec();
        if self.lossy_writes.lock().unwrap().contains(&key) {
            stored.pop();
        }
        self.put_rows(&key, stored);
        Ok(rows.len() as u64)
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64, FlowError> {
        Ok(self.rows(&table.to_string()).len() as u64)
    }
}
