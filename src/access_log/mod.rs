//! Access logging
//!
//! One [`AccessLogRecord`] per gateway request is handed to a background
//! writer over a bounded channel. Recording never blocks and never fails the
//! request: a full or closed channel drops the record with a warning, and
//! store failures are only reported to the operational log.

use crate::model::{AccessLogRecord, LogFilter};
use crate::store::{LogScope, LogStore, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Number of endpoints reported in statistics
pub const TOP_ENDPOINTS: usize = 5;

/// Minutes assumed when a statistics range is open-ended
const DEFAULT_RANGE_MINUTES: f64 = 1440.0;

enum LogMessage {
    Record(Box<AccessLogRecord>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background access log writer
#[derive(Clone)]
pub struct AccessLogger {
    tx: mpsc::Sender<LogMessage>,
    store: Arc<dyn LogStore>,
}

impl AccessLogger {
    /// Start the writer task with room for `buffer` pending records
    pub fn spawn(store: Arc<dyn LogStore>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(run_writer(store.clone(), rx));
        (Self { tx, store }, handle)
    }

    /// Queue a record for persistence
    pub fn record(&self, record: AccessLogRecord) {
        if let Err(e) = self.tx.try_send(LogMessage::Record(Box::new(record))) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Access log buffer full, dropping record")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("Access log writer stopped, dropping record")
                }
            }
        }
    }

    /// Wait until every record queued before this call has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogMessage::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Filtered retrieval, newest first
    pub async fn find_logs(&self, filter: &LogFilter) -> StoreResult<Vec<AccessLogRecord>> {
        self.store.find_logs(filter).await
    }

    /// Aggregate statistics over a scope
    pub async fn stats(&self, scope: &LogScope) -> StoreResult<LogStats> {
        let records = self.store.scan_logs(scope).await?;
        Ok(compute_stats(&records, scope.from, scope.to))
    }
}

async fn run_writer(store: Arc<dyn LogStore>, mut rx: mpsc::Receiver<LogMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            LogMessage::Record(record) => {
                if let Err(e) = store.insert_log(*record).await {
                    error!("Failed to log request: {}", e);
                }
            }
            LogMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Access log writer stopped");
}

/// Request count and latency of one endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopEndpoint {
    pub method: String,
    pub path: String,
    pub count: usize,
    pub avg_response_time: f64,
}

/// Aggregate access log statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogStats {
    pub total_requests: usize,
    /// Milliseconds
    pub average_response_time: f64,
    /// Percent of requests with status below 400
    pub success_rate: f64,
    pub requests_per_minute: f64,
    pub top_endpoints: Vec<TopEndpoint>,
    /// Counts keyed by status class (`1xx`..`5xx`)
    pub status_code_distribution: BTreeMap<String, usize>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn status_class(status: u16) -> &'static str {
    match status {
        0..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Compute statistics over records that already fall within `[from, to]`
pub fn compute_stats(
    records: &[AccessLogRecord],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> LogStats {
    if records.is_empty() {
        return LogStats::default();
    }

    let total = records.len();
    let total_time: f64 = records.iter().map(|r| r.response_time).sum();
    let successes = records.iter().filter(|r| r.status_code < 400).count();

    let minutes = match (from, to) {
        (Some(from), Some(to)) => (to - from).num_milliseconds() as f64 / 60_000.0,
        _ => DEFAULT_RANGE_MINUTES,
    };
    let requests_per_minute = if minutes > 0.0 {
        total as f64 / minutes
    } else {
        0.0
    };

    let mut endpoints: HashMap<(&str, &str), (usize, f64)> = HashMap::new();
    let mut distribution = BTreeMap::new();
    for record in records {
        let entry = endpoints
            .entry((record.method.as_str(), record.path.as_str()))
            .or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += record.response_time;

        *distribution
            .entry(status_class(record.status_code).to_string())
            .or_insert(0) += 1;
    }

    let mut top: Vec<TopEndpoint> = endpoints
        .into_iter()
        .map(|((method, path), (count, time))| TopEndpoint {
            method: method.to_string(),
            path: path.to_string(),
            count,
            avg_response_time: round2(time / count as f64),
        })
        .collect();
    top.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.method.cmp(&b.method))
    });
    top.truncate(TOP_ENDPOINTS);

    LogStats {
        total_requests: total,
        average_response_time: round2(total_time / total as f64),
        success_rate: round2(successes as f64 / total as f64 * 100.0),
        requests_per_minute: round2(requests_per_minute),
        top_endpoints: top,
        status_code_distribution: distribution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn record(method: &str, path: &str, status: u16, time: f64) -> AccessLogRecord {
        AccessLogRecord {
            method: method.to_string(),
            path: path.to_string(),
            status_code: status,
            response_time: time,
            client_ip: "127.0.0.1".to_string(),
            user_id: None,
            api_key_id: None,
            service_id: Some(1),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_stats_arithmetic() {
        let records = vec![
            record("GET", "/gateway/a", 200, 10.0),
            record("GET", "/gateway/a", 201, 20.0),
            record("GET", "/gateway/a", 429, 1.0),
            record("POST", "/gateway/b", 502, 60_000.0),
            record("GET", "/gateway/c", 301, 4.0),
        ];
        let to = Utc::now();
        let from = to - Duration::minutes(10);

        let stats = compute_stats(&records, Some(from), Some(to));
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.average_response_time, 12007.0);
        assert_eq!(stats.success_rate, 60.0);
        assert_eq!(stats.requests_per_minute, 0.5);
        assert_eq!(stats.status_code_distribution.get("2xx"), Some(&2));
        assert_eq!(stats.status_code_distribution.get("3xx"), Some(&1));
        assert_eq!(stats.status_code_distribution.get("4xx"), Some(&1));
        assert_eq!(stats.status_code_distribution.get("5xx"), Some(&1));
        assert_eq!(stats.status_code_distribution.get("1xx"), None);

        let first = &stats.top_endpoints[0];
        assert_eq!((first.method.as_str(), first.path.as_str()), ("GET", "/gateway/a"));
        assert_eq!(first.count, 3);
        assert_eq!(first.avg_response_time, 10.33);
    }

    #[test]
    fn test_open_range_uses_a_day() {
        let records: Vec<_> = (0..144)
            .map(|i| record("GET", &format!("/gateway/s{}", i), 200, 1.0))
            .collect();
        let stats = compute_stats(&records, None, None);
        assert_eq!(stats.requests_per_minute, 0.1);
        assert_eq!(stats.top_endpoints.len(), TOP_ENDPOINTS);
    }

    #[test]
    fn test_empty_stats() {
        let stats = compute_stats(&[], None, None);
        assert_eq!(stats, LogStats::default());
    }

    #[tokio::test]
    async fn test_records_are_written_in_background() {
        let store = Arc::new(MemoryStore::new());
        let (logger, _writer) = AccessLogger::spawn(store.clone(), 16);

        logger.record(record("GET", "/gateway/a", 200, 5.0));
        logger.record(record("GET", "/gateway/a", 404, 5.0));
        logger.flush().await;

        assert_eq!(store.log_count().await, 2);
        let filter = LogFilter {
            status_code: Some(404),
            ..Default::default()
        };
        let found = logger.find_logs(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_record_after_writer_stops_does_not_panic() {
        let store = Arc::new(MemoryStore::new());
        let (logger, writer) = AccessLogger::spawn(store.clone(), 1);
        writer.abort();
        let _ = writer.await;

        logger.record(record("GET", "/gateway/a", 200, 5.0));
        logger.flush().await;
        assert_eq!(store.log_count().await, 0);
    }
}
