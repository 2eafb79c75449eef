//! Batched delivery to the InfluxDB HTTP API
//!
//! Points are queued on a bounded channel and written by a background worker
//! when either the batch is full or the oldest queued point has waited for
//! the configured interval. A failed write is logged and dropped.

use async_trait::async_trait;
use log::{debug, error, info, trace};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::BatchedTransport;
use crate::config::{Credentials, HttpSettings};
use crate::error::{ForwarderError, Result};
use crate::point::EncodedPoint;

/// When queued points are flushed
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPolicy {
    /// Flush as soon as this many points are queued
    pub max_points: usize,
    /// Flush once the oldest queued point has waited this long
    pub max_wait: Duration,
    /// Points that may wait in the channel before sends are rejected
    pub queue_capacity: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_points: 200,
            max_wait: Duration::from_millis(200),
            queue_capacity: 10_000,
        }
    }
}

/// Requests the batching worker makes against the database
#[async_trait]
pub trait WriteClient: Send + Sync + 'static {
    /// Create the database unless it already exists
    async fn ensure_database(&self, database: &str) -> Result<()>;

    /// Write newline-separated line-protocol points
    async fn write(&self, database: &str, retention_policy: &str, body: String) -> Result<()>;
}

/// Builds a [`WriteClient`] for a set of connection settings
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, settings: &HttpSettings) -> Result<Arc<dyn WriteClient>>;
}

/// Connects to InfluxDB 1.x over HTTP
pub struct InfluxConnector {
    timeout: Duration,
}

impl InfluxConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for InfluxConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for InfluxConnector {
    fn connect(&self, settings: &HttpSettings) -> Result<Arc<dyn WriteClient>> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        Ok(Arc::new(InfluxHttpClient {
            client,
            base_url: settings.endpoint.http_url(),
            credentials: settings.credentials.clone(),
        }))
    }
}

/// reqwest-backed client for the `/query` and `/write` endpoints
pub struct InfluxHttpClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

async fn check_status(response: reqwest::Response, action: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(ForwarderError::Transport(format!(
        "InfluxDB {} failed with {}: {}",
        action,
        status,
        body.trim()
    )))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
impl WriteClient for InfluxHttpClient {
    async fn ensure_database(&self, database: &str) -> Result<()> {
        let query = format!("CREATE DATABASE {}", quote_identifier(database));
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .form(&[("q", query.as_str())])
            .send()
            .await?;

        check_status(response, "create database").await
    }

    async fn write(&self, database: &str, retention_policy: &str, body: String) -> Result<()> {
        let mut params = vec![("db", database), ("precision", "ms")];
        if !retention_policy.is_empty() {
            params.push(("rp", retention_policy));
        }

        let response = self
            .client
            .post(format!("{}/write", self.base_url))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .query(&params)
            .body(body)
            .send()
            .await?;

        check_status(response, "write").await
    }
}

/// A point waiting for the next flush
#[derive(Debug)]
struct QueuedPoint {
    database: String,
    retention_policy: String,
    line: String,
}

struct Worker {
    tx: mpsc::Sender<QueuedPoint>,
    task: JoinHandle<()>,
}

/// Queues points and writes them in batches from a background task
pub struct BatchedHttpTransport {
    runtime: Handle,
    policy: BatchPolicy,
    connector: Arc<dyn Connector>,
    worker: Mutex<Option<Worker>>,
    /// Replaced workers still flushing their last batch
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchedHttpTransport {
    /// Create a transport writing to InfluxDB; workers run on `runtime`
    pub fn new(runtime: Handle, policy: BatchPolicy, timeout: Duration) -> Self {
        Self::with_connector(runtime, policy, Arc::new(InfluxConnector::new(timeout)))
    }

    pub fn with_connector(runtime: Handle, policy: BatchPolicy, connector: Arc<dyn Connector>) -> Self {
        Self {
            runtime,
            policy,
            connector,
            worker: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Drop the sender of a replaced worker and keep its task for [`close`](Self::close)
    fn retire(&self, worker: Worker) {
        let Worker { tx, task } = worker;
        drop(tx);
        if let Ok(mut retired) = self.retired.lock() {
            retired.retain(|task| !task.is_finished());
            retired.push(task);
        }
    }

    /// Whether a worker is currently accepting points
    pub fn is_connected(&self) -> bool {
        self.worker.lock().map_or(false, |w| w.is_some())
    }

    /// Stop the worker and wait until it and every replaced worker have
    /// flushed what they hold
    pub async fn close(&self) {
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            self.retire(worker);
        }

        let tasks = match self.retired.lock() {
            Ok(mut retired) => std::mem::take(&mut *retired),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("HTTP flush worker failed: {}", e);
            }
        }
    }
}

impl BatchedTransport for BatchedHttpTransport {
    fn configure(&self, settings: &HttpSettings) -> Result<()> {
        let client = self.connector.connect(settings)?;
        let (tx, rx) = mpsc::channel(self.policy.queue_capacity);
        let task = self.runtime.spawn(run_worker(
            client,
            settings.database.clone(),
            rx,
            self.policy.clone(),
        ));

        let previous = self
            .worker
            .lock()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?
            .replace(Worker { tx, task });
        // The old worker flushes its batch and exits once its sender is gone
        if let Some(previous) = previous {
            self.retire(previous);
            debug!("Replaced previous HTTP flush worker");
        }

        info!(
            "HTTP transport connected to {} as {} (database {})",
            settings.endpoint, settings.credentials.username, settings.database
        );
        Ok(())
    }

    fn send(&self, point: &EncodedPoint, database: &str, retention_policy: &str) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        let worker = worker
            .as_ref()
            .ok_or_else(|| ForwarderError::Transport("HTTP transport is not connected".to_string()))?;

        let queued = QueuedPoint {
            database: database.to_string(),
            retention_policy: retention_policy.to_string(),
            line: point.to_line_protocol(),
        };

        worker.tx.try_send(queued).map_err(|e| match e {
            TrySendError::Full(_) => ForwarderError::Transport(format!(
                "HTTP queue is full ({} points), dropping point",
                self.policy.queue_capacity
            )),
            TrySendError::Closed(_) => {
                ForwarderError::Transport("HTTP flush worker has stopped".to_string())
            }
        })
    }

    fn shutdown(&self) {
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            self.retire(worker);
            info!("HTTP transport shut down");
        }
    }
}

async fn run_worker(
    client: Arc<dyn WriteClient>,
    database: String,
    mut rx: mpsc::Receiver<QueuedPoint>,
    policy: BatchPolicy,
) {
    match client.ensure_database(&database).await {
        Ok(()) => debug!("Database {} is ready", database),
        Err(e) => error!("Failed to create database {}: {}", database, e),
    }

    let mut batch: Vec<QueuedPoint> = Vec::with_capacity(policy.max_points);
    let deadline = tokio::time::sleep(policy.max_wait);
    tokio::pin!(deadline);
    let mut armed = false;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(point) => {
                    trace!("Queued point for {}: {}", point.database, point.line);
                    if batch.is_empty() {
                        deadline.as_mut().reset(Instant::now() + policy.max_wait);
                        armed = true;
                    }
                    batch.push(point);
                    if batch.len() >= policy.max_points {
                        flush(client.as_ref(), &mut batch).await;
                        armed = false;
                    }
                }
                None => {
                    flush(client.as_ref(), &mut batch).await;
                    break;
                }
            },
            _ = &mut deadline, if armed => {
                armed = false;
                flush(client.as_ref(), &mut batch).await;
            }
        }
    }

    debug!("HTTP flush worker stopped");
}

/// Write the batch, one request per database and retention policy
async fn flush(client: &dyn WriteClient, batch: &mut Vec<QueuedPoint>) {
    if batch.is_empty() {
        return;
    }

    let mut groups: Vec<(String, String, Vec<String>)> = Vec::new();
    for point in batch.drain(..) {
        match groups
            .iter_mut()
            .find(|(db, rp, _)| *db == point.database && *rp == point.retention_policy)
        {
            Some((_, _, lines)) => lines.push(point.line),
            None => groups.push((point.database, point.retention_policy, vec![point.line])),
        }
    }

    for (database, retention_policy, lines) in groups {
        let count = lines.len();
        match client.write(&database, &retention_policy, lines.join("\n")).await {
            Ok(()) => debug!("Wrote {} points to {}.{}", count, database, retention_policy),
            Err(e) => error!(
                "Failed to write {} points to {}.{}: {}",
                count, database, retention_policy, e
            ),
        }
    }
}
