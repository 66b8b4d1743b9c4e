use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use crate::store::{BillingSnapshotUpsert, BreakerPersist, RequestLogInsert, Store};

#[derive(Debug, Clone)]
pub struct StorageBusConfig {
    pub request_log_capacity: usize,
    pub snapshot_capacity: usize,
    pub breaker_capacity: usize,
    pub request_log_batch_size: usize,
    pub flush_interval: Duration,
    pub retry_delay: Duration,
    /// Give up after this many write retries; losing a log row beats wedging
    /// the writer forever on a poisoned batch.
    pub max_write_attempts: u32,
}

impl Default for StorageBusConfig {
    fn default() -> Self {
        Self {
            request_log_capacity: 16_384,
            snapshot_capacity: 16_384,
            breaker_capacity: 1024,
            request_log_batch_size: 100,
            flush_interval: Duration::from_millis(200),
            retry_delay: Duration::from_millis(200),
            max_write_attempts: 5,
        }
    }
}

/// Async write path for the request plane: request logs batch, billing
/// snapshots upsert one-by-one (their idempotence key does the dedup), and
/// breaker transitions persist as they happen.
pub struct StorageBus {
    pub request_log_tx: mpsc::Sender<RequestLogInsert>,
    pub snapshot_tx: mpsc::Sender<BillingSnapshotUpsert>,
    pub breaker_tx: mpsc::Sender<BreakerPersist>,
    _handles: Vec<JoinHandle<()>>,
}

impl StorageBus {
    pub fn spawn(store: Store, config: StorageBusConfig) -> Self {
        let (request_log_tx, request_log_rx) = mpsc::channel(config.request_log_capacity);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(config.snapshot_capacity);
        let (breaker_tx, breaker_rx) = mpsc::channel(config.breaker_capacity);

        let mut handles = Vec::new();
        handles.push(tokio::spawn(request_log_writer(
            store.clone(),
            request_log_rx,
            config.clone(),
        )));
        handles.push(tokio::spawn(snapshot_writer(
            store.clone(),
            snapshot_rx,
            config.clone(),
        )));
        handles.push(tokio::spawn(breaker_writer(store, breaker_rx, config)));

        Self {
            request_log_tx,
            snapshot_tx,
            breaker_tx,
            _handles: handles,
        }
    }
}

async fn request_log_writer(
    store: Store,
    mut rx: mpsc::Receiver<RequestLogInsert>,
    config: StorageBusConfig,
) {
    let mut buffer: Vec<RequestLogInsert> = Vec::with_capacity(config.request_log_batch_size);
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(log) = received else {
                    flush_request_logs(&store, &mut buffer, &config).await;
                    break;
                };
                buffer.push(log);
                if buffer.len() >= config.request_log_batch_size {
                    flush_request_logs(&store, &mut buffer, &config).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_request_logs(&store, &mut buffer, &config).await;
                }
            }
        }
    }
}

async fn flush_request_logs(
    store: &Store,
    buffer: &mut Vec<RequestLogInsert>,
    config: &StorageBusConfig,
) {
    let batch = std::mem::take(buffer);
    if batch.is_empty() {
        return;
    }

    for attempt in 1..=config.max_write_attempts {
        match store.insert_request_logs(batch.clone()).await {
            Ok(()) => return,
            Err(err) => {
                eprintln!("request log write failed (attempt {attempt}): {err}");
                tokio_time::sleep(config.retry_delay).await;
            }
        }
    }
    eprintln!("dropping {} request log rows after repeated write failures", batch.len());
}

async fn snapshot_writer(
    store: Store,
    mut rx: mpsc::Receiver<BillingSnapshotUpsert>,
    config: StorageBusConfig,
) {
    while let Some(snapshot) = rx.recv().await {
        for attempt in 1..=config.max_write_attempts {
            match store.upsert_billing_snapshot(snapshot.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    eprintln!("billing snapshot write failed (attempt {attempt}): {err}");
                    tokio_time::sleep(config.retry_delay).await;
                }
            }
        }
    }
}

async fn breaker_writer(
    store: Store,
    mut rx: mpsc::Receiver<BreakerPersist>,
    config: StorageBusConfig,
) {
    while let Some(persist) = rx.recv().await {
        // Coalesce: only the newest state per upstream matters if the queue
        // backed up.
        let mut latest = persist;
        while let Ok(next) = rx.try_recv() {
            if next.upstream_id == latest.upstream_id {
                latest = next;
            } else {
                write_breaker(&store, latest, &config).await;
                latest = next;
            }
        }
        write_breaker(&store, latest, &config).await;
    }
}

async fn write_breaker(store: &Store, persist: BreakerPersist, config: &StorageBusConfig) {
    for attempt in 1..=config.max_write_attempts {
        match store.upsert_breaker_state(persist.clone()).await {
            Ok(()) => return,
            Err(err) => {
                eprintln!("breaker state write failed (attempt {attempt}): {err}");
                tokio_time::sleep(config.retry_delay).await;
            }
        }
    }
}
