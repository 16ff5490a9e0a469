//! Worker is the bounded-concurrency pool between ingress and the
//! exporter hub.
//!
//! Ingress enqueues onto a bounded queue (a full queue blocks the
//! HTTP handler — that is the back-pressure). A single dispatcher
//! dequeues serially, takes one of `max_in_flight` permits under a
//! deadline, and hands the record to a matcher task running under a
//! second deadline. Records that cannot get a permit in time are
//! dropped; matches that blow their deadline are abandoned for the
//! runtime to reclaim. Fired records go to the exporter hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::exporter::Hub;
use crate::matcher;
use crate::prelude::*;
use crate::record::Record;
use crate::rules::StoreHandle;

/// PoolConfig sizes the worker pool.
///
/// Note that the permit wait and the match run each get a full
/// `per_record_timeout`, so a record can occupy the pipeline for up
/// to twice that before it is given up on.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Capacity of the ingress queue.
    pub queue_capacity: usize,
    /// Maximum records matched concurrently.
    pub max_in_flight: usize,
    /// Deadline for the permit wait and, separately, the match.
    pub per_record_timeout: Duration,
    #[cfg(test)]
    pub(crate) match_delay: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            queue_capacity: 1000,
            max_in_flight: 200,
            per_record_timeout: Duration::from_secs(5),
            #[cfg(test)]
            match_delay: None,
        }
    }
}

/// PoolStats counts pipeline outcomes; the same numbers are emitted
/// as metrics.
#[derive(Clone, Debug, Default)]
pub struct PoolStats(Arc<StatsInner>);

#[derive(Debug, Default)]
struct StatsInner {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    fired: AtomicU64,
}

impl PoolStats {
    /// Enqueued is the number of records accepted from ingress.
    pub fn enqueued(&self) -> u64 {
        self.0.enqueued.load(Ordering::Relaxed)
    }
    /// Dropped is the number of records dropped waiting for a permit.
    pub fn dropped(&self) -> u64 {
        self.0.dropped.load(Ordering::Relaxed)
    }
    /// Timed_out is the number of matches abandoned at the deadline.
    pub fn timed_out(&self) -> u64 {
        self.0.timed_out.load(Ordering::Relaxed)
    }
    /// Fired is the number of records a rule fired for.
    pub fn fired(&self) -> u64 {
        self.0.fired.load(Ordering::Relaxed)
    }
}

enum Item {
    Record(Record),
    Shutdown,
}

/// Pool is the handle ingress enqueues through.
#[derive(Clone)]
pub struct Pool {
    tx: mpsc::Sender<Item>,
    stats: PoolStats,
    #[cfg(test)]
    permits: Arc<Semaphore>,
}

impl Pool {
    /// Spawn starts the dispatcher and returns the enqueue handle
    /// plus the dispatcher's join handle.
    pub fn spawn(cfg: PoolConfig, rules: StoreHandle, hub: Arc<Hub>) -> (Pool, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(cfg.max_in_flight.max(1)));
        let stats = PoolStats::default();
        let task = tokio::spawn(dispatch(
            rx,
            cfg,
            rules,
            hub,
            stats.clone(),
            permits.clone(),
        ));
        (
            Pool {
                tx,
                stats,
                #[cfg(test)]
                permits,
            },
            task,
        )
    }

    /// Enqueue pushes a record onto the queue, blocking while it is
    /// full.
    pub async fn enqueue(&self, record: Record) -> Result<()> {
        let kind = record.kind().to_string();
        self.tx
            .send(Item::Record(record))
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("worker pool is shut down")))?;
        self.stats.0.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("ruler_records_total", "kind" => kind).increment(1);
        Ok(())
    }

    /// Shutdown enqueues the sentinel that stops the dispatcher once
    /// the queued records ahead of it have been handled.
    pub async fn shutdown(&self) {
        if self.tx.send(Item::Shutdown).await.is_err() {
            debug!("worker pool already shut down");
        }
    }

    /// Stats exposes the pipeline counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Item>,
    cfg: PoolConfig,
    rules: StoreHandle,
    hub: Arc<Hub>,
    stats: PoolStats,
    permits: Arc<Semaphore>,
) {
    info!("worker pool dispatcher started");
    while let Some(item) = rx.recv().await {
        let record = match item {
            Item::Shutdown => break,
            Item::Record(record) => record,
        };

        let permit = match timeout(cfg.per_record_timeout, permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => break,
            Err(_) => {
                error!(
                    id = %record.id(),
                    kind = %record.kind(),
                    "timed out waiting for a worker, dropping record"
                );
                stats.0.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("ruler_records_dropped_total").increment(1);
                continue;
            }
        };

        // The snapshot is taken once here; the whole match runs
        // against it even if the loader swaps the store mid-flight.
        let store = rules.snapshot();
        let hub = hub.clone();
        let stats = stats.clone();
        let deadline = cfg.per_record_timeout;
        #[cfg(test)]
        let match_delay = cfg.match_delay;

        tokio::spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                #[cfg(test)]
                if let Some(delay) = match_delay {
                    std::thread::sleep(delay);
                }
                let mut record = record;
                let fired = matcher::process(&mut record, &store);
                (record, fired)
            });

            match timeout(deadline, work).await {
                Err(_) => {
                    // The blocking task keeps running to completion
                    // in the background; its result is discarded.
                    drop(permit);
                    error!("match timed out, abandoning worker");
                    stats.0.timed_out.fetch_add(1, Ordering::Relaxed);
                    counter!("ruler_match_timeouts_total").increment(1);
                }
                Ok(Err(err)) => {
                    drop(permit);
                    error!(%err, "match worker failed");
                }
                Ok(Ok((record, fired))) => {
                    drop(permit);
                    if fired {
                        stats.0.fired.fetch_add(1, Ordering::Relaxed);
                        counter!("ruler_alerts_fired_total", "kind" => record.kind().to_string())
                            .increment(1);
                        hub.export(&record).await;
                    }
                }
            }
        });
    }
    info!("worker pool dispatcher stopped");
}
