//! Per-source admission control for crawl jobs.
//!
//! A job may start only when its source has a free concurrency slot, the
//! process-wide cap has a free slot, and the source's token bucket yields a
//! token. Tokens are spaced `1/qps` apart, or `1/floor(qps)` apart once the
//! rate reaches one per second, so no one-second window sees more than
//! `qps_limit` fetches for a source. Every fetch a job makes draws a token
//! through its [`AdmissionPermit`]; the first one is prepaid by admission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::AppError;
use crate::models::{MIN_QPS, Source};

/// Token spacing for a rate. Whole tokens per second from 1 qps up.
fn spacing(qps: f64) -> Duration {
    if !(qps > 0.0 && qps.is_finite()) {
        return Duration::ZERO;
    }
    let rate = if qps >= 1.0 { qps.floor() } else { qps.max(MIN_QPS) };
    Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::from_secs((1.0 / MIN_QPS) as u64))
}

/// Evenly spaced tokens at a fixed rate. Tokens replenish by time only.
#[derive(Debug)]
pub struct TokenBucket {
    interval: Duration,
    next_free: tokio::sync::Mutex<Instant>,
}

impl TokenBucket {
    pub fn new(qps: f64) -> Self {
        Self {
            interval: spacing(qps),
            next_free: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next free slot and sleep until it arrives.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_free.lock().await;
            let now = Instant::now();
            let slot = std::cmp::max(*next, now);
            *next = slot.checked_add(self.interval).unwrap_or(slot);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Concurrency slots and rate for one source.
#[derive(Debug)]
struct SourceGate {
    slots: Arc<Semaphore>,
    limit: usize,
    bucket: Arc<TokenBucket>,
}

/// Reservation in the pending queue. Released on drop.
#[derive(Debug)]
pub struct PendingSlot {
    pending: Arc<AtomicUsize>,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Grants a running job its slots. Dropping it releases them.
#[derive(Debug)]
pub struct AdmissionPermit {
    _source_slot: OwnedSemaphorePermit,
    _global_slot: OwnedSemaphorePermit,
    bucket: Arc<TokenBucket>,
    prepaid: bool,
}

impl AdmissionPermit {
    /// Wait for the next fetch token.
    pub async fn pace(&mut self) {
        if self.prepaid {
            self.prepaid = false;
            return;
        }
        self.bucket.acquire().await;
    }
}

/// Shared admission state. Clones share the same slots and buckets.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    global: Arc<Semaphore>,
    gates: Arc<Mutex<HashMap<String, Arc<SourceGate>>>>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    qps_override: Option<f64>,
}

impl AdmissionController {
    pub fn new(global_concurrency: usize, max_pending: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            gates: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
            qps_override: None,
        }
    }

    /// Cap every source's rate at `qps` (the lower of the two wins).
    pub fn with_qps_override(mut self, qps: Option<f64>) -> Self {
        self.qps_override = qps.filter(|q| *q >= MIN_QPS && q.is_finite());
        self
    }

    /// Number of jobs waiting for admission.
    pub fn pending_depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of admitted jobs currently holding a slot of `source_id`.
    pub fn active(&self, source_id: &str) -> usize {
        let gates = match self.gates.lock() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates
            .get(source_id)
            .map(|g| g.limit - g.slots.available_permits())
            .unwrap_or(0)
    }

    /// Claim a place in the pending queue, failing fast when it is full.
    pub fn reserve(&self, source_id: &str) -> Result<PendingSlot, AppError> {
        let depth = self.pending.fetch_add(1, Ordering::SeqCst);
        if depth >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::QueueSaturated {
                source_id: source_id.to_string(),
                depth,
            });
        }
        Ok(PendingSlot {
            pending: self.pending.clone(),
        })
    }

    /// Suspend until `source` may run a job. Waiters are served FIFO.
    pub async fn admit(
        &self,
        source: &Source,
        slot: PendingSlot,
    ) -> Result<AdmissionPermit, AppError> {
        let gate = self.gate_for(source);

        let source_slot = gate
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Cancelled)?;
        let global_slot = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Cancelled)?;
        gate.bucket.acquire().await;
        drop(slot);

        debug!(source_id = %source.source_id, "Job admitted");
        Ok(AdmissionPermit {
            _source_slot: source_slot,
            _global_slot: global_slot,
            bucket: gate.bucket.clone(),
            prepaid: true,
        })
    }

    fn gate_for(&self, source: &Source) -> Arc<SourceGate> {
        let mut gates = match self.gates.lock() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates
            .entry(source.source_id.clone())
            .or_insert_with(|| {
                let qps = match self.qps_override {
                    Some(cap) => cap.min(source.qps_limit),
                    None => source.qps_limit,
                };
                let limit = source.concurrency_limit.max(1) as usize;
                Arc::new(SourceGate {
                    slots: Arc::new(Semaphore::new(limit)),
                    limit,
                    bucket: Arc::new(TokenBucket::new(qps)),
                })
            })
            .clone()
    }
}
