//! Prewarmed backend session pool
//!
//! A bounded FIFO of single-use backend sessions. Staleness is detected
//! lazily on borrow (age, then a ping), never in the background; every
//! borrow kicks off an asynchronous refill so the pool drifts back toward
//! its target size.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendConn, BackendConnector};
use crate::error::{compact_err, ProxyError, Result};

const DEFAULT_REFILL_TIMEOUT: Duration = Duration::from_secs(8);

/// A pooled session and when it was established.
struct PooledBackend {
    conn: BackendConn,
    created_at: Instant,
}

pub struct BackendPool {
    slots_tx: mpsc::Sender<PooledBackend>,
    slots_rx: Mutex<mpsc::Receiver<PooledBackend>>,
    size: usize,
    max_age: Duration,
    refill_timeout: Duration,
    factory: Arc<dyn BackendConnector>,
    /// Cancels in-flight refills when the pool closes.
    refill_cancel: CancellationToken,
    closed: RwLock<bool>,
}

impl BackendPool {
    pub fn new(
        size: usize,
        max_age: Duration,
        refill_timeout: Duration,
        factory: Arc<dyn BackendConnector>,
    ) -> Self {
        let size = size.max(1);
        let refill_timeout = if refill_timeout.is_zero() {
            DEFAULT_REFILL_TIMEOUT
        } else {
            refill_timeout
        };
        let (slots_tx, slots_rx) = mpsc::channel(size);
        Self {
            slots_tx,
            slots_rx: Mutex::new(slots_rx),
            size,
            max_age,
            refill_timeout,
            factory,
            refill_cancel: CancellationToken::new(),
            closed: RwLock::new(false),
        }
    }

    /// Kick off one refill task per slot.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.size {
            self.spawn_refill();
        }
    }

    fn spawn_refill(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.fill_one().await });
    }

    async fn fill_one(self: Arc<Self>) {
        if *self.closed.read() {
            return;
        }

        // Cancellation and timeout both land in the error arm below, so a
        // prewarm cut short by close() still logs its failure.
        let result = tokio::select! {
            _ = self.refill_cancel.cancelled() => Err(ProxyError::Canceled),
            res = timeout(self.refill_timeout, self.factory.new_conn()) => match res {
                Ok(res) => res,
                Err(_) => Err(ProxyError::Timeout(format!(
                    "prewarm gave up after {:?}",
                    self.refill_timeout
                ))),
            },
        };
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                warn!(reason = %compact_err(&e), "pool prewarm failed");
                return;
            }
        };

        let item = PooledBackend {
            conn,
            created_at: Instant::now(),
        };
        if let Err(rejected) = self.slots_tx.try_send(item) {
            // FIFO full (or pool closed): the session has no slot to live in.
            let mut item = rejected.into_inner();
            item.conn.shutdown().await;
        }
    }

    /// Take a usable session, preferring the FIFO, falling back to a direct
    /// factory call when it is empty.
    ///
    /// Stale sessions found along the way are closed, replaced by a refill
    /// task, and summarized in at most one info log line per call.
    pub async fn borrow(self: &Arc<Self>, cancel: &CancellationToken) -> Result<BackendConn> {
        let mut stale_discarded = 0u32;
        let mut last_reason = String::new();

        loop {
            if cancel.is_cancelled() {
                log_stale_summary(stale_discarded, &last_reason);
                return Err(ProxyError::Canceled);
            }

            let next = self.slots_rx.lock().try_recv();
            let mut pooled = match next {
                Ok(pooled) => pooled,
                Err(_) => {
                    // Empty FIFO: synchronous slow path under the caller's
                    // cancellation scope, no refill timeout.
                    log_stale_summary(stale_discarded, &last_reason);
                    return tokio::select! {
                        _ = cancel.cancelled() => Err(ProxyError::Canceled),
                        res = self.factory.new_conn() => res,
                    };
                }
            };

            if pooled.created_at.elapsed() > self.max_age {
                pooled.conn.shutdown().await;
                self.spawn_refill();
                continue;
            }

            if let Err(e) = pooled.conn.ping().await {
                let reason = compact_err(&e);
                stale_discarded += 1;
                debug!(reason = %reason, "discarding stale pooled connection");
                last_reason = reason;
                pooled.conn.shutdown().await;
                self.spawn_refill();
                continue;
            }

            // Backfill the slot this borrow consumes.
            self.spawn_refill();
            log_stale_summary(stale_discarded, &last_reason);
            return Ok(pooled.conn);
        }
    }

    /// Mark closed, cancel refills, and drop every idle session. Idempotent.
    pub fn close(&self) {
        {
            let mut closed = self.closed.write();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.refill_cancel.cancel();

        let mut rx = self.slots_rx.lock();
        while let Ok(pooled) = rx.try_recv() {
            drop(pooled);
        }
    }
}

fn log_stale_summary(discarded: u32, last_reason: &str) {
    if discarded > 0 {
        info!(
            discarded,
            last_reason = %last_reason,
            "refreshed stale pooled connections"
        );
    }
}
