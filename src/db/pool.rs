use r2d2::ManageConnection;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no connection became available within {0:?}")]
    Exhausted(Duration),
    #[error("failed to open a database connection: {0}")]
    Connect(String),
}

#[derive(Debug, Default)]
struct PoolStats {
    checked_out: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounded connection pool with a fair wait queue.
///
/// Callers queue on a FIFO semaphore sized like the underlying r2d2 pool, so
/// waiting is async, cancellable and first-come first-served. A permit is
/// only released once its connection is back in the r2d2 pool.
pub struct ConnectionPool<M: ManageConnection> {
    inner: r2d2::Pool<M>,
    permits: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
    stats: Arc<PoolStats>,
}

impl<M: ManageConnection> ConnectionPool<M> {
    pub fn new(manager: M, max_size: usize, acquire_timeout: Duration) -> Result<Self, r2d2::Error> {
        let max_size = max_size.max(1);
        // r2d2 rejects a zero timeout.
        let connection_timeout = acquire_timeout.max(Duration::from_millis(1));
        let inner = r2d2::Pool::builder()
            .max_size(max_size as u32)
            .min_idle(Some(0))
            .connection_timeout(connection_timeout)
            .build(manager)?;

        Ok(Self {
            inner,
            permits: Arc::new(Semaphore::new(max_size)),
            max_size,
            acquire_timeout,
            stats: Arc::new(PoolStats::default()),
        })
    }

    /// Waits at most the configured acquire timeout for a free slot and its
    /// connection, together.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed.
            Ok(Err(_)) | Err(_) => {
                warn!(
                    "Connection pool exhausted after waiting {:?} ({} in use)",
                    self.acquire_timeout,
                    self.checked_out()
                );
                return Err(PoolError::Exhausted(self.acquire_timeout));
            }
        };

        let pool = self.inner.clone();
        let remaining = self
            .acquire_timeout
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(1));
        // The permit travels with the checkout so a cancelled caller cannot
        // free its slot while r2d2 is still opening the connection.
        let (conn, permit) = tokio::task::spawn_blocking(move || {
            pool.get_timeout(remaining).map(|conn| (conn, permit))
        })
        .await
        .map_err(|e| PoolError::Connect(e.to_string()))?
        .map_err(|e| PoolError::Connect(e.to_string()))?;

        let now = self.stats.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        debug!("Checked out connection ({}/{})", now, self.max_size);

        Ok(PooledConnection {
            conn,
            _permit: permit,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Checks a connection out and back in; r2d2 validates it on checkout.
    pub async fn health_check(&self) -> Result<(), PoolError> {
        self.acquire().await.map(drop)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn checked_out(&self) -> usize {
        self.stats.checked_out.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous checkouts seen so far.
    pub fn peak_checked_out(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool
/// and wakes the next waiter.
pub struct PooledConnection<M: ManageConnection> {
    conn: r2d2::PooledConnection<M>,
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        self.stats.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}
