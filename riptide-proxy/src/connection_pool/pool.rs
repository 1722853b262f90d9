//! Bounded, reusable connection lifecycle management for one origin.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use riptide_core::errors::{TransportError, TransportErrorKind};
use riptide_core::origin::Origin;
use riptide_core::service::ConnectionPoolSettings;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout, Instant};
use tracing::debug;

/// The future a [`ConnectionFactory`] returns.
pub type ConnectFuture<C> =
    Pin<Box<dyn Future<Output = Result<C, TransportError>> + Send>>;

/// A connection a pool can manage.
pub trait PoolableConnection: Send + 'static {
    /// Whether the connection is still usable. Closed connections found in
    /// the idle queue are dropped, not handed out.
    fn is_open(&self) -> bool;
}

/// Opens connections to an origin. Supplied by the transport layer.
pub trait ConnectionFactory<C: PoolableConnection>: Send + Sync {
    /// Opens one connection. The pool applies the connect timeout around
    /// this future.
    fn connect(&self, origin: &Origin) -> ConnectFuture<C>;
}

/// Counters a pool maintains for the metrics sink.
#[derive(Debug, Default)]
pub struct PoolStats {
    available: AtomicUsize,
    borrowed: AtomicUsize,
    pending: AtomicUsize,
    connection_attempts: AtomicUsize,
    connection_failures: AtomicUsize,
    closed_connections: AtomicUsize,
}

impl PoolStats {
    /// Idle connections ready for reuse.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Connections currently checked out.
    pub fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::Relaxed)
    }

    /// Acquisitions waiting in the pending queue.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Connection-establishment attempts made.
    pub fn connection_attempts(&self) -> usize {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    /// Connection-establishment failures.
    pub fn connection_failures(&self) -> usize {
        self.connection_failures.load(Ordering::Relaxed)
    }

    /// Connections closed by expiry, failure or shutdown.
    pub fn closed_connections(&self) -> usize {
        self.closed_connections.load(Ordering::Relaxed)
    }
}

struct IdleEntry<C> {
    conn: C,
    returned_at: Instant,
}

/// A bounded connection pool for one origin.
///
/// At most `max_connections_per_host` connections exist at a time; beyond
/// that, acquisitions queue up to `max_pending_connections_per_host` and
/// then fail fast. Waiting suspends the calling task, never a worker thread.
pub struct HostConnectionPool<C: PoolableConnection> {
    origin: Arc<Origin>,
    settings: ConnectionPoolSettings,
    factory: Arc<dyn ConnectionFactory<C>>,
    idle: SegQueue<IdleEntry<C>>,
    slots: Arc<Semaphore>,
    stats: PoolStats,
    closed: AtomicBool,
}

impl<C: PoolableConnection> HostConnectionPool<C> {
    /// Creates a pool for the given origin.
    pub fn new(
        origin: Arc<Origin>,
        settings: ConnectionPoolSettings,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(settings.max_connections_per_host)),
            origin,
            settings,
            factory,
            idle: SegQueue::new(),
            stats: PoolStats::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// The origin this pool serves.
    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    /// The pool's counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn error(&self, kind: TransportErrorKind) -> TransportError {
        TransportError::new(
            self.origin.application().clone(),
            self.origin.id().clone(),
            kind,
        )
    }

    fn expired(&self, entry: &IdleEntry<C>) -> bool {
        match self.settings.connection_expiration() {
            Some(expiration) => entry.returned_at.elapsed() >= expiration,
            None => false,
        }
    }

    /// Acquires a connection for exclusive use.
    ///
    /// Fails fast with `PoolExhausted` once the pending queue is full,
    /// `PendingTimeout` when queue wait exceeds its bound, `ConnectTimeout`
    /// or `ConnectFailure` when a fresh connection cannot be established.
    pub async fn acquire(&self) -> Result<CheckedOut<'_, C>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.error(TransportErrorKind::ConnectFailure(
                "connection pool is closed".to_string(),
            )));
        }

        // The pending bound applies only to acquisitions that actually have
        // to wait for a slot; under-capacity acquisitions take one directly.
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(self.error(TransportErrorKind::ConnectFailure(
                    "connection pool is closed".to_string(),
                )))
            }
            Err(TryAcquireError::NoPermits) => {
                if self.stats.pending.fetch_add(1, Ordering::AcqRel)
                    >= self.settings.max_pending_connections_per_host
                {
                    self.stats.pending.fetch_sub(1, Ordering::AcqRel);
                    return Err(self.error(TransportErrorKind::PoolExhausted));
                }

                let acquired = timeout(
                    self.settings.pending_timeout(),
                    self.slots.clone().acquire_owned(),
                )
                .await;
                self.stats.pending.fetch_sub(1, Ordering::AcqRel);

                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => {
                        return Err(self.error(TransportErrorKind::ConnectFailure(
                            "connection pool is closed".to_string(),
                        )))
                    }
                    Err(_elapsed) => {
                        return Err(self.error(TransportErrorKind::PendingTimeout))
                    }
                }
            }
        };

        // Prefer a live idle connection; expired or closed ones are reaped
        // on the way.
        while let Some(entry) = self.idle.pop() {
            self.stats.available.fetch_sub(1, Ordering::AcqRel);
            if self.expired(&entry) || !entry.conn.is_open() {
                self.stats.closed_connections.fetch_add(1, Ordering::AcqRel);
                continue;
            }
            self.stats.borrowed.fetch_add(1, Ordering::AcqRel);
            return Ok(CheckedOut {
                conn: Some(entry.conn),
                _permit: permit,
                pool: self,
            });
        }

        self.stats.connection_attempts.fetch_add(1, Ordering::AcqRel);
        let connected = timeout(
            self.settings.connect_timeout(),
            self.factory.connect(&self.origin),
        )
        .await;
        let conn = match connected {
            Ok(Ok(conn)) => conn,
            Ok(Err(error)) => {
                self.stats.connection_failures.fetch_add(1, Ordering::AcqRel);
                return Err(error);
            }
            Err(_elapsed) => {
                self.stats.connection_failures.fetch_add(1, Ordering::AcqRel);
                return Err(self.error(TransportErrorKind::ConnectTimeout));
            }
        };

        self.stats.borrowed.fetch_add(1, Ordering::AcqRel);
        Ok(CheckedOut {
            conn: Some(conn),
            _permit: permit,
            pool: self,
        })
    }

    /// Runs `use_connection` with an exclusively held connection. The
    /// connection returns to the pool on success and is closed on failure.
    pub async fn with_connection<T, F>(&self, use_connection: F) -> Result<T, TransportError>
    where
        F: for<'a> FnOnce(
            &'a mut C,
        )
            -> Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>,
    {
        let mut checked_out = self.acquire().await?;
        match use_connection(checked_out.connection()).await {
            Ok(value) => {
                checked_out.release();
                Ok(value)
            }
            Err(error) => {
                checked_out.discard();
                Err(error)
            }
        }
    }

    /// Closes expired idle connections. Driven periodically by the engine.
    pub fn sweep_idle(&self) {
        let mut keep = Vec::new();
        while let Some(entry) = self.idle.pop() {
            self.stats.available.fetch_sub(1, Ordering::AcqRel);
            if self.expired(&entry) || !entry.conn.is_open() {
                self.stats.closed_connections.fetch_add(1, Ordering::AcqRel);
            } else {
                keep.push(entry);
            }
        }
        for entry in keep {
            self.stats.available.fetch_add(1, Ordering::AcqRel);
            self.idle.push(entry);
        }
    }

    /// Shuts the pool down: pending acquisitions fail and idle connections
    /// are dropped. In-flight checkouts complete normally.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        while let Some(_entry) = self.idle.pop() {
            self.stats.available.fetch_sub(1, Ordering::AcqRel);
            self.stats.closed_connections.fetch_add(1, Ordering::AcqRel);
        }
        debug!(origin = %self.origin, "connection pool closed");
    }

    fn put_back(&self, conn: C) {
        self.stats.borrowed.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) || !conn.is_open() {
            self.stats.closed_connections.fetch_add(1, Ordering::AcqRel);
            return;
        }
        self.stats.available.fetch_add(1, Ordering::AcqRel);
        self.idle.push(IdleEntry {
            conn,
            returned_at: Instant::now(),
        });
    }

    fn drop_borrowed(&self) {
        self.stats.borrowed.fetch_sub(1, Ordering::AcqRel);
        self.stats.closed_connections.fetch_add(1, Ordering::AcqRel);
    }
}

/// An exclusively held connection.
///
/// [`release`](CheckedOut::release) returns it for reuse;
/// [`discard`](CheckedOut::discard) or dropping the guard closes it. Either
/// way the pool slot is freed.
pub struct CheckedOut<'a, C: PoolableConnection> {
    conn: Option<C>,
    _permit: OwnedSemaphorePermit,
    pool: &'a HostConnectionPool<C>,
}

impl<C: PoolableConnection> fmt::Debug for CheckedOut<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedOut")
            .field("origin", &self.pool.origin.host_and_port())
            .finish_non_exhaustive()
    }
}

impl<C: PoolableConnection> CheckedOut<'_, C> {
    /// The held connection.
    pub fn connection(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection taken")
    }

    /// Returns the connection to the pool for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }

    /// Closes the connection instead of returning it.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.drop_borrowed();
        }
    }
}

impl<C: PoolableConnection> Drop for CheckedOut<'_, C> {
    fn drop(&mut self) {
        // A guard dropped without an explicit release (cancellation, panic
        // unwind) counts as a discard.
        if self.conn.take().is_some() {
            self.pool.drop_borrowed();
        }
    }
}
