//! An HTTP/2-capable pool: a few live connections, many logical streams.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use riptide_core::errors::{TransportError, TransportErrorKind};
use riptide_core::origin::Origin;
use riptide_core::service::Http2PoolSettings;
use tokio::time::timeout;
use tracing::debug;

use super::pool::{ConnectionFactory, PoolableConnection};

struct ConnEntry<C> {
    conn: C,
    active_streams: Arc<AtomicUsize>,
}

/// Pools logical streams over at most `max_connections` live connections,
/// capping concurrent streams per connection and pending stream
/// acquisitions per host.
///
/// The pool keeps `min_connections` connections alive across sweeps and
/// records the highest live-connection count it has reached.
pub struct Http2ConnectionPool<C: PoolableConnection + Clone> {
    origin: Arc<Origin>,
    settings: Http2PoolSettings,
    factory: Arc<dyn ConnectionFactory<C>>,
    connections: Mutex<Vec<ConnEntry<C>>>,
    pending_streams: AtomicUsize,
    max_connections_seen: AtomicUsize,
    connect_timeout: std::time::Duration,
    closed: AtomicBool,
}

impl<C: PoolableConnection + Clone> Http2ConnectionPool<C> {
    /// Creates a pool for the given origin.
    pub fn new(
        origin: Arc<Origin>,
        settings: Http2PoolSettings,
        connect_timeout: std::time::Duration,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            origin,
            settings,
            factory,
            connections: Mutex::new(Vec::new()),
            pending_streams: AtomicUsize::new(0),
            max_connections_seen: AtomicUsize::new(0),
            connect_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Live connections currently held.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// The highest live-connection count reached.
    pub fn max_connections_seen(&self) -> usize {
        self.max_connections_seen.load(Ordering::Relaxed)
    }

    fn error(&self, kind: TransportErrorKind) -> TransportError {
        TransportError::new(
            self.origin.application().clone(),
            self.origin.id().clone(),
            kind,
        )
    }

    /// Finds an open connection with free stream capacity, dropping closed
    /// connections on the way.
    fn checkout_existing(&self) -> Option<StreamGuard<C>> {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.retain(|entry| entry.conn.is_open());
        for entry in connections.iter() {
            let streams = entry.active_streams.clone();
            let claimed = streams.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.settings.max_streams_per_connection).then_some(count + 1)
            });
            if claimed.is_ok() {
                return Some(StreamGuard {
                    conn: entry.conn.clone(),
                    active_streams: streams,
                });
            }
        }
        None
    }

    /// Acquires one logical stream.
    pub async fn acquire_stream(&self) -> Result<StreamGuard<C>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.error(TransportErrorKind::ConnectFailure(
                "connection pool is closed".to_string(),
            )));
        }

        if self.pending_streams.fetch_add(1, Ordering::AcqRel)
            >= self.settings.max_pending_streams_per_host
        {
            self.pending_streams.fetch_sub(1, Ordering::AcqRel);
            return Err(self.error(TransportErrorKind::PoolExhausted));
        }

        let result = self.acquire_stream_inner().await;
        self.pending_streams.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn acquire_stream_inner(&self) -> Result<StreamGuard<C>, TransportError> {
        if let Some(guard) = self.checkout_existing() {
            return Ok(guard);
        }

        if self.connection_count() >= self.settings.max_connections {
            // Every connection is at its stream cap.
            return Err(self.error(TransportErrorKind::PoolExhausted));
        }

        let conn = match timeout(self.connect_timeout, self.factory.connect(&self.origin)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(error)) => return Err(error),
            Err(_elapsed) => return Err(self.error(TransportErrorKind::ConnectTimeout)),
        };

        {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            // Re-check under the lock: a racing acquisition may have filled
            // the cap while this one was connecting.
            if connections.len() < self.settings.max_connections {
                let active_streams = Arc::new(AtomicUsize::new(1));
                let guard = StreamGuard {
                    conn: conn.clone(),
                    active_streams: active_streams.clone(),
                };
                connections.push(ConnEntry {
                    conn,
                    active_streams,
                });
                self.max_connections_seen
                    .fetch_max(connections.len(), Ordering::AcqRel);
                return Ok(guard);
            }
        }

        // The cap was reached meanwhile; discard the surplus connection and
        // take a stream slot on whichever connection won.
        drop(conn);
        self.checkout_existing()
            .ok_or_else(|| self.error(TransportErrorKind::PoolExhausted))
    }

    /// Drops idle connections above `min_connections`, keeping any with
    /// active streams.
    pub fn sweep_idle(&self) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let min = self.settings.min_connections;
        let mut keep: Vec<ConnEntry<C>> = Vec::new();
        for entry in connections.drain(..) {
            let busy = entry.active_streams.load(Ordering::Acquire) > 0;
            if entry.conn.is_open() && (busy || keep.len() < min) {
                keep.push(entry);
            }
        }
        *connections = keep;
    }

    /// Shuts the pool down; in-flight streams complete on their guards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!(origin = %self.origin, "http2 pool closed");
    }
}

/// One claimed logical stream; releases its slot on drop.
pub struct StreamGuard<C> {
    conn: C,
    active_streams: Arc<AtomicUsize>,
}

impl<C> StreamGuard<C> {
    /// The multiplexed connection handle carrying this stream.
    pub fn connection(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> fmt::Debug for StreamGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamGuard")
            .field("active_streams", &self.active_streams.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<C> Drop for StreamGuard<C> {
    fn drop(&mut self) {
        self.active_streams.fetch_sub(1, Ordering::AcqRel);
    }
}
