//! Process-wide server lifecycle state.
//!
//! Holds the shutdown flag and the registry of live connections. The flag
//! only flips under the registry lock, so a connection is either registered
//! before shutdown (and closed by it) or refused.

use slab::Slab;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

/// Shutdown flag plus the live-connection registry.
///
/// The registry stores a duplicate handle of every connection's socket.
/// Shutting that handle down makes the owning handler see end-of-stream.
pub struct ServerState {
    stopping: AtomicBool,
    connections: Mutex<Slab<TcpStream>>,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub fn new(max_connections: usize) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            stopping: AtomicBool::new(false),
            connections: Mutex::new(Slab::with_capacity(max_connections)),
            shutdown,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slab<TcpStream>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Receiver that resolves `changed()` once shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a connection so shutdown can force-close it.
    ///
    /// Returns `None` if shutdown has already begun; the caller should drop
    /// the connection. The returned guard deregisters on drop.
    pub fn register(
        self: &Arc<Self>,
        stream: &TcpStream,
    ) -> std::io::Result<Option<Registration>> {
        let handle = stream.try_clone()?;

        let mut connections = self.lock();
        if self.is_stopping() {
            return Ok(None);
        }
        let id = connections.insert(handle);

        Ok(Some(Registration {
            state: Arc::clone(self),
            id,
        }))
    }

    fn deregister(&self, id: usize) {
        let mut connections = self.lock();
        if connections.contains(id) {
            connections.remove(id);
        }
    }

    /// Begin shutdown: set the flag, wake everyone waiting on it and close
    /// every registered connection.
    ///
    /// Returns `false` if shutdown had already begun, in which case nothing
    /// is closed a second time.
    pub fn close_all(&self) -> bool {
        let drained: Vec<TcpStream> = {
            let mut connections = self.lock();
            if self.stopping.swap(true, Ordering::AcqRel) {
                return false;
            }
            self.shutdown.send_replace(true);
            connections.drain().collect()
        };

        info!(connections = drained.len(), "Closing connections");

        for stream in drained {
            // The peer may already be gone
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(error = %e, "Shutdown of closed connection");
            }
        }

        true
    }
}

/// Live-connection registration, removed from the registry on drop.
pub struct Registration {
    state: Arc<ServerState>,
    id: usize,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.state.deregister(self.id);
    }
}
