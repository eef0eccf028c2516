//! Virtual port fabric: in-band SSH TCP/IP forwarding without opening a
//! host port.
//!
//! The fabric keeps per-port lists of virtual listeners keyed by user.
//! A `direct-tcpip` channel targeting `localhost:<port>` is routed to the
//! first *pending* listener for the authenticated user (a listener whose
//! accept is currently waiting), falling back to the first matching
//! listener otherwise. Dispatch picks and delivers while holding the
//! registry lock so a delivery can never race a listener removal.
//!
//! The payload type is generic: the server routes SSH channels, the tests
//! route plain tokens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a forward was refused. `HostNotAllowed` and `NoListener` are
/// policy-class rejections (SSH `Prohibited`); a transport parse failure
/// is rejected by the SSH layer itself (`ConnectionFailed`) before the
/// fabric is consulted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("destination host {0:?} is not allowed")]
    HostNotAllowed(String),

    #[error("port {0} cannot be forwarded")]
    NoListener(u32),

    #[error("every listener for port {0} is busy")]
    Busy(u32),
}

struct ListenerEntry<T> {
    /// Owning user; empty serves every user.
    user: String,
    port: u32,
    /// True while the listener's accept is waiting for a delivery.
    pending: AtomicBool,
    tx: mpsc::Sender<T>,
}

struct FabricInner<T> {
    listeners: Mutex<HashMap<u32, Vec<Arc<ListenerEntry<T>>>>>,
    cancel: CancellationToken,
}

/// The per-process forwarding registry.
pub struct PortFabric<T> {
    inner: Arc<FabricInner<T>>,
}

impl<T> Clone for PortFabric<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> PortFabric<T> {
    /// Create a fabric whose listeners unblock when `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                listeners: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    /// Register a virtual listener for `user` on `port`. An empty user
    /// accepts forwards from any user. The listener starts out pending.
    pub fn create_listener(&self, port: u32, user: &str) -> VirtualListener<T> {
        let (tx, rx) = mpsc::channel(1);
        let entry = Arc::new(ListenerEntry {
            user: user.to_string(),
            port,
            pending: AtomicBool::new(true),
            tx,
        });
        self.inner
            .listeners
            .lock()
            .entry(port)
            .or_default()
            .push(Arc::clone(&entry));
        VirtualListener {
            entry,
            rx,
            fabric: self.clone(),
        }
    }

    fn remove(&self, entry: &Arc<ListenerEntry<T>>) {
        let mut listeners = self.inner.listeners.lock();
        if let Some(list) = listeners.get_mut(&entry.port) {
            list.retain(|e| !Arc::ptr_eq(e, entry));
            if list.is_empty() {
                listeners.remove(&entry.port);
            }
        }
    }

    /// Route one forwarded connection. Only loopback destinations are
    /// served. Among the listeners for the port that match `user`, the
    /// first pending one wins; with no pending listener the first match
    /// is used anyway (it will accept next). Delivery happens under the
    /// registry lock; at-most-once per payload.
    pub fn dispatch(
        &self,
        dest_host: &str,
        dest_port: u32,
        user: &str,
        payload: T,
    ) -> Result<(), DispatchError> {
        if dest_host != "localhost" && dest_host != "127.0.0.1" {
            return Err(DispatchError::HostNotAllowed(dest_host.to_string()));
        }

        let listeners = self.inner.listeners.lock();
        let matching: Vec<&Arc<ListenerEntry<T>>> = listeners
            .get(&dest_port)
            .map(|list| {
                list.iter()
                    .filter(|e| e.user == user || e.user.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if matching.is_empty() {
            return Err(DispatchError::NoListener(dest_port));
        }

        let mut payload = payload;
        for entry in &matching {
            if !entry.pending.load(Ordering::SeqCst) {
                continue;
            }
            entry.pending.store(false, Ordering::SeqCst);
            match entry.tx.try_send(payload) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(p))
                | Err(mpsc::error::TrySendError::Closed(p)) => {
                    payload = p;
                }
            }
        }
        // No pending listener took it; the first match keeps it queued
        // for its next accept.
        for entry in &matching {
            match entry.tx.try_send(payload) {
                Ok(()) => {
                    entry.pending.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Full(p))
                | Err(mpsc::error::TrySendError::Closed(p)) => {
                    payload = p;
                }
            }
        }
        Err(DispatchError::Busy(dest_port))
    }
}

/// Error returned from [`VirtualListener::accept`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    #[error("fabric shut down")]
    Cancelled,
}

/// A synthetic listener whose accepted connections are forwarded SSH
/// channels. Dropping it deregisters it from the fabric.
pub struct VirtualListener<T> {
    entry: Arc<ListenerEntry<T>>,
    rx: mpsc::Receiver<T>,
    fabric: PortFabric<T>,
}

impl<T: Send + 'static> VirtualListener<T> {
    /// Wait for the next forwarded connection or fabric shutdown.
    pub async fn accept(&mut self) -> Result<T, AcceptError> {
        self.entry.pending.store(true, Ordering::SeqCst);
        let cancel = self.fabric.inner.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(AcceptError::Cancelled),
            delivery = self.rx.recv() => match delivery {
                Some(payload) => {
                    self.entry.pending.store(false, Ordering::SeqCst);
                    Ok(payload)
                }
                None => Err(AcceptError::Cancelled),
            },
        }
    }

    /// The synthetic address this listener serves.
    pub fn local_addr(&self) -> String {
        format!("localhost:{}", self.entry.port)
    }

    /// The user this listener belongs to; empty means any.
    pub fn user(&self) -> &str {
        &self.entry.user
    }
}

impl<T> Drop for VirtualListener<T> {
    fn drop(&mut self) {
        debug!(port = self.entry.port, user = %self.entry.user, "virtual listener closed");
        self.fabric.remove(&self.entry);
    }
}
