//! Registry of live sockets.
//!
//! This is the only state shared between connections. Entries are inserted
//! when a connection goes live and removed when it ends; lookups are used to
//! deliver self events, fan out broadcasts and close sockets from outside.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_channel::TrySendError;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LiveError;
use crate::live::event::Event;
use crate::live::socket::SocketId;

/// Handle onto a live connection held by the registry.
#[derive(Clone)]
pub(crate) struct LiveHandle {
    /// Self events for the connection's read activity.
    pub(crate) inbox: async_channel::Sender<Event>,
    /// Cancels the whole connection.
    pub(crate) cancel: CancellationToken,
}

#[derive(Default)]
pub struct LiveRegistry {
    sockets: Mutex<HashMap<SocketId, LiveHandle>>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketId, LiveHandle>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, id: SocketId, handle: LiveHandle) {
        self.lock().insert(id, handle);
        debug!(socket = %id, "socket registered");
    }

    pub(crate) fn unregister(&self, id: &SocketId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            debug!(socket = %id, "socket unregistered");
        }
        removed
    }

    pub fn contains(&self, id: &SocketId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<SocketId> {
        self.lock().keys().copied().collect()
    }

    /// Queue a self event for one socket.
    pub fn send_self(&self, id: &SocketId, event: &str, data: JsonValue) -> Result<(), LiveError> {
        let handle = self.lock().get(id).cloned().ok_or(LiveError::SendClosed)?;
        match handle.inbox.try_send(Event::new(event, data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LiveError::TooSlow),
            Err(TrySendError::Closed(_)) => Err(LiveError::SendClosed),
        }
    }

    /// Queue a self event for every live socket. Returns how many accepted it.
    pub fn broadcast(&self, event: &str, data: JsonValue) -> usize {
        let handles: Vec<(SocketId, LiveHandle)> =
            self.lock().iter().map(|(id, h)| (*id, h.clone())).collect();
        let mut delivered = 0;
        for (id, handle) in handles {
            match handle.inbox.try_send(Event::new(event, data.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(socket = %id, error = %e, "broadcast not delivered"),
            }
        }
        delivered
    }

    /// Cancel one connection. Returns false if it is not live.
    pub fn close(&self, id: &SocketId) -> bool {
        match self.lock().get(id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for handle in self.lock().values() {
            handle.cancel.cancel();
        }
    }
}

/// Keeps a socket registered for as long as it is alive.
pub(crate) struct Registration<'a> {
    registry: &'a LiveRegistry,
    id: SocketId,
}

impl<'a> Registration<'a> {
    pub(crate) fn new(registry: &'a LiveRegistry, id: SocketId, handle: LiveHandle) -> Self {
        registry.register(id, handle);
        Self { registry, id }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}
