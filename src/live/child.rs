//! Child state holders attached to a socket.
//!
//! A child owns a piece of state and its own event handlers. Its events are
//! scoped on the wire as `{child id}--{event}` so the socket can route them
//! without colliding with the page's own events. Ids may contain the
//! separator themselves; routing prefers the longest attached id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{HandlerError, LiveError, Phase};
use crate::live::event::{Params, CHILD_EVENT_SEPARATOR};

/// Client event handler for a child: current child state in, new state out.
pub type ChildEventHandler =
    Arc<dyn Fn(&JsonValue, &Params) -> Result<JsonValue, HandlerError> + Send + Sync>;

/// Server-side self event handler for a child.
pub type ChildSelfHandler =
    Arc<dyn Fn(&JsonValue, &JsonValue) -> Result<JsonValue, HandlerError> + Send + Sync>;

pub struct Child {
    id: String,
    state: JsonValue,
    event_handlers: HashMap<String, ChildEventHandler>,
    self_handlers: HashMap<String, ChildSelfHandler>,
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("events", &self.event_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Child {
    /// Create a child. The id should be stable across renders and unique on
    /// the page.
    pub fn new(id: impl Into<String>, state: JsonValue) -> Self {
        Self {
            id: id.into(),
            state,
            event_handlers: HashMap::new(),
            self_handlers: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &JsonValue {
        &self.state
    }

    pub fn set_state(&mut self, state: JsonValue) {
        self.state = state;
    }

    pub fn on_event<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JsonValue, &Params) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.event_handlers.insert(event.into(), Arc::new(handler));
        self
    }

    pub fn on_self<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JsonValue, &JsonValue) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.self_handlers.insert(event.into(), Arc::new(handler));
        self
    }

    /// Scope an event name to this child.
    pub fn event(&self, event: &str) -> String {
        format!("{}{}{}", self.id, CHILD_EVENT_SEPARATOR, event)
    }

    pub(crate) fn call_event(&mut self, event: &str, params: &Params) -> Result<(), LiveError> {
        let handler = self
            .event_handlers
            .get(event)
            .cloned()
            .ok_or_else(|| LiveError::NoEventHandler(self.event(event)))?;
        self.state = handler(&self.state, params).map_err(|e| LiveError::handler(Phase::Event, e))?;
        Ok(())
    }

    pub(crate) fn call_self(&mut self, event: &str, data: &JsonValue) -> Result<(), LiveError> {
        let handler = self
            .self_handlers
            .get(event)
            .cloned()
            .ok_or_else(|| LiveError::NoEventHandler(self.event(event)))?;
        self.state = handler(&self.state, data).map_err(|e| LiveError::handler(Phase::Event, e))?;
        Ok(())
    }
}
