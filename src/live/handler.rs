//! Handler registry and event routing.
//!
//! A `Handler` is built once at startup from an ordered list of configs and
//! is read-only afterwards, apart from its live socket registry. Connections
//! share it through an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, LiveError, Phase};
use crate::live::event::{
    Event, Params, EVENT_ACK, EVENT_CONNECT, EVENT_ERROR, EVENT_PARAMS, EVENT_PATCH, EVENT_RENDER,
};
use crate::live::registry::LiveRegistry;
use crate::live::render::RenderContext;
use crate::live::socket::{Socket, SocketId};
use crate::live::tree::Node;

/// Builds the initial state. Runs on the first request and again when the
/// socket connects.
pub type MountHandler = Arc<dyn Fn(&mut Socket) -> Result<JsonValue, HandlerError> + Send + Sync>;

/// Called when a live connection ends.
pub type UnmountHandler = Arc<dyn Fn(&Socket) -> Result<(), HandlerError> + Send + Sync>;

pub type RenderHandler =
    Arc<dyn Fn(&RenderContext<'_>) -> Result<Node, HandlerError> + Send + Sync>;

/// Turns a failure on the stateless path into the response the user sees.
pub type ErrorHandler = Arc<dyn Fn(&LiveError) -> Response<Full<Bytes>> + Send + Sync>;

/// Handles a client event (or a params change) and returns the new assigns.
pub type EventHandler =
    Arc<dyn Fn(&mut Socket, &Params) -> Result<JsonValue, HandlerError> + Send + Sync>;

/// Handles a server-originated self event and returns the new assigns.
pub type SelfHandler =
    Arc<dyn Fn(&mut Socket, &JsonValue) -> Result<JsonValue, HandlerError> + Send + Sync>;

/// Configuration applied to a handler at construction time.
pub type HandlerConfig = Box<dyn FnOnce(&mut Handler) -> Result<(), LiveError>>;

/// Event names the protocol uses itself.
const RESERVED_EVENTS: &[&str] = &[
    EVENT_CONNECT,
    EVENT_PARAMS,
    EVENT_ACK,
    EVENT_ERROR,
    EVENT_PATCH,
    EVENT_RENDER,
];

pub struct Handler {
    mount: MountHandler,
    unmount: UnmountHandler,
    render: Option<RenderHandler>,
    error: ErrorHandler,
    event_handlers: HashMap<String, EventHandler>,
    self_handlers: HashMap<String, SelfHandler>,
    params_handlers: Vec<EventHandler>,
    ignore_favicon: bool,
    registry: LiveRegistry,
    shutdown: CancellationToken,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("events", &self.event_handlers.keys().collect::<Vec<_>>())
            .field("self_events", &self.self_handlers.keys().collect::<Vec<_>>())
            .field("params_handlers", &self.params_handlers.len())
            .field("live_sockets", &self.registry.len())
            .finish()
    }
}

impl Handler {
    /// Build a handler, applying configs in order. The first failing config
    /// aborts construction.
    pub fn new(configs: impl IntoIterator<Item = HandlerConfig>) -> Result<Self, LiveError> {
        let mut handler = Self {
            mount: Arc::new(|_: &mut Socket| -> Result<JsonValue, HandlerError> {
                Ok(JsonValue::Null)
            }),
            unmount: Arc::new(|_: &Socket| -> Result<(), HandlerError> { Ok(()) }),
            render: None,
            error: Arc::new(default_error_response),
            event_handlers: HashMap::new(),
            self_handlers: HashMap::new(),
            params_handlers: Vec::new(),
            ignore_favicon: true,
            registry: LiveRegistry::new(),
            shutdown: CancellationToken::new(),
        };
        for config in configs {
            config(&mut handler)?;
        }
        Ok(handler)
    }

    pub fn handle_mount<F>(&mut self, f: F)
    where
        F: Fn(&mut Socket) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.mount = Arc::new(f);
    }

    pub fn handle_unmount<F>(&mut self, f: F)
    where
        F: Fn(&Socket) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.unmount = Arc::new(f);
    }

    pub fn handle_render<F>(&mut self, f: F)
    where
        F: Fn(&RenderContext<'_>) -> Result<Node, HandlerError> + Send + Sync + 'static,
    {
        self.render = Some(Arc::new(f));
    }

    pub fn handle_error<F>(&mut self, f: F)
    where
        F: Fn(&LiveError) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        self.error = Arc::new(f);
    }

    /// Handle a client event, e.g. a click bound to `event`.
    pub fn handle_event<F>(&mut self, event: impl Into<String>, f: F) -> Result<(), LiveError>
    where
        F: Fn(&mut Socket, &Params) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        let event = checked_event_name(event.into())?;
        self.event_handlers.insert(event, Arc::new(f));
        Ok(())
    }

    /// Handle a self event sent with [`Handler::self_event`] or [`Handler::broadcast`].
    pub fn handle_self<F>(&mut self, event: impl Into<String>, f: F) -> Result<(), LiveError>
    where
        F: Fn(&mut Socket, &JsonValue) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        let event = checked_event_name(event.into())?;
        self.self_handlers.insert(event, Arc::new(f));
        Ok(())
    }

    /// Handle URL parameter changes. Params handlers run in registration order.
    pub fn handle_params<F>(&mut self, f: F)
    where
        F: Fn(&mut Socket, &Params) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.params_handlers.push(Arc::new(f));
    }

    pub fn set_ignore_favicon(&mut self, ignore: bool) {
        self.ignore_favicon = ignore;
    }

    pub fn ignores_favicon(&self) -> bool {
        self.ignore_favicon
    }

    /// Run mount and assign the result.
    pub fn mount(&self, socket: &mut Socket) -> Result<(), LiveError> {
        let assigns = (self.mount)(socket).map_err(|e| LiveError::handler(Phase::Mount, e))?;
        socket.assign(assigns);
        Ok(())
    }

    pub fn unmount(&self, socket: &Socket) -> Result<(), LiveError> {
        (self.unmount)(socket).map_err(|e| LiveError::handler(Phase::Unmount, e))
    }

    /// Run every params handler in order, each reassigning the socket.
    pub fn call_params(&self, socket: &mut Socket, params: &Params) -> Result<(), LiveError> {
        for handler in &self.params_handlers {
            let assigns = handler(socket, params).map_err(|e| LiveError::handler(Phase::Params, e))?;
            socket.assign(assigns);
        }
        Ok(())
    }

    /// Route a client event to the page's handler or to a child scoped as
    /// `child--event`. Child ids may contain `--`; the longest attached id
    /// that prefixes the name wins.
    pub fn call_event(&self, socket: &mut Socket, event: &Event) -> Result<(), LiveError> {
        let params = event.params();
        if let Some(handler) = self.event_handlers.get(&event.t) {
            let assigns = handler(socket, &params).map_err(|e| LiveError::handler(Phase::Event, e))?;
            socket.assign(assigns);
            return Ok(());
        }
        let scope = event.child_scopes().find(|(id, _)| socket.child(id).is_some());
        if let Some((child_id, name)) = scope {
            if let Some(child) = socket.child_mut(child_id) {
                return child.call_event(name, &params);
            }
        }
        Err(LiveError::NoEventHandler(event.t.clone()))
    }

    /// Route a self event the same way as [`Handler::call_event`]. A scoped
    /// name goes to the attached child with the longest matching id.
    pub fn call_self(&self, socket: &mut Socket, event: &Event) -> Result<(), LiveError> {
        if let Some(handler) = self.self_handlers.get(&event.t) {
            let assigns =
                handler(socket, &event.data).map_err(|e| LiveError::handler(Phase::Event, e))?;
            socket.assign(assigns);
            return Ok(());
        }
        let scope = event.child_scopes().find(|(id, _)| socket.child(id).is_some());
        if let Some((child_id, name)) = scope {
            if let Some(child) = socket.child_mut(child_id) {
                return child.call_self(name, &event.data);
            }
        }
        Err(LiveError::NoEventHandler(event.t.clone()))
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<Node, LiveError> {
        let render = self.render.as_ref().ok_or(LiveError::NoRenderer)?;
        render(ctx).map_err(|e| LiveError::handler(Phase::Render, e))
    }

    pub fn error_response(&self, err: &LiveError) -> Response<Full<Bytes>> {
        (self.error)(err)
    }

    pub fn registry(&self) -> &LiveRegistry {
        &self.registry
    }

    /// Send a self event to one live socket.
    pub fn self_event(&self, id: &SocketId, event: &str, data: JsonValue) -> Result<(), LiveError> {
        self.registry.send_self(id, event, data)
    }

    /// Send a self event to every live socket.
    pub fn broadcast(&self, event: &str, data: JsonValue) -> usize {
        self.registry.broadcast(event, data)
    }

    /// Force-close one live socket.
    pub fn close_socket(&self, id: &SocketId) -> bool {
        self.registry.close(id)
    }

    /// Close every live socket and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// A cancellation token for one connection, cancelled on shutdown.
    pub(crate) fn connection_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

fn checked_event_name(event: String) -> Result<String, LiveError> {
    if event.is_empty() {
        return Err(LiveError::config("event name cannot be empty"));
    }
    if RESERVED_EVENTS.contains(&event.as_str()) {
        return Err(LiveError::config(format!("event name '{}' is reserved", event)));
    }
    Ok(event)
}

fn default_error_response(err: &LiveError) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(err.to_string())));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

pub fn with_mount<F>(f: F) -> HandlerConfig
where
    F: Fn(&mut Socket) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
{
    Box::new(move |h: &mut Handler| {
        h.handle_mount(f);
        Ok(())
    })
}

pub fn with_unmount<F>(f: F) -> HandlerConfig
where
    F: Fn(&Socket) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Box::new(move |h: &mut Handler| {
        h.handle_unmount(f);
        Ok(())
    })
}

pub fn with_render<F>(f: F) -> HandlerConfig
where
    F: Fn(&RenderContext<'_>) -> Result<Node, HandlerError> + Send + Sync + 'static,
{
    Box::new(move |h: &mut Handler| {
        h.handle_render(f);
        Ok(())
    })
}

pub fn with_error<F>(f: F) -> HandlerConfig
where
    F: Fn(&LiveError) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    Box::new(move |h: &mut Handler| {
        h.handle_error(f);
        Ok(())
    })
}

pub fn with_event<F>(event: impl Into<String>, f: F) -> HandlerConfig
where
    F: Fn(&mut Socket, &Params) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
{
    let event = event.into();
    Box::new(move |h: &mut Handler| h.handle_event(event, f))
}

pub fn with_self<F>(event: impl Into<String>, f: F) -> HandlerConfig
where
    F: Fn(&mut Socket, &JsonValue) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
{
    let event = event.into();
    Box::new(move |h: &mut Handler| h.handle_self(event, f))
}

pub fn with_params<F>(f: F) -> HandlerConfig
where
    F: Fn(&mut Socket, &Params) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
{
    Box::new(move |h: &mut Handler| {
        h.handle_params(f);
        Ok(())
    })
}

pub fn with_ignore_favicon(ignore: bool) -> HandlerConfig {
    Box::new(move |h: &mut Handler| {
        h.set_ignore_favicon(ignore);
        Ok(())
    })
}
