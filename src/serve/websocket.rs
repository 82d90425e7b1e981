//! The live half of a page: one WebSocket connection per socket.
//!
//! A connection runs two activities. The read activity owns the socket: it
//! decodes client messages and self events, runs handlers, re-renders and
//! queues patches. The write activity drains the socket's queues onto the wire
//! with a timeout per write, and decides how the connection is closed.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

use crate::error::LiveError;
use crate::live::event::{
    ErrorEvent, Event, Params, EVENT_ACK, EVENT_CONNECT, EVENT_ERROR, EVENT_PARAMS,
};
use crate::live::handler::Handler;
use crate::live::registry::{LiveHandle, Registration};
use crate::live::render::render_socket;
use crate::live::socket::{Outbound, Socket, SocketId};
use crate::live::tree::Node;
use crate::serve::config::LiveConfig;
use crate::serve::constants::{INBOX_CAPACITY, TOO_SLOW_REASON};
use crate::session::Session;

/// Close reasons must fit in a control frame.
const MAX_CLOSE_REASON: usize = 123;

/// What the connection starts from: the session it belongs to, the URL
/// parameters of the page and the snapshot the client already displays.
pub struct Connect {
    pub session: Session,
    pub params: Params,
    pub baseline: Option<Node>,
}

/// Serve one live connection until the client leaves, the token is
/// cancelled or a fatal error occurs.
///
/// The socket is registered for the lifetime of the call and unmounted
/// exactly once when its read activity ends. An invalid config is refused
/// before anything is written.
pub async fn serve_connection<S>(
    handler: Arc<Handler>,
    config: Arc<LiveConfig>,
    connect: Connect,
    ws: S,
    cancel: CancellationToken,
) -> Result<(), LiveError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin
        + Send
        + 'static,
{
    config.validate()?;
    let (mut sink, stream) = ws.split();

    let (outbound_tx, outbound_rx) = async_channel::bounded(config.outbound_capacity);
    let (error_tx, error_rx) = async_channel::bounded(config.error_capacity);
    let (inbox_tx, inbox_rx) = async_channel::bounded(INBOX_CAPACITY);
    let slow = Arc::new(Notify::new());

    let mut socket = Socket::connected(connect.session, Outbound::new(outbound_tx, slow.clone()));
    socket.set_baseline(connect.baseline);
    let id = socket.id();

    let _registration = Registration::new(
        handler.registry(),
        id,
        LiveHandle {
            inbox: inbox_tx,
            cancel: cancel.clone(),
        },
    );

    write_event(
        &mut sink,
        &Event::new(EVENT_CONNECT, JsonValue::Null),
        config.write_timeout,
    )
    .await?;
    info!(socket = %id, "socket connected");

    let (done_tx, done_rx) = oneshot::channel();
    let read_task = tokio::spawn(read_activity(
        handler.clone(),
        socket,
        connect.params,
        stream,
        inbox_rx,
        error_tx,
        cancel.clone(),
        done_tx,
    ));

    let result = write_activity(
        &mut sink,
        &config,
        id,
        WriteQueues {
            outbound: outbound_rx,
            errors: error_rx,
            slow,
            done: done_rx,
        },
        &cancel,
    )
    .await;

    let close = Message::Close(Some(close_frame(&result)));
    let _ = tokio::time::timeout(config.write_timeout, sink.send(close)).await;

    cancel.cancel();
    if let Err(e) = read_task.await {
        error!(socket = %id, error = %e, "read activity panicked");
    }

    match &result {
        Ok(()) => info!(socket = %id, "socket disconnected"),
        Err(e) => warn!(socket = %id, error = %e, "socket dropped"),
    }
    result
}

/// Queues drained by the write activity.
struct WriteQueues {
    outbound: async_channel::Receiver<Event>,
    errors: async_channel::Receiver<Event>,
    slow: Arc<Notify>,
    /// Outcome of the read activity.
    done: oneshot::Receiver<Result<(), LiveError>>,
}

async fn write_activity<S>(
    sink: &mut S,
    config: &LiveConfig,
    id: SocketId,
    mut queues: WriteQueues,
    cancel: &CancellationToken,
) -> Result<(), LiveError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(socket = %id, "connection cancelled");
                return Ok(());
            }
            _ = queues.slow.notified() => return Err(LiveError::TooSlow),
            Ok(event) = queues.outbound.recv() => {
                write_event(sink, &event, config.write_timeout).await?;
            }
            Ok(event) = queues.errors.recv() => {
                write_event(sink, &event, config.write_timeout).await?;
            }
            done = &mut queues.done => {
                return match done {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        // Best effort: the connection is going down either way.
                        let event = Event::new(EVENT_ERROR, json!({ "err": err.to_string() }));
                        if let Err(e) = write_event(sink, &event, config.write_timeout).await {
                            debug!(socket = %id, error = %e, "could not report fatal error");
                        }
                        Err(err)
                    }
                    Err(_) => Err(LiveError::SendClosed),
                };
            }
        }
    }
}

async fn read_activity<R>(
    handler: Arc<Handler>,
    mut socket: Socket,
    params: Params,
    stream: R,
    inbox: async_channel::Receiver<Event>,
    errors: async_channel::Sender<Event>,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<(), LiveError>>,
) where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let result = match connect_socket(&handler, &mut socket, &params) {
        Ok(()) => read_loop(&handler, &mut socket, stream, &inbox, &errors, &cancel).await,
        Err(e) => Err(e),
    };

    if let Err(e) = handler.unmount(&socket) {
        warn!(socket = %socket.id(), error = %e, "unmount failed");
    }
    let _ = done.send(result);
}

/// Mount, params and render again now that the socket is connected. The
/// render is diffed against the snapshot the client got over HTTP.
fn connect_socket(handler: &Handler, socket: &mut Socket, params: &Params) -> Result<(), LiveError> {
    handler.mount(socket)?;
    handler.call_params(socket, params)?;
    let tree = render_socket(handler, socket)?;
    socket.update_render(tree)?;
    Ok(())
}

enum Inbound {
    Client(Event),
    SelfEvent(Event),
}

async fn read_loop<R>(
    handler: &Handler,
    socket: &mut Socket,
    mut stream: R,
    inbox: &async_channel::Receiver<Event>,
    errors: &async_channel::Sender<Event>,
    cancel: &CancellationToken,
) -> Result<(), LiveError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            Ok(event) = inbox.recv() => Inbound::SelfEvent(event),
            message = stream.next() => match message {
                None => return Ok(()),
                Some(Err(e)) => return transport_closed(socket.id(), e),
                Some(Ok(Message::Text(text))) => Inbound::Client(serde_json::from_str(&text)?),
                Some(Ok(Message::Binary(data))) => {
                    warn!(socket = %socket.id(), len = data.len(), "ignoring binary message");
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    log_close(socket.id(), frame.as_ref());
                    return Ok(());
                }
                Some(Ok(_)) => continue,
            },
        };

        match inbound {
            Inbound::Client(event) => handle_client_event(handler, socket, event, errors)?,
            Inbound::SelfEvent(event) => handle_self_event(handler, socket, event, errors)?,
        }
    }
}

/// Run the event's handler, re-render and acknowledge the event.
///
/// Handler failures are reported to the client and the connection stays up;
/// only a failed render or a failed send ends it.
fn handle_client_event(
    handler: &Handler,
    socket: &mut Socket,
    event: Event,
    errors: &async_channel::Sender<Event>,
) -> Result<(), LiveError> {
    let result = if event.t == EVENT_PARAMS {
        handler.call_params(socket, &event.params())
    } else {
        handler.call_event(socket, &event)
    };
    report(socket.id(), &event, result, errors);

    let tree = render_socket(handler, socket)?;
    socket.update_render(tree)?;
    socket.send(EVENT_ACK, JsonValue::Null, event.id)
}

fn handle_self_event(
    handler: &Handler,
    socket: &mut Socket,
    event: Event,
    errors: &async_channel::Sender<Event>,
) -> Result<(), LiveError> {
    let result = handler.call_self(socket, &event);
    report(socket.id(), &event, result, errors);

    let tree = render_socket(handler, socket)?;
    socket.update_render(tree)?;
    Ok(())
}

fn report(
    id: SocketId,
    event: &Event,
    result: Result<(), LiveError>,
    errors: &async_channel::Sender<Event>,
) {
    let err = match result {
        Ok(()) => return,
        Err(e) if e.is_no_handler() => {
            warn!(socket = %id, event = %event.t, "no handler for event");
            return;
        }
        Err(e) => e,
    };
    warn!(socket = %id, event = %event.t, error = %err, "event handler failed");
    let report = ErrorEvent {
        source: event.clone(),
        err: err.to_string(),
    };
    if errors.try_send(report.into_event()).is_err() {
        warn!(socket = %id, "error queue full, dropping error event");
    }
}

fn transport_closed(id: SocketId, err: tungstenite::Error) -> Result<(), LiveError> {
    use tungstenite::error::ProtocolError;
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            debug!(socket = %id, "connection went away");
            Ok(())
        }
        e => Err(e.into()),
    }
}

fn log_close(id: SocketId, frame: Option<&CloseFrame<'_>>) {
    match frame {
        None => debug!(socket = %id, "client closed"),
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            debug!(socket = %id, code = u16::from(frame.code), "client closed");
        }
        Some(frame) => {
            warn!(
                socket = %id,
                code = u16::from(frame.code),
                reason = %frame.reason,
                "client closed with error status"
            );
        }
    }
}

async fn write_event<S>(sink: &mut S, event: &Event, timeout: Duration) -> Result<(), LiveError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(event)?;
    match tokio::time::timeout(timeout, sink.send(Message::Text(text))).await {
        Ok(sent) => sent.map_err(LiveError::from),
        Err(_) => Err(LiveError::WriteTimeout),
    }
}

fn close_frame(result: &Result<(), LiveError>) -> CloseFrame<'static> {
    match result {
        Ok(()) => CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        },
        Err(e) if e.is_policy_violation() => CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed(TOO_SLOW_REASON),
        },
        Err(e) => CloseFrame {
            code: CloseCode::Error,
            reason: Cow::Owned(truncate_reason(e.to_string())),
        },
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
