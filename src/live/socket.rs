//! Per-connection state container.
//!
//! A socket holds the current assigns, attached children, the last rendered
//! snapshot and, when connected, the sending half of the outbound queue that
//! the connection's write activity drains.

use std::sync::Arc;

use async_channel::TrySendError;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::error::LiveError;
use crate::live::child::Child;
use crate::live::diff::{diff, Diff};
use crate::live::event::{Event, EVENT_PATCH, EVENT_RENDER};
use crate::live::tree::Node;
use crate::session::Session;

pub type SocketId = Uuid;

/// Bounded outbound queue of a connected socket.
///
/// The queue never grows past its capacity: a full queue fires `slow` so the
/// write activity can drop the connection.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: async_channel::Sender<Event>,
    slow: Arc<Notify>,
}

impl Outbound {
    pub(crate) fn new(tx: async_channel::Sender<Event>, slow: Arc<Notify>) -> Self {
        Self { tx, slow }
    }

    pub(crate) fn push(&self, event: Event) -> Result<(), LiveError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.slow.notify_one();
                Err(LiveError::TooSlow)
            }
            Err(TrySendError::Closed(_)) => Err(LiveError::SendClosed),
        }
    }
}

pub struct Socket {
    id: SocketId,
    session: Session,
    assigns: JsonValue,
    connected: bool,
    children: IndexMap<String, Child>,
    render: Option<Node>,
    outbound: Option<Outbound>,
}

impl Socket {
    /// A socket for a stateless request: nothing it sends leaves the server.
    pub fn new(session: Session) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            assigns: JsonValue::Null,
            connected: false,
            children: IndexMap::new(),
            render: None,
            outbound: None,
        }
    }

    /// A socket bound to a live connection's outbound queue.
    pub(crate) fn connected(session: Session, outbound: Outbound) -> Self {
        Self {
            connected: true,
            outbound: Some(outbound),
            ..Self::new(session)
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// True when backed by a live connection.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn assigns(&self) -> &JsonValue {
        &self.assigns
    }

    pub fn assign(&mut self, assigns: JsonValue) {
        self.assigns = assigns;
    }

    /// Attach a child, replacing any child with the same id.
    pub fn attach_child(&mut self, child: Child) -> Option<Child> {
        let replaced = self.children.insert(child.id().to_string(), child);
        if replaced.is_some() {
            debug!(socket = %self.id, "replaced existing child");
        }
        replaced
    }

    pub fn child(&self, id: &str) -> Option<&Child> {
        self.children.get(id)
    }

    pub fn child_mut(&mut self, id: &str) -> Option<&mut Child> {
        self.children.get_mut(id)
    }

    pub fn children(&self) -> &IndexMap<String, Child> {
        &self.children
    }

    /// The snapshot the client is known to display.
    pub fn latest_render(&self) -> Option<&Node> {
        self.render.as_ref()
    }

    /// Set the snapshot the next render is diffed against.
    pub(crate) fn set_baseline(&mut self, render: Option<Node>) {
        self.render = render;
    }

    /// Diff a fresh render against the stored snapshot, send the result to a
    /// connected client and store the render.
    ///
    /// The snapshot is only replaced once the result is queued; on error the
    /// client is out of sync and the connection must be dropped.
    pub fn update_render(&mut self, render: Node) -> Result<Diff, LiveError> {
        let result = diff(self.render.as_ref(), &render);
        match &result {
            Diff::Patch(ops) if !ops.is_empty() => {
                self.send(EVENT_PATCH, serde_json::to_value(ops)?, None)?;
            }
            Diff::Full(html) if self.connected => {
                self.send(EVENT_RENDER, JsonValue::String(html.clone()), None)?;
            }
            _ => {}
        }
        self.render = Some(render);
        Ok(result)
    }

    /// Queue an event for the client.
    pub fn send(&self, t: &str, data: JsonValue, id: Option<u64>) -> Result<(), LiveError> {
        match &self.outbound {
            Some(outbound) => outbound.push(Event::new(t, data).with_id(id)),
            None => {
                debug!(socket = %self.id, event = t, "dropping message on disconnected socket");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::diff::PatchOp;
    use serde_json::json;

    fn counter(count: i64) -> Node {
        Node::element("div").child(Node::text(count.to_string()))
    }

    fn connected(capacity: usize) -> (Socket, async_channel::Receiver<Event>, Arc<Notify>) {
        let (tx, rx) = async_channel::bounded(capacity);
        let slow = Arc::new(Notify::new());
        let socket = Socket::connected(Session::new(), Outbound::new(tx, slow.clone()));
        (socket, rx, slow)
    }

    #[test]
    fn test_first_render_is_full() {
        let mut socket = Socket::new(Session::new());
        assert!(!socket.is_connected());
        let result = socket.update_render(counter(0)).unwrap();
        assert_eq!(result, Diff::Full("<div>0</div>".into()));
        assert_eq!(socket.latest_render(), Some(&counter(0)));
    }

    #[test]
    fn test_connected_socket_queues_patch() {
        let (mut socket, rx, _) = connected(4);
        socket.set_baseline(Some(counter(0)));
        socket.update_render(counter(1)).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.t, EVENT_PATCH);
        let ops: Vec<PatchOp> = serde_json::from_value(event.data).unwrap();
        assert_eq!(
            ops,
            vec![PatchOp::ReplaceText {
                path: vec![0],
                text: "1".into()
            }]
        );
    }

    #[test]
    fn test_unchanged_render_sends_nothing() {
        let (mut socket, rx, _) = connected(4);
        socket.set_baseline(Some(counter(3)));
        assert!(socket.update_render(counter(3)).unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connected_without_baseline_sends_full_render() {
        let (mut socket, rx, _) = connected(4);
        socket.update_render(counter(2)).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.t, EVENT_RENDER);
        assert_eq!(event.data, json!("<div>2</div>"));
    }

    #[tokio::test]
    async fn test_full_queue_is_too_slow() {
        let (socket, _rx, slow) = connected(1);
        socket.send("a", JsonValue::Null, None).unwrap();
        let err = socket.send("b", JsonValue::Null, None).unwrap_err();
        assert!(matches!(err, LiveError::TooSlow));
        // The permit stored by notify_one is observed immediately.
        tokio::time::timeout(std::time::Duration::from_secs(1), slow.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_failed_send_keeps_previous_snapshot() {
        let (mut socket, rx, _) = connected(1);
        socket.set_baseline(Some(counter(0)));
        socket.send("filler", JsonValue::Null, None).unwrap();
        assert!(socket.update_render(counter(1)).is_err());
        assert_eq!(socket.latest_render(), Some(&counter(0)));
        drop(rx);
    }

    #[test]
    fn test_closed_queue() {
        let (socket, rx, _) = connected(1);
        drop(rx);
        let err = socket.send("a", JsonValue::Null, None).unwrap_err();
        assert!(matches!(err, LiveError::SendClosed));
    }

    #[test]
    fn test_attach_child_replaces_same_id() {
        let mut socket = Socket::new(Session::new());
        assert!(socket.attach_child(Child::new("a", json!(1))).is_none());
        let previous = socket.attach_child(Child::new("a", json!(2))).unwrap();
        assert_eq!(previous.state(), &json!(1));
        assert_eq!(socket.children().len(), 1);
        assert_eq!(socket.child("a").unwrap().state(), &json!(2));
    }
}
