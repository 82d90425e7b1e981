//! Rendering a socket's state into a tree snapshot.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::error::LiveError;
use crate::live::child::Child;
use crate::live::handler::Handler;
use crate::live::socket::{Socket, SocketId};
use crate::live::tree::Node;

/// What a render handler sees: the socket's state, read-only.
pub struct RenderContext<'a> {
    pub socket_id: SocketId,
    pub assigns: &'a JsonValue,
    pub children: &'a IndexMap<String, Child>,
    pub connected: bool,
}

impl<'a> RenderContext<'a> {
    pub fn new(socket: &'a Socket) -> Self {
        Self {
            socket_id: socket.id(),
            assigns: socket.assigns(),
            children: socket.children(),
            connected: socket.is_connected(),
        }
    }

    pub fn child(&self, id: &str) -> Option<&'a Child> {
        self.children.get(id)
    }

    /// State of an attached child, or null.
    pub fn child_state(&self, id: &str) -> &'a JsonValue {
        static NULL: JsonValue = JsonValue::Null;
        self.children.get(id).map(Child::state).unwrap_or(&NULL)
    }
}

/// Render the socket's current state with the handler's render function.
///
/// The tree comes back normalized, so it lines up node for node with what a
/// browser builds from its HTML.
pub fn render_socket(handler: &Handler, socket: &Socket) -> Result<Node, LiveError> {
    handler.render(&RenderContext::new(socket)).map(Node::normalize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::diff::{apply_patch, diff, Diff, PatchOp};
    use crate::live::handler::{with_mount, with_render};
    use crate::session::Session;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn label_handler() -> Handler {
        Handler::new([
            with_mount(|_| Ok(json!({"label": ""}))),
            with_render(|ctx| {
                let label = ctx.assigns["label"].as_str().unwrap_or_default();
                Ok(Node::element("p")
                    .child(Node::text("Count: "))
                    .child(Node::text(label))
                    .child(Node::element("b")))
            }),
        ])
        .unwrap()
    }

    #[test]
    fn test_render_is_normalized() {
        let handler = label_handler();
        let mut socket = Socket::new(Session::new());
        handler.mount(&mut socket).unwrap();

        let tree = render_socket(&handler, &socket).unwrap();
        assert_eq!(tree.to_html(), "<p>Count: <b></b></p>");
        assert_eq!(tree.at(&[0]), Some(&Node::text("Count: ")));
        assert_eq!(tree.at(&[1]).and_then(Node::tag), Some("b"));
    }

    #[test]
    fn test_patches_address_the_parsed_page() {
        let handler = label_handler();
        let mut socket = Socket::new(Session::new());
        handler.mount(&mut socket).unwrap();
        let before = render_socket(&handler, &socket).unwrap();

        socket.assign(json!({"label": "7"}));
        let after = render_socket(&handler, &socket).unwrap();
        assert_eq!(after.to_html(), "<p>Count: 7<b></b></p>");

        let Diff::Patch(ops) = diff(Some(&before), &after) else {
            panic!("expected a patch");
        };
        assert_eq!(
            ops,
            vec![PatchOp::ReplaceText {
                path: vec![0],
                text: "Count: 7".into(),
            }]
        );
        let mut page = before;
        apply_patch(&mut page, &ops).unwrap();
        assert_eq!(page, after);
    }
}
