//! LiveView - Real-time server-rendered views synchronized over WebSocket.
//!
//! A [`Handler`] holds the application's mount, render and event handlers.
//! Each request or connection gets its own [`Socket`]; every render produces a
//! fresh [`Node`] tree which is diffed against the previous one so only patch
//! operations travel to the client.

pub mod child;
pub mod diff;
pub mod event;
pub mod handler;
pub mod registry;
pub mod render;
pub mod socket;
pub mod tree;

pub use child::Child;
pub use diff::{apply_patch, diff, Diff, PatchOp};
pub use event::{ErrorEvent, Event, Params};
pub use handler::{
    with_error, with_event, with_ignore_favicon, with_mount, with_params, with_render, with_self,
    with_unmount, Handler, HandlerConfig,
};
pub use registry::LiveRegistry;
pub use render::{render_socket, RenderContext};
pub use socket::{Socket, SocketId};
pub use tree::{Element, Node, KEY_ATTR};
