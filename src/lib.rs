//! Liveview: server-rendered pages kept live over a WebSocket.
//!
//! A page is first served as plain HTML. When the browser opens a WebSocket
//! on the same URL the page becomes live: client events run server-side
//! handlers, the page is re-rendered and only the differences are sent back.
//!
//! # Layers
//!
//! - [`live`]: handlers, sockets, the render tree and the diff engine
//! - [`serve`]: HTTP and WebSocket transport built on hyper
//! - [`session`]: per-browser sessions kept in signed cookies

// Allow some clippy lints that are stylistic and not critical
#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod error;
pub mod live;
pub mod serve;
pub mod session;

pub use error::{HandlerError, LiveError, SessionError};
pub use live::{Child, Diff, Event, Handler, HandlerConfig, Node, Params, PatchOp, Socket};
pub use serve::{LiveConfig, LiveService};
pub use session::{CookieStore, Session, SessionStore};
