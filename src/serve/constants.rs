/// Protocol and server constants
use std::time::Duration;

/// Per-write timeout on a live connection, including the connect ack
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound message queue capacity per socket (bounded for backpressure)
pub const OUTBOUND_CAPACITY: usize = 32;

/// Queued error event capacity per socket
pub const ERROR_CAPACITY: usize = 16;

/// Self event inbox capacity per socket
pub const INBOX_CAPACITY: usize = 32;

/// Number of first-paint snapshots kept for connecting sockets
pub const FIRST_PAINT_CACHE: usize = 1024;

/// Query parameter marking a session repair redirect
pub const REPAIR_PARAM: &str = "live-repair";

/// Attribute on a first paint's root element naming its snapshot. The client
/// sends it back as a query parameter of the same name when it connects.
pub const RENDER_ATTR: &str = "live-render";

/// Path answered with 404 when favicon requests are ignored
pub const FAVICON_PATH: &str = "/favicon.ico";

/// Close reason sent when a client cannot keep up
pub const TOO_SLOW_REASON: &str = "socket too slow to keep up with messages";

/// Default listen address for the demo server
pub const DEFAULT_ADDR: &str = "127.0.0.1:3000";
