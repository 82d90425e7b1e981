//! HTTP and WebSocket transport for live handlers.

pub mod config;
pub mod constants;
pub mod http;
pub mod websocket;

use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub use config::LiveConfig;
pub use http::LiveService;
pub use websocket::{serve_connection, Connect};

/// Accept connections until the service's handler is shut down.
pub async fn serve(listener: TcpListener, service: Arc<LiveService>) -> std::io::Result<()> {
    let shutdown = service.handler().connection_token();
    info!(addr = %listener.local_addr()?, "live server listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("live server stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let service = service.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let service = service.clone();
                async move { service.handle(req).await }
            });

            // with_upgrades() keeps the connection usable for WebSocket upgrades
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, svc)
                .with_upgrades()
                .await
            {
                debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}
