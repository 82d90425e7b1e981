//! Liveview demo server: a live counter page.

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use liveview::live::{with_event, with_mount, with_params, with_render, with_self, Handler, Node};
use liveview::serve::constants::DEFAULT_ADDR;
use liveview::session::SESSION_COOKIE;
use liveview::{CookieStore, HandlerError, LiveConfig, LiveService};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI command to execute.
enum Command {
    /// Serve the demo page
    Serve {
        addr: String,
        env_file: Option<String>,
    },
    Help,
}

fn print_usage() {
    eprintln!("Liveview {} - live counter demo", VERSION);
    eprintln!();
    eprintln!("Usage: liveview-demo [--addr HOST:PORT] [--env FILE]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --addr HOST:PORT  Listen address (default: {}, or LIVE_ADDR)", DEFAULT_ADDR);
    eprintln!("  --env FILE        Read LIVE_* settings from a .env file");
    eprintln!("  -h, --help        Show this help");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  LIVE_SECRET       Cookie signing key");
    eprintln!("  RUST_LOG          Log filter (default: info)");
}

fn parse_args() -> Command {
    let mut addr = env::var("LIVE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let mut env_file = None;
    let mut args = env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Command::Help,
            "--addr" => match args.next() {
                Some(value) => addr = value,
                None => {
                    eprintln!("Error: --addr requires a value");
                    process::exit(64);
                }
            },
            "--env" => match args.next() {
                Some(value) => env_file = Some(value),
                None => {
                    eprintln!("Error: --env requires a file");
                    process::exit(64);
                }
            },
            other => {
                eprintln!("Error: unknown argument '{}'", other);
                print_usage();
                process::exit(64);
            }
        }
    }

    Command::Serve { addr, env_file }
}

fn counter_handler() -> Result<Handler, liveview::LiveError> {
    Handler::new([
        with_mount(|_| Ok(json!({"count": 0}))),
        with_params(|socket, params| {
            let mut assigns = socket.assigns().clone();
            if let Some(start) = params.get_int("start") {
                assigns["count"] = json!(start);
            }
            Ok(assigns)
        }),
        with_event("inc", |socket, _| step(socket.assigns(), 1)),
        with_event("dec", |socket, _| step(socket.assigns(), -1)),
        with_self("reset", |_, _| Ok(json!({"count": 0}))),
        with_render(|ctx| {
            let count = ctx.assigns["count"].as_i64().unwrap_or(0);
            Ok(Node::element("main")
                .child(Node::element("h1").child(Node::text("Counter")))
                .child(
                    Node::element("output")
                        .attr("id", "count")
                        .child(Node::text(count.to_string())),
                )
                .child(button("dec", "-"))
                .child(button("inc", "+")))
        }),
    ])
}

fn button(event: &str, label: &str) -> Node {
    Node::element("button")
        .attr("live-click", event)
        .child(Node::text(label))
}

fn step(assigns: &serde_json::Value, by: i64) -> Result<serde_json::Value, HandlerError> {
    let count = assigns["count"].as_i64().ok_or("count is not a number")?;
    Ok(json!({"count": count + by}))
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (addr, env_file) = match parse_args() {
        Command::Help => {
            print_usage();
            return;
        }
        Command::Serve { addr, env_file } => (addr, env_file),
    };

    let config = match env_file {
        Some(path) => LiveConfig::from_env_file(Path::new(&path)),
        None => LiveConfig::from_env(),
    };
    let config = config.unwrap_or_else(|e| {
        error!(error = %e, "bad configuration");
        process::exit(78);
    });

    let handler = counter_handler().unwrap_or_else(|e| {
        error!(error = %e, "bad handler configuration");
        process::exit(78);
    });
    let handler = Arc::new(handler);

    let secret = env::var("LIVE_SECRET").unwrap_or_else(|_| {
        info!("LIVE_SECRET not set, using a random signing key");
        uuid::Uuid::new_v4().to_string()
    });
    let store = Arc::new(CookieStore::new(SESSION_COOKIE, secret.into_bytes()));
    let service = match LiveService::new(handler.clone(), store, config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!(error = %e, "bad configuration");
            process::exit(78);
        }
    };

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "cannot bind");
            process::exit(1);
        }
    };

    let shutdown = handler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.shutdown();
        }
    });

    if let Err(e) = liveview::serve::serve(listener, service).await {
        error!(error = %e, "server failed");
        process::exit(1);
    }
}
