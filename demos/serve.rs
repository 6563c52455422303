//! A standalone server binary wiring `whisp::Connection` to a `TcpListener`
//! and a couple of registered apps, loading the host key from disk.
//!
//! Grounded on `examples/examples/server.rs`'s `async_std::main` +
//! `TcpListener::bind` + per-connection `task::spawn` shape, with the
//! teacher's layered `Session::new(...).add_layer(Auth::new(...))` replaced
//! by constructing a `whisp::Connection` directly — there is no layer stack
//! left to add to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_std::net::{TcpListener, TcpStream};
use async_std::stream::StreamExt;
use async_std::task;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_async_std::Signals;

use whisp::auth::AcceptAll;
use whisp::{Config, Connection, HostKeyStore, Registry};

/// A `whisp` server binary.
#[derive(Debug, Parser)]
struct Args {
    /// The port to bind with the listener on `0.0.0.0`.
    #[arg(short, long, default_value_t = 2222)]
    port: u16,

    /// Directory holding (or to generate) this server's persisted host key.
    #[arg(long, default_value = "whisp")]
    host_key_name: String,
}

fn build_registry() -> Registry {
    let mut registry = Registry::new();

    // These bindings are illustrative; real deployments register their own
    // apps here, or build `Registry` from a config file instead.
    let _ = registry.register("default", "/usr/local/bin/whisp-welcome");
    let _ = registry.register("guestbook", "/usr/local/bin/whisp-guestbook");
    let _ = registry.register("chat-{room}", "/usr/local/bin/whisp-chat");

    registry
}

async fn serve(
    stream: TcpStream,
    addr: async_std::net::SocketAddr,
    config: Arc<Config>,
    shutdown: Arc<AtomicBool>,
) {
    let connection_id = format!("{:x}", rand::random::<u64>());

    let connection = match Connection::new(stream, config, addr.to_string(), connection_id).await {
        Ok(connection) => connection.with_shutdown(shutdown),
        Err(err) => {
            tracing::warn!(%addr, %err, "failed to establish connection");
            return;
        }
    };

    if let Err(err) = connection.run().await {
        tracing::info!(%addr, %err, "connection ended");
    }
}

#[async_std::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let host_key_dir = HostKeyStore::default_dir(&args.host_key_name)
        .expect("failed to resolve the host key directory");
    let host_key = HostKeyStore::new(host_key_dir)
        .load_or_generate()
        .expect("failed to load or generate the host key");

    let config = Arc::new(Config {
        host_key,
        registry: build_registry(),
        auth_policy: Arc::new(AcceptAll),
        inactivity_limit: Duration::from_secs(120),
        ..Config::default()
    });

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    tracing::info!(port = args.port, "whisp listening");

    // `spec.md` §6: the embedding program forwards SIGINT/SIGTERM as a
    // graceful-shutdown request. Every worker in flight observes the same
    // flag and unwinds with a `DISCONNECT` at its next loop iteration
    // (`spec.md` §5); the accept loop itself stops taking new connections.
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let shutdown_for_signals = Arc::clone(&shutdown);
    task::spawn(async move {
        if let Some(signal) = signals.next().await {
            tracing::info!(signal, "received shutdown signal");
            shutdown_for_signals.store(true, Ordering::Relaxed);
        }
    });

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let accepted = async_std::future::timeout(Duration::from_millis(200), listener.accept()).await;

        let (stream, addr) = match accepted {
            Ok(result) => result?,
            Err(_elapsed) => continue,
        };

        let config = Arc::clone(&config);
        let shutdown = Arc::clone(&shutdown);

        task::spawn(serve(stream, addr, config, shutdown));
    }

    signals_handle.close();
    tracing::info!("whisp shutting down");

    Ok(())
}
