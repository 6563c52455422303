//! Shared test-server bootstrap, grounded on `tests/common/mod.rs`'s
//! bind-then-spawn shape, adapted from the teacher's single-recv `Session`
//! to handing off an accepted socket straight to `whisp::Connection`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_std::net::TcpListener;
use async_std::stream::StreamExt;
use async_std::task::JoinHandle;

use whisp::{Config, Connection, Result};

/// Bind on an ephemeral port and run exactly one accepted connection to
/// completion, returning its address and a handle to join on the result.
pub async fn server(config: Config) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let socket = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = socket.local_addr()?;
    let config = Arc::new(config);

    let handle = async_std::task::spawn(async move {
        let stream = socket.incoming().next().await.unwrap()?;

        let connection = Connection::new(stream, config, "127.0.0.1:0", "test-connection").await?;
        connection.run().await
    });

    Ok((addr, handle))
}
