//! Listener lifecycle: serve a router until told to stop, then drain.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running HTTP listener.
pub struct ServerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

/// Bind `addr` and serve `router` on it in the background.
pub async fn bind(name: &'static str, addr: &str, router: Router) -> Result<ServerHandle> {
    let listen_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {name} listen address {addr:?}"))?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {name} listener on {listen_addr}"))?;
    start(name, listener, router)
}

/// Serve `router` on an already bound `listener`.
pub fn start(name: &'static str, listener: TcpListener, router: Router) -> Result<ServerHandle> {
    let local_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    let (shutdown, rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
    });

    info!(server = name, %local_addr, "listening");
    Ok(ServerHandle {
        name,
        local_addr,
        shutdown,
        task,
    })
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait up to `grace` for in-flight
    /// requests to finish.  After that the server task is aborted.
    pub async fn stop(self, grace: Duration) -> Result<()> {
        let ServerHandle {
            name,
            shutdown,
            mut task,
            ..
        } = self;
        let _ = shutdown.send(());

        match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => {
                joined
                    .with_context(|| format!("{name} server task panicked"))?
                    .with_context(|| format!("{name} server error"))?;
                info!(server = name, "stopped");
            }
            Err(_) => {
                warn!(server = name, ?grace, "forced shutdown");
                task.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;
    use crate::health::{PROCESSED_BY_HEADER, heartbeat_handler};

    #[tokio::test]
    async fn serves_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = Router::new().route("/lancache-heartbeat", get(heartbeat_handler));
        let handle = start("test", listener, router).unwrap();
        let url = format!("http://{}/lancache-heartbeat", handle.local_addr());

        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()[PROCESSED_BY_HEADER], "lancache");

        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(reqwest::get(&url).await.is_err());
    }

    #[tokio::test]
    async fn bind_rejects_bad_address() {
        let err = bind("test", "not an address", Router::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid test listen address"), "{err}");
    }
}
