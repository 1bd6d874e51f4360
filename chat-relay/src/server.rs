use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    config::RelayConfig,
    handler::{CloseReason, handle_connection},
    registry::Registry,
    session::SessionId,
};

/// State shared by every connection handler of one server.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    next_id: AtomicU64,
    stopping: AtomicBool,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.send_timeout);
        Self {
            config,
            registry,
            broadcaster,
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Token for a new connection; cancelled when the server shuts down.
    pub fn connection_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Closes every session and wakes every handler.
    ///
    /// The registry is drained first so handlers that wake up afterwards find
    /// nothing to deregister and stay quiet.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        let sessions = self.registry.drain();
        info!(sessions = sessions.len(), "relay shutting down");
        join_all(sessions.iter().map(|session| session.close())).await;
        self.shutdown.cancel();
    }
}

pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            relay: Arc::new(Relay::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// session and waits for all handlers to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, relay } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &relay, &mut connections);
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    log_handler_exit(finished);
                }
            }
        }

        drop(listener);
        relay.shutdown().await;
        while let Some(finished) = connections.join_next().await {
            log_handler_exit(finished);
        }
        info!("relay stopped");

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    relay: &Arc<Relay>,
    connections: &mut JoinSet<CloseReason>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, relay, connections),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    relay: &Arc<Relay>,
    connections: &mut JoinSet<CloseReason>,
) {
    debug!(%peer, "connection accepted");
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%peer, ?error, "failed to disable nagle");
    }

    let relay = Arc::clone(relay);
    connections.spawn(async move {
        let (reader, writer) = stream.into_split();
        handle_connection(reader, Box::new(writer), Some(peer), relay).await
    });
}

fn log_handler_exit(finished: Result<CloseReason, JoinError>) {
    match finished {
        Ok(reason) => debug!(?reason, "connection handler finished"),
        Err(error) => warn!(?error, "connection handler panicked"),
    }
}
