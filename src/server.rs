//! TCP server shell.
//!
//! Binds the listener, accepts connections and runs one [`Session`] per
//! connection. Shutdown is a cancellation signal: any session (or the
//! operator) may raise it without waiting, and the accept loop selects on
//! it. After serving stops, [`Server::close`] drains in-flight sessions
//! and closes the backend.

use crate::config::{ServerConfig, SessionMode};
use crate::dispatcher::Dispatcher;
use crate::session::Session;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept loop failed: {0}")]
    Accept(#[source] io::Error),
}

/// Cloneable, idempotent shutdown signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Never blocks; repeated calls are no-ops.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: ShutdownHandle,
    mode: SessionMode,
    max_line_length: usize,
    drain_timeout: Duration,
    connection_limit: Arc<Semaphore>,
    sessions: JoinSet<()>,
}

impl Server {
    /// Bind the listener. Failure is fatal to the caller; there is no retry.
    ///
    /// Must be called within a tokio runtime.
    pub fn bind(config: &ServerConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self, ServerError> {
        let addr = config.listen;
        let listener = create_listener(addr, config.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(address = %local_addr, mode = ?config.mode, "Server listening");

        Ok(Server {
            listener,
            local_addr,
            dispatcher,
            shutdown: ShutdownHandle::new(),
            mode: config.mode,
            max_line_length: config.max_line_length,
            drain_timeout: config.drain_timeout,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            sessions: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is signaled.
    pub async fn serve(&mut self) -> Result<(), ServerError> {
        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Accept loop failed");
                        return Err(ServerError::Accept(e));
                    }
                },
            };

            let session = self.session(stream, peer);
            match self.mode {
                SessionMode::Threaded => {
                    self.sessions.spawn(async move {
                        if let Err(e) = session.run().await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                SessionMode::Serial => {
                    if let Err(e) = session.run().await {
                        debug!(peer = %peer, error = %e, "Connection error");
                    }
                    drop(permit);
                }
            }

            // Reap finished sessions so the set does not grow unbounded.
            while self.sessions.try_join_next().is_some() {}
        }

        info!("Server shutting down");
        Ok(())
    }

    /// Drain sessions, release the listener and close the backend.
    pub async fn close(mut self) {
        self.shutdown.shutdown();

        let active = self.sessions.len();
        if active > 0 {
            debug!(active, "Waiting for sessions to finish");
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while self.sessions.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = self.sessions.len(),
                    "Sessions did not finish in time, aborting"
                );
                self.sessions.shutdown().await;
            }
        }

        drop(self.listener);

        // Backend close may block on device I/O.
        let dispatcher = Arc::clone(&self.dispatcher);
        if let Err(e) = tokio::task::spawn_blocking(move || dispatcher.close()).await {
            warn!(error = %e, "Backend close failed");
        }
        info!("Server closed");
    }

    /// Serve, then close. Close always runs, even if serving failed.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let result = self.serve().await;
        self.close().await;
        result
    }

    fn session(&self, stream: TcpStream, peer: SocketAddr) -> Session<TcpStream> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        Session::new(
            stream,
            peer.to_string(),
            Arc::clone(&self.dispatcher),
            self.shutdown.clone(),
            self.max_line_length,
        )
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Accept errors that affect only the incoming connection.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(24) // EMFILE
}
