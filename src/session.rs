//! Per-connection session handler.
//!
//! A session reads bytes, frames them into lines, dispatches each command
//! and writes exactly one response per command, in order. `QUIT` is
//! handled here for every backend: it is acknowledged, the server is
//! signaled to shut down, and the connection is closed.
//!
//! Dispatcher calls run on tokio's blocking pool. A long backend call on
//! one connection does not stall the others, and a panicking dispatcher
//! turns into an error response instead of a dead session.

use crate::command::{After, Command, Response};
use crate::dispatcher::Dispatcher;
use crate::framer::LineFramer;
use crate::server::ShutdownHandle;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 1024;

/// Whether the read loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Close,
}

/// One client connection and its framing state.
pub struct Session<S> {
    stream: S,
    peer: String,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: ShutdownHandle,
    framer: LineFramer,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
        shutdown: ShutdownHandle,
        max_line_length: usize,
    ) -> Self {
        Self {
            stream,
            peer: peer.into(),
            dispatcher,
            shutdown,
            framer: LineFramer::new(max_line_length),
        }
    }

    /// Serve the connection until the peer disconnects, a command ends the
    /// session, or the server shuts down.
    pub async fn run(mut self) -> io::Result<()> {
        info!(peer = %self.peer, "Client connected");

        let result = self.read_loop().await;
        if result.is_ok() {
            // Best effort; the peer may already be gone.
            let _ = self.stream.shutdown().await;
        }

        info!(peer = %self.peer, "Client disconnected");
        result
    }

    async fn read_loop(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; BUFFER_SIZE];

        loop {
            // Answer everything already buffered before reading again.
            while let Some(frame) = self.framer.next() {
                match frame {
                    Ok(line) => {
                        if self.handle_line(&line).await? == Step::Close {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(peer = %self.peer, error = %e, "Dropping line"),
                }
            }

            let n = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(peer = %self.peer, "Closing session on server shutdown");
                    return Ok(());
                }
                n = self.stream.read(&mut chunk) => n?,
            };

            if n == 0 {
                trace!(
                    peer = %self.peer,
                    pending = self.framer.buffered(),
                    "Connection closed by client"
                );
                if let Some(frame) = self.framer.finish() {
                    match frame {
                        Ok(line) => {
                            self.handle_line(&line).await?;
                        }
                        Err(e) => warn!(peer = %self.peer, error = %e, "Dropping line"),
                    }
                }
                return Ok(());
            }

            self.framer.extend(&chunk[..n]);
        }
    }

    async fn handle_line(&mut self, line: &str) -> io::Result<Step> {
        let Some(command) = Command::parse(line) else {
            return Ok(Step::Continue);
        };
        trace!(peer = %self.peer, command = %command.name, args = ?command.args, "Processing command");

        if command.is_quit() {
            self.write_response(&Response::quit()).await?;
            info!(peer = %self.peer, "Quit received, shutting down server");
            self.shutdown.shutdown();
            return Ok(Step::Close);
        }

        let name = command.name.clone();
        let response = self.dispatch(command).await;
        trace!(peer = %self.peer, command = %name, ok = response.is_ok(), "Command processed");
        self.write_response(&response).await?;

        match response.after {
            After::Continue => Ok(Step::Continue),
            After::Shutdown => {
                info!(peer = %self.peer, "Backend requested shutdown");
                self.shutdown.shutdown();
                Ok(Step::Close)
            }
        }
    }

    /// Run the dispatcher off the async workers and contain panics.
    async fn dispatch(&self, command: Command) -> Response {
        let dispatcher = Arc::clone(&self.dispatcher);
        let name = command.name.clone();

        let task =
            tokio::task::spawn_blocking(move || dispatcher.process(&command.name, &command.args));

        match task.await {
            Ok(response) => response,
            Err(e) => {
                warn!(peer = %self.peer, command = %name, error = %e, "Dispatcher failed");
                Response::internal_error()
            }
        }
    }

    async fn write_response(&mut self, response: &Response) -> io::Result<()> {
        self.stream.write_all(&response.encode()).await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::echo::EchoDispatcher;
    use crate::framer::DEFAULT_MAX_LINE_LENGTH;
    use tokio_test::io::Builder;

    struct Panicky;

    impl Dispatcher for Panicky {
        fn process(&self, name: &str, _args: &[String]) -> Response {
            if name == "BOOM" {
                panic!("backend bug");
            }
            Response::ok(name.to_ascii_lowercase())
        }
    }

    struct Killer;

    impl Dispatcher for Killer {
        fn process(&self, name: &str, _args: &[String]) -> Response {
            match name {
                "KILL" => Response::ok("kill").then_shutdown(),
                _ => Response::unknown_command(name),
            }
        }
    }

    fn session<S>(stream: S, dispatcher: Arc<dyn Dispatcher>) -> (Session<S>, ShutdownHandle)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let shutdown = ShutdownHandle::new();
        let session = Session::new(
            stream,
            "test",
            dispatcher,
            shutdown.clone(),
            DEFAULT_MAX_LINE_LENGTH,
        );
        (session, shutdown)
    }

    #[tokio::test]
    async fn test_split_read_reassembled() {
        let mock = Builder::new()
            .read(b"FRA")
            .read(b"ME 3\n")
            .write(b"FRAME 3\n")
            .build();
        let (session, _) = session(mock, Arc::new(EchoDispatcher));
        session.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_lines_produce_no_response() {
        let mock = Builder::new()
            .read(b"\n\n\nSTATUS\n")
            .write(b"STATUS\n")
            .build();
        let (session, _) = session(mock, Arc::new(EchoDispatcher));
        session.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_responses_in_order() {
        let mock = Builder::new()
            .read(b"one a\ntwo b\r\nthree\n")
            .write(b"ONE A\n")
            .write(b"TWO B\n")
            .write(b"THREE\n")
            .build();
        let (session, _) = session(mock, Arc::new(EchoDispatcher));
        session.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_acknowledged_and_signals_shutdown() {
        // Nothing after QUIT is answered.
        let mock = Builder::new()
            .read(b"Quit\nFRAME\n")
            .write(b"OK quit\n")
            .build();
        let (session, shutdown) = session(mock, Arc::new(EchoDispatcher));
        session.run().await.unwrap();
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_dispatcher_panic_keeps_session_alive() {
        let mock = Builder::new()
            .read(b"BOOM\n")
            .write(b"ERROR:100 internal_error\n")
            .read(b"status\n")
            .write(b"OK status\n")
            .build();
        let (session, shutdown) = session(mock, Arc::new(Panicky));
        session.run().await.unwrap();
        assert!(!shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_backend_shutdown_response() {
        let mock = Builder::new()
            .read(b"NOPE\nKILL\nNOPE\n")
            .write(b"ERROR:101 NOPE unknown_command\n")
            .write(b"OK kill\n")
            .build();
        let (session, shutdown) = session(mock, Arc::new(Killer));
        session.run().await.unwrap();
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_non_ascii_line_dropped() {
        let mock = Builder::new()
            .read(b"caf\xc3\xa9\nok\n")
            .write(b"OK\n")
            .build();
        let (session, _) = session(mock, Arc::new(EchoDispatcher));
        session.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_tail_answered_on_eof() {
        let mock = Builder::new().read(b"frame 2").write(b"FRAME 2\n").build();
        let (session, _) = session(mock, Arc::new(EchoDispatcher));
        session.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_closes_when_already_shut_down() {
        let mock = Builder::new().build();
        let (session, shutdown) = session(mock, Arc::new(EchoDispatcher));
        shutdown.shutdown();
        session.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_error_keeps_detector_usable() {
        use crate::backends::detector::{DetectorServer, SimulatedDetector};

        let mock = Builder::new()
            .read(b"ACQUIRE 1 1e19\nIS_RUNNING\n")
            .write(b"ERROR:102 acquire\n")
            .write(b"OK is_running 0\n")
            .build();
        let detector = DetectorServer::new(Arc::new(SimulatedDetector::new(4, 2)));
        let (session, _) = session(mock, Arc::new(detector));
        session.run().await.unwrap();
    }
}
