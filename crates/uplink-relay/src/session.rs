//! One relayed TCP pairing between the assigned remote endpoint and the
//! local service.
//!
//! A session dials both sides, then copies bytes in each direction until
//! that direction hits end-of-stream, an I/O error, or cancellation. The
//! session is terminal once closed; a dropped pairing is never redialed.

use crate::proxy::{DialError, ProxyDialer};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Copy buffer size for each relay direction.
const COPY_BUF_SIZE: usize = 16 * 1024;

/// Why a session ended unsuccessfully.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Remote dial (direct or proxied) failed.
    #[error(transparent)]
    Connect(#[from] DialError),

    /// Local service dial failed.
    #[error("connect to local {address} failed: {source}")]
    Local { address: String, source: io::Error },

    /// A relay direction hit an I/O error.
    #[error("relay {direction} failed: {source}")]
    Relay {
        direction: &'static str,
        source: io::Error,
    },

    /// The session was stopped before it finished connecting.
    #[error("session stopped before connecting")]
    Stopped,
}

/// Completion marker a session reports exactly once.
pub type SessionResult = Result<(), SessionError>;

/// One relayed pairing: a connection to the assigned remote endpoint and a
/// fresh connection to the local service.
pub struct RelaySession {
    remote_host: String,
    remote_port: u16,
    local_host: String,
    local_port: u16,
    dialer: ProxyDialer,
    cancel: CancellationToken,
}

impl RelaySession {
    pub fn new(
        remote_host: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
        dialer: ProxyDialer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote_host: remote_host.to_string(),
            remote_port,
            local_host: local_host.to_string(),
            local_port,
            dialer,
            cancel,
        }
    }

    /// Token that stops this session. Cancelling it is the only stop
    /// mechanism: it aborts an in-flight dial and unblocks both relay loops,
    /// whose dropped halves close the sockets. Idempotent.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Dial both sides and relay until both directions have terminated, then
    /// report exactly one completion marker on `completions`.
    pub async fn run(self, completions: mpsc::Sender<SessionResult>) {
        let remote = format!("{}:{}", self.remote_host, self.remote_port);
        let result = self.relay().await;
        match &result {
            Ok(()) => debug!(remote = %remote, "session completed"),
            Err(SessionError::Stopped) => debug!(remote = %remote, "session stopped before relaying"),
            Err(err) => warn!(remote = %remote, error = %err, "session failed"),
        }
        let _ = completions.send(result).await;
    }

    async fn relay(&self) -> SessionResult {
        let remote_address = format!("{}:{}", self.remote_host, self.remote_port);

        // Connecting: either dial aborts as soon as the session is stopped.
        let remote = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return Err(SessionError::Stopped),
            dialed = self.dialer.connect(&self.remote_host, self.remote_port) => dialed?,
        };
        debug!(remote = %remote_address, "remote connected");

        let local_address = format!("{}:{}", self.local_host, self.local_port);
        let local = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return Err(SessionError::Stopped),
            dialed = TcpStream::connect(&local_address) => {
                dialed.map_err(|source| SessionError::Local {
                    address: local_address.clone(),
                    source,
                })?
            }
        };
        debug!(local = %local_address, "local connected");

        // Relaying: both copy loops run on a join set owned by this session.
        // The first terminal error decides the session result, but the
        // sibling loop still runs to its own termination before the marker
        // is reported.
        let (remote_read, remote_write) = remote.into_split();
        let (local_read, local_write) = local.into_split();

        let mut loops = JoinSet::new();
        loops.spawn(copy_until_closed(
            local_read,
            remote_write,
            self.cancel.clone(),
            "local->remote",
        ));
        loops.spawn(copy_until_closed(
            remote_read,
            local_write,
            self.cancel.clone(),
            "remote->local",
        ));

        let mut result: SessionResult = Ok(());
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(join_err) => {
                    if result.is_ok() {
                        result = Err(SessionError::Relay {
                            direction: "relay loop",
                            source: io::Error::new(io::ErrorKind::Other, join_err),
                        });
                    }
                }
            }
        }
        result
    }
}

/// Copy bytes in one direction until end-of-stream, an I/O error, or
/// cancellation.
///
/// End-of-stream half-closes the write side so the peer observes the
/// shutdown while the opposite direction keeps relaying.
async fn copy_until_closed(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    cancel: CancellationToken,
    direction: &'static str,
) -> Result<(), SessionError> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    let result = loop {
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(direction, total_bytes = total, "relay cancelled");
                break Ok(());
            }
            read = from.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(direction, total_bytes = total, "relay saw end of stream");
                break Ok(());
            }
            Ok(n) => {
                if let Err(source) = to.write_all(&buf[..n]).await {
                    break Err(SessionError::Relay { direction, source });
                }
                total += n as u64;
            }
            Err(source) => break Err(SessionError::Relay { direction, source }),
        }
    };
    let _ = to.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    fn session_to(
        remote: std::net::SocketAddr,
        local: std::net::SocketAddr,
        cancel: CancellationToken,
    ) -> RelaySession {
        RelaySession::new(
            &remote.ip().to_string(),
            remote.port(),
            &local.ip().to_string(),
            local.port(),
            ProxyDialer::new(None),
            cancel,
        )
    }

    async fn recv_marker(rx: &mut mpsc::Receiver<SessionResult>) -> SessionResult {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no completion marker within timeout")
            .expect("completion channel closed without a marker")
    }

    #[tokio::test]
    async fn relays_bytes_in_both_directions() {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote_listener.local_addr().unwrap();
        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();

        // Local service: read a request, answer, close.
        tokio::spawn(async move {
            let (mut socket, _) = local_listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"request from remote");
            socket.write_all(b"reply from local").await.unwrap();
        });

        // Remote endpoint: send a request, expect the local reply back.
        let remote_task = tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            socket.write_all(b"request from remote").await.unwrap();
            let mut reply = Vec::new();
            socket.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let (tx, mut rx) = mpsc::channel(1);
        let session = session_to(remote_addr, local_addr, CancellationToken::new());
        tokio::spawn(session.run(tx));

        assert!(recv_marker(&mut rx).await.is_ok());
        assert_eq!(remote_task.await.unwrap(), b"reply from local");
    }

    #[tokio::test]
    async fn remote_dial_failure_reports_connect_error() {
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = gone.local_addr().unwrap();
        drop(gone);
        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let session = session_to(remote_addr, local_addr, CancellationToken::new());
        tokio::spawn(session.run(tx));

        let marker = recv_marker(&mut rx).await;
        assert!(matches!(marker, Err(SessionError::Connect(_))));
    }

    #[tokio::test]
    async fn local_dial_failure_reports_local_error() {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote_listener.local_addr().unwrap();
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = gone.local_addr().unwrap();
        drop(gone);

        tokio::spawn(async move {
            let _socket = remote_listener.accept().await;
        });

        let (tx, mut rx) = mpsc::channel(1);
        let session = session_to(remote_addr, local_addr, CancellationToken::new());
        tokio::spawn(session.run(tx));

        let marker = recv_marker(&mut rx).await;
        assert!(matches!(marker, Err(SessionError::Local { .. })));
    }

    #[tokio::test]
    async fn stop_before_connect_reports_stopped() {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote_listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, mut rx) = mpsc::channel(1);
        let session = session_to(remote_addr, remote_addr, cancel);
        tokio::spawn(session.run(tx));

        let marker = recv_marker(&mut rx).await;
        assert!(matches!(marker, Err(SessionError::Stopped)));
    }

    #[tokio::test]
    async fn stop_unblocks_a_relaying_session() {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote_listener.local_addr().unwrap();
        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();

        // Remote greets with one byte; the local peer waits for it, which
        // proves the copy loops are live before the stop flag is raised.
        let remote_held = tokio::spawn(async move {
            let (mut socket, _) = remote_listener.accept().await.unwrap();
            socket.write_all(b"x").await.unwrap();
            socket
        });
        let local_held = tokio::spawn(async move {
            let (mut socket, _) = local_listener.accept().await.unwrap();
            let mut byte = [0u8; 1];
            socket.read_exact(&mut byte).await.unwrap();
            assert_eq!(&byte, b"x");
            socket
        });

        let (tx, mut rx) = mpsc::channel(1);
        let session = session_to(remote_addr, local_addr, CancellationToken::new());
        let cancel = session.stop_token();
        tokio::spawn(session.run(tx));

        // Both loops are relaying and otherwise blocked; cancelling twice
        // must be harmless.
        let _remote_socket = remote_held.await.unwrap();
        let _local_socket = local_held.await.unwrap();
        cancel.cancel();
        cancel.cancel();

        // Caller-requested shutdown is not a session failure.
        assert!(recv_marker(&mut rx).await.is_ok());
    }

    #[tokio::test]
    async fn eof_on_one_side_completes_the_session() {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote_listener.local_addr().unwrap();
        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();

        // Remote closes straight away; local reads until the half-close
        // propagates, then closes too.
        tokio::spawn(async move {
            let (socket, _) = remote_listener.accept().await.unwrap();
            drop(socket);
        });
        tokio::spawn(async move {
            let (mut socket, _) = local_listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let _ = socket.read_to_end(&mut buf).await;
        });

        let (tx, mut rx) = mpsc::channel(1);
        let session = session_to(remote_addr, local_addr, CancellationToken::new());
        tokio::spawn(session.run(tx));

        assert!(recv_marker(&mut rx).await.is_ok());
    }
}
