//! Connection pool: owns the assignment and the relay sessions for one
//! tunnel run.
//!
//! The pool is driven through a fixed sequence: `bind_assignment`, then
//! `bind_local_target`, then `run`. Each operation is valid in exactly one
//! lifecycle state and fails fast with [`PoolError::Sequence`] otherwise. A
//! pool is one-shot: after `run` returns the pool is terminal and recovery
//! means building a fresh one.

use crate::proxy::ProxyDialer;
use crate::session::RelaySession;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uplink_broker::{Assignment, AssignmentSource, BrokerError};

/// Pool errors. Everything here is fatal for the current run.
#[derive(Debug, Error)]
pub enum PoolError {
    /// An operation was called out of its bind -> bind -> run order.
    #[error("{operation} is not valid in the {state} state")]
    Sequence {
        operation: &'static str,
        state: &'static str,
    },

    /// The broker could not supply an assignment.
    #[error("assignment fetch failed: {0}")]
    Assignment(#[from] BrokerError),

    /// The local target refused the eager reachability probe.
    #[error("local target {address} unreachable: {source}")]
    LocalUnreachable { address: String, source: io::Error },
}

/// Lifecycle of a pool. The assignment and local target live inside the
/// states that have them, so no operation can observe a half-bound pool.
enum PoolState {
    Created,
    AssignmentBound {
        assignment: Assignment,
    },
    TargetBound {
        assignment: Assignment,
        local: (String, u16),
    },
    Running,
    Stopped,
}

impl PoolState {
    fn name(&self) -> &'static str {
        match self {
            PoolState::Created => "created",
            PoolState::AssignmentBound { .. } => "assignment-bound",
            PoolState::TargetBound { .. } => "target-bound",
            PoolState::Running => "running",
            PoolState::Stopped => "stopped",
        }
    }
}

/// Cloneable handle that stops a pool whose `run` is being awaited
/// elsewhere (typically from a signal handler).
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
}

impl StopHandle {
    /// Raise the stop flag. Idempotent; re-raising has no further effect.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Outcome of one pool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Sessions that reported a completion marker before the wait ended.
    pub completed: usize,
    /// Whether the wait ended on the stop flag instead of full completion.
    pub stopped: bool,
}

/// Owns one tunnel run: the assignment, the local target and up to
/// `max_conn_count` concurrent relay sessions.
pub struct SessionPool {
    broker: Arc<dyn AssignmentSource>,
    remote_host: String,
    dialer: ProxyDialer,
    state: PoolState,
    cancel: CancellationToken,
}

impl SessionPool {
    /// `remote_host` is the host every session dials, normally the broker
    /// URL's host (`BrokerClient::remote_host`).
    pub fn new(
        broker: Arc<dyn AssignmentSource>,
        remote_host: &str,
        dialer: ProxyDialer,
    ) -> Self {
        Self {
            broker,
            remote_host: remote_host.to_string(),
            dialer,
            state: PoolState::Created,
            cancel: CancellationToken::new(),
        }
    }

    /// Fetch and bind the assignment for `subdomain` (empty requests a new
    /// random one). Returns the public URL.
    pub async fn bind_assignment(&mut self, subdomain: &str) -> Result<String, PoolError> {
        if !matches!(self.state, PoolState::Created) {
            return Err(PoolError::Sequence {
                operation: "bind_assignment",
                state: self.state.name(),
            });
        }

        let assignment = self.broker.request(subdomain).await?;
        info!(
            id = %assignment.id,
            url = %assignment.url,
            port = assignment.port,
            max_conn_count = assignment.max_conn_count,
            "assignment bound"
        );

        let url = assignment.url.clone();
        self.state = PoolState::AssignmentBound { assignment };
        Ok(url)
    }

    /// Probe the local target once, failing fast before any remote session
    /// is attempted. The probed connection is not held open.
    pub async fn bind_local_target(&mut self, host: &str, port: u16) -> Result<(), PoolError> {
        let assignment = match &self.state {
            PoolState::AssignmentBound { assignment } => assignment.clone(),
            other => {
                return Err(PoolError::Sequence {
                    operation: "bind_local_target",
                    state: other.name(),
                });
            }
        };

        let address = format!("{}:{}", host, port);
        match TcpStream::connect(&address).await {
            Ok(probe) => drop(probe),
            Err(source) => return Err(PoolError::LocalUnreachable { address, source }),
        }
        debug!(local = %address, "local target reachable");

        self.state = PoolState::TargetBound {
            assignment,
            local: (host.to_string(), port),
        };
        Ok(())
    }

    /// The bound assignment, if one is bound.
    pub fn assignment(&self) -> Option<&Assignment> {
        match &self.state {
            PoolState::AssignmentBound { assignment }
            | PoolState::TargetBound { assignment, .. } => Some(assignment),
            _ => None,
        }
    }

    /// Handle for stopping the pool while `run` is being awaited.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Raise the stop flag; every session observes it and closes its
    /// sockets. Idempotent, non-blocking.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Spawn exactly `max_conn_count` relay sessions and wait until every
    /// session has reported a completion marker, or until the stop flag is
    /// raised — whichever comes first. All session tasks are joined before
    /// this returns; no relay loop outlives the run.
    pub async fn run(&mut self) -> Result<RunSummary, PoolError> {
        let (assignment, (local_host, local_port)) = match &self.state {
            PoolState::TargetBound { assignment, local } => (assignment.clone(), local.clone()),
            other => {
                return Err(PoolError::Sequence {
                    operation: "run",
                    state: other.name(),
                });
            }
        };
        self.state = PoolState::Running;

        let max_conn_count = assignment.max_conn_count;
        let (completion_tx, mut completion_rx) = mpsc::channel(max_conn_count.max(1));
        let mut sessions = JoinSet::new();
        for n in 0..max_conn_count {
            let session = RelaySession::new(
                &self.remote_host,
                assignment.port,
                &local_host,
                local_port,
                self.dialer.clone(),
                self.cancel.child_token(),
            );
            debug!(session = n, remote_port = assignment.port, "starting relay session");
            sessions.spawn(session.run(completion_tx.clone()));
        }
        drop(completion_tx);

        let mut completed = 0;
        let mut stopped = false;
        while completed < max_conn_count {
            // Biased so a raised stop flag always ends the wait ahead of any
            // queued completion marker.
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!(completed, "stop flag raised, ending wait");
                    stopped = true;
                    break;
                }
                marker = completion_rx.recv() => match marker {
                    Some(Ok(())) => {
                        completed += 1;
                        debug!(completed, "session completed");
                    }
                    Some(Err(err)) => {
                        completed += 1;
                        warn!(completed, error = %err, "session failed");
                    }
                    // All senders gone; every marker has been counted.
                    None => break,
                },
            }
        }

        // Force the stragglers down and join every session task before
        // returning, so the caller never races a half-dead pool.
        self.cancel.cancel();
        while sessions.join_next().await.is_some() {}

        self.state = PoolState::Stopped;
        info!(completed, stopped, "pool run finished");
        Ok(RunSummary { completed, stopped })
    }
}
