//! Connection-pool relay engine for the uplink tunnel client.
//!
//! The pool binds a broker assignment and a local target, then runs the
//! assigned number of parallel relay sessions. Each session pairs one
//! connection to the assigned remote endpoint (optionally through an HTTP
//! forward proxy via CONNECT) with a fresh connection to the local service
//! and copies bytes in both directions until either side fails or the pool
//! is stopped.
//!
//! A dropped session is not reconnected; recovery is a fresh pool run.

pub mod pool;
pub mod proxy;
pub mod session;

pub use pool::{PoolError, RunSummary, SessionPool, StopHandle};
pub use proxy::{DialError, ProxyConfig, ProxyDialer};
pub use session::{RelaySession, SessionError, SessionResult};
