//! Broker client for public tunnel endpoint assignments.
//!
//! The broker is the HTTP/JSON service that hands out tunnel endpoints: given
//! a requested subdomain (or the `?new` sentinel for a random one) it returns
//! the public URL, the remote port relay sessions must dial, and how many
//! parallel sessions the server will accept.

pub mod assignment;
pub mod client;

pub use assignment::Assignment;
pub use client::{AssignmentSource, BrokerClient, BrokerError};
