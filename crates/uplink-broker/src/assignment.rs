//! Assignment metadata returned by the broker.

use serde::Deserialize;

/// Broker-issued metadata describing the public endpoint and how many
/// parallel relay sessions the server will accept for it.
///
/// The broker may omit any field; absent fields decode to their zero values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Assignment {
    /// Identifier of the assignment (usually the subdomain).
    #[serde(default)]
    pub id: String,

    /// Public URL the tunnel is reachable at.
    #[serde(default)]
    pub url: String,

    /// Remote port relay sessions connect to.
    #[serde(default)]
    pub port: u16,

    /// Number of parallel relay sessions the server accepts.
    #[serde(default)]
    pub max_conn_count: usize,
}
