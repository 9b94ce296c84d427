//! Error type definitions for the peers module.

use std::net::SocketAddr;

use thiserror::Error;

/// Peers errors under different operations
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PeersError {
    /// A host string could not be parsed into a peer address
    #[error("invalid endpoint `{endpoint}`")]
    InvalidEndpoint {
        /// The offending host and port
        endpoint: String,
    },
    /// An operation referenced an address the manager does not track
    #[error("unknown peer `{address}`")]
    UnknownPeer {
        /// The address that was not found
        address: SocketAddr,
    },
    /// The in-memory state or a loaded snapshot violates a structural invariant
    #[error("address book integrity violation: {reason}")]
    Integrity {
        /// Description of the violated invariant
        reason: String,
    },
}
