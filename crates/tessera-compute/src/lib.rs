//! # Tessera Compute
//!
//! Communication layer for the Tessera framework. This crate provides a
//! [`Transport`](transport::Transport) trait that isolates the distributed
//! linear-algebra code from how ranks are connected, and a typed
//! [`Communicator`](comm::Communicator) with the collectives that code needs.
//!
//! ## Available transports
//!
//! | Transport | Status |
//! |-----------|--------|
//! | Local (threads, `parking_lot` mailbox) | Implemented |
//! | MPI | Not shipped; implement [`Transport`] |

pub mod comm;
pub mod local;
pub mod transport;

pub use comm::Communicator;
pub use local::{LocalCluster, LocalTransport};
pub use transport::{CommError, SplitResult, Transport, TransportInfo, TransportKind};
