//! Front-door sockets.
//!
//! `listener` owns the bound socket: backlog, accept, and a cap on open
//! inbound connections. `connection` numbers accepted connections and lets
//! the server wait for the last one during a drain.

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
