//! Multi-instance classical Paxos, embedded in an application.
//!
//! A fixed group of peers agrees on a sequence of opaque values, one
//! independent consensus instance per slot. The application picks slot
//! numbers and proposed values through [`Peer::start`], polls outcomes
//! with [`Peer::status`], and releases old slots with [`Peer::done`].
//! Nothing is stored durably; a restarted peer rejoins with empty state.

pub mod config;
pub mod error;
pub mod message;
pub mod server;
mod types;
mod util;

pub use server::Peer;
pub use types::{Fate, Pnum, ReplicaId, Seq, Value};
