//! Authoritative world server.
//!
//! The simulation loop in [`game`] is the single writer for all entity
//! state. The network layer in [`network`] accepts TCP connections, frames
//! and decodes messages, and forwards everything to the loop as events.
//! Each connection carries a [`snapshot::SnapshotView`] so broadcasts send
//! only what that connection has not seen yet.

pub mod connection;
pub mod entity;
pub mod game;
pub mod network;
pub mod snapshot;
pub mod table;
