//! Client-side session and entity mirror.
//!
//! [`network::ClientConnection`] drives the wire protocol, [`cache`] keeps
//! the pooled local copy of the server's entities, and [`interp`] smooths
//! rendered values between snapshots. Rendering itself is the host
//! process's concern; this crate only hands it transforms and events.

pub mod cache;
pub mod interp;
pub mod network;
