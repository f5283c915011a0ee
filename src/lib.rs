//! smartproxy - a transparent TCP reverse proxy with backend power management
//!
//! This library provides a reverse proxy that:
//! - Forwards TCP connections on a set of configured port mappings to a
//!   single backend host, byte-for-byte
//! - Powers the backend on through an external IPMI tool when a connection
//!   arrives while the host is off, holding the connection until it is ready
//! - Queues held connections in a bounded FIFO with per-connection deadlines
//! - Powers the backend off again after a configurable idle period
//! - Observes backend state out-of-band (IPMI power status + TCP probe)

pub mod config;
pub mod error;
pub mod forward;
pub mod idle;
pub mod ipmi;
pub mod lifecycle;
pub mod listener;
pub mod oracle;
pub mod probe;
pub mod queue;
pub mod supervisor;
