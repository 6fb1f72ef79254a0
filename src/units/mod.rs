//! The hub's units.
//!
//! Each unit runs as an independent task, owns no global state, and is
//! driven by application commands forwarded from the central command.

pub mod federation_sync;
pub mod http_server;
pub mod publisher;
