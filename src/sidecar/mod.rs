//! Line-oriented admission service for running next to an HTTP front end.
//!
//! The front end owns transport; it forwards each request's API key and
//! client address as one line and maps the JSON reply onto its response.

mod protocol;
mod server;

pub use protocol::{Command, Reply};
pub use server::{SidecarServer, MAX_LINE_BYTES};
