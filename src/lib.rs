//! agentdash - live output streaming for an agent-monitoring dashboard.
//!
//! The server side watches terminal-multiplexer sessions through an
//! [`source::OutputSource`] and pushes their new output to browsers as
//! server-sent events ([`stream`], [`api`]). The [`client`] module consumes
//! that stream, and [`cache`] implements the dashboard's offline response
//! cache.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod protocol;
pub mod session;
pub mod source;
pub mod stream;
