//! A terminal SMTP receiver: every accepted message becomes one durable
//! `.eml` artifact under the configured storage root. No relaying, no
//! onward delivery.
//!
//! The protocol engine ([`smtp`]) drives the envelope state machine
//! ([`backend::MailSession`]) through the [`smtp::Handler`] callbacks;
//! [`server::Server`] wires the two together from a [`config::Config`].

pub mod auth;
pub mod backend;
pub mod config;
pub mod logging;
pub mod mail;
pub mod server;
pub mod smtp;

pub use tracing;

/// Process lifecycle notifications broadcast to the accept loop and every
/// live session.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
