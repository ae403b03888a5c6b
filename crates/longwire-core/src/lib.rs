//! # Longwire Core
//!
//! Shared contracts for the Longwire persistent-connection transport layer.
//! This crate defines the types every transport implementation, server or
//! client, builds on: the delivery [`Envelope`], the monotonic [`Cursor`],
//! the [`MessageSource`] seam that connects transports to the messaging
//! layer, the [`TransportHooks`] listener set, and the shared error taxonomy.
//!
//! ## Architecture
//!
//! ```text
//! longwire-core/
//! ├── config.rs      # Connection timing configuration
//! ├── cursor.rs      # Opaque monotonic position marker
//! ├── envelope.rs    # Per-iteration delivery unit with control flags
//! ├── error.rs       # Error taxonomy and result alias
//! ├── hooks.rs       # Typed listener set for connection events
//! ├── keep_alive.rs  # Keep-alive timing descriptor
//! ├── negotiate.rs   # Negotiation payload
//! └── source.rs      # Cursor protocol: receive(cursor, cancel) -> Envelope
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod config;
pub mod cursor;
pub mod envelope;
pub mod error;
pub mod hooks;
pub mod keep_alive;
pub mod negotiate;
pub mod source;

pub use config::ConnectionTimings;
pub use cursor::Cursor;
pub use envelope::Envelope;
pub use error::{TransportError, TransportResult};
pub use hooks::TransportHooks;
pub use keep_alive::KeepAliveData;
pub use negotiate::NegotiationResponse;
pub use source::{ChannelMessageSource, MessageSource};

// Re-exported because every transport loop takes one.
pub use tokio_util::sync::CancellationToken;
