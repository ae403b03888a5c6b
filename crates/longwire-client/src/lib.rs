//! # Longwire Client
//!
//! The consumer side of the Longwire transport family. A [`Connection`]
//! negotiates with the server, an [`AutoTransport`] tries candidate
//! transports in priority order and commits to the first that completes its
//! handshake, and each transport normalizes its wire traffic into the
//! connection's [`TransportHooks`] callback stream.
//!
//! ## Architecture
//!
//! ```text
//! longwire-client/
//! ├── abort.rs               # Idempotent teardown coordinator
//! ├── connection.rs          # Client connection state machine
//! ├── http.rs                # HTTP seam + reqwest implementation
//! ├── keep_alive.rs          # Keep-alive monitor
//! ├── long_polling.rs        # Poll loop with reconnect classification
//! ├── negotiator.rs          # Transport fallback chain
//! ├── server_sent_events.rs  # Streaming record reader
//! ├── transport.rs           # ClientTransport trait
//! └── websocket.rs           # Native socket client
//! ```
//!
//! [`TransportHooks`]: longwire_core::TransportHooks

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod abort;
pub mod connection;
pub mod http;
pub mod keep_alive;
pub mod long_polling;
pub mod negotiator;
pub mod server_sent_events;
pub mod transport;
pub mod websocket;

pub use abort::AbortCoordinator;
pub use connection::{Connection, ConnectionState};
pub use http::{ByteStream, HttpRequester, ReqwestRequester};
pub use long_polling::LongPollingTransport;
pub use negotiator::AutoTransport;
pub use server_sent_events::ServerSentEventsTransport;
pub use transport::ClientTransport;
pub use websocket::WebSocketsTransport;

// The contracts both sides share.
pub use longwire_core::{
    CancellationToken, ConnectionTimings, Cursor, Envelope, NegotiationResponse, TransportError,
    TransportHooks, TransportResult,
};
