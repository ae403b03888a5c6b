//! # Longwire Server
//!
//! The server side of the Longwire transport family. Four wire encodings
//! (long polling, server-sent events, forever-frame, and WebSocket) share
//! one receive-loop skeleton ([`ForeverTransport`]) and present one uniform
//! connection abstraction to the messaging layer above.
//!
//! A [`TransportHost`] owns the per-connection endpoints, the
//! [`TransportHeartbeat`] liveness tracker, and the axum router exposing the
//! `negotiate`/`connect`/`reconnect`/`poll`/`send`/`abort` endpoints.
//!
//! ## Architecture
//!
//! ```text
//! longwire-server/
//! ├── connection.rs          # Server connection handle + event seam
//! ├── forever.rs             # Shared receive-loop skeleton
//! ├── forever_frame.rs       # Iframe-streaming encoding
//! ├── heartbeat.rs           # Connection liveness tracker
//! ├── long_polling.rs        # One request == one loop iteration
//! ├── request.rs             # Inbound request classification
//! ├── router.rs              # Transport host + axum wiring
//! ├── server_sent_events.rs  # id:/data: record streaming
//! └── websocket.rs           # Native socket encoding
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod connection;
pub mod forever;
pub mod forever_frame;
pub mod heartbeat;
pub mod long_polling;
pub mod request;
pub mod router;
pub mod server_sent_events;
pub mod websocket;

pub use connection::{ConnectionEvents, NoopEvents, ServerConnection};
pub use forever::{ForeverTransport, LoopEntry, LoopOutcome, WireWriter};
pub use heartbeat::TransportHeartbeat;
pub use request::{RequestKind, TransportRequest};
pub use router::{ConnectionEndpoint, TransportHost};

// The contracts both sides share.
pub use longwire_core::{
    CancellationToken, ConnectionTimings, Cursor, Envelope, MessageSource, NegotiationResponse,
    TransportError, TransportResult,
};
