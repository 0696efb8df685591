#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(broken_intra_doc_links)]

//! A reconnecting, authenticated real-time event channel over a
//! request/response-correlated WebSocket.
//!
//! The stack is layered bottom to top:
//!
//! - [`transport`] — a thin abstraction over an open socket.
//! - [`request_handler`] — request/response correlation, server-push
//!   listeners, and idle-liveness keepalive, bound to exactly one socket.
//! - [`robust_channel`] — connect/authenticate plus automatic reconnection
//!   with backoff, handing a fresh Request Handler to each dial.
//! - [`authenticated_channel`] — proactive JWT refresh on top of a Robust
//!   Channel.
//! - [`event_channel`] — the public, typed surface: subscribe/unsubscribe,
//!   one-shot fetches, reconnect-survival of subscriptions, per-event-type
//!   filtering.
//!
//! [`filters`] holds the static per-event-type registry the Event Channel
//! dispatches through, and [`clock`] the scheduling abstraction both the
//! reconnect backoff and the refresh timer are built on.

mod clock;
mod config;
mod error;
mod filters;
mod ids;
mod request_handler;
mod transport;
mod wire;

mod authenticated_channel;
mod event_channel;
mod robust_channel;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use authenticated_channel::{AuthenticatedChannel, TokenProvider};
pub use clock::{Clock, TokioClock};
pub use config::ChannelConfig;
pub use error::{ChannelError, ConnectError, FilterError, RequestError, TransportError};
pub use event_channel::{EventCallback, EventChannel};
pub use filters::{EventType, PayloadDecoder};
pub use request_handler::RequestHandler;
pub use robust_channel::{AddressResolver, AuthResult, RobustChannel};
pub use transport::{Connection, ConnectionEvent, Transport, TungsteniteTransport};
pub use wire::Envelope;
