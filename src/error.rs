//! Error types shared across the channel stack.

/// Errors produced by the [`Transport`](crate::transport::Transport) layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying websocket library returned an error.
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The remote peer closed the connection.
    #[error("connection closed: code={code} reason={reason}")]
    Closed {
        /// Close code, 1000 if the server did not send one.
        code: u16,
        /// Close reason string, empty if the server did not send one.
        reason: String,
    },

    /// The server sent a binary frame; this protocol only speaks text.
    #[error("unexpected binary frame ({0} bytes)")]
    UnexpectedBinary(usize),

    /// Dialing failed before a socket could be established. Real dials fail
    /// via [`TransportError::WebSocket`]; this variant exists for transports
    /// (e.g. the in-memory test double in [`crate::mock`]) that have no
    /// `tungstenite::Error` of their own to wrap.
    #[error("dial failed: {0}")]
    Dial(String),
}

/// The rejection reason for a single in-flight request.
///
/// This is deliberately a string-like enum rather than a richly typed error:
/// the wire protocol surfaces server rejections as opaque status strings, and
/// callers are expected to match on them directly.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// No response arrived before the request's timeout elapsed.
    #[error("timeout")]
    Timeout,

    /// The socket closed (or was never open) while the request was in flight.
    #[error("socket closed")]
    SocketClosed,

    /// The server responded with a non-"ok" status.
    #[error("{0}")]
    Rejected(String),

    /// `sendRequest`/`registerServerCallback` were called with an empty
    /// action or correlation id.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Errors surfaced by [`RobustChannel::connect`](crate::robust_channel::RobustChannel::connect)
/// and the reconnection path.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The address resolver failed to produce a websocket URL.
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// The token getter failed to produce a JWT.
    #[error("token fetch failed: {0}")]
    TokenFetch(String),

    /// The transport failed to open the socket.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The first inbound frame after sending the JWT was not a valid
    /// `authSuccess` envelope, or the socket closed before one arrived.
    #[error("invalid token")]
    InvalidToken,

    /// The resolved address was not a `ws://`/`wss://` URL.
    #[error("invalid websocket address: {0}")]
    InvalidAddress(String),
}

/// Top-level error type returned by the public [`EventChannel`](crate::event_channel::EventChannel) API.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Operation requires a live session and none exists.
    #[error("not connected")]
    NotConnected,

    /// A synchronously-validated argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure establishing or re-establishing the connection.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Failure of an individual request/subscription RPC.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A filter rejected its configured keys (see [`FilterError`]).
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Errors raised while validating or applying an event filter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FilterError {
    /// The filter object contained a key outside the event type's allowed set.
    #[error("unknown filter key {key:?} for event type {event_type:?}")]
    UnknownKey {
        /// Offending key.
        key: String,
        /// The event type it was supplied for.
        event_type: String,
    },

    /// A required filter key was missing.
    #[error("missing required filter key {key:?} for event type {event_type:?}")]
    MissingRequired {
        /// Missing key.
        key: String,
        /// The event type it was required for.
        event_type: String,
    },

    /// The event type string did not match any entry in the filter registry.
    #[error("unknown event type {0:?}")]
    UnknownEventType(String),

    /// Decoding the Base64/MessagePack initial-state payload failed.
    #[error("failed to decode initial state payload: {0}")]
    Decode(String),
}
