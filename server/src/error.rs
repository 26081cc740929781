//! Server-wide error taxonomy.
//!
//! One enum covers every failure class the server surfaces: admission and
//! control-plane failures map onto HTTP status codes, transport and decode
//! failures stay per-connection. Handlers propagate with `?` and the
//! listeners translate into wire responses at the edge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Room cap reached; creation refused.
    #[error("maximum number of rooms reached")]
    QuotaExceeded,

    /// The ID allocator has no free slots left.
    #[error("no more IDs available")]
    IdsExhausted,

    /// Unknown room ID.
    #[error("room {0} not found")]
    RoomNotFound(u32),

    /// Bad room key or bad/unmatched reconnect token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Room full, or a reconnect target that is still connected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The game world refused the join.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Session upgrade or datagram I/O failure. Closes the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound message. Logged and dropped; the session survives.
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    /// The HTTP status the control plane reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::QuotaExceeded | ServerError::IdsExhausted => 500,
            ServerError::RoomNotFound(_) => 404,
            ServerError::Unauthorized(_) => 401,
            ServerError::Conflict(_) => 409,
            ServerError::Forbidden(_) => 403,
            ServerError::Transport(_) | ServerError::Io(_) | ServerError::Internal(_) => 500,
            ServerError::Decode(_) => 400,
        }
    }
}
