//! # Lockstep Game Session Server
//!
//! An authoritative server that hosts many independent game rooms, drives
//! each through a fixed lifecycle (lobby → preparing → loading → in-game →
//! post-game) and, during the in-game stage, runs a frame-synchronisation
//! loop: every tick it collects the inputs the game world accepted,
//! publishes one numbered frame, and multicasts each client the contiguous
//! window of frames it has not yet acknowledged. Lost datagrams are
//! recovered by that adaptive redundancy, never by retransmission requests.
//!
//! ## Architecture
//!
//! Each room is one task owning all mutable room state, multiplexing
//! registration, retirement, decoded client messages, control commands and
//! the tick timer over channels. One task per client runs the read loop;
//! outbound sends are fire-and-forget tasks so a slow client never blocks
//! the room. The registry creates and destroys rooms and consumes their
//! stop signals on a background task.
//!
//! Game rules are pluggable: the room invokes a [`world::GameWorld`]
//! implementation at every lifecycle and per-frame point, always from the
//! room loop. The world talks back through a narrow [`world::RoomContext`]
//! capability object.
//!
//! ## Transports
//!
//! Clients reach a room over QUIC datagrams (unreliable, the intended
//! transport) or WebSocket binary frames (reliable, used as
//! pseudo-datagrams); both present the same [`session::Session`] contract,
//! and an in-process loopback transport backs the integration tests.

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod frame_store;
pub mod http;
pub mod id_alloc;
pub mod quic;
pub mod registry;
pub mod room;
pub mod session;
pub mod tls;
pub mod token;
pub mod world;
