//! # Shared Wire Protocol
//!
//! This crate contains everything the lockstep session server and its
//! clients must agree on: the room lifecycle stages, the request/response
//! message unions exchanged as datagrams, the per-frame synchronisation
//! payload (`FrameData`) and its deterministic checksum, and the join
//! handshake used on the QUIC transport.
//!
//! ## Encoding
//!
//! Every datagram is a `bincode`-encoded `SessionRequest` (client → server)
//! or `SessionResponse` (server → client), using bincode's default
//! configuration (fixed-width little-endian integers) over the serde-derived
//! types below. The checksum *interior* is independent of the wire encoding:
//! it hashes big-endian u32 writes with xxh3-64 so that every host computes
//! the same 64-bit value for the same frame.
//!
//! ## Reliability model
//!
//! Datagrams may be lost or reordered. Every in-game packet carries a
//! contiguous window of frames from the receiver's last acknowledged frame
//! up to the newest, so clients apply the highest contiguous `frame_id`
//! they have seen and drop duplicates; no retransmission requests exist.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

/// Coarse lifecycle position of a room.
///
/// Rooms advance through the fixed cycle
/// `InLobby → Preparing → Loading → InGame → PostGame → InLobby` any number
/// of times; `Closed` is terminal and absorbing. The discriminants are the
/// protocol's stage codes; servers also use them to store the stage in an
/// atomic cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Stage {
    /// Waiting for players between matches.
    InLobby = 0x20,
    /// A match has been proposed; players flag readiness.
    Preparing = 0x21,
    /// All players ready; clients load assets and report completion.
    Loading = 0x22,
    /// The lockstep clock is running.
    InGame = 0x23,
    /// Match finished; results on display, waiting to return to lobby.
    PostGame = 0x24,
    /// The room is being torn down. No transition leaves this stage.
    Closed = 0xEE,
}

impl Stage {
    /// The next stage in the forward cycle. `PostGame` wraps to `InLobby`;
    /// `Closed` stays `Closed`.
    pub fn forward(self) -> Stage {
        match self {
            Stage::InLobby => Stage::Preparing,
            Stage::Preparing => Stage::Loading,
            Stage::Loading => Stage::InGame,
            Stage::InGame => Stage::PostGame,
            Stage::PostGame => Stage::InLobby,
            Stage::Closed => Stage::Closed,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Stage> {
        match v {
            0x20 => Some(Stage::InLobby),
            0x21 => Some(Stage::Preparing),
            0x22 => Some(Stage::Loading),
            0x23 => Some(Stage::InGame),
            0x24 => Some(Stage::PostGame),
            0xEE => Some(Stage::Closed),
            _ => None,
        }
    }
}

/// One client's input for one frame.
///
/// `frame_id` is the frame the client *intended* the input for; the game
/// world applies its own lag-compensation policy when the input arrives
/// late. `data` is opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInputData {
    pub uid: u32,
    pub frame_id: u32,
    pub data: Vec<u8>,
}

/// An authoritative world event attached to a frame (spawns, damage rolls —
/// anything clients must not predict on their own).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldEventData {
    pub frame_id: u32,
    pub data: Vec<u8>,
}

/// The immutable record the server publishes for one frame: the ordered
/// inputs it accepted, the ordered world events, and a checksum clients can
/// compare to detect divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameData {
    pub frame_id: u32,
    pub inputs: Vec<ClientInputData>,
    pub events: Vec<WorldEventData>,
    pub checksum: u64,
}

impl FrameData {
    /// An empty frame carrying no inputs or events, checksum included.
    pub fn empty(frame_id: u32) -> FrameData {
        let mut fd = FrameData {
            frame_id,
            inputs: Vec::new(),
            events: Vec::new(),
            checksum: 0,
        };
        set_checksum(&mut fd);
        fd
    }
}

/// Computes the deterministic 64-bit checksum of a frame.
///
/// The hash is xxh3-64 over: the frame id, then for each input its
/// `(uid, frame_id, data)`, then for each event its `(frame_id, data)` —
/// all integers written big-endian so the result is identical on every
/// host. Inputs and events must already be in their deterministic order;
/// ordering is the game world's responsibility.
pub fn calculate_checksum(fd: &FrameData) -> u64 {
    let mut h = Xxh3::new();
    h.update(&fd.frame_id.to_be_bytes());
    for input in &fd.inputs {
        h.update(&input.uid.to_be_bytes());
        h.update(&input.frame_id.to_be_bytes());
        h.update(&input.data);
    }
    for event in &fd.events {
        h.update(&event.frame_id.to_be_bytes());
        h.update(&event.data);
    }
    h.digest()
}

/// Computes and stores the checksum. Call before publishing a frame.
pub fn set_checksum(fd: &mut FrameData) {
    fd.checksum = calculate_checksum(fd);
}

/// Everything a client may send over an established session.
///
/// Each variant drives (or is forwarded by) the room state machine; the
/// opaque `data` fields pass through to the plugged-in game world untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionRequest {
    /// Lobby chatter, forwarded to the game world in any stage.
    InLobby { data: Vec<u8> },
    /// Request to start preparing a match. Only honoured in the lobby.
    ToPreparing { data: Vec<u8> },
    /// Toggle readiness while preparing.
    Ready { is_ready: bool, data: Vec<u8> },
    /// Request to abandon preparation or the post-game screen.
    ToInLobby { data: Vec<u8> },
    /// Asset loading finished.
    Loaded { data: Vec<u8> },
    /// In-game frame report: the next frame the client is about to render,
    /// the next frame it has all prior data for, and its input payload.
    InGameFrames {
        frame_id: u32,
        ack_frame_id: u32,
        data: Vec<u8>,
    },
    /// Free-form application data, forwarded in any stage.
    Other { data: Vec<u8> },
    /// Request to end the running match with a status code.
    EndGame { status_code: u32, data: Vec<u8> },
    /// Post-game exchange; a consenting game world sends everyone back to
    /// the lobby.
    PostGameData { data: Vec<u8> },
}

/// Everything the server may send over an established session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionResponse {
    /// Join outcome. Unicast to the joiner with the reconnect token filled
    /// in; re-broadcast to the other members with the token blanked as the
    /// membership update.
    Join { code: u16, result: JoinResult },
    /// Who is ready, out of how many.
    ReadyCountUpdate { ready_ids: Vec<u32>, total: u32 },
    /// Who finished loading, out of how many.
    LoadedCountUpdate { loaded_ids: Vec<u32>, total: u32 },
    /// The room advanced (or reset) to a new stage.
    StageChange { new_stage: Stage, data: Vec<u8> },
    /// A contiguous catch-up window of frames. Empty when every client is
    /// caught up (keep-alive).
    InGameFrames { frames: Vec<FrameData> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JoinResult {
    Success(JoinSuccess),
    Fail(JoinFail),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSuccess {
    pub room_id: u32,
    pub user_id: u32,
    pub reconnect_token: String,
    pub room_info: RoomInfo,
    /// Opaque extra data from the game world's join hook.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinFail {
    pub message: String,
}

/// Snapshot of a room's membership, included in join responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub max_clients: u32,
    pub current_clients: u32,
    pub user_ids: Vec<u32>,
}

/// The handshake blob a QUIC client writes on its first bidirectional
/// stream — the datagram-side equivalent of the `/join` query string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub room_id: u32,
    pub key: String,
    pub reconnect_token: String,
}

pub fn encode_request(req: &SessionRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(req)
}

pub fn decode_request(bytes: &[u8]) -> Result<SessionRequest, bincode::Error> {
    bincode::deserialize(bytes)
}

pub fn encode_response(resp: &SessionResponse) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(resp)
}

pub fn decode_response(bytes: &[u8]) -> Result<SessionResponse, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_forward_cycle() {
        assert_eq!(Stage::InLobby.forward(), Stage::Preparing);
        assert_eq!(Stage::Preparing.forward(), Stage::Loading);
        assert_eq!(Stage::Loading.forward(), Stage::InGame);
        assert_eq!(Stage::InGame.forward(), Stage::PostGame);
        assert_eq!(Stage::PostGame.forward(), Stage::InLobby);
        assert_eq!(Stage::Closed.forward(), Stage::Closed);
    }

    #[test]
    fn stage_numeric_roundtrip() {
        for stage in [
            Stage::InLobby,
            Stage::Preparing,
            Stage::Loading,
            Stage::InGame,
            Stage::PostGame,
            Stage::Closed,
        ] {
            assert_eq!(Stage::from_u32(stage.as_u32()), Some(stage));
        }
        assert_eq!(Stage::from_u32(0), None);
        assert_eq!(Stage::from_u32(0xFF), None);
    }

    fn sample_frame() -> FrameData {
        let mut fd = FrameData {
            frame_id: 4,
            inputs: vec![ClientInputData {
                uid: 7,
                frame_id: 4,
                data: vec![0x01, 0x02],
            }],
            events: vec![WorldEventData {
                frame_id: 5,
                data: vec![0xAA],
            }],
            checksum: 0,
        };
        set_checksum(&mut fd);
        fd
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = sample_frame();
        let b = sample_frame();
        assert_ne!(a.checksum, 0);
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn checksum_is_sensitive_to_every_field() {
        let base = sample_frame();

        let mut changed = base.clone();
        changed.frame_id = 5;
        assert_ne!(calculate_checksum(&changed), base.checksum);

        let mut changed = base.clone();
        changed.inputs[0].uid = 8;
        assert_ne!(calculate_checksum(&changed), base.checksum);

        let mut changed = base.clone();
        changed.inputs[0].frame_id = 3;
        assert_ne!(calculate_checksum(&changed), base.checksum);

        let mut changed = base.clone();
        changed.inputs[0].data[1] = 0x03;
        assert_ne!(calculate_checksum(&changed), base.checksum);

        let mut changed = base.clone();
        changed.events[0].data[0] = 0xAB;
        assert_ne!(calculate_checksum(&changed), base.checksum);
    }

    #[test]
    fn checksum_depends_on_input_order() {
        let mut fd = sample_frame();
        fd.inputs.push(ClientInputData {
            uid: 9,
            frame_id: 4,
            data: vec![0x10],
        });
        let forward = calculate_checksum(&fd);
        fd.inputs.reverse();
        assert_ne!(calculate_checksum(&fd), forward);
    }

    #[test]
    fn request_roundtrip() {
        let req = SessionRequest::InGameFrames {
            frame_id: 12,
            ack_frame_id: 10,
            data: vec![1, 2, 3],
        };
        let bytes = encode_request(&req).unwrap();
        match decode_request(&bytes).unwrap() {
            SessionRequest::InGameFrames {
                frame_id,
                ack_frame_id,
                data,
            } => {
                assert_eq!(frame_id, 12);
                assert_eq!(ack_frame_id, 10);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn response_roundtrip_preserves_frames() {
        let resp = SessionResponse::InGameFrames {
            frames: vec![sample_frame(), FrameData::empty(5)],
        };
        let bytes = encode_response(&resp).unwrap();
        match decode_response(&bytes).unwrap() {
            SessionResponse::InGameFrames { frames } => {
                assert_eq!(frames.len(), 2);
                assert_eq!(frames[0], sample_frame());
                assert_eq!(frames[1].frame_id, 5);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn malformed_bytes_fail_to_decode() {
        let valid = encode_request(&SessionRequest::Loaded { data: vec![] }).unwrap();
        assert!(decode_request(&valid[..valid.len() / 2]).is_err());
        assert!(decode_request(&[]).is_err());

        let mut corrupted = valid.clone();
        corrupted[0] = 0xFF;
        assert!(decode_request(&corrupted).is_err());
    }
}
