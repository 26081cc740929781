//! The join path shared by every transport.
//!
//! One call per join attempt: validate the parameters against the registry
//! and the target room, let the room loop answer the checks that need
//! loop-owned state (room full, reconnect conflict, game-world vote) and
//! allocate the uid, then — after the caller has upgraded the transport —
//! attach the session, enqueue the registration and start the read loop.
//!
//! The read loop is the only producer of inbound messages for its client;
//! it blocks on the bounded incoming queue, which is the server's
//! backpressure against a flooding client.

use std::sync::Arc;

use log::{debug, info, warn};

use shared::{decode_request, SessionRequest};

use crate::client::ClientRecord;
use crate::error::ServerError;
use crate::registry::Registry;
use crate::room::{ClientMessage, RoomHandle};
use crate::session::Session;

/// Parsed join parameters, from either the `/join` query string or the
/// QUIC handshake stream.
#[derive(Debug, Clone, Default)]
pub struct JoinParams {
    pub room_id: u32,
    pub key: String,
    pub reconnect_token: String,
}

/// A validated join that only awaits its transport.
pub struct Admission {
    pub room: Arc<RoomHandle>,
    pub uid: u32,
    pub is_reconnect: bool,
}

/// Runs every admission check except the transport upgrade.
///
/// Order: room exists → reconnect token parses and matches the room → key
/// matches → room loop confirms capacity, connection conflicts and the
/// game-world vote, and hands out the uid.
pub async fn authorize(registry: &Registry, params: &JoinParams) -> Result<Admission, ServerError> {
    if params.room_id == 0 {
        return Err(ServerError::RoomNotFound(0));
    }
    let room = registry
        .get(params.room_id)
        .ok_or(ServerError::RoomNotFound(params.room_id))?;

    let reconnect_uid = if params.reconnect_token.is_empty() {
        None
    } else {
        let claim = room
            .shared
            .tokens
            .verify(&params.reconnect_token)
            .ok_or_else(|| ServerError::Unauthorized("invalid reconnect token".into()))?;
        if claim.room_id != params.room_id {
            return Err(ServerError::Unauthorized(
                "reconnect token is for another room".into(),
            ));
        }
        Some(claim.user_id)
    };

    if room.shared.has_key() && !room.shared.check_key(&params.key) {
        return Err(ServerError::Unauthorized(format!(
            "invalid key for room {}",
            params.room_id
        )));
    }

    let uid = room.join_query(reconnect_uid).await?;
    Ok(Admission {
        room,
        uid,
        is_reconnect: reconnect_uid.is_some(),
    })
}

/// Binds an upgraded session to the admitted slot: builds the client
/// record, enqueues it on the room's register channel and spawns the read
/// loop.
pub fn attach(admission: Admission, session: Session) -> Result<Arc<ClientRecord>, ServerError> {
    let Admission {
        room,
        uid,
        is_reconnect,
    } = admission;

    let record = Arc::new(ClientRecord::new(uid, session, is_reconnect));
    if !room.register(Arc::clone(&record)) {
        let session = record.session().clone();
        tokio::spawn(async move { session.close().await });
        room.release_user(uid);
        return Err(ServerError::Conflict(format!(
            "room {} register queue is full",
            room.shared.id
        )));
    }

    info!(
        "client {} attached to room {} (reconnect: {})",
        uid, room.shared.id, is_reconnect
    );

    tokio::spawn(read_loop(room, Arc::clone(&record)));
    Ok(record)
}

/// Releases a slot whose transport upgrade failed after authorization.
pub fn abort(admission: Admission) {
    admission.room.release_user(admission.uid);
}

/// Receives datagrams for one client until the session dies, decoding each
/// into a `SessionRequest` and forwarding it to the room loop. Frame
/// reports update the record's atomics here, before queueing, so the tick
/// engine sees fresh ack state even when the loop is busy.
async fn read_loop(room: Arc<RoomHandle>, record: Arc<ClientRecord>) {
    let uid = record.uid();
    let incoming = room.incoming();

    loop {
        let data = match record.session().recv_datagram().await {
            Ok(data) => data,
            Err(e) => {
                debug!("read loop for client {} ended: {}", uid, e);
                break;
            }
        };

        let request = match decode_request(&data) {
            Ok(request) => request,
            Err(e) => {
                // Malformed input costs the message, not the session.
                warn!("dropping malformed datagram from client {}: {}", uid, e);
                continue;
            }
        };

        if let SessionRequest::InGameFrames {
            frame_id,
            ack_frame_id,
            ..
        } = &request
        {
            record.update_frames(*frame_id, *ack_frame_id);
        }

        let msg = ClientMessage {
            record: Arc::clone(&record),
            request,
        };
        if incoming.send(msg).await.is_err() {
            debug!("room {} gone, ending read loop for {}", room.shared.id, uid);
            break;
        }
    }

    room.unregister(record);
}
