//! The pluggable game world contract.
//!
//! The server is a framework: concrete game rules live behind [`GameWorld`]
//! and every hook is invoked from the owning room's loop task, so an
//! implementation may assume single-threaded access to its own state. The
//! inverse capability, [`RoomContext`], is the narrow façade a world uses to
//! talk back: it holds a weak reference to the room's shared counters for
//! queries and a command channel for actions, so the room ↔ world ↔ context
//! cycle never owns anything twice.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use shared::{set_checksum, ClientInputData, FrameData};

use crate::room::{RoomCommand, RoomShared};

/// Per-call options for frame and snapshot queries. A single chunk (id 0)
/// covers the whole world today; the field exists so larger worlds can
/// shard later without a contract change.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorldOptions {
    pub chunk_id: u32,
}

/// Opaque world state at a given frame, used for late-joiner fast-forward.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Vec<u8>,
}

/// The contract a user-supplied game world implements.
///
/// Hooks returning `bool` vote on whether the corresponding stage advance
/// may happen; returning `false` silently leaves the stage unchanged.
pub trait GameWorld: Send {
    /// One-time init, called before the room processes its first event.
    fn on_create_room(&mut self, ctx: RoomContext);

    /// Vote on an admission attempt. Base authorisation (key, token) has
    /// already passed.
    fn could_join_room(&mut self, is_reconnect: bool) -> bool;

    /// A player joined; the returned bytes ride along in their JoinSuccess.
    fn on_player_join(&mut self, uid: u32, is_reconnect: bool) -> Vec<u8>;

    fn on_player_leave(&mut self, uid: u32);

    fn on_handle_in_lobby(&mut self, uid: u32, data: &[u8]);

    fn on_handle_to_preparing_stage(&mut self, uid: u32, data: &[u8]) -> bool;

    fn on_handle_ready(&mut self, uid: u32, is_ready: bool, data: &[u8]);

    fn on_handle_to_lobby_stage(&mut self, uid: u32, data: &[u8]) -> bool;

    fn on_handle_loaded(&mut self, uid: u32);

    /// Raw in-game input from a client. The world applies its own
    /// lag-compensation policy to inputs stamped for earlier frames.
    fn on_receive_client_input(&mut self, uid: u32, input: ClientInputData);

    fn on_receive_other_data(&mut self, uid: u32, data: &[u8]);

    fn on_handle_end_game(&mut self, uid: u32, status_code: u32, data: &[u8]) -> bool;

    fn on_handle_post_game_data(&mut self, uid: u32, data: &[u8]) -> bool;

    /// Advance world state by one frame. Called once per successful tick,
    /// immediately before [`get_frame_data`](Self::get_frame_data).
    fn tick(&mut self);

    /// Produce the frame data needed to step from `frame_id - 1` to
    /// `frame_id`: the inputs the world accepted (deterministically
    /// ordered), the authoritative events, and the checksum. Called exactly
    /// once per successful tick with strictly increasing `frame_id`.
    fn get_frame_data(&mut self, frame_id: u32, opts: WorldOptions) -> FrameData;

    /// Optional state snapshot at `frame_id`; `None` when no snapshot is
    /// available for this frame.
    fn get_snapshot(&mut self, frame_id: u32, opts: WorldOptions) -> Option<Snapshot>;

    /// One-time teardown when the room is destroyed.
    fn on_destroy(&mut self);
}

/// Constructor for the game world bound to a new room.
pub type WorldFactory = Arc<dyn Fn(RoomContext) -> Box<dyn GameWorld> + Send + Sync>;

/// Capability object handed to a game world at creation.
///
/// Queries read the room's shared counters through a weak reference (and
/// degrade to defaults once the room is gone); actions are queued onto the
/// room loop, which applies them between events.
#[derive(Clone)]
pub struct RoomContext {
    shared: Weak<RoomShared>,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomContext {
    pub(crate) fn new(
        shared: Weak<RoomShared>,
        commands: mpsc::UnboundedSender<RoomCommand>,
    ) -> RoomContext {
        RoomContext { shared, commands }
    }

    /// Sends raw bytes to every connected client.
    pub fn broadcast(&self, data: Vec<u8>) {
        let _ = self.commands.send(RoomCommand::Broadcast(data));
    }

    pub fn send_to(&self, uid: u32, data: Vec<u8>) {
        let _ = self.commands.send(RoomCommand::SendTo(uid, data));
    }

    pub fn send_to_multiple(&self, uids: Vec<u32>, data: Vec<u8>) {
        let _ = self.commands.send(RoomCommand::SendToMultiple(uids, data));
    }

    pub fn room_id(&self) -> u32 {
        self.shared.upgrade().map(|s| s.id).unwrap_or(0)
    }

    pub fn all_players(&self) -> Vec<u32> {
        self.shared
            .upgrade()
            .map(|s| s.player_ids())
            .unwrap_or_default()
    }

    /// The lockstep frame the room will produce next.
    pub fn current_frame(&self) -> u32 {
        self.shared.upgrade().map(|s| s.current_frame()).unwrap_or(0)
    }

    /// Asks the room to disconnect a player and retire its record.
    pub fn kick_player(&self, uid: u32, reason: &str) {
        let _ = self.commands.send(RoomCommand::Kick {
            uid,
            reason: reason.to_string(),
        });
    }

    /// Asks the room to tear itself down (e.g. the world decided the match
    /// is over for good).
    pub fn destroy_room(&self) {
        let _ = self.commands.send(RoomCommand::Destroy);
    }
}

/// The world used when no game is plugged in: an optimistic input relay.
///
/// Inputs are buffered as they arrive and published wholesale on the next
/// frame, ordered by `(uid, frame_id)` for determinism. Inputs keep the
/// frame id the client stamped them with, so clients can apply their own
/// lag compensation.
pub struct DefaultWorld {
    ctx: Option<RoomContext>,
    pending: Vec<ClientInputData>,
}

impl DefaultWorld {
    pub fn new() -> DefaultWorld {
        DefaultWorld {
            ctx: None,
            pending: Vec::new(),
        }
    }

    /// Factory suitable for [`crate::registry::Registry::new`].
    pub fn factory() -> WorldFactory {
        Arc::new(|_ctx| Box::new(DefaultWorld::new()) as Box<dyn GameWorld>)
    }
}

impl Default for DefaultWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl GameWorld for DefaultWorld {
    fn on_create_room(&mut self, ctx: RoomContext) {
        self.ctx = Some(ctx);
    }

    fn could_join_room(&mut self, _is_reconnect: bool) -> bool {
        true
    }

    fn on_player_join(&mut self, _uid: u32, _is_reconnect: bool) -> Vec<u8> {
        Vec::new()
    }

    fn on_player_leave(&mut self, _uid: u32) {}

    fn on_handle_in_lobby(&mut self, _uid: u32, _data: &[u8]) {}

    fn on_handle_to_preparing_stage(&mut self, _uid: u32, _data: &[u8]) -> bool {
        true
    }

    fn on_handle_ready(&mut self, _uid: u32, _is_ready: bool, _data: &[u8]) {}

    fn on_handle_to_lobby_stage(&mut self, _uid: u32, _data: &[u8]) -> bool {
        true
    }

    fn on_handle_loaded(&mut self, _uid: u32) {}

    fn on_receive_client_input(&mut self, uid: u32, mut input: ClientInputData) {
        input.uid = uid;
        self.pending.push(input);
    }

    fn on_receive_other_data(&mut self, _uid: u32, _data: &[u8]) {}

    fn on_handle_end_game(&mut self, _uid: u32, _status_code: u32, _data: &[u8]) -> bool {
        true
    }

    fn on_handle_post_game_data(&mut self, _uid: u32, _data: &[u8]) -> bool {
        true
    }

    fn tick(&mut self) {}

    fn get_frame_data(&mut self, frame_id: u32, _opts: WorldOptions) -> FrameData {
        let mut inputs = std::mem::take(&mut self.pending);
        inputs.sort_by_key(|i| (i.uid, i.frame_id));

        let mut fd = FrameData {
            frame_id,
            inputs,
            events: Vec::new(),
            checksum: 0,
        };
        set_checksum(&mut fd);
        fd
    }

    fn get_snapshot(&mut self, _frame_id: u32, _opts: WorldOptions) -> Option<Snapshot> {
        None
    }

    fn on_destroy(&mut self) {
        self.pending.clear();
    }
}
